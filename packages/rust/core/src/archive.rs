//! Archive store: idempotent finalization and the read surface.

use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, Stream, TryStreamExt};
use tracing::{debug, info};

use intelhub_shared::{
    ArchiveFilter, ArchivedItem, DiscardReason, FinalState, RawDocument, Result, StructuredResult,
};
use intelhub_storage::{ArchiveCounts, Storage};

/// Page size used by [`ArchiveStore::stream`] when the filter leaves `count` at zero.
const DEFAULT_PAGE: u32 = 100;

/// How an item leaves the pipeline.
#[derive(Debug, Clone)]
pub enum Finalization {
    Archived(StructuredResult),
    Discarded {
        reason: DiscardReason,
        last_raw_response: Option<String>,
    },
}

#[derive(Clone)]
pub struct ArchiveStore {
    storage: Arc<Storage>,
}

impl ArchiveStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    /// Write the terminal record for `doc` and remove it from the queue.
    ///
    /// If the item is already finalized the existing record is returned
    /// unchanged, so a repeated finalize is harmless.
    pub async fn finalize(&self, doc: &RawDocument, outcome: Finalization) -> Result<ArchivedItem> {
        let (structured_result, final_state, reason, last_raw_response) = match outcome {
            Finalization::Archived(result) => (Some(result), FinalState::Archived, None, None),
            Finalization::Discarded {
                reason,
                last_raw_response,
            } => (
                None,
                FinalState::Discarded,
                Some(reason.as_str().to_string()),
                last_raw_response,
            ),
        };
        let record = ArchivedItem {
            item_id: doc.item_id().to_string(),
            source_name: doc.source_name.clone(),
            source_url: doc.source_url.clone(),
            title: doc.title.clone(),
            structured_result,
            final_state,
            reason,
            last_raw_response,
            archived_at: Utc::now(),
        };

        let (stored, created) = self.storage.insert_archived(&record).await?;
        if created {
            info!(
                item_id = %stored.item_id,
                final_state = stored.final_state.as_str(),
                reason = stored.reason.as_deref().unwrap_or(""),
                "item finalized"
            );
        } else {
            debug!(item_id = %stored.item_id, "item already finalized, returning existing record");
        }
        Ok(stored)
    }

    pub async fn get(&self, item_id: &str) -> Result<Option<ArchivedItem>> {
        self.storage.get_archived(item_id).await
    }

    /// One page of records, newest first.
    pub async fn list(&self, filter: &ArchiveFilter) -> Result<Vec<ArchivedItem>> {
        self.storage.list_archived(filter).await
    }

    pub async fn counts(&self) -> Result<ArchiveCounts> {
        self.storage.archive_counts().await
    }

    /// Every record matching `filter`, starting at `filter.offset`, fetched a
    /// page of `filter.count` at a time as the stream is polled.
    pub fn stream(&self, filter: ArchiveFilter) -> impl Stream<Item = Result<ArchivedItem>> + '_ {
        let page = if filter.count == 0 { DEFAULT_PAGE } else { filter.count };
        stream::try_unfold(Some(filter), move |next| async move {
            let Some(mut filter) = next else {
                return Ok(None);
            };
            filter.count = page;
            let items = self.storage.list_archived(&filter).await?;
            let next = if items.len() < page as usize {
                None
            } else {
                filter.offset += page;
                Some(filter)
            };
            Ok(Some((stream::iter(items.into_iter().map(Ok)), next)))
        })
        .try_flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup() -> (Arc<Storage>, ArchiveStore) {
        let tmp = std::env::temp_dir().join(format!("ih_archive_{}.db", Uuid::now_v7()));
        let storage = Arc::new(Storage::open(&tmp).await.expect("open test db"));
        let archive = ArchiveStore::new(Arc::clone(&storage));
        (storage, archive)
    }

    fn doc(n: usize) -> RawDocument {
        RawDocument::new(
            "wire",
            format!("https://example.com/{n}"),
            Some(format!("Story {n}")),
            format!("body {n}"),
            Utc::now(),
        )
    }

    fn result(score: f64) -> StructuredResult {
        StructuredResult {
            score,
            classification: "economy".into(),
            summary: "summary".into(),
            title: None,
            times: vec![],
            locations: vec![],
            people: vec![],
            organizations: vec![],
            impact: None,
            tips: None,
        }
    }

    #[tokio::test]
    async fn finalize_is_idempotent() {
        let (storage, archive) = setup().await;
        let d = doc(1);
        storage.admit_document(&d).await.unwrap();

        let first = archive.finalize(&d, Finalization::Archived(result(7.0))).await.unwrap();
        assert_eq!(first.final_state, FinalState::Archived);
        assert_eq!(first.structured_result.as_ref().unwrap().score, 7.0);
        // Finalizing also dequeues
        assert!(storage.get_cached(d.item_id()).await.unwrap().is_none());

        let again = archive
            .finalize(
                &d,
                Finalization::Discarded {
                    reason: DiscardReason::IngestionFailed,
                    last_raw_response: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(again, first);
    }

    #[tokio::test]
    async fn discard_keeps_reason_and_raw_response() {
        let (_storage, archive) = setup().await;
        let d = doc(2);
        let rec = archive
            .finalize(
                &d,
                Finalization::Discarded {
                    reason: DiscardReason::UnparsableResponse,
                    last_raw_response: Some("not json".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(rec.final_state, FinalState::Discarded);
        assert_eq!(rec.reason.as_deref(), Some("unparsable_response"));
        assert_eq!(rec.last_raw_response.as_deref(), Some("not json"));
        assert!(rec.structured_result.is_none());
        assert_eq!(archive.get(d.item_id()).await.unwrap(), Some(rec));
    }

    #[tokio::test]
    async fn stream_walks_every_page() {
        let (_storage, archive) = setup().await;
        for n in 0..7 {
            archive
                .finalize(&doc(n), Finalization::Archived(result(n as f64)))
                .await
                .unwrap();
        }
        archive
            .finalize(
                &doc(99),
                Finalization::Discarded {
                    reason: DiscardReason::IngestionFailed,
                    last_raw_response: None,
                },
            )
            .await
            .unwrap();

        let all: Vec<_> = archive
            .stream(ArchiveFilter {
                count: 3,
                ..Default::default()
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(all.len(), 8);

        let scored: Vec<_> = archive
            .stream(ArchiveFilter {
                count: 2,
                score_threshold: Some(4.0),
                ..Default::default()
            })
            .try_collect()
            .await
            .unwrap();
        assert_eq!(scored.len(), 3);
        assert!(scored.iter().all(|i| i.final_state == FinalState::Archived));

        let counts = archive.counts().await.unwrap();
        assert_eq!((counts.archived, counts.discarded), (7, 1));
    }
}
