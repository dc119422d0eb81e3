//! Deduplication store: fingerprint check-and-mark.

use std::sync::Arc;

use intelhub_shared::{Fingerprint, RawDocument, Result};
use intelhub_storage::Storage;

/// Result of [`DedupStore::mark_seen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyMarked,
}

/// Result of [`DedupStore::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// First sighting; the document is now queued.
    Admitted,
    Duplicate,
}

/// Fingerprint store backed by the `seen_fingerprints` table.
///
/// Storage failures are returned as errors, never as "not seen".
#[derive(Clone)]
pub struct DedupStore {
    storage: Arc<Storage>,
}

impl DedupStore {
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }

    pub async fn seen(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.storage.is_seen(fingerprint).await
    }

    pub async fn mark_seen(&self, fingerprint: &Fingerprint) -> Result<MarkOutcome> {
        Ok(if self.storage.mark_seen(fingerprint).await? {
            MarkOutcome::Marked
        } else {
            MarkOutcome::AlreadyMarked
        })
    }

    /// Atomically check-and-mark the document's fingerprint and queue it.
    pub async fn admit(&self, doc: &RawDocument) -> Result<Admission> {
        Ok(if self.storage.admit_document(doc).await? {
            Admission::Admitted
        } else {
            Admission::Duplicate
        })
    }
}
