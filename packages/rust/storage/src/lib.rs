//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding dedup marks, the
//! cached queue, the attempt audit trail, and the archive.
//!
//! Every state transition is a single conditional statement, so concurrent
//! workers coordinate through the database rather than a shared lock.
//!
//! **Access rules:**
//! - The hub process: read-write via [`Storage::open`]
//! - Read-only consumers (the web layer, `intelhub stats`): [`Storage::open_readonly`]

mod migrations;

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use intelhub_shared::{
    AnalysisAttempt, ArchiveFilter, ArchivedItem, AttemptKind, CachedItem, FinalState,
    Fingerprint, IntelHubError, ItemState, RawDocument, Result, StructuredResult,
};
use libsql::params::IntoParams;
use libsql::{Connection, Database, params};
use uuid::Uuid;

/// Columns selected for a [`CachedItem`], in [`row_to_cached_item`] order.
const CACHED_COLUMNS: &str = "fingerprint, source_name, source_url, title, body, crawled_at, \
     state, ingest_at, lease_expiry_ms, transient_attempts, format_attempts, account_attempts";

/// Columns selected for an [`ArchivedItem`], in [`row_to_archived_item`] order.
const ARCHIVED_COLUMNS: &str = "item_id, source_name, source_url, title, result_json, \
     final_state, reason, last_raw_response, archived_at";

/// Primary storage handle wrapping a libSQL database.
#[derive(Debug)]
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// An item handed to exactly one caller by [`Storage::claim_next`].
#[derive(Debug, Clone)]
pub struct ClaimedItem {
    pub item: CachedItem,
    /// Token every later transition on this item must present.
    pub lease_token: String,
}

/// Input for [`Storage::record_attempt`]. The attempt number is assigned by the store.
#[derive(Debug, Clone, Copy)]
pub struct AttemptDraft<'a> {
    pub kind: AttemptKind,
    pub account_id: Option<&'a str>,
    pub started_at: DateTime<Utc>,
    pub raw_response: Option<&'a str>,
    pub error: Option<&'a str>,
}

/// Live queue depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueCounts {
    pub cached: u64,
    pub analyzing: u64,
}

/// Archive totals by final state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveCounts {
    pub archived: u64,
    pub discarded: u64,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IntelHubError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(IntelHubError::storage)?;

        let conn = db.connect().map_err(IntelHubError::storage)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(IntelHubError::storage)?;

        let conn = db.connect().map_err(IntelHubError::storage)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        IntelHubError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(IntelHubError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    /// Run a conditional write and report whether it touched a row.
    ///
    /// The connection is shared across tasks, so success is read from the
    /// statement's own `RETURNING` row rather than the connection-wide change
    /// count, which another task may overwrite in between.
    async fn returns_row(&self, sql: &str, params: impl IntoParams) -> Result<bool> {
        let mut rows = self
            .conn
            .query(sql, params)
            .await
            .map_err(IntelHubError::storage)?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(IntelHubError::storage(e)),
        }
    }

    // -----------------------------------------------------------------------
    // Dedup marks
    // -----------------------------------------------------------------------

    /// Whether a fingerprint has ever been marked.
    pub async fn is_seen(&self, fingerprint: &Fingerprint) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM seen_fingerprints WHERE fingerprint = ?1",
                params![fingerprint.as_str()],
            )
            .await
            .map_err(IntelHubError::storage)?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(IntelHubError::storage(e)),
        }
    }

    /// Mark a fingerprint. Returns `false` if it was already marked.
    pub async fn mark_seen(&self, fingerprint: &Fingerprint) -> Result<bool> {
        self.check_writable()?;
        self.returns_row(
            "INSERT INTO seen_fingerprints (fingerprint) VALUES (?1)
             ON CONFLICT(fingerprint) DO NOTHING
             RETURNING fingerprint",
            params![fingerprint.as_str()],
        )
        .await
    }

    /// Check-and-mark plus enqueue in one statement.
    ///
    /// Returns `true` if the document was queued, `false` if its fingerprint
    /// was already marked. The insert trigger marks the fingerprint, so two
    /// concurrent admissions of the same document queue exactly one item.
    pub async fn admit_document(&self, doc: &RawDocument) -> Result<bool> {
        self.check_writable()?;
        let now = Utc::now();
        self.returns_row(
            "INSERT INTO cached_items
                (fingerprint, source_name, source_url, title, body, crawled_at,
                 state, ingest_at, not_before_ms)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6, 'cached', ?7, ?8
             WHERE NOT EXISTS (SELECT 1 FROM seen_fingerprints WHERE fingerprint = ?1)
             ON CONFLICT(fingerprint) DO NOTHING
             RETURNING fingerprint",
            params![
                doc.fingerprint.as_str(),
                doc.source_name.as_str(),
                doc.source_url.as_str(),
                doc.title.as_deref(),
                doc.body.as_str(),
                doc.crawled_at.to_rfc3339(),
                now.to_rfc3339(),
                now.timestamp_millis(),
            ],
        )
        .await
    }

    // -----------------------------------------------------------------------
    // Cached queue
    // -----------------------------------------------------------------------

    /// Atomically move the next due CACHED item to ANALYZING under a fresh lease.
    pub async fn claim_next(&self, lease: Duration) -> Result<Option<ClaimedItem>> {
        self.check_writable()?;
        let now = now_ms();
        let token = Uuid::now_v7().to_string();
        let sql = format!(
            "UPDATE cached_items
             SET state = 'analyzing', lease_token = ?1, lease_expiry_ms = ?2
             WHERE seq = (
                 SELECT seq FROM cached_items
                 WHERE state = 'cached' AND not_before_ms <= ?3
                 ORDER BY not_before_ms, seq
                 LIMIT 1
             ) AND state = 'cached'
             RETURNING {CACHED_COLUMNS}"
        );
        let mut rows = self
            .conn
            .query(
                &sql,
                params![token.as_str(), now + duration_ms(lease), now],
            )
            .await
            .map_err(IntelHubError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(ClaimedItem {
                item: row_to_cached_item(&row)?,
                lease_token: token,
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(IntelHubError::storage(e)),
        }
    }

    /// Extend a lease. Returns `false` if the token no longer holds the item.
    pub async fn renew_lease(&self, item_id: &str, lease_token: &str, lease: Duration) -> Result<bool> {
        self.check_writable()?;
        self.returns_row(
            "UPDATE cached_items SET lease_expiry_ms = ?3
             WHERE fingerprint = ?1 AND lease_token = ?2 AND state = 'analyzing'
             RETURNING fingerprint",
            params![item_id, lease_token, now_ms() + duration_ms(lease)],
        )
        .await
    }

    /// Return a held item to CACHED, claimable again after `delay`.
    /// Returns `false` if the token no longer holds the item.
    pub async fn release(&self, item_id: &str, lease_token: &str, delay: Duration) -> Result<bool> {
        self.check_writable()?;
        self.returns_row(
            "UPDATE cached_items
             SET state = 'cached', lease_token = NULL, lease_expiry_ms = NULL, not_before_ms = ?3
             WHERE fingerprint = ?1 AND lease_token = ?2 AND state = 'analyzing'
             RETURNING fingerprint",
            params![item_id, lease_token, now_ms() + duration_ms(delay)],
        )
        .await
    }

    /// Return every ANALYZING item past its lease expiry to CACHED.
    /// Returns the ids of the reclaimed items.
    pub async fn reclaim_expired(&self) -> Result<Vec<String>> {
        self.check_writable()?;
        let now = now_ms();
        let mut rows = self
            .conn
            .query(
                "UPDATE cached_items
                 SET state = 'cached', lease_token = NULL, lease_expiry_ms = NULL, not_before_ms = ?1
                 WHERE state = 'analyzing' AND lease_expiry_ms <= ?1
                 RETURNING fingerprint",
                params![now],
            )
            .await
            .map_err(IntelHubError::storage)?;

        let mut reclaimed = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => reclaimed.push(row.get::<String>(0).map_err(IntelHubError::storage)?),
                Ok(None) => break,
                Err(e) => return Err(IntelHubError::storage(e)),
            }
        }
        Ok(reclaimed)
    }

    /// Get a queued item by id.
    pub async fn get_cached(&self, item_id: &str) -> Result<Option<CachedItem>> {
        let sql = format!("SELECT {CACHED_COLUMNS} FROM cached_items WHERE fingerprint = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![item_id])
            .await
            .map_err(IntelHubError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_cached_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(IntelHubError::storage(e)),
        }
    }

    /// Count queued items by state.
    pub async fn queue_counts(&self) -> Result<QueueCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT state, COUNT(*) FROM cached_items GROUP BY state",
                params![],
            )
            .await
            .map_err(IntelHubError::storage)?;

        let mut counts = QueueCounts::default();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let state: String = row.get(0).map_err(IntelHubError::storage)?;
                    let n = row.get::<i64>(1).map_err(IntelHubError::storage)? as u64;
                    match state.parse::<ItemState>()? {
                        ItemState::Cached => counts.cached = n,
                        ItemState::Analyzing => counts.analyzing = n,
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(IntelHubError::storage(e)),
            }
        }
        Ok(counts)
    }

    // -----------------------------------------------------------------------
    // Attempts
    // -----------------------------------------------------------------------

    /// Append an attempt for a held item and bump its per-kind counter.
    ///
    /// Returns the assigned attempt number, or `None` if the token no longer
    /// holds the item (nothing is recorded in that case).
    pub async fn record_attempt(
        &self,
        item_id: &str,
        lease_token: &str,
        draft: AttemptDraft<'_>,
    ) -> Result<Option<u32>> {
        self.check_writable()?;
        let mut rows = self
            .conn
            .query(
                "INSERT INTO analysis_attempts
                    (item_id, account_id, attempt_number, kind, started_at, raw_response, error)
                 SELECT fingerprint, ?3,
                        CASE ?4
                            WHEN 'transient' THEN transient_attempts
                            WHEN 'format' THEN format_attempts
                            ELSE account_attempts
                        END + 1,
                        ?4, ?5, ?6, ?7
                 FROM cached_items
                 WHERE fingerprint = ?1 AND lease_token = ?2 AND state = 'analyzing'
                 RETURNING attempt_number",
                params![
                    item_id,
                    lease_token,
                    draft.account_id,
                    draft.kind.as_str(),
                    draft.started_at.to_rfc3339(),
                    draft.raw_response,
                    draft.error,
                ],
            )
            .await
            .map_err(IntelHubError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row.get::<u32>(0).map_err(IntelHubError::storage)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(IntelHubError::storage(e)),
        }
    }

    /// All attempts recorded for an item, oldest first.
    pub async fn list_attempts(&self, item_id: &str) -> Result<Vec<AnalysisAttempt>> {
        let mut rows = self
            .conn
            .query(
                "SELECT item_id, account_id, attempt_number, kind, started_at, raw_response, error
                 FROM analysis_attempts WHERE item_id = ?1 ORDER BY id",
                params![item_id],
            )
            .await
            .map_err(IntelHubError::storage)?;

        let mut results = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => results.push(AnalysisAttempt {
                    item_id: row.get::<String>(0).map_err(IntelHubError::storage)?,
                    account_id: row.get::<String>(1).ok(),
                    attempt_number: row.get::<u32>(2).map_err(IntelHubError::storage)?,
                    kind: row
                        .get::<String>(3)
                        .map_err(IntelHubError::storage)?
                        .parse()?,
                    started_at: parse_timestamp(&row.get::<String>(4).map_err(IntelHubError::storage)?)?,
                    raw_response: row.get::<String>(5).ok(),
                    error: row.get::<String>(6).ok(),
                }),
                Ok(None) => break,
                Err(e) => return Err(IntelHubError::storage(e)),
            }
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Archive
    // -----------------------------------------------------------------------

    /// Insert a finalized record unless one already exists for the item.
    ///
    /// Returns the stored record and whether this call created it. Inserting
    /// also removes the item from the cached queue.
    pub async fn insert_archived(&self, item: &ArchivedItem) -> Result<(ArchivedItem, bool)> {
        self.check_writable()?;
        let result_json = item
            .structured_result
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(IntelHubError::storage)?;
        let score = item.structured_result.as_ref().map(|r| r.score);

        let created = self
            .returns_row(
                "INSERT INTO archived_items
                    (item_id, source_name, source_url, title, result_json, score,
                     final_state, reason, last_raw_response, archived_at, archived_ms)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                 ON CONFLICT(item_id) DO NOTHING
                 RETURNING item_id",
                params![
                    item.item_id.as_str(),
                    item.source_name.as_str(),
                    item.source_url.as_str(),
                    item.title.as_deref(),
                    result_json,
                    score,
                    item.final_state.as_str(),
                    item.reason.as_deref(),
                    item.last_raw_response.as_deref(),
                    item.archived_at.to_rfc3339(),
                    item.archived_at.timestamp_millis(),
                ],
            )
            .await?;

        let stored = self.get_archived(&item.item_id).await?.ok_or_else(|| {
            IntelHubError::Storage(format!("archived item {} vanished after insert", item.item_id))
        })?;
        Ok((stored, created))
    }

    /// Get a finalized record by item id.
    pub async fn get_archived(&self, item_id: &str) -> Result<Option<ArchivedItem>> {
        let sql = format!("SELECT {ARCHIVED_COLUMNS} FROM archived_items WHERE item_id = ?1");
        let mut rows = self
            .conn
            .query(&sql, params![item_id])
            .await
            .map_err(IntelHubError::storage)?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_archived_item(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(IntelHubError::storage(e)),
        }
    }

    /// One page of finalized records, newest first.
    ///
    /// A score threshold excludes discarded items, which carry no score.
    pub async fn list_archived(&self, filter: &ArchiveFilter) -> Result<Vec<ArchivedItem>> {
        let sql = format!(
            "SELECT {ARCHIVED_COLUMNS} FROM archived_items
             WHERE (?1 IS NULL OR (score IS NOT NULL AND score >= ?1))
               AND (?2 IS NULL OR final_state = ?2)
             ORDER BY archived_ms DESC, item_id
             LIMIT ?3 OFFSET ?4"
        );
        let mut rows = self
            .conn
            .query(
                &sql,
                params![
                    filter.score_threshold,
                    filter.final_state.map(|s| s.as_str()),
                    i64::from(filter.count),
                    i64::from(filter.offset),
                ],
            )
            .await
            .map_err(IntelHubError::storage)?;

        let mut results = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => results.push(row_to_archived_item(&row)?),
                Ok(None) => break,
                Err(e) => return Err(IntelHubError::storage(e)),
            }
        }
        Ok(results)
    }

    /// Count finalized records by state.
    pub async fn archive_counts(&self) -> Result<ArchiveCounts> {
        let mut rows = self
            .conn
            .query(
                "SELECT final_state, COUNT(*) FROM archived_items GROUP BY final_state",
                params![],
            )
            .await
            .map_err(IntelHubError::storage)?;

        let mut counts = ArchiveCounts::default();
        loop {
            match rows.next().await {
                Ok(Some(row)) => {
                    let state: String = row.get(0).map_err(IntelHubError::storage)?;
                    let n = row.get::<i64>(1).map_err(IntelHubError::storage)? as u64;
                    match state.parse::<FinalState>()? {
                        FinalState::Archived => counts.archived = n,
                        FinalState::Discarded => counts.discarded = n,
                    }
                }
                Ok(None) => break,
                Err(e) => return Err(IntelHubError::storage(e)),
            }
        }
        Ok(counts)
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| IntelHubError::Storage(format!("invalid date: {e}")))
}

/// Convert a database row to a [`CachedItem`].
fn row_to_cached_item(row: &libsql::Row) -> Result<CachedItem> {
    let crawled_at: String = row.get(5).map_err(IntelHubError::storage)?;
    let state: String = row.get(6).map_err(IntelHubError::storage)?;
    let ingest_at: String = row.get(7).map_err(IntelHubError::storage)?;

    Ok(CachedItem {
        document: RawDocument {
            fingerprint: Fingerprint(row.get::<String>(0).map_err(IntelHubError::storage)?),
            source_name: row.get::<String>(1).map_err(IntelHubError::storage)?,
            source_url: row.get::<String>(2).map_err(IntelHubError::storage)?,
            title: row.get::<String>(3).ok(),
            body: row.get::<String>(4).map_err(IntelHubError::storage)?,
            crawled_at: parse_timestamp(&crawled_at)?,
        },
        state: state.parse()?,
        ingest_at: parse_timestamp(&ingest_at)?,
        lease_expiry: row
            .get::<i64>(8)
            .ok()
            .and_then(DateTime::<Utc>::from_timestamp_millis),
        transient_attempts: row.get::<u32>(9).map_err(IntelHubError::storage)?,
        format_attempts: row.get::<u32>(10).map_err(IntelHubError::storage)?,
        account_attempts: row.get::<u32>(11).map_err(IntelHubError::storage)?,
    })
}

/// Convert a database row to an [`ArchivedItem`].
fn row_to_archived_item(row: &libsql::Row) -> Result<ArchivedItem> {
    let structured_result = match row.get::<String>(4).ok() {
        Some(json) => Some(
            serde_json::from_str::<StructuredResult>(&json)
                .map_err(|e| IntelHubError::Storage(format!("invalid result_json: {e}")))?,
        ),
        None => None,
    };
    let final_state: String = row.get(5).map_err(IntelHubError::storage)?;
    let archived_at: String = row.get(8).map_err(IntelHubError::storage)?;

    Ok(ArchivedItem {
        item_id: row.get::<String>(0).map_err(IntelHubError::storage)?,
        source_name: row.get::<String>(1).map_err(IntelHubError::storage)?,
        source_url: row.get::<String>(2).map_err(IntelHubError::storage)?,
        title: row.get::<String>(3).ok(),
        structured_result,
        final_state: final_state.parse()?,
        reason: row.get::<String>(6).ok(),
        last_raw_response: row.get::<String>(7).ok(),
        archived_at: parse_timestamp(&archived_at)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use intelhub_shared::DiscardReason;
    use uuid::Uuid;

    /// Create a temp file storage for testing.
    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ih_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn doc(n: u32) -> RawDocument {
        RawDocument::new(
            "wire",
            format!("https://example.com/story/{n}"),
            Some(format!("Story {n}")),
            format!("body of story {n}"),
            Utc::now(),
        )
    }

    fn draft(kind: AttemptKind) -> AttemptDraft<'static> {
        AttemptDraft {
            kind,
            account_id: Some("acct-1"),
            started_at: Utc::now(),
            raw_response: None,
            error: Some("boom"),
        }
    }

    fn archived(item_id: &str, score: Option<f64>) -> ArchivedItem {
        ArchivedItem {
            item_id: item_id.into(),
            source_name: "wire".into(),
            source_url: format!("https://example.com/{item_id}"),
            title: None,
            structured_result: score.map(|score| StructuredResult {
                score,
                classification: "technology".into(),
                summary: "summary".into(),
                title: None,
                times: vec![],
                locations: vec![],
                people: vec![],
                organizations: vec![],
                impact: None,
                tips: None,
            }),
            final_state: if score.is_some() {
                FinalState::Archived
            } else {
                FinalState::Discarded
            },
            reason: score
                .is_none()
                .then(|| DiscardReason::IngestionFailed.as_str().to_string()),
            last_raw_response: None,
            archived_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        let version = storage.get_schema_version().await;
        assert_eq!(version, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ih_test_{}.db", Uuid::now_v7()));
        let _s1 = Storage::open(&tmp).await.expect("first open");
        drop(_s1);
        let s2 = Storage::open(&tmp).await.expect("second open");
        assert_eq!(s2.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn admission_marks_and_dedups() {
        let storage = test_storage().await;
        let d = doc(1);

        assert!(!storage.is_seen(&d.fingerprint).await.unwrap());
        assert!(storage.admit_document(&d).await.unwrap());
        assert!(storage.is_seen(&d.fingerprint).await.unwrap());
        assert!(!storage.admit_document(&d).await.unwrap());
        assert!(!storage.mark_seen(&d.fingerprint).await.unwrap());

        let counts = storage.queue_counts().await.unwrap();
        assert_eq!(counts, QueueCounts { cached: 1, analyzing: 0 });
    }

    #[tokio::test]
    async fn marked_fingerprint_is_not_admitted() {
        let storage = test_storage().await;
        let d = doc(2);
        assert!(storage.mark_seen(&d.fingerprint).await.unwrap());
        assert!(!storage.admit_document(&d).await.unwrap());
        assert!(storage.get_cached(d.item_id()).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_admission_queues_one_item() {
        let storage = Arc::new(test_storage().await);
        let d = doc(3);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let storage = Arc::clone(&storage);
            let d = d.clone();
            handles.push(tokio::spawn(async move { storage.admit_document(&d).await }));
        }
        let mut admitted = 0;
        for h in handles {
            if h.await.unwrap().unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
        assert_eq!(storage.queue_counts().await.unwrap().cached, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_renewals_report_the_holder_correctly() {
        let storage = Arc::new(test_storage().await);
        let d = doc(4);
        storage.admit_document(&d).await.unwrap();
        let claimed = storage.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();

        let mut live = Vec::new();
        let mut stale = Vec::new();
        for n in 0..100 {
            let s = Arc::clone(&storage);
            let id = d.item_id().to_string();
            let token = claimed.lease_token.clone();
            live.push(tokio::spawn(async move {
                s.renew_lease(&id, &token, Duration::from_secs(60)).await
            }));

            let s = Arc::clone(&storage);
            let id = d.item_id().to_string();
            stale.push(tokio::spawn(async move {
                s.renew_lease(&id, &format!("stale-{n}"), Duration::from_secs(60)).await
            }));
        }

        for h in live {
            assert!(h.await.unwrap().unwrap(), "holder renewal reported lost");
        }
        for h in stale {
            assert!(!h.await.unwrap().unwrap(), "stale renewal reported held");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_archive_inserts_create_once() {
        let storage = Arc::new(test_storage().await);

        let mut handles = Vec::new();
        for _ in 0..12 {
            let s = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                s.insert_archived(&archived("contended", Some(5.0))).await
            }));
        }
        let mut created = 0;
        for h in handles {
            let (stored, was_created) = h.await.unwrap().unwrap();
            assert_eq!(stored.item_id, "contended");
            if was_created {
                created += 1;
            }
        }
        assert_eq!(created, 1);
    }

    #[tokio::test]
    async fn claim_is_exclusive_and_fifo() {
        let storage = test_storage().await;
        let first = doc(10);
        let second = doc(11);
        storage.admit_document(&first).await.unwrap();
        storage.admit_document(&second).await.unwrap();

        let a = storage
            .claim_next(Duration::from_secs(60))
            .await
            .unwrap()
            .expect("first claim");
        assert_eq!(a.item.item_id(), first.item_id());
        assert_eq!(a.item.state, ItemState::Analyzing);
        assert!(a.item.lease_expiry.is_some());

        let b = storage.claim_next(Duration::from_secs(60)).await.unwrap().expect("second claim");
        assert_eq!(b.item.item_id(), second.item_id());
        assert_ne!(a.lease_token, b.lease_token);

        assert!(storage.claim_next(Duration::from_secs(60)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn release_respects_token_and_delay() {
        let storage = test_storage().await;
        let d = doc(20);
        storage.admit_document(&d).await.unwrap();
        let claimed = storage.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();

        assert!(!storage.release(d.item_id(), "not-the-token", Duration::ZERO).await.unwrap());
        assert!(
            storage
                .release(d.item_id(), &claimed.lease_token, Duration::from_secs(3600))
                .await
                .unwrap()
        );

        // Not due yet
        assert!(storage.claim_next(Duration::from_secs(60)).await.unwrap().is_none());
        let item = storage.get_cached(d.item_id()).await.unwrap().unwrap();
        assert_eq!(item.state, ItemState::Cached);
        assert!(item.lease_expiry.is_none());
    }

    #[tokio::test]
    async fn expired_lease_is_reclaimed_once() {
        let storage = test_storage().await;
        let d = doc(30);
        storage.admit_document(&d).await.unwrap();
        let claimed = storage.claim_next(Duration::from_millis(20)).await.unwrap().unwrap();

        tokio::time::sleep(Duration::from_millis(60)).await;
        let reclaimed = storage.reclaim_expired().await.unwrap();
        assert_eq!(reclaimed, vec![d.item_id().to_string()]);
        assert!(storage.reclaim_expired().await.unwrap().is_empty());

        // The stale holder can no longer act on the item
        assert!(!storage.renew_lease(d.item_id(), &claimed.lease_token, Duration::from_secs(60)).await.unwrap());

        let again = storage.claim_next(Duration::from_secs(60)).await.unwrap().expect("reclaimable");
        assert_eq!(again.item.item_id(), d.item_id());
        assert_ne!(again.lease_token, claimed.lease_token);
    }

    #[tokio::test]
    async fn attempts_are_numbered_per_kind() {
        let storage = test_storage().await;
        let d = doc(40);
        storage.admit_document(&d).await.unwrap();
        let c = storage.claim_next(Duration::from_secs(60)).await.unwrap().unwrap();
        let id = d.item_id();

        let n1 = storage.record_attempt(id, &c.lease_token, draft(AttemptKind::Transient)).await.unwrap();
        let n2 = storage.record_attempt(id, &c.lease_token, draft(AttemptKind::Transient)).await.unwrap();
        let f1 = storage.record_attempt(id, &c.lease_token, draft(AttemptKind::Format)).await.unwrap();
        assert_eq!((n1, n2, f1), (Some(1), Some(2), Some(1)));

        let stale = storage.record_attempt(id, "stale", draft(AttemptKind::Format)).await.unwrap();
        assert_eq!(stale, None);

        let item = storage.get_cached(id).await.unwrap().unwrap();
        assert_eq!(item.transient_attempts, 2);
        assert_eq!(item.format_attempts, 1);
        assert_eq!(item.account_attempts, 0);

        let attempts = storage.list_attempts(id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert_eq!(attempts[2].kind, AttemptKind::Format);
        assert_eq!(attempts[0].account_id.as_deref(), Some("acct-1"));
    }

    #[tokio::test]
    async fn archive_is_idempotent_and_dequeues() {
        let storage = test_storage().await;
        let d = doc(50);
        storage.admit_document(&d).await.unwrap();

        let (first, created) = storage.insert_archived(&archived(d.item_id(), Some(7.0))).await.unwrap();
        assert!(created);
        assert!(storage.get_cached(d.item_id()).await.unwrap().is_none());

        let (second, created) = storage.insert_archived(&archived(d.item_id(), None)).await.unwrap();
        assert!(!created);
        assert_eq!(second, first);
        assert_eq!(second.final_state, FinalState::Archived);

        // Still deduplicated after leaving the queue
        assert!(!storage.admit_document(&d).await.unwrap());
    }

    #[tokio::test]
    async fn list_archived_filters_by_threshold() {
        let storage = test_storage().await;
        storage.insert_archived(&archived("low", Some(3.0))).await.unwrap();
        storage.insert_archived(&archived("high", Some(8.5))).await.unwrap();
        storage.insert_archived(&archived("dropped", None)).await.unwrap();

        let all = storage
            .list_archived(&ArchiveFilter { offset: 0, count: 10, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(all.len(), 3);

        let hot = storage
            .list_archived(&ArchiveFilter {
                offset: 0,
                count: 10,
                score_threshold: Some(6.0),
                final_state: None,
            })
            .await
            .unwrap();
        assert_eq!(hot.len(), 1);
        assert_eq!(hot[0].item_id, "high");

        let discarded = storage
            .list_archived(&ArchiveFilter {
                offset: 0,
                count: 10,
                score_threshold: None,
                final_state: Some(FinalState::Discarded),
            })
            .await
            .unwrap();
        assert_eq!(discarded.len(), 1);
        assert_eq!(discarded[0].reason.as_deref(), Some("ingestion_failed"));

        let counts = storage.archive_counts().await.unwrap();
        assert_eq!(counts, ArchiveCounts { archived: 2, discarded: 1 });
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ih_test_{}.db", Uuid::now_v7()));
        let rw = Storage::open(&tmp).await.unwrap();
        rw.admit_document(&doc(60)).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        assert_eq!(ro.queue_counts().await.unwrap().cached, 1);
        let result = ro.admit_document(&doc(61)).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
