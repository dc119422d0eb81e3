//! SQL migration definitions for the hub database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: seen_fingerprints, cached_items, analysis_attempts, archived_items",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Dedup marks. Never deleted.
CREATE TABLE IF NOT EXISTS seen_fingerprints (
    fingerprint TEXT PRIMARY KEY,
    marked_at   TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now'))
);

-- Ingested documents awaiting or undergoing analysis
CREATE TABLE IF NOT EXISTS cached_items (
    seq                INTEGER PRIMARY KEY AUTOINCREMENT,
    fingerprint        TEXT NOT NULL UNIQUE,
    source_name        TEXT NOT NULL,
    source_url         TEXT NOT NULL,
    title              TEXT,
    body               TEXT NOT NULL,
    crawled_at         TEXT NOT NULL,
    state              TEXT NOT NULL DEFAULT 'cached' CHECK (state IN ('cached', 'analyzing')),
    ingest_at          TEXT NOT NULL,
    lease_token        TEXT,
    lease_expiry_ms    INTEGER,
    not_before_ms      INTEGER NOT NULL,
    transient_attempts INTEGER NOT NULL DEFAULT 0,
    format_attempts    INTEGER NOT NULL DEFAULT 0,
    account_attempts   INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_cached_claim ON cached_items(state, not_before_ms, seq);
CREATE INDEX IF NOT EXISTS idx_cached_lease ON cached_items(state, lease_expiry_ms);

-- Admission marks the fingerprint in the same statement that queues it
CREATE TRIGGER IF NOT EXISTS cached_items_mark_seen AFTER INSERT ON cached_items BEGIN
    INSERT OR IGNORE INTO seen_fingerprints (fingerprint) VALUES (new.fingerprint);
END;

-- Append-only attempt audit trail
CREATE TABLE IF NOT EXISTS analysis_attempts (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    item_id        TEXT NOT NULL,
    account_id     TEXT,
    attempt_number INTEGER NOT NULL,
    kind           TEXT NOT NULL CHECK (kind IN ('transient', 'format', 'account')),
    started_at     TEXT NOT NULL,
    raw_response   TEXT,
    error          TEXT,
    UNIQUE(item_id, kind, attempt_number)
);

CREATE INDEX IF NOT EXISTS idx_attempts_item ON analysis_attempts(item_id);

-- Keep the per-kind counters on the queued item in step with the audit trail
CREATE TRIGGER IF NOT EXISTS analysis_attempts_bump AFTER INSERT ON analysis_attempts BEGIN
    UPDATE cached_items SET
        transient_attempts = CASE WHEN new.kind = 'transient' THEN new.attempt_number ELSE transient_attempts END,
        format_attempts    = CASE WHEN new.kind = 'format'    THEN new.attempt_number ELSE format_attempts END,
        account_attempts   = CASE WHEN new.kind = 'account'   THEN new.attempt_number ELSE account_attempts END
    WHERE fingerprint = new.item_id;
END;

-- Finalized records, one per item
CREATE TABLE IF NOT EXISTS archived_items (
    item_id           TEXT PRIMARY KEY,
    source_name       TEXT NOT NULL,
    source_url        TEXT NOT NULL,
    title             TEXT,
    result_json       TEXT,
    score             REAL,
    final_state       TEXT NOT NULL CHECK (final_state IN ('archived', 'discarded')),
    reason            TEXT,
    last_raw_response TEXT,
    archived_at       TEXT NOT NULL,
    archived_ms       INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_archived_recent ON archived_items(archived_ms DESC);
CREATE INDEX IF NOT EXISTS idx_archived_score ON archived_items(score);

-- Finalizing an item drops it from the queue atomically
CREATE TRIGGER IF NOT EXISTS archived_items_dequeue AFTER INSERT ON archived_items BEGIN
    DELETE FROM cached_items WHERE fingerprint = new.item_id;
END;

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
