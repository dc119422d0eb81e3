//! Core domain types for the ingestion and analysis pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::IntelHubError;

// ---------------------------------------------------------------------------
// Fingerprint
// ---------------------------------------------------------------------------

/// Stable SHA-256 identity of a document over its normalized URL and content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

impl Fingerprint {
    /// Compute the fingerprint of a document.
    pub fn compute(source_url: &str, body: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(normalize_url(source_url).as_bytes());
        hasher.update([0u8]);
        hasher.update(normalize_content(body).as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalize a URL for fingerprinting (strip fragment and trailing slash, lowercase host).
pub fn normalize_url(raw: &str) -> String {
    match Url::parse(raw.trim()) {
        Ok(mut url) => {
            url.set_fragment(None);
            let mut s = url.to_string();
            // Keep the root slash, drop it elsewhere
            if s.ends_with('/') && url.path() != "/" {
                s.pop();
            }
            s
        }
        Err(_) => raw.trim().to_lowercase(),
    }
}

/// Collapse whitespace runs so reflowed copies of the same text hash identically.
fn normalize_content(body: &str) -> String {
    body.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// RawDocument
// ---------------------------------------------------------------------------

/// A document as produced by a collector. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDocument {
    pub fingerprint: Fingerprint,
    pub source_name: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub body: String,
    pub crawled_at: DateTime<Utc>,
}

impl RawDocument {
    /// Build a document, deriving its fingerprint.
    pub fn new(
        source_name: impl Into<String>,
        source_url: impl Into<String>,
        title: Option<String>,
        body: impl Into<String>,
        crawled_at: DateTime<Utc>,
    ) -> Self {
        let source_url = source_url.into();
        let body = body.into();
        Self {
            fingerprint: Fingerprint::compute(&source_url, &body),
            source_name: source_name.into(),
            source_url,
            title,
            body,
            crawled_at,
        }
    }

    /// The item id used throughout the pipeline (the fingerprint).
    pub fn item_id(&self) -> &str {
        self.fingerprint.as_str()
    }
}

/// Collector-facing submission shape; the fingerprint is always derived, never trusted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewDocument {
    pub source_name: String,
    pub source_url: String,
    #[serde(default)]
    pub title: Option<String>,
    pub body: String,
    #[serde(default)]
    pub crawled_at: Option<DateTime<Utc>>,
}

impl From<NewDocument> for RawDocument {
    fn from(d: NewDocument) -> Self {
        RawDocument::new(
            d.source_name,
            d.source_url,
            d.title,
            d.body,
            d.crawled_at.unwrap_or_else(Utc::now),
        )
    }
}

// ---------------------------------------------------------------------------
// CachedItem
// ---------------------------------------------------------------------------

/// Lifecycle state of a queued item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemState {
    Cached,
    Analyzing,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cached => "cached",
            Self::Analyzing => "analyzing",
        }
    }
}

impl FromStr for ItemState {
    type Err = IntelHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cached" => Ok(Self::Cached),
            "analyzing" => Ok(Self::Analyzing),
            other => Err(IntelHubError::Storage(format!("unknown item state '{other}'"))),
        }
    }
}

/// An ingested document waiting for (or undergoing) analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedItem {
    pub document: RawDocument,
    pub state: ItemState,
    pub ingest_at: DateTime<Utc>,
    /// Set only while `state == Analyzing`.
    pub lease_expiry: Option<DateTime<Utc>>,
    pub transient_attempts: u32,
    pub format_attempts: u32,
    pub account_attempts: u32,
}

impl CachedItem {
    pub fn item_id(&self) -> &str {
        self.document.item_id()
    }
}

// ---------------------------------------------------------------------------
// AnalysisAttempt
// ---------------------------------------------------------------------------

/// Which retry budget an attempt is charged against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptKind {
    /// Network/provider failure.
    Transient,
    /// The response failed schema validation.
    Format,
    /// The account was rejected (auth, quota, rate limit). Item-neutral.
    Account,
}

impl AttemptKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Format => "format",
            Self::Account => "account",
        }
    }
}

impl FromStr for AttemptKind {
    type Err = IntelHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "format" => Ok(Self::Format),
            "account" => Ok(Self::Account),
            other => Err(IntelHubError::Storage(format!("unknown attempt kind '{other}'"))),
        }
    }
}

/// One audited try at analysing an item. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisAttempt {
    pub item_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub attempt_number: u32,
    pub kind: AttemptKind,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Structured result & archive
// ---------------------------------------------------------------------------

/// Schema-constrained output of AI analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuredResult {
    pub score: f64,
    pub classification: String,
    pub summary: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub times: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub people: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub impact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tips: Option<String>,
}

/// Terminal state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinalState {
    Archived,
    Discarded,
}

impl FinalState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Archived => "archived",
            Self::Discarded => "discarded",
        }
    }
}

impl FromStr for FinalState {
    type Err = IntelHubError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "archived" => Ok(Self::Archived),
            "discarded" => Ok(Self::Discarded),
            other => Err(IntelHubError::Storage(format!("unknown final state '{other}'"))),
        }
    }
}

/// Reason code persisted with every discarded item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// Transient retry cap exceeded.
    IngestionFailed,
    /// Format retry cap exceeded.
    UnparsableResponse,
}

impl DiscardReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::IngestionFailed => "ingestion_failed",
            Self::UnparsableResponse => "unparsable_response",
        }
    }
}

/// A finalized record. Created exactly once per item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArchivedItem {
    pub item_id: String,
    pub source_name: String,
    pub source_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub structured_result: Option<StructuredResult>,
    pub final_state: FinalState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Last raw AI response, retained for audit on discards.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_raw_response: Option<String>,
    pub archived_at: DateTime<Utc>,
}

/// Read-surface filter for archived items.
#[derive(Debug, Clone, Default)]
pub struct ArchiveFilter {
    pub offset: u32,
    pub count: u32,
    /// Minimum score; excludes discarded items (which carry no score).
    pub score_threshold: Option<f64>,
    pub final_state: Option<FinalState>,
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

/// An AI-service credential. Never printed in full.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// The raw secret, for building request headers only.
    pub fn expose(&self) -> &str {
        &self.0
    }

    fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(8).collect();
        format!("{prefix}...")
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Credential({})", self.redacted())
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Budget/health state of an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountState {
    Active,
    LowBalance,
    Exhausted,
    Invalid,
}

impl AccountState {
    /// Whether the pool may hand this account to a worker.
    pub fn is_selectable(&self) -> bool {
        matches!(self, Self::Active | Self::LowBalance)
    }
}

impl fmt::Display for AccountState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Active => "ACTIVE",
            Self::LowBalance => "LOW_BALANCE",
            Self::Exhausted => "EXHAUSTED",
            Self::Invalid => "INVALID",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of an account, for status output.
#[derive(Debug, Clone, Serialize)]
pub struct AccountSnapshot {
    pub id: String,
    /// Redacted credential.
    pub credential: String,
    pub balance: Option<f64>,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub state: AccountState,
    pub in_flight: usize,
}
