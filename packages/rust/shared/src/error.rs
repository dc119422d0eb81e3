//! Error types for the intelligence hub.
//!
//! Library crates use [`IntelHubError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Top-level error type for all hub operations.
#[derive(Debug, thiserror::Error)]
pub enum IntelHubError {
    /// Configuration loading or validation error.
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error while collecting documents.
    #[error("network error: {0}")]
    Network(String),

    /// HTML/feed content could not be converted to text.
    #[error("conversion error: {0}")]
    Conversion(String),

    /// Database or storage layer error. Never treated as "not seen" or "empty".
    #[error("storage error: {0}")]
    Storage(String),

    /// The caller's lease on an item was reclaimed or superseded.
    #[error("lease lost for item {item_id}")]
    LeaseLost { item_id: String },

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Input validation error (bad document, bad argument).
    #[error("validation error: {message}")]
    Validation { message: String },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, IntelHubError>;

impl IntelHubError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a storage error from any displayable error.
    pub fn storage(err: impl fmt::Display) -> Self {
        Self::Storage(err.to_string())
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

// ---------------------------------------------------------------------------
// Provider errors
// ---------------------------------------------------------------------------

/// Failure classes reported by the AI completion and balance endpoints.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// Network failure, timeout, or 5xx. Retryable within the transient cap.
    #[error("transient: {0}")]
    Transient(String),

    /// The credential was rejected.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// The credential has no budget left.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The provider asked us to slow down on this credential.
    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
}

impl ProviderError {
    /// Whether this failure is the account's fault rather than the item's.
    pub fn is_account_fatal(&self) -> bool {
        matches!(
            self,
            Self::Auth(_) | Self::QuotaExceeded(_) | Self::RateLimited { .. }
        )
    }
}

// ---------------------------------------------------------------------------
// Schema violations
// ---------------------------------------------------------------------------

/// A single offending field in an AI response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldViolation {
    /// JSON field name (`$` for the document root).
    pub field: String,
    /// What is wrong with it.
    pub problem: String,
}

/// Every field that failed validation, in field-name order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaViolations(pub Vec<FieldViolation>);

impl SchemaViolations {
    /// Record a violation for `field`.
    pub fn push(&mut self, field: impl Into<String>, problem: impl Into<String>) {
        self.0.push(FieldViolation {
            field: field.into(),
            problem: problem.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names of the offending fields.
    pub fn fields(&self) -> Vec<&str> {
        self.0.iter().map(|v| v.field.as_str()).collect()
    }
}

impl fmt::Display for SchemaViolations {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self
            .0
            .iter()
            .map(|v| format!("[{}] {}", v.field, v.problem))
            .collect();
        write!(f, "{}", parts.join("; "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_formatting() {
        let err = IntelHubError::config("no account credentials resolved");
        assert_eq!(
            err.to_string(),
            "config error: no account credentials resolved"
        );

        let err = IntelHubError::LeaseLost {
            item_id: "abc".into(),
        };
        assert_eq!(err.to_string(), "lease lost for item abc");
    }

    #[test]
    fn schema_violations_enumerate_fields() {
        let mut v = SchemaViolations::default();
        v.push("score", "must be a number");
        v.push("summary", "missing");
        let text = v.to_string();
        assert!(text.contains("[score] must be a number"));
        assert!(text.contains("[summary] missing"));
        assert_eq!(v.fields(), vec!["score", "summary"]);
    }

    #[test]
    fn account_fatal_classification() {
        assert!(ProviderError::Auth("401".into()).is_account_fatal());
        assert!(ProviderError::QuotaExceeded("402".into()).is_account_fatal());
        assert!(ProviderError::RateLimited { retry_after: None }.is_account_fatal());
        assert!(!ProviderError::Transient("timeout".into()).is_account_fatal());
    }
}
