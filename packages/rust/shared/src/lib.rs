//! Shared types, error model, and configuration for the intelligence hub.
//!
//! This crate is the foundation depended on by all other hub crates.
//! It provides:
//! - [`IntelHubError`]: the unified error type
//! - Domain types ([`RawDocument`], [`CachedItem`], [`ArchivedItem`], [`Fingerprint`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AccountKeyEntry, AccountSeed, AccountsConfig, AppConfig, BalancePolicy, CollectorEntry,
    CollectorKind, HubConfig, PipelineConfig, ProviderConfig, ReadConfig, SchemaConfig,
    ValidationConfig, config_dir, config_file_path, expand_home, init_config, load_config,
    load_config_from, resolve_account_seeds,
};
pub use error::{FieldViolation, IntelHubError, ProviderError, Result, SchemaViolations};
pub use types::{
    AccountSnapshot, AccountState, AnalysisAttempt, ArchiveFilter, ArchivedItem, AttemptKind,
    CachedItem, Credential, DiscardReason, FinalState, Fingerprint, ItemState, NewDocument,
    RawDocument, StructuredResult, normalize_url,
};
