//! Core pipeline orchestration for the intelligence hub.
//!
//! This crate ties together deduplication, the leased cached queue, the
//! account rotation pool, analysis workers, result validation and the archive
//! into the [`IntelligenceHub`].

pub mod accounts;
pub mod archive;
pub mod balance;
pub mod dedup;
pub mod hub;
pub mod provider;
pub mod queue;
pub mod stats;
pub mod validator;
pub mod worker;

#[cfg(test)]
mod testing;

pub use accounts::{AccountLease, AccountPool, DemoteReason};
pub use archive::{ArchiveStore, Finalization};
pub use balance::{BalanceMonitor, RefreshSummary};
pub use dedup::{Admission, DedupStore, MarkOutcome};
pub use hub::{CollectSummary, HubDeps, HubHandle, IntelligenceHub, SubmitOutcome};
pub use provider::{
    BalanceQuery, CompletionProvider, DEFAULT_ANALYSIS_PROMPT, OpenAiCompatibleClient,
    SiliconFlowBalanceClient, load_prompt,
};
pub use queue::CachedQueue;
pub use stats::{CounterSnapshot, HubStatistics};
pub use validator::ResultValidator;
pub use worker::{AnalysisPipeline, StepOutcome};
