//! Analysis workers: claim an item, pick an account, call the provider,
//! validate, and either finalize or hand the item back to the queue.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use intelhub_shared::{
    AttemptKind, DiscardReason, IntelHubError, PipelineConfig, ProviderError, Result, SchemaConfig,
};
use intelhub_storage::{AttemptDraft, ClaimedItem, Storage};

use crate::accounts::{AccountLease, AccountPool, DemoteReason};
use crate::archive::{ArchiveStore, Finalization};
use crate::provider::{CompletionProvider, format_document_text};
use crate::queue::CachedQueue;
use crate::stats::HubStats;
use crate::validator::ResultValidator;

/// Cool-down applied to a rate-limited account that sent no `Retry-After`.
const DEFAULT_RATE_LIMIT_COOLDOWN: Duration = Duration::from_secs(30);

/// What one pass over a claimed item ended with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Archived,
    Discarded(DiscardReason),
    /// Released back to the queue after a failure of this kind.
    Retrying { kind: AttemptKind },
    /// No account became available within the patience window. The item
    /// stays ANALYZING until its lease expires.
    Saturated,
    /// Another worker took over the item.
    LeaseLost,
}

/// Shared analysis machinery driven by every worker task.
pub struct AnalysisPipeline {
    queue: CachedQueue,
    pool: Arc<AccountPool>,
    provider: Arc<dyn CompletionProvider>,
    validator: ResultValidator,
    archive: ArchiveStore,
    prompt: String,
    config: PipelineConfig,
    stats: Arc<HubStats>,
}

impl AnalysisPipeline {
    pub fn new(
        storage: Arc<Storage>,
        pool: Arc<AccountPool>,
        provider: Arc<dyn CompletionProvider>,
        schema: SchemaConfig,
        prompt: String,
        config: PipelineConfig,
        stats: Arc<HubStats>,
    ) -> Self {
        Self {
            queue: CachedQueue::new(Arc::clone(&storage), config.lease),
            pool,
            provider,
            validator: ResultValidator::new(schema),
            archive: ArchiveStore::new(storage),
            prompt,
            config,
            stats,
        }
    }

    /// Claim one due item and drive it through a single analysis pass.
    ///
    /// Returns `Ok(None)` when nothing is claimable. Storage errors propagate;
    /// the item they interrupt is recovered by lease expiry.
    pub async fn process_next(&self) -> Result<Option<StepOutcome>> {
        let Some(claim) = self.queue.claim().await? else {
            return Ok(None);
        };
        match self.analyze(&claim).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(IntelHubError::LeaseLost { item_id }) => {
                warn!(%item_id, "lease lost, abandoning item");
                HubStats::bump(&self.stats.leases_lost);
                Ok(Some(StepOutcome::LeaseLost))
            }
            Err(e) => Err(e),
        }
    }

    /// Worker loop. Idle polls back off exponentially up to `max_poll_backoff`.
    ///
    /// Shutdown may interrupt a pass mid-flight; the abandoned lease expires
    /// and the item is reclaimed.
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id, "worker started");
        let mut idle = self.config.poll_interval;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let step = tokio::select! {
                step = self.process_next() => step,
                _ = shutdown.changed() => break,
            };
            let wait = match step {
                Ok(Some(outcome)) => {
                    debug!(worker_id, ?outcome, "analysis pass complete");
                    idle = self.config.poll_interval;
                    continue;
                }
                Ok(None) => {
                    let wait = idle;
                    idle = (idle * 2).min(self.config.max_poll_backoff);
                    wait
                }
                Err(e) => {
                    if matches!(e, IntelHubError::Storage(_)) {
                        HubStats::bump(&self.stats.storage_errors);
                    }
                    error!(worker_id, error = %e, "analysis pass failed");
                    self.config.max_poll_backoff
                }
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
        }
        info!(worker_id, "worker stopped");
    }

    #[instrument(skip_all, fields(item_id = %claim.item.item_id()))]
    async fn analyze(&self, claim: &ClaimedItem) -> Result<StepOutcome> {
        let document_text = format_document_text(&claim.item.document);
        let mut rejected_accounts: Vec<String> = Vec::new();

        loop {
            let account = match self.acquire_account(claim, &rejected_accounts).await? {
                Some(account) => account,
                None if rejected_accounts.is_empty() => {
                    warn!(
                        patience_secs = self.config.saturation_patience.as_secs_f64(),
                        "no eligible account, leaving item to lease expiry"
                    );
                    return Ok(StepOutcome::Saturated);
                }
                None => {
                    // Every account tried this pass was rejected
                    self.queue.release(claim, Duration::ZERO).await?;
                    return Ok(StepOutcome::Retrying {
                        kind: AttemptKind::Account,
                    });
                }
            };

            self.queue.renew(claim).await?;
            let started_at = Utc::now();
            let deadline = self.call_deadline();
            let reply = match tokio::time::timeout(
                deadline,
                self.provider
                    .complete(&self.prompt, &document_text, account.credential()),
            )
            .await
            {
                Ok(reply) => reply,
                Err(_) => Err(ProviderError::Transient(format!(
                    "analysis call exceeded {}s deadline",
                    deadline.as_secs_f64()
                ))),
            };
            let account_id = account.id().to_string();
            drop(account);

            match reply {
                Ok(raw) => match self.validator.validate(&raw) {
                    Ok(result) => return self.finish(claim, Finalization::Archived(result)).await,
                    Err(violations) => {
                        HubStats::bump(&self.stats.format_failures);
                        let message = violations.to_string();
                        let attempt = self
                            .queue
                            .record_attempt(
                                claim,
                                attempt_draft(
                                    AttemptKind::Format,
                                    &account_id,
                                    started_at,
                                    Some(&raw),
                                    &message,
                                ),
                            )
                            .await?;
                        warn!(
                            %account_id,
                            attempt,
                            kind = "format",
                            error = %message,
                            "response failed validation"
                        );
                        if attempt >= self.config.format_retry_cap {
                            return self
                                .finish(
                                    claim,
                                    Finalization::Discarded {
                                        reason: DiscardReason::UnparsableResponse,
                                        last_raw_response: Some(raw),
                                    },
                                )
                                .await;
                        }
                        self.queue.release(claim, Duration::ZERO).await?;
                        return Ok(StepOutcome::Retrying {
                            kind: AttemptKind::Format,
                        });
                    }
                },
                Err(err) if err.is_account_fatal() => {
                    HubStats::bump(&self.stats.account_failures);
                    self.penalize(&account_id, &err);
                    let message = err.to_string();
                    let attempt = self
                        .queue
                        .record_attempt(
                            claim,
                            attempt_draft(
                                AttemptKind::Account,
                                &account_id,
                                started_at,
                                None,
                                &message,
                            ),
                        )
                        .await?;
                    warn!(
                        %account_id,
                        attempt,
                        kind = "account",
                        error = %message,
                        "account rejected, trying another"
                    );
                    rejected_accounts.push(account_id);
                }
                Err(err) => {
                    HubStats::bump(&self.stats.transient_failures);
                    let message = err.to_string();
                    let attempt = self
                        .queue
                        .record_attempt(
                            claim,
                            attempt_draft(
                                AttemptKind::Transient,
                                &account_id,
                                started_at,
                                None,
                                &message,
                            ),
                        )
                        .await?;
                    warn!(
                        %account_id,
                        attempt,
                        kind = "transient",
                        error = %message,
                        "analysis call failed"
                    );
                    if attempt >= self.config.transient_retry_cap {
                        return self
                            .finish(
                                claim,
                                Finalization::Discarded {
                                    reason: DiscardReason::IngestionFailed,
                                    last_raw_response: None,
                                },
                            )
                            .await;
                    }
                    self.queue.release(claim, self.retry_delay(attempt)).await?;
                    return Ok(StepOutcome::Retrying {
                        kind: AttemptKind::Transient,
                    });
                }
            }
        }
    }

    /// Select an account, waiting out saturation while the lease is kept alive.
    ///
    /// With a non-empty `rejected` list the pool is asked once: the item goes
    /// back to the queue rather than holding a worker.
    async fn acquire_account(
        &self,
        claim: &ClaimedItem,
        rejected: &[String],
    ) -> Result<Option<AccountLease>> {
        let exclude: Vec<&str> = rejected.iter().map(String::as_str).collect();
        if let Some(account) = self.pool.select(&exclude) {
            return Ok(Some(account));
        }
        if !rejected.is_empty() {
            return Ok(None);
        }

        HubStats::bump(&self.stats.saturation_waits);
        debug!("account pool saturated, waiting");
        let give_up = Instant::now() + self.config.saturation_patience;
        while Instant::now() < give_up {
            tokio::time::sleep(self.config.saturation_backoff).await;
            if let Some(account) = self.pool.select(&[]) {
                debug!(account_id = account.id(), "account became available");
                return Ok(Some(account));
            }
            self.queue.renew(claim).await?;
        }
        Ok(None)
    }

    fn penalize(&self, account_id: &str, err: &ProviderError) {
        match err {
            ProviderError::Auth(_) => self.pool.demote(account_id, DemoteReason::AuthRejected),
            ProviderError::QuotaExceeded(_) => {
                self.pool.demote(account_id, DemoteReason::QuotaExceeded)
            }
            ProviderError::RateLimited { retry_after } => self
                .pool
                .cool_down(account_id, retry_after.unwrap_or(DEFAULT_RATE_LIMIT_COOLDOWN)),
            ProviderError::Transient(_) => {}
        }
    }

    /// Finalize after confirming the lease is still ours.
    async fn finish(&self, claim: &ClaimedItem, finalization: Finalization) -> Result<StepOutcome> {
        let outcome = match &finalization {
            Finalization::Archived(_) => StepOutcome::Archived,
            Finalization::Discarded { reason, .. } => StepOutcome::Discarded(*reason),
        };
        self.queue.renew(claim).await?;
        self.archive.finalize(&claim.item.document, finalization).await?;
        match outcome {
            StepOutcome::Archived => HubStats::bump(&self.stats.archived),
            _ => HubStats::bump(&self.stats.discarded),
        }
        Ok(outcome)
    }

    /// Provider calls must finish inside the lease so an expired item is never
    /// still being analysed by its previous holder.
    fn call_deadline(&self) -> Duration {
        self.config.lease - self.config.lease / 10
    }

    /// Exponential backoff before the item is claimable again: base * 2^(n-1), capped.
    fn retry_delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.config
            .retry_base_delay
            .saturating_mul(factor)
            .min(self.config.retry_max_delay)
    }
}

fn attempt_draft<'a>(
    kind: AttemptKind,
    account_id: &'a str,
    started_at: DateTime<Utc>,
    raw_response: Option<&'a str>,
    error: &'a str,
) -> AttemptDraft<'a> {
    AttemptDraft {
        kind,
        account_id: Some(account_id),
        started_at,
        raw_response,
        error: Some(error),
    }
}
