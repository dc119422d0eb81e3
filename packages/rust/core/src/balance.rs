//! Periodic balance refresh for the account pool.
//!
//! Runs off the analysis critical path: queries go out concurrently, each
//! under its own timeout, and results are applied to the pool as they land.
//! Inside that timeout a transient failure is retried with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};

use intelhub_shared::ProviderError;

use intelhub_shared::Credential;

use crate::accounts::{AccountPool, DemoteReason};
use crate::provider::BalanceQuery;

/// Tries per account per pass.
const BALANCE_QUERY_ATTEMPTS: u32 = 3;

/// Wait before the first retry; doubles on each further retry.
const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Outcome of one refresh pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub refreshed: usize,
    pub failed: usize,
}

/// Refreshes every account's balance on an adaptive interval.
pub struct BalanceMonitor {
    pool: Arc<AccountPool>,
    query: Arc<dyn BalanceQuery>,
    interval: Duration,
    low_balance_interval: Duration,
    query_timeout: Duration,
    retry_backoff: Duration,
}

impl BalanceMonitor {
    pub fn new(
        pool: Arc<AccountPool>,
        query: Arc<dyn BalanceQuery>,
        interval: Duration,
        low_balance_interval: Duration,
        query_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            query,
            interval,
            low_balance_interval,
            query_timeout,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
        }
    }

    /// Override the first retry delay.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Query every account once. A failing or slow account never holds up the others.
    #[instrument(skip_all, fields(accounts = self.pool.len()))]
    pub async fn refresh_all(&self) -> RefreshSummary {
        let mut set = JoinSet::new();
        for (id, credential) in self.pool.credentials() {
            let query = Arc::clone(&self.query);
            let timeout = self.query_timeout;
            let backoff = self.retry_backoff;
            set.spawn(async move {
                let attempt = query_with_retry(query.as_ref(), &credential, backoff);
                let result = match tokio::time::timeout(timeout, attempt).await {
                    Ok(r) => r,
                    Err(_) => Err(ProviderError::Transient(format!(
                        "balance query timed out after {}s",
                        timeout.as_secs_f64()
                    ))),
                };
                (id, result)
            });
        }

        let mut summary = RefreshSummary::default();
        while let Some(joined) = set.join_next().await {
            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "balance query task failed");
                    summary.failed += 1;
                    continue;
                }
            };
            match result {
                Ok(balance) => {
                    self.pool.apply_balance(&id, balance);
                    debug!(account_id = %id, balance, "balance refreshed");
                    summary.refreshed += 1;
                }
                Err(ProviderError::Auth(msg)) => {
                    warn!(account_id = %id, error = %msg, "balance query rejected credential");
                    self.pool.demote(&id, DemoteReason::AuthRejected);
                    summary.failed += 1;
                }
                Err(ProviderError::QuotaExceeded(msg)) => {
                    warn!(account_id = %id, error = %msg, "balance query reports quota exhausted");
                    self.pool.demote(&id, DemoteReason::QuotaExceeded);
                    summary.failed += 1;
                }
                Err(e) => {
                    warn!(account_id = %id, error = %e, "balance query failed, keeping last state");
                    summary.failed += 1;
                }
            }
        }

        info!(
            refreshed = summary.refreshed,
            failed = summary.failed,
            "balance refresh complete"
        );
        summary
    }

    /// Interval until the next pass: shorter while any account is LOW_BALANCE.
    pub fn next_interval(&self) -> Duration {
        if self.pool.any_low_balance() {
            self.low_balance_interval
        } else {
            self.interval
        }
    }

    /// Refresh immediately, then on the adaptive interval until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.refresh_all().await;
            let wait = self.next_interval();
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                debug!("balance monitor stopping");
                break;
            }
        }
    }
}

/// Query one balance, retrying transient failures. Account rejections return at once.
async fn query_with_retry(
    query: &dyn BalanceQuery,
    credential: &Credential,
    backoff: Duration,
) -> Result<f64, ProviderError> {
    let mut attempt = 1;
    loop {
        match query.query_balance(credential).await {
            Ok(balance) => return Ok(balance),
            Err(e @ (ProviderError::Auth(_) | ProviderError::QuotaExceeded(_))) => return Err(e),
            Err(e) if attempt >= BALANCE_QUERY_ATTEMPTS => return Err(e),
            Err(e) => {
                let wait = match &e {
                    ProviderError::RateLimited {
                        retry_after: Some(after),
                    } => (*after).max(backoff * 2u32.pow(attempt - 1)),
                    _ => backoff * 2u32.pow(attempt - 1),
                };
                debug!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "retrying balance query");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeBalance;
    use intelhub_shared::{AccountSeed, AccountState, BalancePolicy, Credential};

    const POLICY: BalancePolicy = BalancePolicy {
        low_balance_threshold: 1.0,
        exhausted_floor: 0.2,
    };

    fn pool(ids: &[&str]) -> Arc<AccountPool> {
        let seeds = ids
            .iter()
            .map(|id| AccountSeed {
                id: id.to_string(),
                credential: Credential::new(format!("key-{id}")),
                initial_balance_hint: Some(10.0),
            })
            .collect();
        Arc::new(AccountPool::new(seeds, 2, POLICY))
    }

    fn state_of(pool: &AccountPool, id: &str) -> AccountState {
        pool.snapshot()
            .into_iter()
            .find(|s| s.id == id)
            .map(|s| s.state)
            .unwrap()
    }

    #[tokio::test]
    async fn refresh_updates_states() {
        let pool = pool(&["a", "b", "c"]);
        let fake = Arc::new(FakeBalance::default());
        fake.set("key-a", Ok(25.0));
        fake.set("key-b", Ok(0.5));
        fake.set("key-c", Ok(0.05));

        let monitor = BalanceMonitor::new(
            Arc::clone(&pool),
            fake,
            Duration::from_secs(600),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        let summary = monitor.refresh_all().await;
        assert_eq!(summary, RefreshSummary { refreshed: 3, failed: 0 });
        assert_eq!(state_of(&pool, "a"), AccountState::Active);
        assert_eq!(state_of(&pool, "b"), AccountState::LowBalance);
        assert_eq!(state_of(&pool, "c"), AccountState::Exhausted);
        assert_eq!(monitor.next_interval(), Duration::from_secs(60));
    }

    #[tokio::test]
    async fn one_failing_account_does_not_block_others() {
        let pool = pool(&["slow", "broken", "fine"]);
        let fake = Arc::new(FakeBalance::default());
        fake.set_delay("key-slow", Duration::from_secs(5));
        fake.set("key-slow", Ok(99.0));
        fake.set("key-broken", Err(ProviderError::Transient("502".into())));
        fake.set("key-fine", Ok(0.1));

        let monitor = BalanceMonitor::new(
            Arc::clone(&pool),
            fake,
            Duration::from_secs(600),
            Duration::from_secs(60),
            Duration::from_millis(100),
        );
        let started = std::time::Instant::now();
        let summary = monitor.refresh_all().await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(summary, RefreshSummary { refreshed: 1, failed: 2 });
        assert_eq!(state_of(&pool, "fine"), AccountState::Exhausted);
        // Failed queries keep the previous state
        assert_eq!(state_of(&pool, "broken"), AccountState::Active);
        assert_eq!(monitor.next_interval(), Duration::from_secs(600));
    }

    #[tokio::test]
    async fn transient_failure_is_retried_within_the_pass() {
        let pool = pool(&["a"]);
        pool.demote("a", DemoteReason::QuotaExceeded);
        let fake = Arc::new(FakeBalance::default());
        fake.push("key-a", Err(ProviderError::Transient("connection reset".into())));
        fake.set("key-a", Ok(20.0));

        let monitor = BalanceMonitor::new(
            Arc::clone(&pool),
            fake.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .with_retry_backoff(Duration::from_millis(10));
        let summary = monitor.refresh_all().await;
        assert_eq!(summary, RefreshSummary { refreshed: 1, failed: 0 });
        assert_eq!(fake.calls(), 2);
        assert_eq!(state_of(&pool, "a"), AccountState::Active);
    }

    #[tokio::test]
    async fn retries_stop_at_the_attempt_cap() {
        let pool = pool(&["a"]);
        let fake = Arc::new(FakeBalance::default());
        fake.set("key-a", Err(ProviderError::Transient("502".into())));

        let monitor = BalanceMonitor::new(
            Arc::clone(&pool),
            fake.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .with_retry_backoff(Duration::from_millis(5));
        let summary = monitor.refresh_all().await;
        assert_eq!(summary, RefreshSummary { refreshed: 0, failed: 1 });
        assert_eq!(fake.calls(), BALANCE_QUERY_ATTEMPTS as usize);
    }

    #[tokio::test]
    async fn rejected_credential_is_not_retried() {
        let pool = pool(&["a"]);
        let fake = Arc::new(FakeBalance::default());
        fake.set("key-a", Err(ProviderError::Auth("401".into())));

        let monitor = BalanceMonitor::new(
            Arc::clone(&pool),
            fake.clone(),
            Duration::from_secs(600),
            Duration::from_secs(60),
            Duration::from_secs(1),
        )
        .with_retry_backoff(Duration::from_millis(5));
        monitor.refresh_all().await;
        assert_eq!(fake.calls(), 1);
    }

    #[tokio::test]
    async fn rejected_credential_is_invalidated() {
        let pool = pool(&["a"]);
        let fake = Arc::new(FakeBalance::default());
        fake.set("key-a", Err(ProviderError::Auth("401".into())));

        let monitor = BalanceMonitor::new(
            Arc::clone(&pool),
            fake,
            Duration::from_secs(600),
            Duration::from_secs(60),
            Duration::from_secs(1),
        );
        monitor.refresh_all().await;
        assert_eq!(state_of(&pool, "a"), AccountState::Invalid);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let pool = pool(&["a"]);
        let fake = Arc::new(FakeBalance::default());
        fake.set("key-a", Ok(5.0));
        let monitor = BalanceMonitor::new(
            pool,
            fake.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(3600),
            Duration::from_secs(1),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(monitor.run(rx));
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("monitor stops promptly")
            .unwrap();
        assert_eq!(fake.calls(), 1);
    }
}
