//! Account rotation pool.
//!
//! Tracks every AI-service credential with its last known balance and state,
//! and hands one out per analysis attempt. Each account has its own lock and
//! an atomic in-flight counter; there is no pool-wide lock on the selection
//! path.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use intelhub_shared::{AccountSeed, AccountSnapshot, AccountState, BalancePolicy, Credential};

/// Why a worker is taking an account out of rotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoteReason {
    /// The provider rejected the credential.
    AuthRejected,
    /// The provider reported the budget as spent.
    QuotaExceeded,
}

impl DemoteReason {
    fn target_state(self) -> AccountState {
        match self {
            Self::AuthRejected => AccountState::Invalid,
            Self::QuotaExceeded => AccountState::Exhausted,
        }
    }
}

#[derive(Debug)]
struct AccountRecord {
    balance: Option<f64>,
    last_checked_at: Option<DateTime<Utc>>,
    state: AccountState,
    cooldown_until: Option<Instant>,
}

impl AccountRecord {
    fn is_eligible(&self, now: Instant) -> bool {
        self.state.is_selectable() && self.cooldown_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug)]
struct Slot {
    id: String,
    credential: Credential,
    record: Mutex<AccountRecord>,
    in_flight: AtomicUsize,
}

impl Slot {
    fn record(&self) -> MutexGuard<'_, AccountRecord> {
        self.record.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take one unit of concurrency if below `cap`.
    fn try_acquire(&self, cap: usize) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n < cap).then_some(n + 1))
            .is_ok()
    }

    fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive use of one unit of an account's concurrency. Dropping it frees the unit.
#[derive(Debug)]
pub struct AccountLease {
    slot: Arc<Slot>,
}

impl AccountLease {
    pub fn id(&self) -> &str {
        &self.slot.id
    }

    pub fn credential(&self) -> &Credential {
        &self.slot.credential
    }
}

impl Drop for AccountLease {
    fn drop(&mut self) {
        self.slot.release();
    }
}

/// The shared pool of accounts.
#[derive(Debug)]
pub struct AccountPool {
    slots: Vec<Arc<Slot>>,
    per_account_cap: usize,
    policy: BalancePolicy,
}

impl AccountPool {
    /// Seed the pool. Accounts with a balance hint start in the state the hint
    /// implies; accounts without one start ACTIVE until the first refresh.
    pub fn new(seeds: Vec<AccountSeed>, per_account_cap: usize, policy: BalancePolicy) -> Self {
        let slots = seeds
            .into_iter()
            .map(|seed| {
                let state = seed
                    .initial_balance_hint
                    .map(|b| classify(b, &policy))
                    .unwrap_or(AccountState::Active);
                Arc::new(Slot {
                    id: seed.id,
                    credential: seed.credential,
                    record: Mutex::new(AccountRecord {
                        balance: seed.initial_balance_hint,
                        last_checked_at: None,
                        state,
                        cooldown_until: None,
                    }),
                    in_flight: AtomicUsize::new(0),
                })
            })
            .collect();

        Self {
            slots,
            per_account_cap: per_account_cap.max(1),
            policy,
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Pick an account for one attempt.
    ///
    /// ACTIVE accounts rank before LOW_BALANCE ones, and within a rank the
    /// highest known balance wins. Accounts in `exclude`, cooling down, or at
    /// their concurrency cap are skipped. `None` means the pool is saturated.
    pub fn select(&self, exclude: &[&str]) -> Option<AccountLease> {
        let now = Instant::now();
        let mut candidates: Vec<(u8, f64, &Arc<Slot>)> = self
            .slots
            .iter()
            .filter(|slot| !exclude.contains(&slot.id.as_str()))
            .filter(|slot| slot.in_flight.load(Ordering::Acquire) < self.per_account_cap)
            .filter_map(|slot| {
                let record = slot.record();
                if !record.is_eligible(now) {
                    return None;
                }
                let rank = match record.state {
                    AccountState::Active => 0,
                    _ => 1,
                };
                Some((rank, record.balance.unwrap_or(f64::MIN), slot))
            })
            .collect();

        candidates.sort_by(|a, b| a.0.cmp(&b.0).then(b.1.total_cmp(&a.1)));

        for (_, _, slot) in candidates {
            if !slot.try_acquire(self.per_account_cap) {
                continue;
            }
            // State may have changed between ranking and acquiring
            if slot.record().is_eligible(Instant::now()) {
                return Some(AccountLease {
                    slot: Arc::clone(slot),
                });
            }
            slot.release();
        }
        None
    }

    /// Remove an account from selection until its next successful balance refresh.
    pub fn demote(&self, account_id: &str, reason: DemoteReason) {
        let Some(slot) = self.find(account_id) else {
            return;
        };
        let target = reason.target_state();
        let mut record = slot.record();
        if record.state != target {
            warn!(account_id, from = %record.state, to = %target, ?reason, "account demoted");
            record.state = target;
        }
    }

    /// Skip an account for `duration` without changing its state.
    pub fn cool_down(&self, account_id: &str, duration: Duration) {
        if let Some(slot) = self.find(account_id) {
            let until = Instant::now() + duration;
            let mut record = slot.record();
            if record.cooldown_until.is_none_or(|current| current < until) {
                record.cooldown_until = Some(until);
            }
            info!(account_id, cooldown_secs = duration.as_secs_f64(), "account cooling down");
        }
    }

    /// Record a successful balance query and reclassify the account.
    pub fn apply_balance(&self, account_id: &str, balance: f64) -> Option<AccountState> {
        let slot = self.find(account_id)?;
        let state = classify(balance, &self.policy);
        let mut record = slot.record();
        if record.state != state {
            info!(account_id, balance, from = %record.state, to = %state, "account state changed");
        }
        record.balance = Some(balance);
        record.last_checked_at = Some(Utc::now());
        record.state = state;
        Some(state)
    }

    /// Whether any account is currently LOW_BALANCE.
    pub fn any_low_balance(&self) -> bool {
        self.slots
            .iter()
            .any(|s| s.record().state == AccountState::LowBalance)
    }

    /// Ids and credentials of every account, for the balance monitor.
    pub fn credentials(&self) -> Vec<(String, Credential)> {
        self.slots
            .iter()
            .map(|s| (s.id.clone(), s.credential.clone()))
            .collect()
    }

    /// Point-in-time view of every account.
    pub fn snapshot(&self) -> Vec<AccountSnapshot> {
        self.slots
            .iter()
            .map(|s| {
                let record = s.record();
                AccountSnapshot {
                    id: s.id.clone(),
                    credential: s.credential.to_string(),
                    balance: record.balance,
                    last_checked_at: record.last_checked_at,
                    state: record.state,
                    in_flight: s.in_flight.load(Ordering::Acquire),
                }
            })
            .collect()
    }

    fn find(&self, account_id: &str) -> Option<&Arc<Slot>> {
        self.slots.iter().find(|s| s.id == account_id)
    }
}

/// State implied by a balance under the given thresholds.
pub fn classify(balance: f64, policy: &BalancePolicy) -> AccountState {
    if balance < policy.exhausted_floor {
        AccountState::Exhausted
    } else if balance < policy.low_balance_threshold {
        AccountState::LowBalance
    } else {
        AccountState::Active
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: BalancePolicy = BalancePolicy {
        low_balance_threshold: 1.0,
        exhausted_floor: 0.2,
    };

    fn seed(id: &str, balance: Option<f64>) -> AccountSeed {
        AccountSeed {
            id: id.into(),
            credential: Credential::new(format!("sk-{id}-secret")),
            initial_balance_hint: balance,
        }
    }

    #[test]
    fn classify_thresholds() {
        assert_eq!(classify(0.1, &POLICY), AccountState::Exhausted);
        assert_eq!(classify(0.2, &POLICY), AccountState::LowBalance);
        assert_eq!(classify(0.99, &POLICY), AccountState::LowBalance);
        assert_eq!(classify(1.0, &POLICY), AccountState::Active);
    }

    #[test]
    fn selects_highest_balance_active_first() {
        let pool = AccountPool::new(
            vec![seed("a", Some(5.0)), seed("b", Some(20.0)), seed("low", Some(0.5))],
            1,
            POLICY,
        );
        let first = pool.select(&[]).unwrap();
        assert_eq!(first.id(), "b");
        let second = pool.select(&[]).unwrap();
        assert_eq!(second.id(), "a");
        // ACTIVE accounts at cap; LOW_BALANCE is the fallback
        let third = pool.select(&[]).unwrap();
        assert_eq!(third.id(), "low");
        assert!(pool.select(&[]).is_none());

        drop(first);
        assert_eq!(pool.select(&[]).unwrap().id(), "b");
    }

    #[test]
    fn exclude_list_is_respected() {
        let pool = AccountPool::new(vec![seed("a", Some(5.0)), seed("b", Some(20.0))], 2, POLICY);
        assert_eq!(pool.select(&["b"]).unwrap().id(), "a");
        assert!(pool.select(&["a", "b"]).is_none());
    }

    #[test]
    fn never_selects_exhausted_or_invalid() {
        let pool = AccountPool::new(
            vec![seed("dry", Some(0.0)), seed("bad", Some(50.0)), seed("ok", Some(2.0))],
            8,
            POLICY,
        );
        pool.demote("bad", DemoteReason::AuthRejected);

        let mut held = Vec::new();
        for _ in 0..8 {
            let lease = pool.select(&[]).expect("ok has capacity");
            assert_eq!(lease.id(), "ok");
            held.push(lease);
        }
        assert!(pool.select(&[]).is_none());
        let states: Vec<_> = pool.snapshot().into_iter().map(|s| (s.id, s.state)).collect();
        assert!(states.contains(&("bad".into(), AccountState::Invalid)));
        assert!(states.contains(&("dry".into(), AccountState::Exhausted)));
    }

    #[test]
    fn demotion_lasts_until_balance_refresh() {
        let pool = AccountPool::new(vec![seed("a", Some(10.0))], 1, POLICY);
        pool.demote("a", DemoteReason::QuotaExceeded);
        assert!(pool.select(&[]).is_none());

        assert_eq!(pool.apply_balance("a", 3.0), Some(AccountState::Active));
        assert_eq!(pool.select(&[]).unwrap().id(), "a");
    }

    #[test]
    fn cooldown_skips_account_temporarily() {
        let pool = AccountPool::new(vec![seed("a", Some(10.0)), seed("b", Some(1.5))], 1, POLICY);
        pool.cool_down("a", Duration::from_secs(60));
        assert_eq!(pool.select(&[]).unwrap().id(), "b");

        pool.cool_down("b", Duration::ZERO);
        std::thread::sleep(Duration::from_millis(5));
        assert!(pool.select(&[]).is_some());
    }

    #[test]
    fn unknown_balance_starts_active_and_ranks_last() {
        let pool = AccountPool::new(vec![seed("unknown", None), seed("known", Some(1.5))], 1, POLICY);
        assert_eq!(pool.select(&[]).unwrap().id(), "known");
        let snap = pool.snapshot();
        assert_eq!(snap[0].state, AccountState::Active);
        assert_eq!(snap[0].balance, None);
    }

    #[test]
    fn snapshot_redacts_credentials() {
        let pool = AccountPool::new(vec![seed("a", Some(10.0))], 1, POLICY);
        let _lease = pool.select(&[]).unwrap();
        let snap = pool.snapshot();
        assert_eq!(snap[0].credential, "sk-a-sec...");
        assert_eq!(snap[0].in_flight, 1);
    }

    #[test]
    fn concurrent_selection_respects_cap() {
        let pool = Arc::new(AccountPool::new(
            vec![seed("a", Some(10.0)), seed("b", Some(9.0))],
            3,
            POLICY,
        ));
        let held = Arc::new(Mutex::new(Vec::new()));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let held = Arc::clone(&held);
                std::thread::spawn(move || {
                    if let Some(lease) = pool.select(&[]) {
                        held.lock().unwrap().push(lease);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(held.lock().unwrap().len(), 6);
        assert!(pool.snapshot().iter().all(|s| s.in_flight == 3));

        held.lock().unwrap().clear();
        assert!(pool.snapshot().iter().all(|s| s.in_flight == 0));
    }
}
