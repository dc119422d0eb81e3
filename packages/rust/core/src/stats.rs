//! Hub-wide counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Monotonic event counters shared by every hub task.
#[derive(Debug, Default)]
pub struct HubStats {
    pub(crate) accepted: AtomicU64,
    pub(crate) duplicates: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) archived: AtomicU64,
    pub(crate) discarded: AtomicU64,
    pub(crate) transient_failures: AtomicU64,
    pub(crate) format_failures: AtomicU64,
    pub(crate) account_failures: AtomicU64,
    pub(crate) saturation_waits: AtomicU64,
    pub(crate) storage_errors: AtomicU64,
    pub(crate) reclaimed: AtomicU64,
    pub(crate) leases_lost: AtomicU64,
}

impl HubStats {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CounterSnapshot {
            accepted: get(&self.accepted),
            duplicates: get(&self.duplicates),
            rejected: get(&self.rejected),
            archived: get(&self.archived),
            discarded: get(&self.discarded),
            transient_failures: get(&self.transient_failures),
            format_failures: get(&self.format_failures),
            account_failures: get(&self.account_failures),
            saturation_waits: get(&self.saturation_waits),
            storage_errors: get(&self.storage_errors),
            reclaimed: get(&self.reclaimed),
            leases_lost: get(&self.leases_lost),
        }
    }
}

/// Point-in-time copy of [`HubStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub accepted: u64,
    pub duplicates: u64,
    pub rejected: u64,
    pub archived: u64,
    pub discarded: u64,
    pub transient_failures: u64,
    pub format_failures: u64,
    pub account_failures: u64,
    pub saturation_waits: u64,
    pub storage_errors: u64,
    pub reclaimed: u64,
    pub leases_lost: u64,
}

/// Counters plus live queue and archive depth.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct HubStatistics {
    pub counters: CounterSnapshot,
    pub cached: u64,
    pub analyzing: u64,
    pub archived_total: u64,
    pub discarded_total: u64,
}
