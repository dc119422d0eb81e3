//! Cached queue: lease-based claim, release and reclamation.
//!
//! A claim hands out a lease token. Every later transition on the item must
//! present it; a stale token yields [`IntelHubError::LeaseLost`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use intelhub_shared::{IntelHubError, Result};
use intelhub_storage::{AttemptDraft, ClaimedItem, QueueCounts, Storage};

#[derive(Clone)]
pub struct CachedQueue {
    storage: Arc<Storage>,
    lease: Duration,
}

impl CachedQueue {
    pub fn new(storage: Arc<Storage>, lease: Duration) -> Self {
        Self { storage, lease }
    }

    /// Lease duration granted on claim and renewal.
    pub fn lease(&self) -> Duration {
        self.lease
    }

    /// Move one due CACHED item to ANALYZING. No two callers receive the same item.
    pub async fn claim(&self) -> Result<Option<ClaimedItem>> {
        let claimed = self.storage.claim_next(self.lease).await?;
        if let Some(c) = &claimed {
            debug!(item_id = %c.item.item_id(), "item claimed");
        }
        Ok(claimed)
    }

    /// Extend the lease on a held item by a full lease period.
    pub async fn renew(&self, claim: &ClaimedItem) -> Result<()> {
        let held = self
            .storage
            .renew_lease(claim.item.item_id(), &claim.lease_token, self.lease)
            .await?;
        lease_held(held, claim)
    }

    /// Return a held item to CACHED, claimable again after `delay`.
    pub async fn release(&self, claim: &ClaimedItem, delay: Duration) -> Result<()> {
        let held = self
            .storage
            .release(claim.item.item_id(), &claim.lease_token, delay)
            .await?;
        lease_held(held, claim)
    }

    /// Record an attempt against a held item. Returns its per-kind number.
    pub async fn record_attempt(&self, claim: &ClaimedItem, draft: AttemptDraft<'_>) -> Result<u32> {
        self.storage
            .record_attempt(claim.item.item_id(), &claim.lease_token, draft)
            .await?
            .ok_or_else(|| IntelHubError::LeaseLost {
                item_id: claim.item.item_id().to_string(),
            })
    }

    /// Return every expired ANALYZING item to CACHED.
    pub async fn reclaim_expired(&self) -> Result<Vec<String>> {
        let reclaimed = self.storage.reclaim_expired().await?;
        for id in &reclaimed {
            info!(item_id = %id, "expired lease reclaimed");
        }
        Ok(reclaimed)
    }

    pub async fn counts(&self) -> Result<QueueCounts> {
        self.storage.queue_counts().await
    }
}

fn lease_held(held: bool, claim: &ClaimedItem) -> Result<()> {
    if held {
        Ok(())
    } else {
        Err(IntelHubError::LeaseLost {
            item_id: claim.item.item_id().to_string(),
        })
    }
}
