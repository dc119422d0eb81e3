//! The intelligence hub: submission, background tasks and the read surface.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use intelhub_collector::{Collector, CollectorRegistry};
use intelhub_shared::{
    ArchiveFilter, ArchivedItem, Fingerprint, PipelineConfig, RawDocument, Result, SchemaConfig,
};
use intelhub_storage::Storage;

use crate::accounts::AccountPool;
use crate::archive::ArchiveStore;
use crate::balance::BalanceMonitor;
use crate::dedup::{Admission, DedupStore};
use crate::provider::{BalanceQuery, CompletionProvider};
use crate::queue::CachedQueue;
use crate::stats::{HubStatistics, HubStats};
use crate::worker::AnalysisPipeline;

/// Attempts made to store one collected document before it is dropped.
const SUBMIT_ATTEMPTS: u32 = 3;
const SUBMIT_RETRY_BASE: Duration = Duration::from_millis(200);

/// Answer to a [`IntelligenceHub::submit`] call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum SubmitOutcome {
    Accepted,
    Duplicate,
    Rejected(String),
}

/// Tally of one collection pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectSummary {
    pub collectors: usize,
    pub accepted: usize,
    pub duplicates: usize,
    pub rejected: usize,
    /// Documents lost to storage errors after retries.
    pub dropped: usize,
}

/// External collaborators and policy the hub is built from.
pub struct HubDeps {
    pub storage: Arc<Storage>,
    pub pool: Arc<AccountPool>,
    pub provider: Arc<dyn CompletionProvider>,
    pub balance: Arc<dyn BalanceQuery>,
    pub schema: SchemaConfig,
    /// Fully rendered analysis prompt.
    pub prompt: String,
}

pub struct IntelligenceHub {
    dedup: DedupStore,
    queue: CachedQueue,
    archive: ArchiveStore,
    pool: Arc<AccountPool>,
    balance: Arc<dyn BalanceQuery>,
    pipeline: Arc<AnalysisPipeline>,
    registry: CollectorRegistry,
    config: PipelineConfig,
    stats: Arc<HubStats>,
}

impl IntelligenceHub {
    pub fn new(deps: HubDeps, config: PipelineConfig) -> Self {
        let stats = Arc::new(HubStats::default());
        let pipeline = Arc::new(AnalysisPipeline::new(
            Arc::clone(&deps.storage),
            Arc::clone(&deps.pool),
            deps.provider,
            deps.schema,
            deps.prompt,
            config.clone(),
            Arc::clone(&stats),
        ));
        Self {
            dedup: DedupStore::new(Arc::clone(&deps.storage)),
            queue: CachedQueue::new(Arc::clone(&deps.storage), config.lease),
            archive: ArchiveStore::new(deps.storage),
            pool: deps.pool,
            balance: deps.balance,
            pipeline,
            registry: CollectorRegistry::new(),
            config,
            stats,
        }
    }

    /// Admit a document into the pipeline.
    ///
    /// Storage failures are returned as errors so the caller can retry; a
    /// document is never reported as a duplicate unless it really was seen.
    #[instrument(skip_all, fields(item_id = %doc.item_id(), source = %doc.source_name))]
    pub async fn submit(&self, doc: RawDocument) -> Result<SubmitOutcome> {
        if let Some(reason) = rejection_reason(&doc) {
            HubStats::bump(&self.stats.rejected);
            info!(%reason, "document rejected");
            return Ok(SubmitOutcome::Rejected(reason));
        }
        match self.dedup.admit(&doc).await {
            Ok(Admission::Admitted) => {
                HubStats::bump(&self.stats.accepted);
                debug!("document accepted");
                Ok(SubmitOutcome::Accepted)
            }
            Ok(Admission::Duplicate) => {
                HubStats::bump(&self.stats.duplicates);
                debug!("duplicate document");
                Ok(SubmitOutcome::Duplicate)
            }
            Err(e) => {
                HubStats::bump(&self.stats.storage_errors);
                Err(e)
            }
        }
    }

    /// Start workers, the lease reclaimer, the balance monitor and the
    /// collection loop.
    pub fn start(self: &Arc<Self>) -> HubHandle {
        let (shutdown, rx) = watch::channel(false);
        let mut tasks = JoinSet::new();
        for worker_id in 0..self.config.workers {
            tasks.spawn(Arc::clone(&self.pipeline).run_worker(worker_id, rx.clone()));
        }
        tasks.spawn(Arc::clone(self).run_reclaimer(rx.clone()));
        tasks.spawn(self.monitor().run(rx.clone()));
        tasks.spawn(Arc::clone(self).run_collection(rx));
        info!(workers = self.config.workers, "hub started");
        HubHandle { shutdown, tasks }
    }

    /// A balance monitor over this hub's pool.
    pub fn monitor(&self) -> BalanceMonitor {
        BalanceMonitor::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.balance),
            self.config.monitor_interval,
            self.config.low_balance_interval,
            self.config.balance_query_timeout,
        )
    }

    /// Counters plus live queue and archive depth.
    pub async fn statistics(&self) -> Result<HubStatistics> {
        let queue = self.queue.counts().await?;
        let archive = self.archive.counts().await?;
        Ok(HubStatistics {
            counters: self.stats.snapshot(),
            cached: queue.cached,
            analyzing: queue.analyzing,
            archived_total: archive.archived,
            discarded_total: archive.discarded,
        })
    }

    /// A page of finalized records, newest first. A threshold excludes
    /// discarded records.
    pub async fn list_archived(
        &self,
        offset: u32,
        count: u32,
        score_threshold: Option<f64>,
    ) -> Result<Vec<ArchivedItem>> {
        self.archive
            .list(&ArchiveFilter {
                offset,
                count,
                score_threshold,
                final_state: None,
            })
            .await
    }

    /// Return expired leases to the queue. Returns how many were reclaimed.
    pub async fn reclaim_once(&self) -> Result<usize> {
        match self.queue.reclaim_expired().await {
            Ok(ids) => {
                HubStats::add(&self.stats.reclaimed, ids.len() as u64);
                Ok(ids.len())
            }
            Err(e) => {
                HubStats::bump(&self.stats.storage_errors);
                Err(e)
            }
        }
    }

    /// Poll every registered collector once and submit what they produce.
    #[instrument(skip_all)]
    pub async fn collect_once(&self) -> CollectSummary {
        let collectors = self.registry.snapshot();
        let mut summary = CollectSummary {
            collectors: collectors.len(),
            ..Default::default()
        };
        let produced =
            futures::future::join_all(collectors.iter().map(|c: &Arc<dyn Collector>| c.produce()))
                .await;

        for (collector, result) in collectors.iter().zip(produced) {
            let docs = match result {
                Ok(docs) => docs,
                Err(e) => {
                    warn!(collector = collector.name(), error = %e, "collector failed");
                    continue;
                }
            };
            for doc in docs {
                match self.submit_with_retry(doc).await {
                    Some(SubmitOutcome::Accepted) => summary.accepted += 1,
                    Some(SubmitOutcome::Duplicate) => summary.duplicates += 1,
                    Some(SubmitOutcome::Rejected(_)) => summary.rejected += 1,
                    None => summary.dropped += 1,
                }
            }
        }

        info!(
            collectors = summary.collectors,
            accepted = summary.accepted,
            duplicates = summary.duplicates,
            rejected = summary.rejected,
            dropped = summary.dropped,
            "collection pass complete"
        );
        summary
    }

    pub fn registry(&self) -> &CollectorRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<AccountPool> {
        &self.pool
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.archive
    }

    pub fn pipeline(&self) -> &Arc<AnalysisPipeline> {
        &self.pipeline
    }

    async fn submit_with_retry(&self, doc: RawDocument) -> Option<SubmitOutcome> {
        let mut delay = SUBMIT_RETRY_BASE;
        for attempt in 1..=SUBMIT_ATTEMPTS {
            match self.submit(doc.clone()).await {
                Ok(outcome) => return Some(outcome),
                Err(e) if attempt < SUBMIT_ATTEMPTS => {
                    warn!(item_id = doc.item_id(), attempt, error = %e, "submit failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    error!(item_id = doc.item_id(), attempt, error = %e, "submit failed, dropping document");
                }
            }
        }
        None
    }

    async fn run_reclaimer(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.reclaim_interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.reclaim_once().await {
                error!(error = %e, "lease reclaim failed");
            }
        }
        debug!("reclaimer stopping");
    }

    async fn run_collection(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if !self.registry.snapshot().is_empty() {
                tokio::select! {
                    _ = self.collect_once() => {}
                    _ = shutdown.changed() => {}
                }
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.collect_interval) => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }
        }
        debug!("collection loop stopping");
    }
}

/// Running background tasks of a started hub.
pub struct HubHandle {
    shutdown: watch::Sender<bool>,
    tasks: JoinSet<()>,
}

impl HubHandle {
    /// Signal every task to stop and wait for them.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        while let Some(joined) = self.tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "hub task panicked");
            }
        }
        info!("hub stopped");
    }
}

fn rejection_reason(doc: &RawDocument) -> Option<String> {
    if doc.body.trim().is_empty() {
        return Some("empty body".into());
    }
    if let Err(e) = Url::parse(&doc.source_url) {
        return Some(format!("unparsable source url: {e}"));
    }
    if doc.fingerprint != Fingerprint::compute(&doc.source_url, &doc.body) {
        return Some("fingerprint does not match content".into());
    }
    None
}
