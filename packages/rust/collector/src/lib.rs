//! Document collectors and the process-wide collector registry.
//!
//! This crate provides:
//! - [`Collector`]: the narrow capability the hub depends on
//! - [`CollectorRegistry`]: explicit registration/deregistration of collectors
//! - [`FeedCollector`] and [`PageCollector`]: built-in RSS/Atom and HTML variants

mod extract;
mod http;

pub mod feed;
pub mod page;

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use intelhub_shared::{CollectorEntry, CollectorKind, IntelHubError, RawDocument, Result};

pub use feed::FeedCollector;
pub use page::PageCollector;

/// Default HTTP timeout for collector requests.
const COLLECT_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Anything that can produce raw documents for the hub.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Unique collector name; also the `source_name` of its documents.
    fn name(&self) -> &str;

    /// Produce the documents currently available from this source.
    async fn produce(&self) -> Result<Vec<RawDocument>>;
}

/// Build a collector from a `[[collectors]]` config entry.
pub fn from_config(entry: &CollectorEntry) -> Result<Arc<dyn Collector>> {
    if entry.urls.is_empty() {
        return Err(IntelHubError::config(format!(
            "collector '{}' has no urls",
            entry.name
        )));
    }
    let collector: Arc<dyn Collector> = match entry.kind {
        CollectorKind::Rss => Arc::new(FeedCollector::new(&entry.name, &entry.urls, COLLECT_TIMEOUT)?),
        CollectorKind::Page => Arc::new(PageCollector::new(&entry.name, &entry.urls, COLLECT_TIMEOUT)?),
    };
    Ok(collector)
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Process-wide set of active collectors, keyed by name.
///
/// Polling loops take a [`snapshot`](Self::snapshot) so registration changes
/// never block an in-progress collection pass.
#[derive(Default)]
pub struct CollectorRegistry {
    collectors: RwLock<BTreeMap<String, Arc<dyn Collector>>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a collector. Fails if one with the same name is already registered.
    pub fn register(&self, collector: Arc<dyn Collector>) -> Result<()> {
        let name = collector.name().to_string();
        let mut map = self.collectors.write().unwrap_or_else(|e| e.into_inner());
        if map.contains_key(&name) {
            return Err(IntelHubError::validation(format!(
                "collector '{name}' is already registered"
            )));
        }
        map.insert(name.clone(), collector);
        info!(collector = %name, "collector registered");
        Ok(())
    }

    /// Remove a collector by name. Returns `false` if it was not registered.
    pub fn deregister(&self, name: &str) -> bool {
        let removed = self
            .collectors
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(name)
            .is_some();
        if removed {
            info!(collector = %name, "collector deregistered");
        }
        removed
    }

    /// The currently registered collectors, in name order.
    pub fn snapshot(&self) -> Vec<Arc<dyn Collector>> {
        self.collectors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    /// Names of the registered collectors.
    pub fn names(&self) -> Vec<String> {
        self.collectors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    struct Fixed(&'static str);

    #[async_trait]
    impl Collector for Fixed {
        fn name(&self) -> &str {
            self.0
        }

        async fn produce(&self) -> Result<Vec<RawDocument>> {
            Ok(vec![RawDocument::new(self.0, "https://example.com/a", None, "body", Utc::now())])
        }
    }

    #[test]
    fn register_rejects_duplicate_names() {
        let registry = CollectorRegistry::new();
        registry.register(Arc::new(Fixed("wire"))).unwrap();
        let err = registry.register(Arc::new(Fixed("wire"))).unwrap_err();
        assert!(err.to_string().contains("already registered"));
        assert_eq!(registry.names(), vec!["wire".to_string()]);
    }

    #[tokio::test]
    async fn deregister_removes_from_snapshot() {
        let registry = CollectorRegistry::new();
        registry.register(Arc::new(Fixed("b"))).unwrap();
        registry.register(Arc::new(Fixed("a"))).unwrap();

        let snapshot = registry.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].name(), "a");
        assert_eq!(snapshot[0].produce().await.unwrap().len(), 1);

        assert!(registry.deregister("a"));
        assert!(!registry.deregister("a"));
        assert_eq!(registry.names(), vec!["b".to_string()]);
        // A snapshot taken earlier is unaffected
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn from_config_builds_variants() {
        let entry = CollectorEntry {
            name: "wire".into(),
            kind: CollectorKind::Rss,
            urls: vec!["https://example.com/feed.xml".into()],
            enabled: true,
        };
        assert_eq!(from_config(&entry).unwrap().name(), "wire");

        let empty = CollectorEntry { urls: vec![], ..entry };
        assert!(from_config(&empty).is_err());
    }
}
