//! Time-bounded cache of the aggregated tool set.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::ToolDescriptor;
use crate::names::NameMapping;
use crate::registry::ProviderRegistry;
use crate::{Error, Result};

pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// An immutable view of the catalog and the names built from it.
#[derive(Debug, Default)]
pub struct Snapshot {
    tools: Vec<ToolDescriptor>,
    index: HashMap<String, usize>,
    names: NameMapping,
}

impl Snapshot {
    /// Tools are kept in id order; duplicate ids keep their first entry.
    pub fn new(mut tools: Vec<ToolDescriptor>) -> Self {
        tools.sort_by(|a, b| a.id.cmp(&b.id));
        tools.dedup_by(|a, b| a.id == b.id);
        let index = tools
            .iter()
            .enumerate()
            .map(|(i, t)| (t.id.clone(), i))
            .collect();
        let names = NameMapping::build(&tools);
        Self {
            tools,
            index,
            names,
        }
    }

    pub fn tools(&self) -> &[ToolDescriptor] {
        &self.tools
    }

    pub fn names(&self) -> &NameMapping {
        &self.names
    }

    pub fn get(&self, id: &str) -> Option<&ToolDescriptor> {
        self.index.get(id).map(|&i| &self.tools[i])
    }

    /// The descriptor a friendly name or id refers to in this snapshot.
    pub fn lookup(&self, name_or_id: &str) -> Option<&ToolDescriptor> {
        self.names.resolve(name_or_id).and_then(|id| self.get(id))
    }

    pub fn friendly_name(&self, id: &str) -> Option<&str> {
        self.names.friendly_name(id)
    }
}

/// One catalog entry as listed by discovery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Listing {
    pub name: String,
    pub id: String,
    pub provider: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub tools: Vec<Listing>,
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

struct CacheEntry {
    snapshot: Arc<Snapshot>,
    created: Instant,
    generation: u64,
}

/// Caches the provider registry's tool list for a fixed TTL.
///
/// The snapshot is swapped whole on refresh, so readers never see a
/// half-built mapping. A refresh that fails keeps serving the previous
/// snapshot when there is one.
pub struct ToolCatalog {
    registry: Arc<dyn ProviderRegistry>,
    ttl: Duration,
    cache: RwLock<Option<CacheEntry>>,
    refreshes: AtomicU64,
}

impl ToolCatalog {
    pub fn new(registry: Arc<dyn ProviderRegistry>) -> Self {
        Self::with_ttl(registry, DEFAULT_TTL)
    }

    pub fn with_ttl(registry: Arc<dyn ProviderRegistry>, ttl: Duration) -> Self {
        Self {
            registry,
            ttl,
            cache: RwLock::new(None),
            refreshes: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<dyn ProviderRegistry> {
        &self.registry
    }

    /// The current snapshot, refreshing first if it expired, was
    /// invalidated, or the registry's providers changed.
    pub async fn get(&self) -> Result<Arc<Snapshot>> {
        let generation = self.registry.generation();
        {
            let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some(entry) = cache.as_ref()
                && entry.generation == generation
                && entry.created.elapsed() < self.ttl
            {
                return Ok(entry.snapshot.clone());
            }
        }
        self.refresh().await
    }

    /// Rebuild from the registry unconditionally.
    pub async fn refresh(&self) -> Result<Arc<Snapshot>> {
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        let generation = self.registry.generation();
        let started = Instant::now();

        match self.registry.list_all().await {
            Ok(tools) => {
                let snapshot = Arc::new(Snapshot::new(tools));
                debug!(
                    tools = snapshot.tools().len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "tool catalog refreshed"
                );
                *self.cache.write().unwrap_or_else(|p| p.into_inner()) = Some(CacheEntry {
                    snapshot: snapshot.clone(),
                    created: Instant::now(),
                    generation,
                });
                Ok(snapshot)
            }
            Err(e) => {
                let stale = self
                    .cache
                    .read()
                    .unwrap_or_else(|p| p.into_inner())
                    .as_ref()
                    .map(|entry| entry.snapshot.clone());
                match stale {
                    Some(snapshot) => {
                        warn!(error = %e, "catalog refresh failed, serving previous snapshot");
                        Ok(snapshot)
                    }
                    None => Err(match e {
                        Error::Unavailable(message) => Error::Unavailable(message),
                        other => Error::Unavailable(other.to_string()),
                    }),
                }
            }
        }
    }

    /// Drop the snapshot so the next [`get`](Self::get) rebuilds.
    pub fn invalidate(&self) {
        *self.cache.write().unwrap_or_else(|p| p.into_inner()) = None;
        debug!("tool catalog invalidated");
    }

    /// How many times the registry has been listed.
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::SeqCst)
    }

    /// One page of the catalog in id order.
    pub async fn page(&self, limit: usize, offset: usize) -> Result<Page> {
        let snapshot = self.get().await?;
        let total = snapshot.tools().len();
        let tools: Vec<Listing> = snapshot
            .tools()
            .iter()
            .skip(offset)
            .take(limit)
            .map(|tool| Listing {
                name: snapshot
                    .friendly_name(&tool.id)
                    .unwrap_or(&tool.id)
                    .to_string(),
                id: tool.id.clone(),
                provider: tool.provider_name.clone(),
                description: tool.description.clone(),
            })
            .collect();
        let has_more = offset.saturating_add(tools.len()) < total;
        Ok(Page {
            tools,
            total,
            offset,
            limit,
            has_more,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcp::CallToolResult;
    use serde_json::Value;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicBool;

    #[derive(Default)]
    struct Listed {
        tools: Mutex<Vec<ToolDescriptor>>,
        failing: AtomicBool,
        generation: AtomicU64,
    }

    impl Listed {
        fn with(tools: Vec<ToolDescriptor>) -> Arc<Self> {
            let registry = Self::default();
            *registry.tools.lock().unwrap() = tools;
            Arc::new(registry)
        }
    }

    #[async_trait]
    impl ProviderRegistry for Listed {
        async fn list_all(&self) -> Result<Vec<ToolDescriptor>> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Provider("registry down".into()));
            }
            Ok(self.tools.lock().unwrap().clone())
        }

        async fn call_by_id(&self, _: &str, _: Value, _: Option<&str>) -> Result<CallToolResult> {
            Ok(CallToolResult::text("ok"))
        }

        async fn abort(&self, _: &str) -> bool {
            false
        }

        fn generation(&self) -> u64 {
            self.generation.load(Ordering::SeqCst)
        }
    }

    fn tools(n: usize) -> Vec<ToolDescriptor> {
        (0..n)
            .map(|i| ToolDescriptor::new("p", "P", format!("t{i}")))
            .collect()
    }

    #[tokio::test]
    async fn warm_cache_is_reused() {
        let catalog = ToolCatalog::new(Listed::with(tools(2)));
        catalog.get().await.unwrap();
        catalog.get().await.unwrap();
        assert_eq!(catalog.refresh_count(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_one_refresh() {
        let catalog = ToolCatalog::new(Listed::with(tools(2)));
        catalog.get().await.unwrap();
        catalog.invalidate();
        catalog.get().await.unwrap();
        catalog.get().await.unwrap();
        assert_eq!(catalog.refresh_count(), 2);
    }

    #[tokio::test]
    async fn expired_entries_are_rebuilt() {
        let catalog = ToolCatalog::with_ttl(Listed::with(tools(1)), Duration::ZERO);
        catalog.get().await.unwrap();
        catalog.get().await.unwrap();
        assert_eq!(catalog.refresh_count(), 2);
    }

    #[tokio::test]
    async fn generation_change_invalidates() {
        let registry = Listed::with(tools(1));
        let catalog = ToolCatalog::new(registry.clone());
        catalog.get().await.unwrap();
        registry.tools.lock().unwrap().extend(tools(3));
        registry.generation.fetch_add(1, Ordering::SeqCst);
        let snapshot = catalog.get().await.unwrap();
        assert_eq!(snapshot.tools().len(), 3);
        assert_eq!(catalog.refresh_count(), 2);
    }

    #[tokio::test]
    async fn failed_refresh_serves_previous_snapshot() {
        let registry = Listed::with(tools(2));
        let catalog = ToolCatalog::with_ttl(registry.clone(), Duration::ZERO);
        catalog.get().await.unwrap();
        registry.failing.store(true, Ordering::SeqCst);
        let snapshot = catalog.get().await.unwrap();
        assert_eq!(snapshot.tools().len(), 2);
    }

    #[tokio::test]
    async fn failed_first_refresh_is_unavailable() {
        let registry = Listed::with(tools(2));
        registry.failing.store(true, Ordering::SeqCst);
        let catalog = ToolCatalog::new(registry);
        let err = catalog.get().await.unwrap_err();
        assert!(matches!(err, Error::Unavailable(ref m) if m.contains("registry down")), "{err}");
    }

    #[tokio::test]
    async fn pages_in_id_order() {
        let catalog = ToolCatalog::new(Listed::with(tools(5)));
        let page = catalog.page(2, 1).await.unwrap();
        let ids: Vec<_> = page.tools.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, ["p__t1", "p__t2"]);
        assert_eq!(page.total, 5);
        assert!(page.has_more);
        assert_eq!(page.tools[0].name, "pT1");

        let last = catalog.page(10, 4).await.unwrap();
        assert_eq!(last.tools.len(), 1);
        assert!(!last.has_more);

        let beyond = catalog.page(10, 50).await.unwrap();
        assert!(beyond.tools.is_empty());
        assert_eq!(beyond.total, 5);
    }

    #[test]
    fn snapshot_lookup_by_name_or_id() {
        let snapshot = Snapshot::new(tools(2));
        assert_eq!(snapshot.lookup("pT0").map(|t| t.id.as_str()), Some("p__t0"));
        assert_eq!(snapshot.lookup("p__t1").map(|t| t.id.as_str()), Some("p__t1"));
        assert!(snapshot.lookup("p__gone").is_none());
        assert!(snapshot.lookup("nope").is_none());
    }
}
