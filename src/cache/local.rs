//! In-process cache manager

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{Result, WireError};
use crate::server::admin::{LocalTaskManager, TaskManager};
use crate::server::lifecycle::ComponentStatus;
use crate::server::registry::{MetricsRegistry, ObservabilityRegistry};

use super::CacheManager;

/// Name of the cache used when none is given
pub const DEFAULT_CACHE_NAME: &str = "default";

/// A named in-memory map
#[derive(Debug)]
pub struct LocalCache {
    name: String,
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl LocalCache {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.read().get(key).cloned()
    }

    /// Store a value, returning the previous one
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) -> Option<Vec<u8>> {
        self.entries.write().insert(key, value)
    }

    pub fn remove(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.entries.write().remove(key)
    }

    pub fn contains_key(&self, key: &[u8]) -> bool {
        self.entries.read().contains_key(key)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn size(&self) -> u64 {
        self.entries.read().len() as u64
    }
}

/// Cache manager holding every cache in this process
pub struct LocalCacheManager {
    name: String,
    default_cache: String,
    defined: Vec<String>,
    caches: RwLock<BTreeMap<String, Arc<LocalCache>>>,
    status: Mutex<ComponentStatus>,
    topology_id: AtomicU32,
    registry: Arc<MetricsRegistry>,
    task_manager: Option<Arc<dyn TaskManager>>,
}

impl LocalCacheManager {
    /// A manager named `name` with a local task manager
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            default_cache: DEFAULT_CACHE_NAME.to_string(),
            defined: Vec::new(),
            caches: RwLock::new(BTreeMap::new()),
            status: Mutex::new(ComponentStatus::Instantiated),
            topology_id: AtomicU32::new(1),
            registry: Arc::new(MetricsRegistry::new()),
            task_manager: Some(Arc::new(LocalTaskManager::new())),
        }
    }

    /// Define caches created when the manager starts
    pub fn with_caches<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.defined.extend(names.into_iter().map(Into::into));
        self
    }

    /// Set the cache used when a request names none
    pub fn with_default_cache(mut self, name: impl Into<String>) -> Self {
        self.default_cache = name.into();
        self
    }

    /// Replace the task manager
    pub fn with_task_manager(mut self, task_manager: Arc<dyn TaskManager>) -> Self {
        self.task_manager = Some(task_manager);
        self
    }

    /// Run without a task manager
    pub fn without_task_manager(mut self) -> Self {
        self.task_manager = None;
        self
    }

    /// Concrete registry, for inspection
    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.registry
    }

    /// Announce a new topology; returns the new id
    pub fn bump_topology(&self) -> u32 {
        let id = self.topology_id.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::info!("Cache manager {} moved to topology {}", self.name, id);
        id
    }

    fn create(&self, name: &str) -> Result<Arc<LocalCache>> {
        if name.is_empty() {
            return Err(WireError::config("cache name must not be empty"));
        }
        let mut caches = self.caches.write();
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!("Cache manager {} created cache {}", self.name, name);
                Arc::new(LocalCache::new(name))
            });
        Ok(Arc::clone(cache))
    }
}

impl CacheManager for LocalCacheManager {
    fn name(&self) -> &str {
        &self.name
    }

    fn start(&self) -> Result<()> {
        let mut status = self.status.lock();
        if status.is_running() {
            return Ok(());
        }
        if self.name.is_empty() {
            return Err(WireError::config("cache manager name must not be empty"));
        }
        if self.defined.iter().any(|n| n.is_empty()) {
            return Err(WireError::config(format!(
                "cache manager {} defines a cache with an empty name",
                self.name
            )));
        }

        *status = ComponentStatus::Starting;
        for name in self.defined.iter().chain(std::iter::once(&self.default_cache)) {
            if let Err(e) = self.create(name) {
                *status = ComponentStatus::Terminated;
                return Err(e);
            }
        }
        *status = ComponentStatus::Running;
        tracing::info!(
            "Cache manager {} started with {} caches",
            self.name,
            self.caches.read().len()
        );
        Ok(())
    }

    fn stop(&self) {
        let mut status = self.status.lock();
        if *status == ComponentStatus::Terminated {
            return;
        }
        self.caches.write().clear();
        *status = ComponentStatus::Terminated;
        tracing::info!("Cache manager {} stopped", self.name);
    }

    fn status(&self) -> ComponentStatus {
        *self.status.lock()
    }

    fn default_cache_name(&self) -> &str {
        &self.default_cache
    }

    fn cache_names(&self) -> Vec<String> {
        self.caches.read().keys().cloned().collect()
    }

    fn cache_exists(&self, name: &str) -> bool {
        self.caches.read().contains_key(name)
    }

    fn get_cache(&self, name: &str) -> Option<Arc<LocalCache>> {
        self.caches.read().get(name).cloned()
    }

    fn get_or_create_cache(&self, name: &str) -> Result<Arc<LocalCache>> {
        if let Some(cache) = self.get_cache(name) {
            return Ok(cache);
        }
        self.create(name)
    }

    fn remove_cache(&self, name: &str) -> bool {
        let removed = self.caches.write().remove(name).is_some();
        if removed {
            tracing::debug!("Cache manager {} removed cache {}", self.name, name);
        }
        removed
    }

    fn topology_id(&self) -> u32 {
        self.topology_id.load(Ordering::Acquire)
    }

    fn registry(&self) -> Arc<dyn ObservabilityRegistry> {
        self.registry.clone()
    }

    fn task_manager(&self) -> Option<Arc<dyn TaskManager>> {
        self.task_manager.clone()
    }
}

impl std::fmt::Debug for LocalCacheManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheManager")
            .field("name", &self.name)
            .field("caches", &self.cache_names())
            .field("status", &self.status())
            .finish()
    }
}
