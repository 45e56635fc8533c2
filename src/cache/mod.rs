//! Cache Module
//!
//! The cache manager collaborator consumed by the protocol servers: named
//! caches created on demand, a topology id, and the registries a server
//! plugs its metrics and admin task engines into.
//!
//! Storage is a plain in-memory map. Eviction, expiry and clustering are
//! not modelled.

mod local;

use std::sync::Arc;

use crate::error::Result;
use crate::server::admin::TaskManager;
use crate::server::lifecycle::ComponentStatus;
use crate::server::registry::ObservabilityRegistry;

pub use local::{LocalCache, LocalCacheManager, DEFAULT_CACHE_NAME};

/// Creates and looks up named caches
pub trait CacheManager: Send + Sync {
    /// Name of this cache manager
    fn name(&self) -> &str;

    /// Start the manager and define its configured caches
    fn start(&self) -> Result<()>;

    fn stop(&self);

    fn status(&self) -> ComponentStatus;

    /// Cache used when a request names none
    fn default_cache_name(&self) -> &str;

    /// Names of every defined cache, sorted
    fn cache_names(&self) -> Vec<String>;

    fn cache_exists(&self, name: &str) -> bool {
        self.cache_names().iter().any(|n| n == name)
    }

    /// An existing cache
    fn get_cache(&self, name: &str) -> Option<Arc<LocalCache>>;

    /// An existing cache, or a freshly created empty one
    fn get_or_create_cache(&self, name: &str) -> Result<Arc<LocalCache>>;

    /// Remove a cache; returns whether it existed
    fn remove_cache(&self, name: &str) -> bool;

    /// Current topology id, announced in every response header
    fn topology_id(&self) -> u32;

    /// Where servers register their metrics
    fn registry(&self) -> Arc<dyn ObservabilityRegistry>;

    /// Where servers register admin task engines, if available
    fn task_manager(&self) -> Option<Arc<dyn TaskManager>>;
}
