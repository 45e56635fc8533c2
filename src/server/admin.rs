//! Admin operations
//!
//! An admin operations handler is a task engine: a named set of
//! administrative tasks run against a cache manager. Protocol servers
//! register their handler with the cache manager's task manager at startup.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::cache::CacheManager;
use crate::error::{Result, WireError};

/// Parameters of a task invocation
pub type TaskParameters = HashMap<String, String>;

/// A named engine of administrative tasks
pub trait AdminOperationsHandler: Debug + Send + Sync {
    /// Engine name, unique within a task manager
    fn name(&self) -> &str;

    /// Names of the tasks this engine runs
    fn tasks(&self) -> Vec<&'static str>;

    /// Run `task` against `cache_manager`
    fn execute(
        &self,
        task: &str,
        parameters: &TaskParameters,
        cache_manager: &dyn CacheManager,
    ) -> Result<String>;
}

/// Cache administration tasks
#[derive(Debug, Default)]
pub struct ServerAdminOperationsHandler;

impl ServerAdminOperationsHandler {
    pub const NAME: &'static str = "server-admin";

    pub fn new() -> Self {
        Self
    }
}

impl AdminOperationsHandler for ServerAdminOperationsHandler {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn tasks(&self) -> Vec<&'static str> {
        vec!["cache-create", "cache-remove", "cache-names"]
    }

    fn execute(
        &self,
        task: &str,
        parameters: &TaskParameters,
        cache_manager: &dyn CacheManager,
    ) -> Result<String> {
        let cache_name = || {
            parameters
                .get("name")
                .filter(|name| !name.is_empty())
                .ok_or_else(|| WireError::config(format!("task {} requires a 'name' parameter", task)))
        };

        match task {
            "cache-create" => {
                let name = cache_name()?;
                cache_manager.get_or_create_cache(name)?;
                Ok(name.clone())
            }
            "cache-remove" => {
                let name = cache_name()?;
                if cache_manager.remove_cache(name) {
                    Ok(name.clone())
                } else {
                    Err(WireError::config(format!("cache {} does not exist", name)))
                }
            }
            "cache-names" => Ok(cache_manager.cache_names().join(",")),
            other => Err(WireError::config(format!(
                "unknown task {} for engine {}",
                other,
                Self::NAME
            ))),
        }
    }
}

// =============================================================================
// Task Manager
// =============================================================================

/// Registry of task engines
pub trait TaskManager: Send + Sync {
    /// Register an engine; registering the same name again is a no-op
    fn register_engine(&self, engine: Arc<dyn AdminOperationsHandler>) -> Result<()>;

    fn unregister_engine(&self, name: &str) -> bool;

    /// Names of every registered engine, sorted
    fn engines(&self) -> Vec<String>;

    /// Run `task` on the engine named `engine`
    fn run_task(
        &self,
        engine: &str,
        task: &str,
        parameters: &TaskParameters,
        cache_manager: &dyn CacheManager,
    ) -> Result<String>;
}

/// In-process task manager
#[derive(Debug, Default)]
pub struct LocalTaskManager {
    engines: RwLock<BTreeMap<String, Arc<dyn AdminOperationsHandler>>>,
}

impl LocalTaskManager {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TaskManager for LocalTaskManager {
    fn register_engine(&self, engine: Arc<dyn AdminOperationsHandler>) -> Result<()> {
        let name = engine.name().to_string();
        if name.is_empty() {
            return Err(WireError::config("task engine name must not be empty"));
        }
        let mut engines = self.engines.write();
        if !engines.contains_key(&name) {
            tracing::debug!("Registered task engine {} ({:?})", name, engine.tasks());
            engines.insert(name, engine);
        }
        Ok(())
    }

    fn unregister_engine(&self, name: &str) -> bool {
        self.engines.write().remove(name).is_some()
    }

    fn engines(&self) -> Vec<String> {
        self.engines.read().keys().cloned().collect()
    }

    fn run_task(
        &self,
        engine: &str,
        task: &str,
        parameters: &TaskParameters,
        cache_manager: &dyn CacheManager,
    ) -> Result<String> {
        let handler = self
            .engines
            .read()
            .get(engine)
            .cloned()
            .ok_or_else(|| WireError::config(format!("no task engine named {}", engine)))?;
        tracing::debug!("Running task {}:{}", engine, task);
        handler.execute(task, parameters, cache_manager)
    }
}
