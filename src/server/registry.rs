//! Observability registry
//!
//! Named metric sources registered under a dotted hierarchical name, e.g.
//! `server.binary-main.worker-executor`. A protocol server registers its
//! entries in `start` and removes every one of them in `stop`.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, WireError};

/// Something that can report a set of named counters and gauges
pub trait MetricSource: Send + Sync {
    fn snapshot(&self) -> Vec<(&'static str, u64)>;
}

/// Register/unregister named metric objects
pub trait ObservabilityRegistry: Send + Sync {
    /// Register `source` under `name`; fails if the name is taken
    fn register(&self, name: &str, source: Arc<dyn MetricSource>) -> Result<()>;

    /// Remove `name`; returns whether it was registered
    fn unregister(&self, name: &str) -> bool;

    /// Every registered name, sorted
    fn names(&self) -> Vec<String>;

    /// Registered names under `prefix`
    fn names_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.names()
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect()
    }
}

/// In-memory registry
#[derive(Default)]
pub struct MetricsRegistry {
    entries: RwLock<BTreeMap<String, Arc<dyn MetricSource>>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values of one entry
    pub fn snapshot(&self, name: &str) -> Option<Vec<(&'static str, u64)>> {
        self.entries.read().get(name).map(|source| source.snapshot())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ObservabilityRegistry for MetricsRegistry {
    fn register(&self, name: &str, source: Arc<dyn MetricSource>) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(WireError::config(format!(
                "metric '{}' is already registered",
                name
            )));
        }
        entries.insert(name.to_string(), source);
        tracing::trace!("Registered metric {}", name);
        Ok(())
    }

    fn unregister(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();
        if removed {
            tracing::trace!("Unregistered metric {}", name);
        }
        removed
    }

    fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("entries", &self.names())
            .finish()
    }
}
