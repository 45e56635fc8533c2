//! Cache visibility control
//!
//! One `IgnoredCaches` set is shared by every protocol server of a process,
//! so ignoring a cache through any of them hides it from all of them.

use std::collections::BTreeSet;

use parking_lot::RwLock;

/// Names of caches that servers must refuse to serve
#[derive(Debug, Default)]
pub struct IgnoredCaches {
    names: RwLock<BTreeSet<String>>,
}

impl IgnoredCaches {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start refusing requests for `cache`; returns false if already ignored
    pub fn ignore(&self, cache: &str) -> bool {
        let added = self.names.write().insert(cache.to_string());
        if added {
            tracing::info!("Cache {} is now ignored", cache);
        }
        added
    }

    /// Serve `cache` again; returns whether it was ignored
    pub fn unignore(&self, cache: &str) -> bool {
        let removed = self.names.write().remove(cache);
        if removed {
            tracing::info!("Cache {} is no longer ignored", cache);
        }
        removed
    }

    pub fn is_ignored(&self, cache: &str) -> bool {
        self.names.read().contains(cache)
    }

    /// Ignored cache names, sorted
    pub fn list(&self) -> Vec<String> {
        self.names.read().iter().cloned().collect()
    }
}
