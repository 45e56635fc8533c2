//! Server management capability
//!
//! What the HTTP endpoints (and embedding code) may do to a running server
//! process. Implemented by the orchestrator.

use std::env;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::Serialize;

use crate::cache::CacheManager;
use crate::config::ServerConfigView;
use crate::error::Result;

use super::lifecycle::ComponentStatus;

pub trait ServerManagement: Send + Sync {
    /// Server version string
    fn version(&self) -> &str;

    fn status(&self) -> ComponentStatus;

    /// Effective configuration, with the ports actually bound
    fn configuration(&self) -> ServerConfigView;

    /// Names of the cache managers
    fn cache_manager_names(&self) -> Vec<String>;

    fn get_cache_manager(&self, name: &str) -> Option<Arc<dyn CacheManager>>;

    /// Stop serving `cache` on every protocol server
    fn ignore_cache(&self, cache_manager: &str, cache: &str) -> Result<()>;

    /// Serve `cache` again; returns whether it was ignored
    fn unignore_cache(&self, cache_manager: &str, cache: &str) -> Result<bool>;

    /// Ignored cache names of `cache_manager`
    fn ignored_caches(&self, cache_manager: &str) -> Result<Vec<String>>;

    /// Delay used by `stop_after` when none is given
    fn shutdown_delay(&self) -> Duration;

    /// Stop the whole process after `delay`, without blocking the caller
    fn stop_after(&self, delay: Duration);
}

/// Facts about the running process
///
/// Environment variables are not included.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessEnvironment {
    pub version: String,
    pub os: String,
    pub arch: String,
    pub family: String,
    pub pid: u32,
    pub executable: Option<String>,
    pub current_dir: Option<String>,
    pub args: Vec<String>,
    pub available_parallelism: usize,
}

impl ProcessEnvironment {
    pub fn capture() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            os: env::consts::OS.to_string(),
            arch: env::consts::ARCH.to_string(),
            family: env::consts::FAMILY.to_string(),
            pid: std::process::id(),
            executable: env::current_exe().ok().map(|p| p.display().to_string()),
            current_dir: env::current_dir().ok().map(|p| p.display().to_string()),
            args: env::args().collect(),
            available_parallelism: thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }
}
