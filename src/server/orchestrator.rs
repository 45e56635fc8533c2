//! Orchestrator
//!
//! Runs a whole server process: one cache manager, every configured
//! protocol server and, optionally, the single-port router in front of the
//! servers that do not bind their own port.
//!
//! ## Start sequence
//! ```text
//!   cache manager ──► protocol servers (in parallel) ──► collect routes ──► router
//!        │                      │
//!   config error:          one failure:
//!   abort everything       log, keep the others
//! ```
//! The router starts only after every route is known, so its first table
//! is complete.

use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::cache::CacheManager;
use crate::config::{ConnectorView, ServerConfig, ServerConfigView};
use crate::error::{LifecycleError, Result, WireError};
use crate::router::{Route, RoutingTable, SinglePortRouter};
use crate::security::SecurityProviders;

use super::admin::{AdminOperationsHandler, ServerAdminOperationsHandler};
use super::ignore::IgnoredCaches;
use super::lifecycle::ComponentStatus;
use super::management::ServerManagement;
use super::protocol_server::ProtocolServer;

struct OrchestratorInner {
    this: Weak<OrchestratorInner>,
    config: ServerConfig,
    cache_manager: Arc<dyn CacheManager>,
    security: Arc<SecurityProviders>,
    ignored: Arc<IgnoredCaches>,
    admin: Arc<dyn AdminOperationsHandler>,
    servers: RwLock<Vec<ProtocolServer>>,
    router: Mutex<Option<SinglePortRouter>>,
    status: Mutex<ComponentStatus>,
    exited: Condvar,
}

/// The server process
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

impl Orchestrator {
    pub fn new(
        config: ServerConfig,
        cache_manager: Arc<dyn CacheManager>,
        security: Arc<SecurityProviders>,
    ) -> Self {
        Self {
            inner: Arc::new_cyclic(|this| OrchestratorInner {
                this: this.clone(),
                config,
                cache_manager,
                security,
                ignored: Arc::new(IgnoredCaches::new()),
                admin: Arc::new(ServerAdminOperationsHandler::new()),
                servers: RwLock::new(Vec::new()),
                router: Mutex::new(None),
                status: Mutex::new(ComponentStatus::Instantiated),
                exited: Condvar::new(),
            }),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start the cache manager, the protocol servers and the router
    ///
    /// A configuration error from the cache manager aborts the start. A
    /// protocol server failing to start is logged; the others keep running.
    pub fn start(&self) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            if !status.can_start() {
                return Err(WireError::config(format!("server cannot start while {}", *status)));
            }
            *status = ComponentStatus::Starting;
        }

        // Step 1: cache manager
        if let Err(e) = self.inner.cache_manager.start() {
            tracing::error!(
                "Cache manager {} failed to start: {}",
                self.inner.cache_manager.name(),
                e
            );
            self.inner.cache_manager.stop();
            self.set_status(ComponentStatus::Terminated);
            return Err(e);
        }

        // Step 2: protocol servers, in parallel
        let management: Weak<dyn ServerManagement> = self.inner.this.clone();
        let servers: Vec<(ProtocolServer, _)> = self
            .inner
            .config
            .connectors
            .iter()
            .map(|connector| {
                let server = ProtocolServer::with_collaborators(
                    connector.protocol,
                    Arc::clone(&self.inner.ignored),
                    Arc::clone(&self.inner.security),
                );
                server.set_management(management.clone());
                let mut config = connector.server.clone();
                config.admin_operations_handler = Some(Arc::clone(&self.inner.admin));
                (server, config)
            })
            .collect();

        let cache_manager = &self.inner.cache_manager;
        let started: Vec<bool> = thread::scope(|scope| {
            let handles: Vec<_> = servers
                .iter()
                .map(|(server, config)| {
                    scope.spawn(move || server.start(config.clone(), Arc::clone(cache_manager)))
                })
                .collect();
            handles
                .into_iter()
                .zip(&servers)
                .map(|(handle, (server, _))| match handle.join() {
                    Ok(Ok(())) => true,
                    Ok(Err(e)) => {
                        tracing::error!("Server {} failed to start: {}", server.qualified_name(), e);
                        false
                    }
                    Err(_) => {
                        tracing::error!("Server {} panicked while starting", server.qualified_name());
                        server.stop();
                        false
                    }
                })
                .collect()
        });

        let servers: Vec<ProtocolServer> = servers.into_iter().map(|(server, _)| server).collect();
        *self.inner.servers.write() = servers.clone();

        // Step 3: routes for servers without their own transport
        let table = RoutingTable::new(
            servers
                .iter()
                .zip(&started)
                .filter(|(server, ok)| **ok && !server.is_transport_enabled())
                .map(|(server, _)| Route::for_server(server.clone()))
                .collect(),
        );

        // Step 4: router, once the table is complete
        match &self.inner.config.router {
            Some(router_config) => {
                let router = SinglePortRouter::new(router_config.clone());
                if let Err(e) = router.start(table) {
                    self.stop();
                    return Err(e);
                }
                *self.inner.router.lock() = Some(router);
            }
            None if !table.is_empty() => {
                tracing::warn!(
                    "{} servers run without a transport but no router is configured",
                    table.len()
                );
            }
            None => {}
        }

        self.set_status(ComponentStatus::Running);
        tracing::info!(
            "Hotwire {} started: {}/{} protocol servers running",
            crate::VERSION,
            started.iter().filter(|ok| **ok).count(),
            started.len()
        );
        Ok(())
    }

    /// Start, then block until stopped
    pub fn run(&self) -> Result<()> {
        self.start()?;
        self.wait_for_exit();
        Ok(())
    }

    /// Block until the orchestrator is TERMINATED
    pub fn wait_for_exit(&self) {
        let mut status = self.inner.status.lock();
        while *status != ComponentStatus::Terminated {
            self.inner.exited.wait(&mut status);
        }
    }

    /// Stop the router, every protocol server and the cache manager
    pub fn stop(&self) {
        self.inner.shutdown();
    }

    /// Stop after `delay` on a background thread
    pub fn stop_after(&self, delay: Duration) {
        self.inner.stop_after(delay);
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn status(&self) -> ComponentStatus {
        *self.inner.status.lock()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Effective configuration, with the ports actually bound
    pub fn configuration(&self) -> ServerConfigView {
        self.inner.configuration()
    }

    pub fn protocol_servers(&self) -> Vec<ProtocolServer> {
        self.inner.servers.read().clone()
    }

    pub fn router(&self) -> Option<SinglePortRouter> {
        self.inner.router.lock().clone()
    }

    pub fn cache_manager_names(&self) -> Vec<String> {
        self.inner.cache_manager_names()
    }

    pub fn get_cache_manager(&self, name: &str) -> Option<Arc<dyn CacheManager>> {
        self.inner.get_cache_manager(name)
    }

    pub fn ignore_cache(&self, cache_manager: &str, cache: &str) -> Result<()> {
        self.inner.ignore_cache(cache_manager, cache)
    }

    pub fn unignore_cache(&self, cache_manager: &str, cache: &str) -> Result<bool> {
        self.inner.unignore_cache(cache_manager, cache)
    }

    pub fn ignored_caches(&self, cache_manager: &str) -> Result<Vec<String>> {
        self.inner.ignored_caches(cache_manager)
    }

    /// Shared management capability, as handed to the HTTP servers
    pub fn management(&self) -> Arc<dyn ServerManagement> {
        self.inner.clone()
    }

    fn set_status(&self, status: ComponentStatus) {
        self.inner.set_status(status);
    }
}

impl OrchestratorInner {
    fn set_status(&self, status: ComponentStatus) {
        *self.status.lock() = status;
        if status == ComponentStatus::Terminated {
            self.exited.notify_all();
        }
    }

    fn shutdown(&self) {
        {
            let mut status = self.status.lock();
            if status.is_stopped() || *status == ComponentStatus::Instantiated {
                return;
            }
            *status = ComponentStatus::Stopping;
        }
        tracing::info!("Stopping Hotwire");

        if let Some(router) = self.router.lock().take() {
            router.stop();
        }

        let servers = self.servers.read().clone();
        thread::scope(|scope| {
            for server in &servers {
                scope.spawn(move || server.stop());
            }
        });

        self.cache_manager.stop();
        self.set_status(ComponentStatus::Terminated);
        tracing::info!("Hotwire stopped");
    }

    /// A running server to carry out admin operations
    fn representative(&self) -> Result<ProtocolServer> {
        self.servers
            .read()
            .iter()
            .find(|server| server.status().is_running())
            .cloned()
            .ok_or_else(|| LifecycleError::NotRunning("protocol servers".to_string()).into())
    }

    fn check_cache_manager(&self, name: &str) -> Result<()> {
        if name == self.cache_manager.name() {
            Ok(())
        } else {
            Err(WireError::config(format!("unknown cache manager {}", name)))
        }
    }
}

impl ServerManagement for OrchestratorInner {
    fn version(&self) -> &str {
        crate::VERSION
    }

    fn status(&self) -> ComponentStatus {
        *self.status.lock()
    }

    fn configuration(&self) -> ServerConfigView {
        let mut view = self.config.view();
        let servers = self.servers.read();
        for (connector, server) in view.connectors.iter_mut().zip(servers.iter()) {
            if let Some(config) = server.get_configuration() {
                *connector = ConnectorView::new(server.protocol(), &config);
            }
            if let Some(addr) = server.local_addr() {
                connector.port = addr.port();
            }
        }
        view
    }

    fn cache_manager_names(&self) -> Vec<String> {
        vec![self.cache_manager.name().to_string()]
    }

    fn get_cache_manager(&self, name: &str) -> Option<Arc<dyn CacheManager>> {
        (name == self.cache_manager.name()).then(|| Arc::clone(&self.cache_manager))
    }

    fn ignore_cache(&self, cache_manager: &str, cache: &str) -> Result<()> {
        self.check_cache_manager(cache_manager)?;
        self.representative()?.ignore_cache(cache);
        Ok(())
    }

    fn unignore_cache(&self, cache_manager: &str, cache: &str) -> Result<bool> {
        self.check_cache_manager(cache_manager)?;
        Ok(self.representative()?.unignore_cache(cache))
    }

    fn ignored_caches(&self, cache_manager: &str) -> Result<Vec<String>> {
        self.check_cache_manager(cache_manager)?;
        Ok(self.representative()?.ignored_caches())
    }

    fn shutdown_delay(&self) -> Duration {
        Duration::from_millis(self.config.shutdown_delay_ms)
    }

    fn stop_after(&self, delay: Duration) {
        let weak = self.this.clone();
        let spawned = thread::Builder::new()
            .name("hotwire-delayed-stop".to_string())
            .spawn(move || {
                thread::sleep(delay);
                if let Some(inner) = weak.upgrade() {
                    inner.shutdown();
                }
            });
        match spawned {
            Ok(_) => tracing::info!("Stopping in {} ms", delay.as_millis()),
            Err(e) => {
                tracing::warn!("Cannot schedule delayed stop, stopping now: {}", e);
                self.shutdown();
            }
        }
    }
}
