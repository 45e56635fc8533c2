//! Protocol Server
//!
//! Lifecycle manager of one protocol endpoint: the optional listening
//! transport, the worker pool, the connection handler for its protocol and
//! the observability entries describing all of them.
//!
//! ## Lifecycle
//! ```text
//!   INSTANTIATED ──start──► STARTING ──► RUNNING ──stop──► STOPPING ──► TERMINATED
//!                              │                              ▲
//!                              └──── any failure: stop() ─────┘
//! ```
//!
//! ## Shutdown order
//! 1. Reject new worker submissions (interrupting queued work)
//! 2. Stop the transport and force-close open connections
//! 3. Unregister every observability entry registered by `start`

use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::{Arc, Weak};
use std::thread;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};

use crate::cache::CacheManager;
use crate::config::ProtocolServerConfig;
use crate::error::{ErrorKind, LifecycleError, Result, WireError};
use crate::security::SecurityProviders;

use super::binary::BinaryHandler;
use super::executor::{RejectReason, Submission, Task, WorkerPool};
use super::http::HttpHandler;
use super::ignore::IgnoredCaches;
use super::lifecycle::ComponentStatus;
use super::management::ServerManagement;
use super::registry::{MetricSource, ObservabilityRegistry};
use super::transport::{
    ConnectionAcceptor, ConnectionGuard, ConnectionRegistry, Transport, TransportStats,
};
use super::{ConnectionHandler, Protocol};

/// Registered observability entries and the registry holding them
struct Registration {
    registry: Arc<dyn ObservabilityRegistry>,
    names: Vec<String>,
}

struct ServerInner {
    protocol: Protocol,
    handler: Box<dyn ConnectionHandler>,
    status: Mutex<ComponentStatus>,
    config: RwLock<Option<ProtocolServerConfig>>,
    cache_manager: RwLock<Option<Arc<dyn CacheManager>>>,
    executor: Mutex<Option<Arc<WorkerPool>>>,
    transport: Mutex<Option<Arc<Transport>>>,
    registration: Mutex<Option<Registration>>,
    connections: Arc<ConnectionRegistry>,
    stats: Arc<TransportStats>,
    ignored: Arc<IgnoredCaches>,
    security: Arc<SecurityProviders>,
    management: RwLock<Option<Weak<dyn ServerManagement>>>,
}

/// One protocol endpoint
#[derive(Clone)]
pub struct ProtocolServer {
    inner: Arc<ServerInner>,
}

impl ProtocolServer {
    /// A server with its own ignore set
    pub fn new(protocol: Protocol, security: Arc<SecurityProviders>) -> Self {
        Self::with_collaborators(protocol, Arc::new(IgnoredCaches::new()), security)
    }

    /// A server sharing `ignored` and `security` with its siblings
    pub fn with_collaborators(
        protocol: Protocol,
        ignored: Arc<IgnoredCaches>,
        security: Arc<SecurityProviders>,
    ) -> Self {
        let handler: Box<dyn ConnectionHandler> = match protocol {
            Protocol::Binary => Box::new(BinaryHandler),
            Protocol::Http => Box::new(HttpHandler),
        };
        Self {
            inner: Arc::new(ServerInner {
                protocol,
                handler,
                status: Mutex::new(ComponentStatus::Instantiated),
                config: RwLock::new(None),
                cache_manager: RwLock::new(None),
                executor: Mutex::new(None),
                transport: Mutex::new(None),
                registration: Mutex::new(None),
                connections: Arc::new(ConnectionRegistry::default()),
                stats: Arc::new(TransportStats::default()),
                ignored,
                security,
                management: RwLock::new(None),
            }),
        }
    }

    /// Attach the process management capability used by the HTTP endpoints
    pub fn set_management(&self, management: Weak<dyn ServerManagement>) {
        *self.inner.management.write() = Some(management);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start serving with `config` on top of `cache_manager`
    ///
    /// Any failure unwinds whatever was already set up through `stop()`
    /// before the error is returned.
    pub fn start(
        &self,
        config: ProtocolServerConfig,
        cache_manager: Arc<dyn CacheManager>,
    ) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            if !status.can_start() {
                return Err(WireError::config(format!(
                    "{} server cannot start while {}",
                    self.inner.protocol, *status
                )));
            }
            *status = ComponentStatus::Starting;
        }

        *self.inner.config.write() = Some(config.clone());
        *self.inner.cache_manager.write() = Some(Arc::clone(&cache_manager));
        tracing::debug!("Starting server {} with {:?}", self.qualified_name(), config);

        match self.start_internal(&config, &cache_manager) {
            Ok(()) => {
                *self.inner.status.lock() = ComponentStatus::Running;
                match self.local_addr() {
                    Some(addr) => tracing::info!(
                        "Server {} listening on {}",
                        self.qualified_name(),
                        addr
                    ),
                    None => tracing::info!(
                        "Server {} started without transport",
                        self.qualified_name()
                    ),
                }
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "Server {} failed to start on {}: {}",
                    self.qualified_name(),
                    config.bind_address(),
                    e
                );
                self.stop();
                Err(e)
            }
        }
    }

    fn start_internal(
        &self,
        config: &ProtocolServerConfig,
        cache_manager: &Arc<dyn CacheManager>,
    ) -> Result<()> {
        // Step 1: validate, register the admin task engine
        config.validate()?;
        if let Some(handler) = &config.admin_operations_handler {
            match cache_manager.task_manager() {
                Some(task_manager) => task_manager.register_engine(Arc::clone(handler))?,
                None => {
                    return Err(WireError::config(format!(
                        "cannot register admin operations handler {} for {}: no task manager available",
                        handler.name(),
                        self.qualified_name()
                    )))
                }
            }
        }

        // Step 2: default cache
        if let Some(name) = &config.default_cache {
            cache_manager.get_or_create_cache(name)?;
        }

        // Step 3: transport
        let executor = self.executor()?;
        if config.start_transport {
            let acceptor: Arc<dyn ConnectionAcceptor> = Arc::new(ServerAcceptor {
                server: Arc::downgrade(&self.inner),
            });
            let transport = Arc::new(Transport::bind(
                self.qualified_name(),
                &config.bind_address(),
                acceptor,
                Arc::clone(&self.inner.stats),
            )?);
            *self.inner.transport.lock() = Some(transport);
        }

        // Step 4: observability
        let prefix = format!("server.{}", self.qualified_name());
        let executor: Arc<dyn MetricSource> = executor;
        let connections: Arc<dyn MetricSource> = self.inner.connections.clone();
        let mut entries = vec![
            (format!("{}.worker-executor", prefix), executor),
            (format!("{}.connections", prefix), connections),
        ];
        let transport = self.inner.transport.lock().clone();
        if let Some(transport) = transport {
            let transport: Arc<dyn MetricSource> = transport;
            entries.push((format!("{}.transport", prefix), transport));
        }

        let registry = cache_manager.registry();
        for (name, source) in entries {
            registry.register(&name, source)?;
            let mut registration = self.inner.registration.lock();
            registration
                .get_or_insert_with(|| Registration {
                    registry: Arc::clone(&registry),
                    names: Vec::new(),
                })
                .names
                .push(name);
        }

        Ok(())
    }

    /// Stop the server; idempotent and safe after a partial start
    pub fn stop(&self) {
        {
            let mut status = self.inner.status.lock();
            if status.is_stopped() {
                return;
            }
            *status = ComponentStatus::Stopping;
        }
        let name = self.qualified_name();

        // Step 1: no new work
        if let Some(executor) = self.inner.executor.lock().take() {
            executor.shutdown_now();
        }

        // Step 2: no new connections, drop existing ones
        if let Some(transport) = self.inner.transport.lock().take() {
            transport.stop();
        }
        let closed = self.inner.connections.close_all();
        if closed > 0 {
            tracing::debug!("Server {} closed {} connections", name, closed);
        }

        // Step 3: unregister observability
        if let Some(registration) = self.inner.registration.lock().take() {
            for entry in &registration.names {
                registration.registry.unregister(entry);
            }
        }

        *self.inner.status.lock() = ComponentStatus::Terminated;
        tracing::info!("Server {} stopped", name);
    }

    /// The worker pool, created on first use and recreated after a shutdown
    pub fn executor(&self) -> Result<Arc<WorkerPool>> {
        let mut slot = self.inner.executor.lock();
        if let Some(pool) = slot.as_ref().filter(|pool| !pool.is_shutdown()) {
            return Ok(Arc::clone(pool));
        }

        let (threads, capacity) = {
            let config = self.inner.config.read();
            let defaults = ProtocolServerConfig::default();
            let config = config.as_ref().unwrap_or(&defaults);
            (config.worker_threads, config.worker_queue_capacity)
        };
        let pool = Arc::new(WorkerPool::new(
            format!("{}-handler", self.qualified_name()),
            threads,
            capacity,
        )?);
        *slot = Some(Arc::clone(&pool));
        Ok(pool)
    }

    /// Run `task` on the worker pool; only while RUNNING
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.submit_task(Box::new(task)) {
            Submission::Accepted => Ok(()),
            Submission::Rejected(RejectReason::Overloaded) => {
                Err(LifecycleError::Overloaded(self.qualified_name()).into())
            }
            Submission::Rejected(RejectReason::Shutdown) => match self.status() {
                ComponentStatus::Instantiated | ComponentStatus::Starting => {
                    Err(LifecycleError::NotRunning(self.qualified_name()).into())
                }
                _ => Err(LifecycleError::AlreadyStopped(self.qualified_name()).into()),
            },
        }
    }

    /// Hand `task` to the worker pool of a RUNNING server
    ///
    /// The pool is looked up under the status lock, so once `stop` has
    /// begun no submission can bring up a replacement pool.
    pub fn submit_task(&self, task: Task) -> Submission {
        let pool = {
            let status = self.inner.status.lock();
            if !status.is_running() {
                return Submission::Rejected(RejectReason::Shutdown);
            }
            match self.executor() {
                Ok(pool) => pool,
                Err(e) => {
                    tracing::error!("Server {} has no worker pool: {}", self.qualified_name(), e);
                    return Submission::Rejected(RejectReason::Shutdown);
                }
            }
        };
        pool.submit(task)
    }

    /// Serve a connection accepted elsewhere, e.g. by the router
    ///
    /// `prefix` holds bytes already read from the stream. Connections
    /// arriving while the server is not RUNNING are closed.
    pub fn route_connection(&self, stream: TcpStream, prefix: BytesMut) {
        let name = self.qualified_name();
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        if !self.status().is_running() {
            tracing::debug!("Server {} not running, closing connection from {}", name, peer);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        // Tracked before the status re-check: either `stop` closes it, or
        // we see that `stop` has begun
        let guard = match self.inner.connections.track(&stream) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("Server {} cannot track connection from {}: {}", name, peer, e);
                let _ = stream.shutdown(Shutdown::Both);
                return;
            }
        };
        if !self.status().is_running() {
            tracing::debug!("Server {} stopping, closing connection from {}", name, peer);
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }

        let server = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("{}-conn", name))
            .spawn(move || server.serve_connection(stream, prefix, &peer, guard));
        if let Err(e) = spawned {
            tracing::warn!("Server {} cannot spawn connection thread: {}", name, e);
        }
    }

    fn serve_connection(
        &self,
        stream: TcpStream,
        prefix: BytesMut,
        peer: &str,
        _guard: ConnectionGuard,
    ) {
        let name = self.qualified_name();
        tracing::debug!("Server {} serving connection from {}", name, peer);

        match self.inner.handler.serve(self, stream, prefix) {
            Ok(()) => tracing::debug!("Server {}: client {} disconnected", name, peer),
            Err(e) if e.kind() == ErrorKind::Protocol => {
                self.inner.stats.record_protocol_error();
                tracing::warn!("Server {}: protocol error from {}: {}", name, peer, e);
            }
            Err(e) => tracing::debug!("Server {}: connection from {} ended: {}", name, peer, e),
        }
        self.inner.stats.record_closed();
    }

    // =========================================================================
    // Cache Visibility
    // =========================================================================

    pub fn ignore_cache(&self, cache: &str) -> bool {
        self.inner.ignored.ignore(cache)
    }

    pub fn unignore_cache(&self, cache: &str) -> bool {
        self.inner.ignored.unignore(cache)
    }

    pub fn is_cache_ignored(&self, cache: &str) -> bool {
        self.inner.ignored.is_ignored(cache)
    }

    pub fn ignored_caches(&self) -> Vec<String> {
        self.inner.ignored.list()
    }

    pub(crate) fn ignored_caches_handle(&self) -> Arc<IgnoredCaches> {
        Arc::clone(&self.inner.ignored)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn protocol(&self) -> Protocol {
        self.inner.protocol
    }

    pub fn status(&self) -> ComponentStatus {
        *self.inner.status.lock()
    }

    /// Configuration passed to the last `start`
    pub fn get_configuration(&self) -> Option<ProtocolServerConfig> {
        self.inner.config.read().clone()
    }

    /// Logical name from the configuration
    pub fn name(&self) -> String {
        self.inner
            .config
            .read()
            .as_ref()
            .map(|c| c.name.clone())
            .unwrap_or_default()
    }

    /// Protocol name plus logical name, e.g. `binary-main`
    pub fn qualified_name(&self) -> String {
        let name = self.name();
        if name.is_empty() {
            self.inner.protocol.name().to_string()
        } else {
            format!("{}-{}", self.inner.protocol.name(), name)
        }
    }

    /// Whether this server binds its own listening socket
    pub fn is_transport_enabled(&self) -> bool {
        self.inner
            .config
            .read()
            .as_ref()
            .map(|c| c.start_transport)
            .unwrap_or(false)
    }

    /// Bound port if the transport is running, configured port otherwise
    pub fn port(&self) -> Option<u16> {
        if let Some(addr) = self.local_addr() {
            return Some(addr.port());
        }
        self.inner.config.read().as_ref().map(|c| c.port)
    }

    /// Address of the running transport
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.lock().as_ref().map(|t| t.local_addr())
    }

    pub fn cache_manager(&self) -> Option<Arc<dyn CacheManager>> {
        self.inner.cache_manager.read().clone()
    }

    pub fn security(&self) -> &Arc<SecurityProviders> {
        &self.inner.security
    }

    pub fn management(&self) -> Option<Arc<dyn ServerManagement>> {
        self.inner.management.read().as_ref().and_then(Weak::upgrade)
    }

    /// Connection counters
    pub fn transport_stats(&self) -> &Arc<TransportStats> {
        &self.inner.stats
    }

    /// Connections currently open
    pub fn open_connections(&self) -> usize {
        self.inner.connections.len()
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.inner
            .config
            .read()
            .as_ref()
            .map(|c| c.max_frame_size)
            .unwrap_or(crate::protocol::DEFAULT_MAX_FRAME_SIZE)
    }

    pub(crate) fn read_timeout_ms(&self) -> u64 {
        self.inner
            .config
            .read()
            .as_ref()
            .map(|c| c.read_timeout_ms)
            .unwrap_or(0)
    }
}

impl ConnectionAcceptor for ProtocolServer {
    fn accept(&self, stream: TcpStream, prefix: BytesMut) {
        self.route_connection(stream, prefix);
    }
}

impl std::fmt::Debug for ProtocolServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolServer")
            .field("name", &self.qualified_name())
            .field("status", &self.status())
            .field("port", &self.port())
            .finish()
    }
}

/// Transport-side acceptor; does not keep the server alive
struct ServerAcceptor {
    server: Weak<ServerInner>,
}

impl ConnectionAcceptor for ServerAcceptor {
    fn accept(&self, stream: TcpStream, prefix: BytesMut) {
        match self.server.upgrade() {
            Some(inner) => ProtocolServer { inner }.route_connection(stream, prefix),
            None => {
                let _ = stream.shutdown(Shutdown::Both);
            }
        }
    }
}
