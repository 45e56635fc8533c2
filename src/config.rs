//! Configuration for Hotwire
//!
//! Centralized configuration with sensible defaults. Every component takes
//! an already-validated configuration value; nothing here reads files.

use std::sync::Arc;

use serde::Serialize;

use crate::error::{Result, WireError};
use crate::server::admin::AdminOperationsHandler;
use crate::server::Protocol;

// =============================================================================
// Protocol Server Configuration
// =============================================================================

/// Configuration of one protocol server endpoint
#[derive(Debug, Clone)]
pub struct ProtocolServerConfig {
    /// Logical name, appended to the protocol name to build the qualified name
    pub name: String,

    /// Host to bind the transport to
    pub host: String,

    /// Port to bind the transport to (0 picks an ephemeral port)
    pub port: u16,

    /// Number of threads in the worker pool
    pub worker_threads: usize,

    /// Bounded queue length of the worker pool before overload rejection
    pub worker_queue_capacity: usize,

    /// Bind a listening transport; otherwise reachable only through the router
    pub start_transport: bool,

    /// Cache created at startup, if any
    pub default_cache: Option<String>,

    /// Admin task engine registered with the task manager at startup
    pub admin_operations_handler: Option<Arc<dyn AdminOperationsHandler>>,

    /// Connection read timeout (milliseconds, 0 = none)
    pub read_timeout_ms: u64,

    /// Largest length prefix accepted in a frame
    pub max_frame_size: usize,
}

impl Default for ProtocolServerConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: "127.0.0.1".to_string(),
            port: 11222,
            worker_threads: 4,
            worker_queue_capacity: 1024,
            start_transport: true,
            default_cache: None,
            admin_operations_handler: None,
            read_timeout_ms: 0,
            max_frame_size: crate::protocol::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ProtocolServerConfig {
    /// Create a new config builder
    pub fn builder() -> ProtocolServerConfigBuilder {
        ProtocolServerConfigBuilder::default()
    }

    /// Reject values no server can run with
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(WireError::config("host must not be empty"));
        }
        if self.worker_threads == 0 {
            return Err(WireError::config("worker_threads must be at least 1"));
        }
        if self.worker_queue_capacity == 0 {
            return Err(WireError::config("worker_queue_capacity must be at least 1"));
        }
        Ok(())
    }

    /// `host:port` as configured
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Builder for ProtocolServerConfig
#[derive(Default)]
pub struct ProtocolServerConfigBuilder {
    config: ProtocolServerConfig,
}

impl ProtocolServerConfigBuilder {
    /// Set the logical name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set the bind host
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.config.host = host.into();
        self
    }

    /// Set the bind port
    pub fn port(mut self, port: u16) -> Self {
        self.config.port = port;
        self
    }

    /// Set the worker pool size
    pub fn worker_threads(mut self, count: usize) -> Self {
        self.config.worker_threads = count;
        self
    }

    /// Set the worker queue capacity
    pub fn worker_queue_capacity(mut self, capacity: usize) -> Self {
        self.config.worker_queue_capacity = capacity;
        self
    }

    /// Enable or disable the listening transport
    pub fn start_transport(mut self, enabled: bool) -> Self {
        self.config.start_transport = enabled;
        self
    }

    /// Set the default cache
    pub fn default_cache(mut self, name: impl Into<String>) -> Self {
        self.config.default_cache = Some(name.into());
        self
    }

    /// Set the admin operations handler
    pub fn admin_operations_handler(mut self, handler: Arc<dyn AdminOperationsHandler>) -> Self {
        self.config.admin_operations_handler = Some(handler);
        self
    }

    /// Set the read timeout (in milliseconds)
    pub fn read_timeout_ms(mut self, ms: u64) -> Self {
        self.config.read_timeout_ms = ms;
        self
    }

    /// Set the maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.config.max_frame_size = size;
        self
    }

    pub fn build(self) -> ProtocolServerConfig {
        self.config
    }
}

// =============================================================================
// Client Configuration
// =============================================================================

/// What `ChannelPool::acquire` does when an address is at its channel bound
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustedAction {
    /// Block until a channel is released or the timeout elapses
    Wait { timeout_ms: u64 },

    /// Fail immediately with `PoolExhausted`
    Fail,
}

/// Configuration of the client side: pool, operations and retries
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server addresses (`host:port`), used round-robin
    pub servers: Vec<String>,

    /// Cache addressed when a call does not name one
    pub cache_name: String,

    /// Max physical channels per destination address
    pub max_channels_per_address: usize,

    /// Behaviour at the channel bound
    pub exhausted_action: ExhaustedAction,

    /// Whether several operations may share one channel, matched by correlation id
    pub multiplexing: bool,

    /// Max in-flight operations per channel when multiplexing
    pub max_in_flight_per_channel: usize,

    /// Connect timeout (milliseconds)
    pub connect_timeout_ms: u64,

    /// Per-operation timeout (milliseconds)
    pub operation_timeout_ms: u64,

    /// Retries after a retryable failure or a topology change
    pub max_retries: usize,

    /// Largest length prefix accepted in a response
    pub max_frame_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            servers: vec!["127.0.0.1:11222".to_string()],
            cache_name: String::new(),
            max_channels_per_address: 8,
            exhausted_action: ExhaustedAction::Wait { timeout_ms: 5000 },
            multiplexing: false,
            max_in_flight_per_channel: 64,
            connect_timeout_ms: 2000,
            operation_timeout_ms: 5000,
            max_retries: 3,
            max_frame_size: crate::protocol::DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a new config builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Max concurrent operations on one channel under the multiplexing policy
    pub fn channel_capacity(&self) -> usize {
        if self.multiplexing {
            self.max_in_flight_per_channel.max(1)
        } else {
            1
        }
    }
}

/// Builder for ClientConfig
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    /// Replace the server list
    pub fn servers<I, S>(mut self, servers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.config.servers = servers.into_iter().map(Into::into).collect();
        self
    }

    /// Set the default cache name
    pub fn cache_name(mut self, name: impl Into<String>) -> Self {
        self.config.cache_name = name.into();
        self
    }

    /// Set the per-address channel bound
    pub fn max_channels_per_address(mut self, count: usize) -> Self {
        self.config.max_channels_per_address = count;
        self
    }

    /// Set the behaviour at the channel bound
    pub fn exhausted_action(mut self, action: ExhaustedAction) -> Self {
        self.config.exhausted_action = action;
        self
    }

    /// Enable or disable multiplexing
    pub fn multiplexing(mut self, enabled: bool) -> Self {
        self.config.multiplexing = enabled;
        self
    }

    /// Set the in-flight bound per multiplexed channel
    pub fn max_in_flight_per_channel(mut self, count: usize) -> Self {
        self.config.max_in_flight_per_channel = count;
        self
    }

    /// Set the connect timeout (in milliseconds)
    pub fn connect_timeout_ms(mut self, ms: u64) -> Self {
        self.config.connect_timeout_ms = ms;
        self
    }

    /// Set the operation timeout (in milliseconds)
    pub fn operation_timeout_ms(mut self, ms: u64) -> Self {
        self.config.operation_timeout_ms = ms;
        self
    }

    /// Set the retry ceiling
    pub fn max_retries(mut self, retries: usize) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}

// =============================================================================
// Router Configuration
// =============================================================================

/// Configuration of the single-port router
#[derive(Debug, Clone, Serialize)]
pub struct RouterConfig {
    /// Host to bind to
    pub host: String,

    /// Port to bind to (0 picks an ephemeral port)
    pub port: u16,

    /// How long to wait for the leading bytes of a new connection (milliseconds)
    pub peek_timeout_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11221,
            peek_timeout_ms: 5000,
        }
    }
}

impl RouterConfig {
    /// `host:port` as configured
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// =============================================================================
// Orchestrator Configuration
// =============================================================================

/// One configured protocol endpoint
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    pub protocol: Protocol,
    pub server: ProtocolServerConfig,
}

impl ConnectorConfig {
    pub fn new(protocol: Protocol, server: ProtocolServerConfig) -> Self {
        Self { protocol, server }
    }
}

/// Configuration of the whole server process
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Name of the cache manager
    pub cache_manager_name: String,

    /// Caches defined when the cache manager starts
    pub caches: Vec<String>,

    /// Protocol endpoints
    pub connectors: Vec<ConnectorConfig>,

    /// Single-port router, if any
    pub router: Option<RouterConfig>,

    /// Delay applied by the management stop endpoint (milliseconds)
    pub shutdown_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            cache_manager_name: "default".to_string(),
            caches: Vec::new(),
            connectors: Vec::new(),
            router: None,
            shutdown_delay_ms: 3000,
        }
    }
}

impl ServerConfig {
    /// Create a new config builder
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::default()
    }
}

/// Builder for ServerConfig
#[derive(Default)]
pub struct ServerConfigBuilder {
    config: ServerConfig,
}

impl ServerConfigBuilder {
    /// Set the cache manager name
    pub fn cache_manager_name(mut self, name: impl Into<String>) -> Self {
        self.config.cache_manager_name = name.into();
        self
    }

    /// Define a cache at startup
    pub fn cache(mut self, name: impl Into<String>) -> Self {
        self.config.caches.push(name.into());
        self
    }

    /// Add a protocol endpoint
    pub fn connector(mut self, protocol: Protocol, server: ProtocolServerConfig) -> Self {
        self.config.connectors.push(ConnectorConfig::new(protocol, server));
        self
    }

    /// Enable the single-port router
    pub fn router(mut self, router: RouterConfig) -> Self {
        self.config.router = Some(router);
        self
    }

    /// Set the management stop delay (in milliseconds)
    pub fn shutdown_delay_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_delay_ms = ms;
        self
    }

    pub fn build(self) -> ServerConfig {
        self.config
    }
}

// =============================================================================
// Serializable Views
// =============================================================================

/// One connector as reported by the management endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectorView {
    pub protocol: Protocol,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub worker_threads: usize,
    pub worker_queue_capacity: usize,
    pub start_transport: bool,
    pub default_cache: Option<String>,
    /// Name of the admin task engine, if one is attached
    pub admin_operations_handler: Option<String>,
    pub read_timeout_ms: u64,
    pub max_frame_size: usize,
}

impl ConnectorView {
    pub fn new(protocol: Protocol, config: &ProtocolServerConfig) -> Self {
        Self {
            protocol,
            name: config.name.clone(),
            host: config.host.clone(),
            port: config.port,
            worker_threads: config.worker_threads,
            worker_queue_capacity: config.worker_queue_capacity,
            start_transport: config.start_transport,
            default_cache: config.default_cache.clone(),
            admin_operations_handler: config
                .admin_operations_handler
                .as_ref()
                .map(|handler| handler.name().to_string()),
            read_timeout_ms: config.read_timeout_ms,
            max_frame_size: config.max_frame_size,
        }
    }
}

/// The whole server configuration as reported by the management endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfigView {
    pub cache_manager_name: String,
    pub caches: Vec<String>,
    pub connectors: Vec<ConnectorView>,
    pub router: Option<RouterConfig>,
    pub shutdown_delay_ms: u64,
}

impl ServerConfig {
    /// Serializable snapshot of this configuration
    pub fn view(&self) -> ServerConfigView {
        ServerConfigView {
            cache_manager_name: self.cache_manager_name.clone(),
            caches: self.caches.clone(),
            connectors: self
                .connectors
                .iter()
                .map(|c| ConnectorView::new(c.protocol, &c.server))
                .collect(),
            router: self.router.clone(),
            shutdown_delay_ms: self.shutdown_delay_ms,
        }
    }
}
