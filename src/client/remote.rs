//! Remote cache client
//!
//! Blocking facade over the channel pool. Each call builds one request
//! frame, runs it as an `Operation` against the next server in round-robin
//! order and maps the response body back to a typed result.

use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::ClientConfig;
use crate::error::{Result, WireError};
use crate::protocol::{flags, Request, RequestFrame, ResponseBody, ResponseFrame, Status};

use super::operation::Operation;
use super::pool::ChannelPool;

/// Client for one or more cache servers
pub struct CacheClient {
    config: ClientConfig,
    servers: Vec<SocketAddr>,
    pool: ChannelPool,
    next_server: AtomicUsize,
    next_correlation_id: AtomicU64,
    topology_id: AtomicU32,
}

impl CacheClient {
    /// Resolve the configured servers; channels are opened lazily
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let mut servers = Vec::with_capacity(config.servers.len());
        for server in &config.servers {
            let resolved = server
                .to_socket_addrs()
                .map_err(|e| WireError::config(format!("cannot resolve {}: {}", server, e)))?;
            servers.extend(resolved.take(1));
        }
        if servers.is_empty() {
            return Err(WireError::config("no servers configured"));
        }

        tracing::debug!("Cache client configured for {:?}", servers);
        Ok(Self {
            pool: ChannelPool::new(config.clone()),
            config,
            servers,
            next_server: AtomicUsize::new(0),
            next_correlation_id: AtomicU64::new(1),
            topology_id: AtomicU32::new(0),
        })
    }

    /// Run `request` against `cache_name`, retrying retryable failures
    ///
    /// Each attempt goes to the next server in round-robin order. Attempts
    /// are bounded by `max_retries`.
    pub fn execute(&self, cache_name: &str, request: Request) -> Result<ResponseFrame> {
        let mut attempt = 0;
        loop {
            let address = self.next_address();
            match self.execute_once(address, cache_name, request.clone()) {
                Ok(response) => return Ok(response),
                Err(e) if e.is_retryable() && attempt < self.config.max_retries => {
                    attempt += 1;
                    tracing::debug!(
                        "Retrying {} after failure on {} (attempt {}/{}): {}",
                        request.opcode().name(),
                        address,
                        attempt,
                        self.config.max_retries,
                        e
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Round-trip an empty request
    pub fn ping(&self) -> Result<()> {
        self.execute(&self.config.cache_name, Request::Ping).map(|_| ())
    }

    /// SASL mechanisms the server offers
    pub fn auth_mech_list(&self) -> Result<Vec<String>> {
        let response = self.execute(&self.config.cache_name, Request::AuthMechList)?;
        match response.into_parts().1 {
            ResponseBody::Strings(items) => Ok(items),
            other => Err(unexpected("AUTH_MECH_LIST", &other)),
        }
    }

    /// Handle on the default cache
    pub fn default_cache(&self) -> RemoteCache<'_> {
        self.cache(&self.config.cache_name)
    }

    /// Handle on a named cache
    pub fn cache(&self, name: &str) -> RemoteCache<'_> {
        RemoteCache {
            client: self,
            name: name.to_string(),
        }
    }

    /// Latest topology id announced by a server
    pub fn topology_id(&self) -> u32 {
        self.topology_id.load(Ordering::Acquire)
    }

    pub fn pool(&self) -> &ChannelPool {
        &self.pool
    }

    pub fn servers(&self) -> &[SocketAddr] {
        &self.servers
    }

    /// Close every channel
    pub fn close(&self) {
        self.pool.close();
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn next_address(&self) -> SocketAddr {
        let index = self.next_server.fetch_add(1, Ordering::Relaxed);
        self.servers[index % self.servers.len()]
    }

    fn execute_once(
        &self,
        address: SocketAddr,
        cache_name: &str,
        request: Request,
    ) -> Result<ResponseFrame> {
        let correlation_id = self.next_correlation_id.fetch_add(1, Ordering::Relaxed);
        let frame = RequestFrame::new(
            request,
            correlation_id,
            self.topology_id(),
            cache_name,
            flags::NONE,
        );
        let op = Operation::new(
            frame,
            Duration::from_millis(self.config.operation_timeout_ms),
            self.config.max_frame_size,
        );

        let result = op.execute(&self.pool, address)?.wait();
        if let Ok(response) = &result {
            self.observe_topology(response.header().topology_id());
        }
        result
    }

    /// Track a newer topology; channels opened under the old one are retired
    fn observe_topology(&self, announced: u32) {
        let previous = self.topology_id.fetch_max(announced, Ordering::AcqRel);
        if previous != 0 && announced > previous {
            tracing::info!("Topology changed from {} to {}", previous, announced);
            self.pool.mark_all_stale();
        }
    }
}

impl Drop for CacheClient {
    fn drop(&mut self) {
        self.pool.close();
    }
}

/// Typed operations on one remote cache
pub struct RemoteCache<'a> {
    client: &'a CacheClient,
    name: String,
}

impl RemoteCache<'_> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Value stored under `key`, if any
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let response = self.run(Request::Get { key: key.to_vec() })?;
        match response.into_parts().1 {
            ResponseBody::Value(value) => Ok(value),
            ResponseBody::Empty => Ok(None),
            other => Err(unexpected("GET", &other)),
        }
    }

    /// Store `value` under `key`
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.run(Request::Put {
            key: key.to_vec(),
            value: value.to_vec(),
        })
        .map(|_| ())
    }

    /// Remove `key`; returns whether it was present
    pub fn remove(&self, key: &[u8]) -> Result<bool> {
        let response = self.run(Request::Remove { key: key.to_vec() })?;
        Ok(response.status() == Status::Success)
    }

    pub fn contains_key(&self, key: &[u8]) -> Result<bool> {
        let response = self.run(Request::ContainsKey { key: key.to_vec() })?;
        Ok(response.status() == Status::Success)
    }

    pub fn clear(&self) -> Result<()> {
        self.run(Request::Clear).map(|_| ())
    }

    /// Number of entries
    pub fn size(&self) -> Result<u64> {
        let response = self.run(Request::Size)?;
        match response.into_parts().1 {
            ResponseBody::Count(count) => Ok(count),
            other => Err(unexpected("SIZE", &other)),
        }
    }

    fn run(&self, request: Request) -> Result<ResponseFrame> {
        self.client.execute(&self.name, request)
    }
}

fn unexpected(operation: &str, body: &ResponseBody) -> WireError {
    WireError::protocol(format!("unexpected {} response body: {:?}", operation, body))
}
