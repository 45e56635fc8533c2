//! Single-port router
//!
//! Listens on one port for every protocol. Each new connection is read until
//! its first bytes identify a protocol, then handed, together with the bytes
//! already read, to the protocol server behind that signature.
//!
//! ```text
//!   accept ──► read ──► resolve(prefix) ──┬─ Matched   ──► server.route_connection(stream, prefix)
//!                ▲                        ├─ Undecided ──► read again
//!                └────────────────────────┘
//!                                         └─ Unmatched ──► close, count protocol error
//! ```
//!
//! The table lives behind an `RwLock<Arc<_>>`: readers take a snapshot, a
//! reconfiguration swaps in a new table. Connections already routed are
//! unaffected by a swap.

use std::io::{ErrorKind as IoErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};

use crate::config::RouterConfig;
use crate::error::{Result, WireError};
use crate::server::lifecycle::ComponentStatus;
use crate::server::transport::{ConnectionAcceptor, Transport, TransportStats};

use super::table::{Resolution, RoutingTable};

const PEEK_CHUNK: usize = 512;

struct RouterInner {
    config: RouterConfig,
    table: RwLock<Arc<RoutingTable>>,
    transport: Mutex<Option<Transport>>,
    status: Mutex<ComponentStatus>,
    stats: Arc<TransportStats>,
    routed: AtomicU64,
    unmatched: AtomicU64,
}

/// Routes connections on one port to protocol servers by signature
#[derive(Clone)]
pub struct SinglePortRouter {
    inner: Arc<RouterInner>,
}

impl SinglePortRouter {
    pub fn new(config: RouterConfig) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                config,
                table: RwLock::new(Arc::new(RoutingTable::empty())),
                transport: Mutex::new(None),
                status: Mutex::new(ComponentStatus::Instantiated),
                stats: Arc::new(TransportStats::default()),
                routed: AtomicU64::new(0),
                unmatched: AtomicU64::new(0),
            }),
        }
    }

    /// Publish `table` and start listening
    pub fn start(&self, table: RoutingTable) -> Result<()> {
        {
            let mut status = self.inner.status.lock();
            if !status.can_start() {
                return Err(WireError::config(format!("router cannot start while {}", *status)));
            }
            *status = ComponentStatus::Starting;
        }
        let routes = table.len();
        self.update_table(table);

        let acceptor: Arc<dyn ConnectionAcceptor> = Arc::new(RouterAcceptor {
            router: Arc::downgrade(&self.inner),
        });
        match Transport::bind(
            "router",
            &self.inner.config.bind_address(),
            acceptor,
            Arc::clone(&self.inner.stats),
        ) {
            Ok(transport) => {
                tracing::info!(
                    "Router listening on {} with {} routes",
                    transport.local_addr(),
                    routes
                );
                *self.inner.transport.lock() = Some(transport);
                *self.inner.status.lock() = ComponentStatus::Running;
                Ok(())
            }
            Err(e) => {
                tracing::error!(
                    "Router failed to bind {}: {}",
                    self.inner.config.bind_address(),
                    e
                );
                *self.inner.status.lock() = ComponentStatus::Terminated;
                Err(e)
            }
        }
    }

    /// Stop listening; idempotent
    pub fn stop(&self) {
        {
            let mut status = self.inner.status.lock();
            if status.is_stopped() {
                return;
            }
            *status = ComponentStatus::Stopping;
        }
        if let Some(transport) = self.inner.transport.lock().take() {
            transport.stop();
        }
        *self.inner.status.lock() = ComponentStatus::Terminated;
        tracing::info!("Router stopped");
    }

    /// Swap in a new table; returns the previous one
    pub fn update_table(&self, table: RoutingTable) -> Arc<RoutingTable> {
        let table = Arc::new(table);
        let previous = std::mem::replace(&mut *self.inner.table.write(), table);
        tracing::debug!("Routing table replaced ({} routes before)", previous.len());
        previous
    }

    /// Snapshot of the current table
    pub fn table(&self) -> Arc<RoutingTable> {
        self.inner.table()
    }

    pub fn status(&self) -> ComponentStatus {
        *self.inner.status.lock()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.transport.lock().as_ref().map(|t| t.local_addr())
    }

    /// Connections handed to a protocol server
    pub fn routed_count(&self) -> u64 {
        self.inner.routed.load(Ordering::Relaxed)
    }

    /// Connections closed because no signature matched
    pub fn unmatched_count(&self) -> u64 {
        self.inner.unmatched.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.inner.stats
    }
}

impl RouterInner {
    fn table(&self) -> Arc<RoutingTable> {
        Arc::clone(&self.table.read())
    }

    fn route(&self, mut stream: TcpStream, mut buf: BytesMut) {
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let peek_timeout = Duration::from_millis(self.config.peek_timeout_ms.max(1));
        if let Err(e) = stream.set_read_timeout(Some(peek_timeout)) {
            tracing::warn!("Router: cannot configure connection from {}: {}", peer, e);
            return;
        }

        let table = self.table();
        let mut chunk = [0u8; PEEK_CHUNK];
        loop {
            match table.resolve(&buf) {
                Resolution::Matched(route) => {
                    if let Err(e) = stream.set_read_timeout(None) {
                        tracing::warn!("Router: cannot configure connection from {}: {}", peer, e);
                        return;
                    }
                    self.routed.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "Router: {} connection from {} routed to {}",
                        route.signature().protocol(),
                        peer,
                        route.server().qualified_name()
                    );
                    route.server().route_connection(stream, buf);
                    return;
                }
                Resolution::Unmatched => {
                    self.unmatched.fetch_add(1, Ordering::Relaxed);
                    self.stats.record_protocol_error();
                    let shown = &buf[..buf.len().min(16)];
                    tracing::warn!(
                        "Router: protocol error from {}: unrecognised signature {:02x?}",
                        peer,
                        shown
                    );
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
                Resolution::Undecided => {}
            }

            match stream.read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!("Router: {} closed before identifying a protocol", peer);
                    return;
                }
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::debug!("Router: no protocol signature from {}: {}", peer, e);
                    let _ = stream.shutdown(Shutdown::Both);
                    return;
                }
            }
        }
    }
}

impl std::fmt::Debug for SinglePortRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinglePortRouter")
            .field("status", &self.status())
            .field("local_addr", &self.local_addr())
            .field("routes", &self.table().len())
            .finish()
    }
}

/// Transport-side acceptor; each connection is identified on its own thread
struct RouterAcceptor {
    router: Weak<RouterInner>,
}

impl ConnectionAcceptor for RouterAcceptor {
    fn accept(&self, stream: TcpStream, prefix: BytesMut) {
        let Some(router) = self.router.upgrade() else {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        };
        let spawned = thread::Builder::new()
            .name("hotwire-router-conn".to_string())
            .spawn(move || router.route(stream, prefix));
        if let Err(e) = spawned {
            tracing::warn!("Router: cannot spawn connection thread: {}", e);
        }
    }
}
