//! TCP transport
//!
//! Accepts connections on a listening socket and hands each one to a
//! `ConnectionAcceptor`. The accept loop runs on its own thread over a
//! non-blocking listener so `stop` can end it without a wake-up connection.

use std::collections::HashMap;
use std::io::ErrorKind as IoErrorKind;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::error::Result;

use super::registry::MetricSource;

/// How long the accept loop sleeps when no connection is pending
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Receives accepted connections
///
/// `prefix` holds bytes already read from the stream, e.g. by the router
/// while sniffing the protocol. Implementations must not block the caller.
pub trait ConnectionAcceptor: Send + Sync {
    fn accept(&self, stream: TcpStream, prefix: BytesMut);
}

/// Counters shared by a transport and the connections it feeds
#[derive(Debug, Default)]
pub struct TransportStats {
    accepted: AtomicU64,
    closed: AtomicU64,
    protocol_errors: AtomicU64,
}

impl TransportStats {
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    pub fn closed(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    pub fn protocol_errors(&self) -> u64 {
        self.protocol_errors.load(Ordering::Relaxed)
    }

    pub(crate) fn record_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_closed(&self) {
        self.closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }
}

impl MetricSource for TransportStats {
    fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("accepted", self.accepted()),
            ("closed", self.closed()),
            ("protocol-errors", self.protocol_errors()),
        ]
    }
}

// =============================================================================
// Open Connections
// =============================================================================

/// Open connections of one server, so they can be force-closed on stop
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    next_id: AtomicU64,
    open: Mutex<HashMap<u64, TcpStream>>,
}

impl ConnectionRegistry {
    /// Track `stream` until the returned guard is dropped
    pub(crate) fn track(self: &Arc<Self>, stream: &TcpStream) -> std::io::Result<ConnectionGuard> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.open.lock().insert(id, stream.try_clone()?);
        Ok(ConnectionGuard {
            id,
            registry: Arc::clone(self),
        })
    }

    /// Shut down every tracked connection; returns how many were open
    pub fn close_all(&self) -> usize {
        let open: Vec<_> = self.open.lock().drain().map(|(_, s)| s).collect();
        for stream in &open {
            let _ = stream.shutdown(Shutdown::Both);
        }
        open.len()
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.open.lock().is_empty()
    }
}

impl MetricSource for ConnectionRegistry {
    fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![("open", self.len() as u64)]
    }
}

/// Removes a connection from its registry when dropped
pub(crate) struct ConnectionGuard {
    id: u64,
    registry: Arc<ConnectionRegistry>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.registry.open.lock().remove(&self.id);
    }
}

// =============================================================================
// Transport
// =============================================================================

/// A bound listening socket plus its accept thread
pub struct Transport {
    name: String,
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    stats: Arc<TransportStats>,
}

impl Transport {
    /// Bind `address` and start accepting
    pub fn bind(
        name: impl Into<String>,
        address: &str,
        acceptor: Arc<dyn ConnectionAcceptor>,
        stats: Arc<TransportStats>,
    ) -> Result<Self> {
        let name = name.into();
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let name = name.clone();
            thread::Builder::new()
                .name(format!("{}-accept", name))
                .spawn(move || Self::accept_loop(&name, listener, acceptor, shutdown, stats))?
        };

        tracing::debug!("Transport {} listening on {}", name, local_addr);
        Ok(Self {
            name,
            local_addr,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
            stats,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &Arc<TransportStats> {
        &self.stats
    }

    pub fn is_running(&self) -> bool {
        !self.shutdown.load(Ordering::Acquire)
    }

    /// Stop accepting and close the listener; idempotent
    pub fn stop(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.accept_thread.lock().take() {
            let _ = handle.join();
        }
        tracing::debug!("Transport {} on {} stopped", self.name, self.local_addr);
    }

    fn accept_loop(
        name: &str,
        listener: TcpListener,
        acceptor: Arc<dyn ConnectionAcceptor>,
        shutdown: Arc<AtomicBool>,
        stats: Arc<TransportStats>,
    ) {
        while !shutdown.load(Ordering::Acquire) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream.set_nonblocking(false) {
                        tracing::warn!("{}: cannot configure connection from {}: {}", name, peer, e);
                        continue;
                    }
                    stats.record_accepted();
                    tracing::debug!("{}: accepted connection from {}", name, peer);
                    acceptor.accept(stream, BytesMut::new());
                }
                Err(ref e) if e.kind() == IoErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(ref e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(e) => {
                    tracing::warn!("{}: accept failed: {}", name, e);
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }
}

impl MetricSource for Transport {
    fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut values = self.stats.snapshot();
        values.push(("port", self.local_addr.port() as u64));
        values
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.stop();
    }
}
