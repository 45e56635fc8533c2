//! Client channels
//!
//! A channel is one TCP connection to a server. Writes happen on the caller's
//! thread; a dedicated reader thread decodes responses and feeds each body to
//! the operation waiting for it.
//!
//! ## Reader loop
//! ```text
//!          bytes arrive
//!               │
//!               ▼
//!   ┌──────────────────────┐  NeedMoreData
//!   │ decode header        │◄──────────────┐
//!   └──────────┬───────────┘               │
//!              │ correlation id            │
//!              ▼                           │
//!   ┌──────────────────────┐  NeedMoreData │
//!   │ op.decode_payload()  │───────────────┤
//!   │  (or discard body)   │               │
//!   └──────────┬───────────┘               │
//!              │ complete                  │
//!              └───────────────────────────┘
//! ```
//! Responses are matched to operations by queue position when the channel
//! carries one operation at a time, by correlation id when multiplexed.

use std::collections::{HashMap, VecDeque};
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;

use crate::config::ClientConfig;
use crate::error::{Result, WireError};
use crate::protocol::{
    decode_response_body, decode_response_header, BodyCheckpoint, Decoded, Header,
    HeaderCheckpoint, Status, PREAMBLE,
};

use super::operation::Operation;

/// How often an idle reader wakes up to check operation deadlines
const READ_TICK: Duration = Duration::from_millis(200);

/// Operations waiting for a response on one channel
enum Pending {
    /// One operation at a time, answered in order
    Queue(VecDeque<Arc<Operation>>),

    /// Several operations, answered by correlation id
    ById(HashMap<u64, Arc<Operation>>),
}

impl Pending {
    fn len(&self) -> usize {
        match self {
            Pending::Queue(queue) => queue.len(),
            Pending::ById(map) => map.len(),
        }
    }

    fn target(&self, correlation_id: u64) -> Option<Arc<Operation>> {
        match self {
            Pending::Queue(queue) => queue
                .front()
                .filter(|op| op.correlation_id() == correlation_id)
                .cloned(),
            Pending::ById(map) => map.get(&correlation_id).cloned(),
        }
    }

    fn remove(&mut self, correlation_id: u64) {
        match self {
            Pending::Queue(queue) => queue.retain(|op| op.correlation_id() != correlation_id),
            Pending::ById(map) => {
                map.remove(&correlation_id);
            }
        }
    }

    fn drain(&mut self) -> Vec<Arc<Operation>> {
        match self {
            Pending::Queue(queue) => queue.drain(..).collect(),
            Pending::ById(map) => map.drain().map(|(_, op)| op).collect(),
        }
    }

    fn overdue(&self, now: Instant) -> Vec<Arc<Operation>> {
        let ops: Box<dyn Iterator<Item = &Arc<Operation>>> = match self {
            Pending::Queue(queue) => Box::new(queue.iter()),
            Pending::ById(map) => Box::new(map.values()),
        };
        ops.filter(|op| op.is_overdue(now)).cloned().collect()
    }
}

/// Where the reader is within the current response
enum ReadState {
    Header(HeaderCheckpoint),
    Body {
        header: Header,
        target: Option<Arc<Operation>>,
        discard: BodyCheckpoint,
    },
}

/// One pooled connection to a server
pub struct Channel {
    id: u64,
    address: SocketAddr,
    socket: TcpStream,
    writer: Mutex<TcpStream>,
    active: AtomicBool,
    stale: AtomicBool,
    leases: AtomicUsize,
    pending: Mutex<Pending>,
    max_frame_size: usize,
}

impl Channel {
    /// Connect to `address`, send the preamble and start the reader thread
    pub fn connect(id: u64, address: SocketAddr, config: &ClientConfig) -> Result<Arc<Self>> {
        let timeout = Duration::from_millis(config.connect_timeout_ms.max(1));
        let stream = TcpStream::connect_timeout(&address, timeout).map_err(|e| {
            if e.kind() == IoErrorKind::TimedOut {
                WireError::ConnectTimeout {
                    address: address.to_string(),
                }
            } else {
                WireError::Io(e)
            }
        })?;

        // Disable Nagle's algorithm for low latency
        stream.set_nodelay(true)?;
        stream.set_read_timeout(Some(READ_TICK))?;

        let mut writer = stream.try_clone()?;
        writer.write_all(&PREAMBLE)?;
        let reader = stream.try_clone()?;

        let pending = if config.multiplexing {
            Pending::ById(HashMap::new())
        } else {
            Pending::Queue(VecDeque::new())
        };

        let channel = Arc::new(Self {
            id,
            address,
            socket: stream,
            writer: Mutex::new(writer),
            active: AtomicBool::new(true),
            stale: AtomicBool::new(false),
            leases: AtomicUsize::new(0),
            pending: Mutex::new(pending),
            max_frame_size: config.max_frame_size,
        });

        let worker = Arc::clone(&channel);
        thread::Builder::new()
            .name(format!("hotwire-channel-{}", id))
            .spawn(move || worker.read_loop(reader))?;

        tracing::debug!("Channel {} connected to {}", id, address);
        Ok(channel)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    /// Number of operations currently holding this channel
    pub fn leases(&self) -> usize {
        self.leases.load(Ordering::Acquire)
    }

    /// Number of operations awaiting a response
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    pub(crate) fn inactive_error(&self) -> WireError {
        WireError::ChannelInactive {
            address: self.address.to_string(),
        }
    }

    // =========================================================================
    // Operations
    // =========================================================================

    /// Expect a response for `op`
    pub(crate) fn register(&self, op: Arc<Operation>) -> Result<()> {
        if !self.is_active() {
            return Err(self.inactive_error());
        }
        let mut pending = self.pending.lock();
        match &mut *pending {
            Pending::Queue(queue) => {
                if !queue.is_empty() {
                    return Err(WireError::protocol(format!(
                        "channel {} to {} already has an operation in flight",
                        self.id, self.address
                    )));
                }
                queue.push_back(op);
            }
            Pending::ById(map) => {
                map.insert(op.correlation_id(), op);
            }
        }
        Ok(())
    }

    /// Stop expecting a response for `correlation_id`
    pub(crate) fn forget(&self, correlation_id: u64) {
        self.pending.lock().remove(correlation_id);
    }

    /// Write an encoded frame
    pub(crate) fn write(&self, bytes: &[u8]) -> Result<()> {
        if !self.is_active() {
            return Err(self.inactive_error());
        }
        let mut writer = self.writer.lock();
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    /// Exclude from future acquires; in-flight operations are unaffected
    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// Shut the connection down; the reader fails whatever is still pending
    pub fn close(&self) {
        if self.active.swap(false, Ordering::AcqRel) {
            tracing::debug!("Closing channel {} to {}", self.id, self.address);
            let _ = self.socket.shutdown(Shutdown::Both);
        }
    }

    pub(crate) fn lease(&self) {
        self.leases.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unlease(&self) {
        let _ = self
            .leases
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    // =========================================================================
    // Reader
    // =========================================================================

    fn read_loop(self: Arc<Self>, mut stream: TcpStream) {
        let mut buf = BytesMut::with_capacity(8 * 1024);
        let mut chunk = [0u8; 8 * 1024];
        let mut state = ReadState::Header(HeaderCheckpoint::with_limit(self.max_frame_size));

        loop {
            match stream.read(&mut chunk) {
                Ok(0) => {
                    tracing::debug!("Channel {} to {} closed by peer", self.id, self.address);
                    break;
                }
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    state = match self.process(&mut buf, state) {
                        Ok(next) => next,
                        Err(e) => {
                            tracing::warn!(
                                "Protocol error on channel {} to {}: {}",
                                self.id,
                                self.address,
                                e
                            );
                            break;
                        }
                    };
                }
                Err(ref e)
                    if e.kind() == IoErrorKind::WouldBlock || e.kind() == IoErrorKind::TimedOut =>
                {
                    self.expire_overdue();
                }
                Err(ref e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(e) => {
                    if self.is_active() {
                        tracing::debug!("Read error on channel {} to {}: {}", self.id, self.address, e);
                    }
                    break;
                }
            }
        }

        self.close();
        self.fail_pending();
    }

    /// Decode as many responses as `buf` holds
    fn process(&self, buf: &mut BytesMut, state: ReadState) -> Result<ReadState> {
        let mut state = state;
        loop {
            state = match state {
                ReadState::Header(checkpoint) => match decode_response_header(buf, checkpoint)? {
                    Decoded::NeedMoreData(checkpoint) => return Ok(ReadState::Header(checkpoint)),
                    Decoded::Parsed { value: header, consumed } => {
                        buf.advance(consumed);
                        let target = self.pending.lock().target(header.correlation_id());
                        if target.is_none() {
                            tracing::debug!(
                                "Discarding response {} on channel {}: no waiting operation",
                                header.correlation_id(),
                                self.id
                            );
                        }
                        ReadState::Body {
                            header,
                            target,
                            discard: BodyCheckpoint::with_limit(self.max_frame_size),
                        }
                    }
                },
                ReadState::Body {
                    header,
                    target: Some(op),
                    discard,
                } => {
                    if op.is_terminal() {
                        ReadState::Body {
                            header,
                            target: None,
                            discard,
                        }
                    } else {
                        match op.decode_payload(buf, &header)? {
                            Some(consumed) => {
                                buf.advance(consumed);
                                ReadState::Header(HeaderCheckpoint::with_limit(self.max_frame_size))
                            }
                            None => {
                                return Ok(ReadState::Body {
                                    header,
                                    target: Some(op),
                                    discard,
                                })
                            }
                        }
                    }
                }
                ReadState::Body {
                    header,
                    target: None,
                    discard,
                } => {
                    let status = header.status().unwrap_or(Status::Success);
                    match decode_response_body(header.opcode(), status, buf, discard)? {
                        Decoded::NeedMoreData(discard) => {
                            return Ok(ReadState::Body {
                                header,
                                target: None,
                                discard,
                            })
                        }
                        Decoded::Parsed { consumed, .. } => {
                            buf.advance(consumed);
                            ReadState::Header(HeaderCheckpoint::with_limit(self.max_frame_size))
                        }
                    }
                }
            };
        }
    }

    fn expire_overdue(&self) {
        let overdue = self.pending.lock().overdue(Instant::now());
        for op in overdue {
            op.expire();
        }
    }

    fn fail_pending(&self) {
        let ops = self.pending.lock().drain();
        for op in ops {
            op.fail(self.inactive_error());
        }
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("active", &self.is_active())
            .field("stale", &self.is_stale())
            .field("leases", &self.leases())
            .finish()
    }
}
