//! Binary protocol connection handler
//!
//! Runs on the connection's I/O thread: checks the preamble, decodes request
//! frames resumably as bytes arrive and hands every complete frame to the
//! worker pool. Cache work and the response write happen on a worker.
//!
//! A malformed frame ends this connection only; the error surfaces to the
//! server, which counts it.

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use parking_lot::Mutex;

use crate::cache::CacheManager;
use crate::error::{LifecycleError, Result};
use crate::protocol::{
    decode_preamble, decode_request, encode_response, Decoded, FrameCheckpoint, Header, Request,
    RequestFrame, ResponseBody, ResponseFrame, Status,
};

use super::executor::{RejectReason, Submission};
use super::ignore::IgnoredCaches;
use super::{ConnectionHandler, ProtocolServer};

const READ_CHUNK: usize = 8 * 1024;

pub(crate) struct BinaryHandler;

impl ConnectionHandler for BinaryHandler {
    fn serve(&self, server: &ProtocolServer, stream: TcpStream, prefix: BytesMut) -> Result<()> {
        stream.set_nodelay(true)?;
        let read_timeout = server.read_timeout_ms();
        if read_timeout > 0 {
            stream.set_read_timeout(Some(Duration::from_millis(read_timeout)))?;
        }

        let Some(cache_manager) = server.cache_manager() else {
            return Err(LifecycleError::NotRunning(server.qualified_name()).into());
        };
        let writer = Arc::new(Mutex::new(stream.try_clone()?));
        let limit = server.max_frame_size();

        let mut reader = stream;
        let mut buf = prefix;
        let mut chunk = [0u8; READ_CHUNK];
        let mut preamble_seen = false;
        let mut checkpoint = FrameCheckpoint::with_limit(limit);

        loop {
            // Step 1: preamble
            if !preamble_seen {
                if let Some(len) = decode_preamble(&buf)? {
                    buf.advance(len);
                    preamble_seen = true;
                }
            }

            // Step 2: every complete frame in the buffer
            if preamble_seen {
                loop {
                    match decode_request(&buf, checkpoint)? {
                        Decoded::Parsed { value, consumed } => {
                            buf.advance(consumed);
                            checkpoint = FrameCheckpoint::with_limit(limit);
                            tracing::trace!(
                                "{}: {} (id={})",
                                server.qualified_name(),
                                value.request().opcode().name(),
                                value.header().correlation_id()
                            );
                            dispatch(server, &cache_manager, value, &writer)?;
                        }
                        Decoded::NeedMoreData(next) => {
                            checkpoint = next;
                            break;
                        }
                    }
                }
            }

            // Step 3: more bytes
            match reader.read(&mut chunk) {
                Ok(0) => return Ok(()),
                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                Err(ref e) if e.kind() == IoErrorKind::Interrupted => {}
                Err(ref e)
                    if e.kind() == IoErrorKind::WouldBlock || e.kind() == IoErrorKind::TimedOut =>
                {
                    tracing::debug!("{}: read timeout", server.qualified_name());
                    return Ok(());
                }
                Err(ref e)
                    if matches!(
                        e.kind(),
                        IoErrorKind::ConnectionReset
                            | IoErrorKind::ConnectionAborted
                            | IoErrorKind::BrokenPipe
                    ) =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Hand one decoded frame to the worker pool
fn dispatch(
    server: &ProtocolServer,
    cache_manager: &Arc<dyn CacheManager>,
    frame: RequestFrame,
    writer: &Arc<Mutex<TcpStream>>,
) -> Result<()> {
    let header = frame.header().clone();
    let task = {
        let cache_manager = Arc::clone(cache_manager);
        let ignored = server.ignored_caches_handle();
        let mechanisms = server.security().sasl_mechanisms().to_vec();
        let writer = Arc::clone(writer);
        move || {
            let request_header = frame.header().clone();
            let response = panic::catch_unwind(AssertUnwindSafe(|| {
                handle_request(cache_manager.as_ref(), &ignored, &mechanisms, frame)
            }))
            .unwrap_or_else(|_| {
                error_response(
                    &request_header,
                    Status::ServerError,
                    cache_manager.topology_id(),
                    "request handler panicked",
                )
            });
            write_response(&writer, &response);
        }
    };

    match server.submit_task(Box::new(task)) {
        Submission::Accepted => Ok(()),
        Submission::Rejected(RejectReason::Overloaded) => {
            tracing::warn!(
                "{}: worker pool overloaded, rejecting request {}",
                server.qualified_name(),
                header.correlation_id()
            );
            let response = error_response(
                &header,
                Status::ServerError,
                cache_manager.topology_id(),
                "server overloaded",
            );
            write_response(writer, &response);
            Ok(())
        }
        Submission::Rejected(RejectReason::Shutdown) => {
            Err(LifecycleError::AlreadyStopped(server.qualified_name()).into())
        }
    }
}

/// Execute one request against the cache manager
pub(crate) fn handle_request(
    cache_manager: &dyn CacheManager,
    ignored: &IgnoredCaches,
    mechanisms: &[String],
    frame: RequestFrame,
) -> ResponseFrame {
    let topology_id = cache_manager.topology_id();
    let (header, request) = frame.into_parts();
    let reply = |status: Status, body: ResponseBody| ResponseFrame::reply(&header, status, topology_id, body);

    match request {
        Request::Ping => return reply(Status::Success, ResponseBody::Empty),
        Request::AuthMechList => {
            return reply(Status::Success, ResponseBody::Strings(mechanisms.to_vec()))
        }
        _ => {}
    }

    let cache_name = match header.cache_name() {
        "" => cache_manager.default_cache_name(),
        name => name,
    };
    if ignored.is_ignored(cache_name) {
        return error_response(
            &header,
            Status::CacheUnavailable,
            topology_id,
            &format!("Cache '{}' is currently unavailable", cache_name),
        );
    }
    let Some(cache) = cache_manager.get_cache(cache_name) else {
        return error_response(
            &header,
            Status::ServerError,
            topology_id,
            &format!("Cache '{}' does not exist", cache_name),
        );
    };

    match request {
        Request::Put { key, value } => {
            cache.put(key, value);
            reply(Status::Success, ResponseBody::Empty)
        }
        Request::Get { key } => match cache.get(&key) {
            Some(value) => reply(Status::Success, ResponseBody::Value(Some(value))),
            None => reply(Status::KeyDoesNotExist, ResponseBody::Value(None)),
        },
        Request::Remove { key } => match cache.remove(&key) {
            Some(_) => reply(Status::Success, ResponseBody::Empty),
            None => reply(Status::KeyDoesNotExist, ResponseBody::Empty),
        },
        Request::ContainsKey { key } => {
            if cache.contains_key(&key) {
                reply(Status::Success, ResponseBody::Empty)
            } else {
                reply(Status::KeyDoesNotExist, ResponseBody::Empty)
            }
        }
        Request::Clear => {
            cache.clear();
            reply(Status::Success, ResponseBody::Empty)
        }
        Request::Size => reply(Status::Success, ResponseBody::Count(cache.size())),
        Request::Ping | Request::AuthMechList => reply(Status::Success, ResponseBody::Empty),
    }
}

fn error_response(header: &Header, status: Status, topology_id: u32, message: &str) -> ResponseFrame {
    ResponseFrame::reply(header, status, topology_id, ResponseBody::Error(message.to_string()))
}

fn write_response(writer: &Mutex<TcpStream>, response: &ResponseFrame) {
    let bytes = encode_response(response);
    let mut stream = writer.lock();
    if let Err(e) = stream.write_all(&bytes).and_then(|_| stream.flush()) {
        tracing::debug!(
            "Failed to write response {}: {}",
            response.header().correlation_id(),
            e
        );
    }
}
