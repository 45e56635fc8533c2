//! HTTP management endpoints
//!
//! A small blocking HTTP/1.1 server: `httparse` reads the request head into
//! an `http::Request`, an optional `Content-Length` body is skipped, and the
//! answer is an `http::Response` with a JSON body.
//!
//! ## Endpoints
//! - `GET    /v2/server/`                               version
//! - `GET    /v2/server/config`                         effective configuration
//! - `GET    /v2/server/env`                            process facts
//! - `GET    /v2/server/cache-managers`                 cache manager names
//! - `GET    /v2/server/ignored-caches/{cm}`            ignored caches
//! - `POST   /v2/server/ignored-caches/{cm}/{cache}`    ignore a cache
//! - `DELETE /v2/server/ignored-caches/{cm}/{cache}`    serve it again
//! - `GET    /v2/server/stop`                           delayed stop
//!
//! An unknown cache manager or cache answers 404. A request body larger
//! than the server's `max_frame_size` is a protocol error.

use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use bytes::{Buf, BytesMut};
use crossbeam::channel;
use http::header::{CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, TRANSFER_ENCODING};
use http::{HeaderValue, Method, Request, Response, StatusCode, Version};
use serde::Serialize;
use serde_json::json;

use crate::error::{LifecycleError, Result, WireError};

use super::executor::{RejectReason, Submission};
use super::management::{ProcessEnvironment, ServerManagement};
use super::{ConnectionHandler, ProtocolServer};

const READ_CHUNK: usize = 4 * 1024;

/// Largest accepted request head (request line plus headers)
const MAX_HEAD_SIZE: usize = 16 * 1024;

/// Most headers accepted in one request
const MAX_HEADERS: usize = 32;

/// Request methods recognised by the router as HTTP
pub const METHODS: [&str; 7] = ["GET", "POST", "PUT", "DELETE", "HEAD", "OPTIONS", "PATCH"];

pub(crate) struct HttpHandler;

/// A parsed request head
#[derive(Debug)]
struct RequestHead {
    request: Request<()>,
    head_len: usize,
    body_len: usize,
}

impl ConnectionHandler for HttpHandler {
    fn serve(&self, server: &ProtocolServer, stream: TcpStream, prefix: BytesMut) -> Result<()> {
        let read_timeout = server.read_timeout_ms();
        if read_timeout > 0 {
            stream.set_read_timeout(Some(Duration::from_millis(read_timeout)))?;
        }

        let limit = server.max_frame_size();
        let mut reader = stream.try_clone()?;
        let mut writer = stream;
        let mut buf = prefix;
        let mut chunk = [0u8; READ_CHUNK];

        loop {
            // Step 1: request head
            let head = loop {
                if let Some(head) = parse_head(&buf, limit)? {
                    break head;
                }
                if !read_more(&mut reader, &mut buf, &mut chunk)? {
                    return Ok(());
                }
            };

            // Step 2: skip the body
            let total = head
                .head_len
                .checked_add(head.body_len)
                .ok_or_else(|| WireError::protocol("HTTP request length overflows"))?;
            while buf.len() < total {
                if !read_more(&mut reader, &mut buf, &mut chunk)? {
                    return Ok(());
                }
            }
            buf.advance(total);

            let request = head.request;
            let keep_alive = keep_alive(&request);
            tracing::trace!("{}: {} {}", server.qualified_name(), request.method(), request.uri());

            // Step 3: handle on a worker
            let response = execute(server, request)?;

            // Step 4: answer
            writer.write_all(&encode(response, keep_alive))?;
            writer.flush()?;
            if !keep_alive {
                return Ok(());
            }
        }
    }
}

/// Append the next chunk of the stream to `buf`; false once the peer is gone
fn read_more(reader: &mut TcpStream, buf: &mut BytesMut, chunk: &mut [u8]) -> Result<bool> {
    loop {
        match reader.read(chunk) {
            Ok(0) => return Ok(false),
            Ok(n) => {
                buf.extend_from_slice(&chunk[..n]);
                return Ok(true);
            }
            Err(ref e) if e.kind() == IoErrorKind::Interrupted => {}
            Err(ref e)
                if matches!(
                    e.kind(),
                    IoErrorKind::WouldBlock
                        | IoErrorKind::TimedOut
                        | IoErrorKind::ConnectionReset
                        | IoErrorKind::ConnectionAborted
                ) =>
            {
                return Ok(false)
            }
            Err(e) => return Err(e.into()),
        }
    }
}

fn execute(server: &ProtocolServer, request: Request<()>) -> Result<Response<String>> {
    let Some(management) = server.management() else {
        return Ok(error(StatusCode::SERVICE_UNAVAILABLE, "server management unavailable"));
    };

    let (tx, rx) = channel::bounded(1);
    let task = Box::new(move || {
        let _ = tx.send(route(management.as_ref(), &request));
    });
    match server.submit_task(task) {
        Submission::Accepted => rx
            .recv()
            .map_err(|_| LifecycleError::AlreadyStopped(server.qualified_name()).into()),
        Submission::Rejected(RejectReason::Overloaded) => {
            tracing::warn!("{}: worker pool overloaded", server.qualified_name());
            Ok(error(StatusCode::SERVICE_UNAVAILABLE, "server overloaded"))
        }
        Submission::Rejected(RejectReason::Shutdown) => {
            Err(LifecycleError::AlreadyStopped(server.qualified_name()).into())
        }
    }
}

/// Map one request to its endpoint
fn route(management: &dyn ServerManagement, request: &Request<()>) -> Response<String> {
    let path = request.uri().path();
    let rest = match path.strip_prefix("/v2/server") {
        Some(rest) if rest.is_empty() || rest.starts_with('/') => rest,
        _ => return error(StatusCode::NOT_FOUND, format!("no resource at {}", path)),
    };
    let segments: Vec<&str> = rest.split('/').filter(|s| !s.is_empty()).collect();

    match (request.method(), segments.as_slice()) {
        (&Method::GET, []) => json(&json!({ "version": management.version() })),
        (&Method::GET, ["config"]) => json(&management.configuration()),
        (&Method::GET, ["env"]) => json(&ProcessEnvironment::capture()),
        (&Method::GET, ["cache-managers"]) => json(&management.cache_manager_names()),
        (&Method::GET, ["ignored-caches", cache_manager]) => {
            if management.get_cache_manager(cache_manager).is_none() {
                return empty(StatusCode::NOT_FOUND);
            }
            match management.ignored_caches(cache_manager) {
                Ok(ignored) => json(&ignored),
                Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
        (method, ["ignored-caches", cache_manager, cache])
            if method == Method::POST || method == Method::DELETE =>
        {
            let Some(manager) = management.get_cache_manager(cache_manager) else {
                return empty(StatusCode::NOT_FOUND);
            };
            if !manager.cache_exists(cache) {
                return empty(StatusCode::NOT_FOUND);
            }
            let outcome = if method == Method::POST {
                management.ignore_cache(cache_manager, cache)
            } else {
                management.unignore_cache(cache_manager, cache).map(|_| ())
            };
            match outcome {
                Ok(()) => empty(StatusCode::NO_CONTENT),
                Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
            }
        }
        (&Method::GET, ["stop"]) => {
            management.stop_after(management.shutdown_delay());
            empty(StatusCode::NO_CONTENT)
        }
        (
            method,
            [] | ["config"] | ["env"] | ["cache-managers"] | ["ignored-caches", _]
            | ["ignored-caches", _, _] | ["stop"],
        ) => error(
            StatusCode::METHOD_NOT_ALLOWED,
            format!("{} not allowed on {}", method, path),
        ),
        _ => error(StatusCode::NOT_FOUND, format!("no resource at {}", path)),
    }
}

// =============================================================================
// Request Parsing
// =============================================================================

/// Parse a request head if `buf` holds one
///
/// A body announced above `max_body` bytes, a chunked body or a malformed
/// head is a protocol error.
fn parse_head(buf: &[u8], max_body: usize) -> Result<Option<RequestHead>> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_HEAD_SIZE {
                return Err(WireError::protocol("HTTP request head too large"));
            }
            return Ok(None);
        }
        Err(e) => return Err(WireError::protocol(format!("malformed HTTP request: {}", e))),
    };
    if head_len > MAX_HEAD_SIZE {
        return Err(WireError::protocol("HTTP request head too large"));
    }

    let (Some(method), Some(path)) = (parsed.method, parsed.path) else {
        return Err(WireError::protocol("HTTP request line incomplete"));
    };
    let method = Method::from_bytes(method.as_bytes())
        .map_err(|_| WireError::protocol(format!("bad HTTP method: {}", method)))?;
    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder().method(method).uri(path).version(version);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let request = builder
        .body(())
        .map_err(|e| WireError::protocol(format!("invalid HTTP request: {}", e)))?;

    if request.headers().contains_key(TRANSFER_ENCODING) {
        return Err(WireError::protocol("chunked HTTP request bodies are not supported"));
    }
    let body_len = match request.headers().get(CONTENT_LENGTH) {
        None => 0,
        Some(value) => value
            .to_str()
            .ok()
            .and_then(|v| v.trim().parse::<usize>().ok())
            .ok_or_else(|| WireError::protocol(format!("bad Content-Length: {:?}", value)))?,
    };
    if body_len > max_body {
        return Err(WireError::protocol(format!(
            "HTTP body of {} bytes exceeds limit {}",
            body_len, max_body
        )));
    }

    Ok(Some(RequestHead {
        request,
        head_len,
        body_len,
    }))
}

fn keep_alive(request: &Request<()>) -> bool {
    match request.headers().get(CONNECTION).and_then(|v| v.to_str().ok()) {
        Some(v) if v.eq_ignore_ascii_case("close") => false,
        Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
        _ => request.version() == Version::HTTP_11,
    }
}

// =============================================================================
// Responses
// =============================================================================

fn json<T: Serialize + ?Sized>(value: &T) -> Response<String> {
    match serde_json::to_string(value) {
        Ok(body) => with_body(StatusCode::OK, body),
        Err(e) => error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response<String> {
    with_body(status, json!({ "error": message.into() }).to_string())
}

fn with_body(status: StatusCode, body: String) -> Response<String> {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

fn empty(status: StatusCode) -> Response<String> {
    let mut response = Response::new(String::new());
    *response.status_mut() = status;
    response
}

/// Serialize `response` as HTTP/1.1
fn encode(mut response: Response<String>, keep_alive: bool) -> Vec<u8> {
    let body_len = response.body().len();
    let headers = response.headers_mut();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(body_len));
    headers.insert(
        CONNECTION,
        HeaderValue::from_static(if keep_alive { "keep-alive" } else { "close" }),
    );

    let status = response.status();
    let mut out = Vec::with_capacity(128 + body_len);
    out.extend_from_slice(
        format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_str(),
            status.canonical_reason().unwrap_or("")
        )
        .as_bytes(),
    );
    for (name, value) in response.headers() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(response.body().as_bytes());
    out
}
