//! Tests for the Protocol Server
//!
//! These tests verify:
//! - Start / stop lifecycle and idempotent stop
//! - Observability registration and cleanup, including after a failed start
//! - Lazy worker pool creation and lifecycle-aware rejection
//! - Serving the binary protocol over a real socket
//! - Protocol errors closing only the offending connection
//! - Oversized HTTP bodies refused before any of them is read
//! - Injected security providers answering the mechanism list

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use hotwire::protocol::{
    decode_response, encode_request, flags, Decoded, FrameCheckpoint, Request, RequestFrame,
    ResponseBody, ResponseFrame, Status, PREAMBLE,
};
use hotwire::server::{
    ComponentStatus, ObservabilityRegistry, RejectReason, ServerAdminOperationsHandler,
    Submission, TaskManager,
};
use hotwire::{
    CacheManager, ErrorKind, LifecycleError, LocalCacheManager, Protocol, ProtocolServer,
    ProtocolServerConfig, SecurityProviders, WireError,
};

// =============================================================================
// Helper Functions
// =============================================================================

fn cache_manager() -> Arc<LocalCacheManager> {
    let manager = Arc::new(LocalCacheManager::new("test-manager"));
    manager.start().unwrap();
    manager
}

fn config(name: &str) -> ProtocolServerConfig {
    ProtocolServerConfig::builder()
        .name(name)
        .host("127.0.0.1")
        .port(0)
        .worker_threads(2)
        .build()
}

fn entries(manager: &LocalCacheManager, server: &ProtocolServer) -> Vec<String> {
    manager
        .registry()
        .names_with_prefix(&format!("server.{}.", server.qualified_name()))
}

fn send_raw(addr: SocketAddr, bytes: &[u8]) -> TcpStream {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(bytes).unwrap();
    stream
}

fn read_response(stream: &mut TcpStream) -> ResponseFrame {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 1024];
    loop {
        if let Decoded::Parsed { value, .. } = decode_response(&buf, FrameCheckpoint::new()).unwrap() {
            return value;
        }
        let n = stream.read(&mut tmp).unwrap();
        assert!(n > 0, "connection closed before a full response");
        buf.extend_from_slice(&tmp[..n]);
    }
}

fn request_bytes(request: Request, id: u64, cache: &str) -> Vec<u8> {
    encode_request(&RequestFrame::new(request, id, 0, cache, flags::NONE)).to_vec()
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_start_binds_and_registers() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    assert_eq!(server.status(), ComponentStatus::Instantiated);

    server.start(config("main"), manager.clone()).unwrap();

    assert_eq!(server.status(), ComponentStatus::Running);
    assert_eq!(server.qualified_name(), "binary-main");
    assert!(server.is_transport_enabled());
    assert!(server.local_addr().is_some());
    assert_ne!(server.port(), Some(0));
    assert_eq!(server.get_configuration().unwrap().name, "main");
    assert_eq!(
        entries(&manager, &server),
        vec![
            "server.binary-main.connections".to_string(),
            "server.binary-main.transport".to_string(),
            "server.binary-main.worker-executor".to_string(),
        ]
    );

    server.stop();
}

#[test]
fn test_stop_twice_leaves_nothing_registered() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.start(config("twice"), manager.clone()).unwrap();
    let addr = server.local_addr().unwrap();

    server.stop();
    server.stop();

    assert_eq!(server.status(), ComponentStatus::Terminated);
    assert!(entries(&manager, &server).is_empty());
    assert!(manager.metrics().is_empty());
    assert!(server.local_addr().is_none());

    // The port is free again
    assert!(TcpListener::bind(addr).is_ok());
}

#[test]
fn test_stop_without_start() {
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.stop();
    server.stop();
    assert_eq!(server.status(), ComponentStatus::Terminated);
}

#[test]
fn test_restart_after_stop() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());

    server.start(config("again"), manager.clone()).unwrap();
    server.stop();
    server.start(config("again"), manager.clone()).unwrap();

    assert_eq!(server.status(), ComponentStatus::Running);
    assert_eq!(entries(&manager, &server).len(), 3);
    server.stop();
}

#[test]
fn test_start_while_running_is_rejected() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.start(config("once"), manager.clone()).unwrap();

    let err = server.start(config("once"), manager.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(server.status(), ComponentStatus::Running);
    server.stop();
}

#[test]
fn test_without_transport() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("routed")
        .port(12345)
        .start_transport(false)
        .build();

    server.start(config, manager.clone()).unwrap();

    assert!(!server.is_transport_enabled());
    assert!(server.local_addr().is_none());
    assert_eq!(server.port(), Some(12345));
    assert_eq!(entries(&manager, &server).len(), 2);
    server.stop();
}

#[test]
fn test_default_cache_created() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("with-cache")
        .port(0)
        .default_cache("sessions")
        .build();

    server.start(config, manager.clone()).unwrap();
    assert!(manager.cache_exists("sessions"));
    server.stop();
}

// =============================================================================
// Failed Start Tests
// =============================================================================

#[test]
fn test_admin_handler_without_task_manager_is_fatal() {
    let manager = Arc::new(LocalCacheManager::new("no-tasks").without_task_manager());
    manager.start().unwrap();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("admin")
        .port(0)
        .admin_operations_handler(Arc::new(ServerAdminOperationsHandler::new()))
        .build();

    let err = server.start(config, manager.clone()).unwrap_err();

    assert!(matches!(err, WireError::Config(_)));
    assert_eq!(server.status(), ComponentStatus::Terminated);
    assert!(entries(&manager, &server).is_empty());
    assert!(manager.metrics().is_empty());
    assert!(server.local_addr().is_none());
}

#[test]
fn test_admin_handler_registered_with_task_manager() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("admin-ok")
        .port(0)
        .admin_operations_handler(Arc::new(ServerAdminOperationsHandler::new()))
        .build();

    server.start(config, manager.clone()).unwrap();

    let engines = manager.task_manager().unwrap().engines();
    assert!(engines.contains(&"server-admin".to_string()));
    server.stop();
}

#[test]
fn test_invalid_config_rejected() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("broken")
        .port(0)
        .worker_threads(0)
        .build();

    let err = server.start(config, manager.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(entries(&manager, &server).is_empty());
}

#[test]
fn test_bind_failure_unwinds() {
    let manager = cache_manager();
    let occupied = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = occupied.local_addr().unwrap().port();

    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder().name("clash").port(port).build();

    let err = server.start(config, manager.clone()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(server.status(), ComponentStatus::Terminated);
    assert!(entries(&manager, &server).is_empty());
}

// =============================================================================
// Worker Pool Tests
// =============================================================================

#[test]
fn test_submit_requires_running() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());

    let err = server.submit(|| {}).unwrap_err();
    assert!(matches!(err, WireError::Lifecycle(LifecycleError::NotRunning(_))));

    server.start(config("submit"), manager.clone()).unwrap();
    let (tx, rx) = crossbeam::channel::bounded(1);
    server.submit(move || tx.send(42).unwrap()).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 42);

    server.stop();
    let err = server.submit(|| {}).unwrap_err();
    assert!(matches!(err, WireError::Lifecycle(LifecycleError::AlreadyStopped(_))));
    assert!(!err.is_retryable());
}

#[test]
fn test_executor_recreated_after_shutdown() {
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());

    let first = server.executor().unwrap();
    assert!(Arc::ptr_eq(&first, &server.executor().unwrap()));

    first.shutdown_now();
    let err = first.execute(|| {}).unwrap_err();
    assert!(matches!(err, WireError::Lifecycle(LifecycleError::AlreadyStopped(_))));

    let second = server.executor().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(!second.is_shutdown());
    assert_eq!(second.name(), "binary-handler");
}

#[test]
fn test_submit_task_rejected_outside_running() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());

    assert_eq!(
        server.submit_task(Box::new(|| {})),
        Submission::Rejected(RejectReason::Shutdown)
    );

    server.start(config("gated"), manager.clone()).unwrap();
    let (tx, rx) = crossbeam::channel::bounded(1);
    let accepted = server.submit_task(Box::new(move || tx.send(7).unwrap()));
    assert_eq!(accepted, Submission::Accepted);
    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), 7);

    server.stop();
    assert_eq!(
        server.submit_task(Box::new(|| {})),
        Submission::Rejected(RejectReason::Shutdown)
    );
    // No replacement pool was brought up and registered
    assert!(entries(&manager, &server).is_empty());
}

#[test]
fn test_overloaded_pool_rejects_submit() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("busy")
        .port(0)
        .worker_threads(1)
        .worker_queue_capacity(1)
        .build();
    server.start(config, manager.clone()).unwrap();

    let (release_tx, release_rx) = crossbeam::channel::bounded::<()>(0);
    let (started_tx, started_rx) = crossbeam::channel::bounded(1);
    server
        .submit(move || {
            started_tx.send(()).unwrap();
            let _ = release_rx.recv();
        })
        .unwrap();
    started_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    server.submit(|| {}).unwrap();

    let err = server.submit(|| {}).unwrap_err();
    assert!(matches!(err, WireError::Lifecycle(LifecycleError::Overloaded(_))));

    drop(release_tx);
    server.stop();
}

// =============================================================================
// Connection Routing Tests
// =============================================================================

fn accepted_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
    client.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let (accepted, _) = listener.accept().unwrap();
    (client, accepted)
}

#[test]
fn test_routed_connection_after_stop_is_closed() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.start(config("late"), manager.clone()).unwrap();
    server.stop();

    let (mut client, accepted) = accepted_pair();
    server.route_connection(accepted, BytesMut::from(&PREAMBLE[..]));

    let mut tmp = [0u8; 16];
    assert!(matches!(client.read(&mut tmp), Ok(0) | Err(_)));
    assert_eq!(server.open_connections(), 0);
}

#[test]
fn test_routed_connection_is_tracked_while_served() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("routed-only")
        .port(0)
        .start_transport(false)
        .build();
    server.start(config, manager.clone()).unwrap();

    let (mut client, accepted) = accepted_pair();
    server.route_connection(accepted, BytesMut::from(&PREAMBLE[..]));
    assert_eq!(server.open_connections(), 1);

    client.write_all(&request_bytes(Request::Ping, 3, "")).unwrap();
    assert_eq!(read_response(&mut client).status(), Status::Success);

    server.stop();
    let mut tmp = [0u8; 16];
    assert!(matches!(client.read(&mut tmp), Ok(0) | Err(_)));
    assert_eq!(server.open_connections(), 0);
}

// =============================================================================
// Binary Protocol Tests
// =============================================================================

#[test]
fn test_ping_over_socket() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.start(config("ping"), manager.clone()).unwrap();

    let mut bytes = PREAMBLE.to_vec();
    bytes.extend(request_bytes(Request::Ping, 9, ""));
    let mut stream = send_raw(server.local_addr().unwrap(), &bytes);

    let response = read_response(&mut stream);
    assert_eq!(response.status(), Status::Success);
    assert_eq!(response.header().correlation_id(), 9);
    assert_eq!(response.header().topology_id(), manager.topology_id());
    server.stop();
}

#[test]
fn test_put_get_over_socket() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.start(config("kv"), manager.clone()).unwrap();

    let mut stream = send_raw(server.local_addr().unwrap(), &PREAMBLE);
    stream
        .write_all(&request_bytes(Request::Put { key: b"k".to_vec(), value: b"v".to_vec() }, 1, ""))
        .unwrap();
    assert_eq!(read_response(&mut stream).status(), Status::Success);

    stream.write_all(&request_bytes(Request::Get { key: b"k".to_vec() }, 2, "")).unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.body(), &ResponseBody::Value(Some(b"v".to_vec())));

    stream.write_all(&request_bytes(Request::Get { key: b"k".to_vec() }, 3, "missing")).unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), Status::ServerError);

    server.ignore_cache("default");
    stream.write_all(&request_bytes(Request::Size, 4, "")).unwrap();
    assert_eq!(read_response(&mut stream).status(), Status::CacheUnavailable);

    server.stop();
}

#[test]
fn test_bad_preamble_closes_only_that_connection() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.start(config("strict"), manager.clone()).unwrap();
    let addr = server.local_addr().unwrap();

    let mut good = send_raw(addr, &PREAMBLE);
    let mut bad = send_raw(addr, b"XYZ");

    let mut tmp = [0u8; 16];
    assert!(matches!(bad.read(&mut tmp), Ok(0) | Err(_)));
    eventually("protocol error count", || server.transport_stats().protocol_errors() == 1);

    good.write_all(&request_bytes(Request::Ping, 5, "")).unwrap();
    assert_eq!(read_response(&mut good).status(), Status::Success);
    server.stop();
}

#[test]
fn test_stop_closes_open_connections() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    server.start(config("closing"), manager.clone()).unwrap();

    let mut stream = send_raw(server.local_addr().unwrap(), &PREAMBLE);
    eventually("connection tracking", || server.open_connections() == 1);

    server.stop();
    let mut tmp = [0u8; 16];
    assert!(matches!(stream.read(&mut tmp), Ok(0) | Err(_)));
}

#[test]
fn test_injected_security_providers_are_listed() {
    let manager = cache_manager();
    let providers = Arc::new(SecurityProviders::new(["EXTERNAL", "OAUTHBEARER"], ["BEARER"]));
    let server = ProtocolServer::new(Protocol::Binary, providers.clone());
    server.start(config("mechs"), manager.clone()).unwrap();
    assert!(Arc::ptr_eq(server.security(), &providers));

    let mut bytes = PREAMBLE.to_vec();
    bytes.extend(request_bytes(Request::AuthMechList, 11, ""));
    let mut stream = send_raw(server.local_addr().unwrap(), &bytes);

    let response = read_response(&mut stream);
    assert_eq!(response.status(), Status::Success);
    assert_eq!(
        response.body(),
        &ResponseBody::Strings(vec!["EXTERNAL".to_string(), "OAUTHBEARER".to_string()])
    );
    server.stop();
}

// =============================================================================
// HTTP Protocol Tests
// =============================================================================

#[test]
fn test_http_huge_content_length_closes_connection() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Http, SecurityProviders::install());
    server.start(config("http-limits"), manager.clone()).unwrap();

    let mut stream = send_raw(
        server.local_addr().unwrap(),
        b"GET /v2/server/ HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n",
    );

    let mut tmp = [0u8; 64];
    assert!(matches!(stream.read(&mut tmp), Ok(0) | Err(_)));
    eventually("protocol error count", || server.transport_stats().protocol_errors() == 1);
    eventually("connection close", || server.transport_stats().closed() >= 1);
    assert_eq!(server.status(), ComponentStatus::Running);
    server.stop();
}

#[test]
fn test_http_body_above_frame_limit_closes_connection() {
    let manager = cache_manager();
    let server = ProtocolServer::new(Protocol::Http, SecurityProviders::install());
    let config = ProtocolServerConfig::builder()
        .name("http-small")
        .host("127.0.0.1")
        .port(0)
        .max_frame_size(64)
        .build();
    server.start(config, manager.clone()).unwrap();

    let mut stream = send_raw(
        server.local_addr().unwrap(),
        b"POST /v2/server/ HTTP/1.1\r\nContent-Length: 65\r\n\r\n",
    );

    let mut tmp = [0u8; 64];
    assert!(matches!(stream.read(&mut tmp), Ok(0) | Err(_)));
    eventually("protocol error count", || server.transport_stats().protocol_errors() == 1);
    server.stop();
}
