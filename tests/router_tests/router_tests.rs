//! Tests for the Single-Port Router
//!
//! These tests verify:
//! - Signature matching on partial and complete prefixes
//! - Routing table resolution and atomic table replacement
//! - Binary and HTTP traffic sharing one port
//! - Unrecognised traffic being closed and counted

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hotwire::router::{ProtocolSignature, Resolution, Route, RoutingTable, SignatureMatch};
use hotwire::server::ComponentStatus;
use hotwire::{
    CacheClient, CacheManager, ClientConfig, LocalCacheManager, Protocol, ProtocolServer,
    ProtocolServerConfig, RouterConfig, SecurityProviders, SinglePortRouter,
};

// =============================================================================
// Helper Functions
// =============================================================================

/// A binary and an HTTP server without their own transports
fn routed_servers() -> (Arc<LocalCacheManager>, ProtocolServer, ProtocolServer) {
    let manager = Arc::new(LocalCacheManager::new("routed"));
    manager.start().unwrap();

    let binary = ProtocolServer::new(Protocol::Binary, SecurityProviders::install());
    binary
        .start(
            ProtocolServerConfig::builder().name("r").start_transport(false).build(),
            manager.clone(),
        )
        .unwrap();

    let http = ProtocolServer::new(Protocol::Http, SecurityProviders::install());
    http.start(
        ProtocolServerConfig::builder().name("r").start_transport(false).build(),
        manager.clone(),
    )
    .unwrap();

    (manager, binary, http)
}

fn start_router(binary: &ProtocolServer, http: &ProtocolServer) -> SinglePortRouter {
    let router = SinglePortRouter::new(RouterConfig {
        port: 0,
        peek_timeout_ms: 1000,
        ..RouterConfig::default()
    });
    router
        .start(RoutingTable::new(vec![
            Route::for_server(binary.clone()),
            Route::for_server(http.clone()),
        ]))
        .unwrap();
    router
}

fn client_for(addr: SocketAddr) -> CacheClient {
    CacheClient::connect(
        ClientConfig::builder()
            .servers([addr.to_string()])
            .operation_timeout_ms(3000)
            .build(),
    )
    .unwrap()
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(10));
    }
}

// =============================================================================
// Signature Tests
// =============================================================================

#[test]
fn test_binary_signature() {
    let signature = ProtocolSignature::Binary;
    assert_eq!(signature.matches(b""), SignatureMatch::Maybe);
    assert_eq!(signature.matches(b"H"), SignatureMatch::Maybe);
    assert_eq!(signature.matches(b"HR"), SignatureMatch::Yes);
    assert_eq!(signature.matches(b"HR\x01\x01"), SignatureMatch::Yes);
    assert_eq!(signature.matches(b"HX"), SignatureMatch::No);
    assert_eq!(signature.matches(b"GET "), SignatureMatch::No);
}

#[test]
fn test_http_signature() {
    let signature = ProtocolSignature::Http;
    assert_eq!(signature.matches(b"GE"), SignatureMatch::Maybe);
    assert_eq!(signature.matches(b"GET"), SignatureMatch::Maybe);
    assert_eq!(signature.matches(b"GET /v2/server/ HTTP/1.1"), SignatureMatch::Yes);
    assert_eq!(signature.matches(b"DELETE /x"), SignatureMatch::Yes);
    assert_eq!(signature.matches(b"GETX"), SignatureMatch::No);
    assert_eq!(signature.matches(b"HR\x01"), SignatureMatch::No);
}

#[test]
fn test_signature_for_protocol() {
    assert_eq!(ProtocolSignature::for_protocol(Protocol::Binary), ProtocolSignature::Binary);
    assert_eq!(ProtocolSignature::Http.protocol(), Protocol::Http);
}

// =============================================================================
// Routing Table Tests
// =============================================================================

#[test]
fn test_resolve() {
    let table = RoutingTable::new(vec![
        Route::for_server(ProtocolServer::new(Protocol::Binary, SecurityProviders::install())),
        Route::for_server(ProtocolServer::new(Protocol::Http, SecurityProviders::install())),
    ]);

    match table.resolve(b"HR\x01") {
        Resolution::Matched(route) => assert_eq!(route.server().protocol(), Protocol::Binary),
        other => panic!("expected a match, got {:?}", other),
    }
    match table.resolve(b"POST /") {
        Resolution::Matched(route) => assert_eq!(route.signature(), ProtocolSignature::Http),
        other => panic!("expected a match, got {:?}", other),
    }
    assert!(matches!(table.resolve(b""), Resolution::Undecided));
    assert!(matches!(table.resolve(b"P"), Resolution::Undecided));
    assert!(matches!(table.resolve(b"XYZ"), Resolution::Unmatched));
}

#[test]
fn test_empty_table_matches_nothing() {
    let table = RoutingTable::empty();
    assert!(table.is_empty());
    assert!(matches!(table.resolve(b"HR\x01"), Resolution::Unmatched));
}

#[test]
fn test_with_route_leaves_original_untouched() {
    let table = RoutingTable::empty();
    let extended = table.with_route(Route::for_server(ProtocolServer::new(Protocol::Binary, SecurityProviders::install())));

    assert_eq!(table.len(), 0);
    assert_eq!(extended.len(), 1);
}

#[test]
fn test_update_table_swaps_snapshot() {
    let router = SinglePortRouter::new(RouterConfig::default());
    let before = router.table();
    assert!(before.is_empty());

    let previous = router.update_table(RoutingTable::new(vec![Route::for_server(
        ProtocolServer::new(Protocol::Http, SecurityProviders::install()),
    )]));

    assert!(Arc::ptr_eq(&before, &previous));
    assert_eq!(router.table().len(), 1);
    // Snapshots taken earlier keep their view
    assert!(before.is_empty());
}

// =============================================================================
// Live Routing Tests
// =============================================================================

#[test]
fn test_binary_traffic_routed() {
    let (manager, binary, http) = routed_servers();
    let router = start_router(&binary, &http);
    assert_eq!(router.status(), ComponentStatus::Running);

    let client = client_for(router.local_addr().unwrap());
    client.ping().unwrap();
    client.default_cache().put(b"via", b"router").unwrap();

    assert_eq!(client.default_cache().get(b"via").unwrap(), Some(b"router".to_vec()));
    assert_eq!(
        manager.get_cache("default").unwrap().get(b"via"),
        Some(b"router".to_vec())
    );
    assert!(router.routed_count() >= 1);
    assert_eq!(router.unmatched_count(), 0);

    router.stop();
    binary.stop();
    http.stop();
}

#[test]
fn test_http_traffic_routed() {
    let (_manager, binary, http) = routed_servers();
    let router = start_router(&binary, &http);

    let mut stream = TcpStream::connect(router.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream
        .write_all(b"GET /v2/server/ HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    // Standalone servers have no management attached
    assert!(reply.starts_with("HTTP/1.1 503"), "unexpected reply: {}", reply);
    eventually("routed count", || router.routed_count() == 1);

    router.stop();
    binary.stop();
    http.stop();
}

#[test]
fn test_unknown_signature_closed() {
    let (_manager, binary, http) = routed_servers();
    let router = start_router(&binary, &http);

    let mut stream = TcpStream::connect(router.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"XYZ").unwrap();

    let mut buf = [0u8; 16];
    assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));
    eventually("unmatched count", || router.unmatched_count() == 1);
    assert_eq!(router.stats().protocol_errors(), 1);
    assert_eq!(router.routed_count(), 0);

    router.stop();
    binary.stop();
    http.stop();
}

#[test]
fn test_signature_split_across_reads() {
    let (_manager, binary, http) = routed_servers();
    let router = start_router(&binary, &http);

    let mut stream = TcpStream::connect(router.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"G").unwrap();
    stream.flush().unwrap();
    thread::sleep(Duration::from_millis(50));
    stream.write_all(b"ET /v2/server/ HTTP/1.0\r\n\r\n").unwrap();

    let mut reply = String::new();
    stream.read_to_string(&mut reply).unwrap();
    assert!(reply.starts_with("HTTP/1.1 "), "unexpected reply: {}", reply);

    router.stop();
    binary.stop();
    http.stop();
}

#[test]
fn test_stopped_server_behind_router_closes_connection() {
    let (_manager, binary, http) = routed_servers();
    let router = start_router(&binary, &http);
    binary.stop();

    let mut stream = TcpStream::connect(router.local_addr().unwrap()).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    stream.write_all(b"HR\x01").unwrap();

    let mut buf = [0u8; 16];
    assert!(matches!(stream.read(&mut buf), Ok(0) | Err(_)));

    router.stop();
    http.stop();
}

#[test]
fn test_router_stop_is_idempotent() {
    let (_manager, binary, http) = routed_servers();
    let router = start_router(&binary, &http);
    let addr = router.local_addr().unwrap();

    router.stop();
    router.stop();

    assert_eq!(router.status(), ComponentStatus::Terminated);
    assert!(router.local_addr().is_none());
    assert!(TcpStream::connect(addr).is_err());

    binary.stop();
    http.stop();
}
