//! Tests for the Channel Pool
//!
//! These tests verify:
//! - Channel reuse and the per-address bound
//! - Strict one-operation-per-channel without multiplexing
//! - Shared channels with multiplexing
//! - Wait / Fail exhaustion policies
//! - Stale and inactive channel handling

use std::io::Read;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use hotwire::client::ChannelPool;
use hotwire::{ClientConfig, ErrorKind, ExhaustedAction, WireError};

// =============================================================================
// Helper Functions
// =============================================================================

/// Listener that accepts connections and reads them until EOF
fn sink_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { return };
            thread::spawn(move || {
                let mut buf = [0u8; 256];
                while matches!(stream.read(&mut buf), Ok(n) if n > 0) {}
            });
        }
    });
    addr
}

fn pool(max_channels: usize, action: ExhaustedAction) -> ChannelPool {
    ChannelPool::new(
        ClientConfig::builder()
            .max_channels_per_address(max_channels)
            .exhausted_action(action)
            .build(),
    )
}

// =============================================================================
// Acquire / Release Tests
// =============================================================================

#[test]
fn test_acquire_opens_channel() {
    let addr = sink_server();
    let pool = pool(2, ExhaustedAction::Fail);

    let channel = pool.acquire(addr).unwrap();

    assert!(channel.is_active());
    assert_eq!(channel.address(), addr);
    assert_eq!(channel.leases(), 1);
    assert_eq!(pool.channel_count(addr), 1);
    assert_eq!(pool.leased_count(addr), 1);
}

#[test]
fn test_released_channel_is_reused() {
    let addr = sink_server();
    let pool = pool(2, ExhaustedAction::Fail);

    let first = pool.acquire(addr).unwrap();
    let id = first.id();
    pool.release(&first);
    assert_eq!(first.leases(), 0);

    let second = pool.acquire(addr).unwrap();
    assert_eq!(second.id(), id);
    assert_eq!(pool.channel_count(addr), 1);
}

#[test]
fn test_fail_policy_at_bound() {
    let addr = sink_server();
    let pool = pool(2, ExhaustedAction::Fail);

    let a = pool.acquire(addr).unwrap();
    let b = pool.acquire(addr).unwrap();
    assert_ne!(a.id(), b.id());

    let err = pool.acquire(addr).unwrap_err();
    assert!(matches!(err, WireError::PoolExhausted { .. }));
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[test]
fn test_wait_policy_gets_released_channel() {
    let addr = sink_server();
    let pool = pool(1, ExhaustedAction::Wait { timeout_ms: 3000 });

    let held = pool.acquire(addr).unwrap();
    let id = held.id();
    let releaser = {
        let pool = pool.clone();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            pool.release(&held);
        })
    };

    let started = Instant::now();
    let channel = pool.acquire(addr).unwrap();
    assert_eq!(channel.id(), id);
    assert!(started.elapsed() >= Duration::from_millis(150));
    releaser.join().unwrap();
}

#[test]
fn test_wait_policy_times_out() {
    let addr = sink_server();
    let pool = pool(1, ExhaustedAction::Wait { timeout_ms: 200 });

    let _held = pool.acquire(addr).unwrap();
    let started = Instant::now();
    let err = pool.acquire(addr).unwrap_err();

    assert!(matches!(err, WireError::PoolExhausted { .. }));
    assert!(started.elapsed() >= Duration::from_millis(150));
}

// =============================================================================
// Multiplexing Policy Tests
// =============================================================================

#[test]
fn test_one_operation_per_channel_under_contention() {
    let addr = sink_server();
    let pool = pool(2, ExhaustedAction::Wait { timeout_ms: 5000 });
    let violations = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..8)
        .map(|_| {
            let pool = pool.clone();
            let violations = Arc::clone(&violations);
            thread::spawn(move || {
                for _ in 0..20 {
                    let channel = pool.acquire(addr).unwrap();
                    if channel.leases() != 1 {
                        violations.fetch_add(1, Ordering::SeqCst);
                    }
                    thread::sleep(Duration::from_millis(1));
                    pool.release(&channel);
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(violations.load(Ordering::SeqCst), 0);
    assert!(pool.channel_count(addr) <= 2);
    assert_eq!(pool.leased_count(addr), 0);
}

#[test]
fn test_multiplexed_channel_is_shared() {
    let addr = sink_server();
    let pool = ChannelPool::new(
        ClientConfig::builder()
            .max_channels_per_address(1)
            .multiplexing(true)
            .max_in_flight_per_channel(3)
            .exhausted_action(ExhaustedAction::Fail)
            .build(),
    );

    let a = pool.acquire(addr).unwrap();
    let b = pool.acquire(addr).unwrap();
    let c = pool.acquire(addr).unwrap();
    assert!(Arc::ptr_eq(&a, &b) && Arc::ptr_eq(&b, &c));
    assert_eq!(a.leases(), 3);

    assert!(pool.acquire(addr).is_err());
    pool.release(&c);
    assert!(pool.acquire(addr).is_ok());
}

// =============================================================================
// Stale / Inactive Channel Tests
// =============================================================================

#[test]
fn test_stale_channel_kept_while_leased() {
    let addr = sink_server();
    let pool = pool(2, ExhaustedAction::Fail);

    let old = pool.acquire(addr).unwrap();
    pool.mark_all_stale();

    // In-flight work keeps its channel
    assert!(old.is_active());
    assert!(old.is_stale());

    let fresh = pool.acquire(addr).unwrap();
    assert_ne!(fresh.id(), old.id());

    pool.release(&old);
    assert!(!old.is_active());
    assert_eq!(pool.channel_count(addr), 1);
}

#[test]
fn test_idle_stale_channel_closed() {
    let addr = sink_server();
    let pool = pool(2, ExhaustedAction::Fail);

    let channel = pool.acquire(addr).unwrap();
    pool.release(&channel);
    pool.mark_stale(addr);

    assert!(!channel.is_active());
    assert_eq!(pool.channel_count(addr), 0);
}

#[test]
fn test_inactive_channel_discarded_on_release() {
    let addr = sink_server();
    let pool = pool(1, ExhaustedAction::Fail);

    let channel = pool.acquire(addr).unwrap();
    channel.close();
    pool.release(&channel);

    assert_eq!(pool.channel_count(addr), 0);
    let replacement = pool.acquire(addr).unwrap();
    assert_ne!(replacement.id(), channel.id());
}

#[test]
fn test_addresses_are_isolated() {
    let first = sink_server();
    let second = sink_server();
    let pool = pool(1, ExhaustedAction::Fail);

    let _a = pool.acquire(first).unwrap();
    assert!(pool.acquire(first).is_err());
    assert!(pool.acquire(second).is_ok());
}

#[test]
fn test_closed_pool_rejects_acquire() {
    let addr = sink_server();
    let pool = pool(1, ExhaustedAction::Fail);

    let channel = pool.acquire(addr).unwrap();
    pool.close();

    assert!(!channel.is_active());
    let err = pool.acquire(addr).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Lifecycle);
    assert!(!err.is_retryable());
}

#[test]
fn test_connect_refused() {
    let addr = {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let pool = pool(1, ExhaustedAction::Fail);

    let err = pool.acquire(addr).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert_eq!(pool.channel_count(addr), 0);
}
