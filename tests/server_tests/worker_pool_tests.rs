//! Tests for the WorkerPool
//!
//! These tests verify:
//! - Accepted tasks run on the pool
//! - Overload and shutdown rejections are told apart
//! - Queued tasks are dropped on shutdown
//! - A panicking task does not take its worker down

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel;
use hotwire::server::{MetricSource, RejectReason, Submission, WorkerPool};
use hotwire::{LifecycleError, WireError};

// =============================================================================
// Helper Functions
// =============================================================================

/// Occupy one worker until the returned sender is dropped or used
fn block_worker(pool: &WorkerPool) -> channel::Sender<()> {
    let (release, wait) = channel::bounded::<()>(1);
    assert!(pool
        .submit(Box::new(move || {
            let _ = wait.recv();
        }))
        .is_accepted());
    release
}

fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(5));
    }
}

fn metric(pool: &WorkerPool, name: &str) -> u64 {
    pool.snapshot()
        .into_iter()
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .unwrap()
}

// =============================================================================
// Submission Tests
// =============================================================================

#[test]
fn test_accepted_tasks_run() {
    let pool = WorkerPool::new("runner", 4, 64).unwrap();
    let (tx, rx) = channel::unbounded();

    for i in 0..32 {
        let tx = tx.clone();
        assert_eq!(pool.submit(Box::new(move || tx.send(i).unwrap())), Submission::Accepted);
    }

    let mut seen: Vec<i32> = (0..32)
        .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, (0..32).collect::<Vec<_>>());
    assert_eq!(pool.threads(), 4);
}

#[test]
fn test_full_queue_is_overloaded() {
    let pool = WorkerPool::new("tight", 1, 1).unwrap();
    let release = block_worker(&pool);
    eventually("worker busy", || pool.active() == 1);

    // One slot in the queue, then nothing
    assert!(pool.submit(Box::new(|| {})).is_accepted());
    assert_eq!(
        pool.submit(Box::new(|| {})),
        Submission::Rejected(RejectReason::Overloaded)
    );

    let err = pool.execute(|| {}).unwrap_err();
    assert!(matches!(err, WireError::Lifecycle(LifecycleError::Overloaded(_))));
    assert!(err.is_retryable());
    assert!(metric(&pool, "rejected") >= 2);

    release.send(()).unwrap();
    eventually("queue drained", || pool.queued() == 0 && pool.active() == 0);
    assert!(pool.submit(Box::new(|| {})).is_accepted());
}

#[test]
fn test_shutdown_rejects_new_work() {
    let pool = WorkerPool::new("closing", 2, 8).unwrap();
    assert_eq!(pool.shutdown_now(), 0);
    assert!(pool.is_shutdown());

    assert_eq!(
        pool.submit(Box::new(|| {})),
        Submission::Rejected(RejectReason::Shutdown)
    );
    let err = pool.execute(|| {}).unwrap_err();
    assert!(matches!(err, WireError::Lifecycle(LifecycleError::AlreadyStopped(_))));
    assert!(!err.is_retryable());

    assert!(pool.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_shutdown_drops_queued_tasks() {
    let pool = WorkerPool::new("dropping", 1, 8).unwrap();
    let release = block_worker(&pool);
    eventually("worker busy", || pool.active() == 1);

    let ran = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let ran = Arc::clone(&ran);
        assert!(pool
            .submit(Box::new(move || {
                ran.fetch_add(1, Ordering::SeqCst);
            }))
            .is_accepted());
    }

    assert_eq!(pool.shutdown_now(), 3);
    // A second shutdown is a no-op
    assert_eq!(pool.shutdown_now(), 0);

    release.send(()).unwrap();
    assert!(pool.await_termination(Duration::from_secs(5)));
    assert_eq!(ran.load(Ordering::SeqCst), 0);
    assert_eq!(metric(&pool, "dropped"), 3);
}

#[test]
fn test_await_termination_times_out_while_busy() {
    let pool = WorkerPool::new("busy", 1, 1).unwrap();
    let release = block_worker(&pool);
    eventually("worker busy", || pool.active() == 1);

    pool.shutdown_now();
    assert!(!pool.await_termination(Duration::from_millis(50)));

    release.send(()).unwrap();
    assert!(pool.await_termination(Duration::from_secs(5)));
}

#[test]
fn test_panicking_task_keeps_worker() {
    let pool = WorkerPool::new("sturdy", 1, 8).unwrap();
    let (tx, rx) = channel::bounded(1);

    assert!(pool.submit(Box::new(|| panic!("task failure"))).is_accepted());
    assert!(pool.submit(Box::new(move || tx.send("after").unwrap())).is_accepted());

    assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
    eventually("panic counted", || metric(&pool, "panicked") == 1);
}
