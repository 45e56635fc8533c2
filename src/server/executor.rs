//! Worker pool
//!
//! Fixed-size pool of threads fed by a bounded crossbeam queue. Decoding
//! happens on connection threads; everything after decoding runs here and
//! may block freely.
//!
//! `submit` never panics or throws: it reports `Accepted` or
//! `Rejected { reason }`, where the reason tells a stopped pool apart from a
//! full queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, Sender, TrySendError};
use parking_lot::Mutex;

use crate::error::{LifecycleError, Result};

use super::registry::MetricSource;

/// A unit of work
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Why a task was refused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The pool has been shut down; it will never accept work again
    Shutdown,

    /// The queue is full; a later submission may succeed
    Overloaded,
}

/// Outcome of `WorkerPool::submit`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Rejected(RejectReason),
}

impl Submission {
    pub fn is_accepted(self) -> bool {
        self == Submission::Accepted
    }
}

#[derive(Default)]
struct PoolStats {
    submitted: AtomicU64,
    completed: AtomicU64,
    rejected: AtomicU64,
    dropped: AtomicU64,
    panicked: AtomicU64,
    active: AtomicUsize,
}

/// Bounded fixed-size thread pool
pub struct WorkerPool {
    name: String,
    sender: Mutex<Option<Sender<Task>>>,
    receiver: Receiver<Task>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    shutdown: Arc<AtomicBool>,
    stats: Arc<PoolStats>,
    threads: usize,
}

impl WorkerPool {
    /// Spawn `threads` workers behind a queue of `queue_capacity`
    pub fn new(name: impl Into<String>, threads: usize, queue_capacity: usize) -> Result<Self> {
        let name = name.into();
        let threads = threads.max(1);
        let (sender, receiver) = channel::bounded::<Task>(queue_capacity.max(1));
        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(PoolStats::default());

        let mut workers = Vec::with_capacity(threads);
        for id in 0..threads {
            let receiver = receiver.clone();
            let shutdown = Arc::clone(&shutdown);
            let stats = Arc::clone(&stats);
            let handle = thread::Builder::new()
                .name(format!("{}-worker-{}", name, id))
                .spawn(move || Self::work(id, receiver, shutdown, stats))?;
            workers.push(handle);
        }

        tracing::debug!("Worker pool {} started with {} threads", name, threads);
        Ok(Self {
            name,
            sender: Mutex::new(Some(sender)),
            receiver,
            workers: Mutex::new(workers),
            shutdown,
            stats,
            threads,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn threads(&self) -> usize {
        self.threads
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Tasks currently running
    pub fn active(&self) -> usize {
        self.stats.active.load(Ordering::Acquire)
    }

    /// Tasks waiting in the queue
    pub fn queued(&self) -> usize {
        self.receiver.len()
    }

    /// Hand `task` to the pool
    pub fn submit(&self, task: Task) -> Submission {
        if self.is_shutdown() {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Submission::Rejected(RejectReason::Shutdown);
        }

        let sender = self.sender.lock();
        let Some(sender) = sender.as_ref() else {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Submission::Rejected(RejectReason::Shutdown);
        };

        match sender.try_send(task) {
            Ok(()) => {
                self.stats.submitted.fetch_add(1, Ordering::Relaxed);
                Submission::Accepted
            }
            Err(TrySendError::Full(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Submission::Rejected(RejectReason::Overloaded)
            }
            Err(TrySendError::Disconnected(_)) => {
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                Submission::Rejected(RejectReason::Shutdown)
            }
        }
    }

    /// `submit`, with rejections mapped to lifecycle errors
    pub fn execute<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        match self.submit(Box::new(f)) {
            Submission::Accepted => Ok(()),
            Submission::Rejected(RejectReason::Shutdown) => {
                Err(LifecycleError::AlreadyStopped(self.name.clone()).into())
            }
            Submission::Rejected(RejectReason::Overloaded) => {
                Err(LifecycleError::Overloaded(self.name.clone()).into())
            }
        }
    }

    /// Stop accepting work and drop everything still queued
    ///
    /// Running tasks are not waited for; workers exit once their current
    /// task returns. Returns the number of queued tasks dropped.
    pub fn shutdown_now(&self) -> usize {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return 0;
        }
        drop(self.sender.lock().take());

        let dropped = self.receiver.try_iter().count();
        self.stats.dropped.fetch_add(dropped as u64, Ordering::Relaxed);
        tracing::debug!(
            "Worker pool {} shut down, {} queued tasks dropped",
            self.name,
            dropped
        );
        dropped
    }

    /// Wait for every worker to exit after `shutdown_now`
    pub fn await_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut workers = self.workers.lock();
                if workers.iter().all(|w| w.is_finished()) {
                    for worker in workers.drain(..) {
                        let _ = worker.join();
                    }
                    return true;
                }
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn work(id: usize, receiver: Receiver<Task>, shutdown: Arc<AtomicBool>, stats: Arc<PoolStats>) {
        while let Ok(task) = receiver.recv() {
            // Tasks still queued at shutdown are interrupted, not run
            if shutdown.load(Ordering::Acquire) {
                stats.dropped.fetch_add(1, Ordering::Relaxed);
                continue;
            }

            stats.active.fetch_add(1, Ordering::AcqRel);
            let outcome = panic::catch_unwind(AssertUnwindSafe(task));
            stats.active.fetch_sub(1, Ordering::AcqRel);

            match outcome {
                Ok(()) => {
                    stats.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    stats.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::error!("Worker {} task panicked", id);
                }
            }
        }
        tracing::trace!("Worker {} exiting", id);
    }
}

impl MetricSource for WorkerPool {
    fn snapshot(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("threads", self.threads as u64),
            ("active", self.active() as u64),
            ("queued", self.queued() as u64),
            ("submitted", self.stats.submitted.load(Ordering::Relaxed)),
            ("completed", self.stats.completed.load(Ordering::Relaxed)),
            ("rejected", self.stats.rejected.load(Ordering::Relaxed)),
            ("dropped", self.stats.dropped.load(Ordering::Relaxed)),
            ("panicked", self.stats.panicked.load(Ordering::Relaxed)),
        ]
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown_now();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("name", &self.name)
            .field("threads", &self.threads)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}
