//! Channel pool
//!
//! Owns the physical channels, grouped per destination address. Each address
//! has its own lock, so acquiring a channel to one server never waits on
//! another server's traffic.
//!
//! ## Acquire
//! ```text
//!   acquire(addr)
//!     ├─ prune inactive channels, close stale idle ones
//!     ├─ active, non-stale channel with spare capacity? ──► lease it
//!     ├─ below max_channels_per_address?               ──► open a new one
//!     └─ at the bound: Wait → block until release / timeout
//!                      Fail → PoolExhausted
//! ```
//! Without multiplexing a channel's capacity is one, which gives strict
//! one-operation-per-channel.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{ClientConfig, ExhaustedAction};
use crate::error::{LifecycleError, Result, WireError};

use super::channel::Channel;

#[derive(Default)]
struct AddressState {
    channels: Vec<Arc<Channel>>,
    /// Connects in progress, counted against the bound
    opening: usize,
}

#[derive(Default)]
struct AddressPool {
    state: Mutex<AddressState>,
    available: Condvar,
}

struct PoolInner {
    config: ClientConfig,
    addresses: Mutex<HashMap<SocketAddr, Arc<AddressPool>>>,
    next_channel_id: AtomicU64,
    closed: AtomicBool,
}

/// Pool of channels keyed by server address
#[derive(Clone)]
pub struct ChannelPool {
    inner: Arc<PoolInner>,
}

impl ChannelPool {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                config,
                addresses: Mutex::new(HashMap::new()),
                next_channel_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Lease a channel to `address`, opening one if needed
    pub fn acquire(&self, address: SocketAddr) -> Result<Arc<Channel>> {
        let pool = self.address_pool(address)?;
        let capacity = self.inner.config.channel_capacity();
        let bound = self.inner.config.max_channels_per_address.max(1);
        let deadline = match self.inner.config.exhausted_action {
            ExhaustedAction::Wait { timeout_ms } => {
                Some(Instant::now() + Duration::from_millis(timeout_ms))
            }
            ExhaustedAction::Fail => None,
        };

        let mut state = pool.state.lock();
        loop {
            if self.inner.closed.load(Ordering::Acquire) {
                return Err(LifecycleError::AlreadyStopped("channel pool".to_string()).into());
            }

            Self::prune(&mut state);

            // Step 1: reuse a channel with spare capacity
            if let Some(channel) = state
                .channels
                .iter()
                .filter(|c| c.is_active() && !c.is_stale() && c.leases() < capacity)
                .min_by_key(|c| c.leases())
            {
                channel.lease();
                return Ok(Arc::clone(channel));
            }

            // Step 2: open a new one while under the bound
            if state.channels.len() + state.opening < bound {
                return self.open(&pool, &mut state, address);
            }

            // Step 3: at the bound
            match deadline {
                None => {
                    return Err(WireError::PoolExhausted {
                        address: address.to_string(),
                    })
                }
                Some(deadline) => {
                    if pool.available.wait_until(&mut state, deadline).timed_out() {
                        return Err(WireError::PoolExhausted {
                            address: address.to_string(),
                        });
                    }
                }
            }
        }
    }

    /// Return a leased channel; inactive channels are discarded
    pub fn release(&self, channel: &Arc<Channel>) {
        channel.unlease();

        let Some(pool) = self.inner.addresses.lock().get(&channel.address()).cloned() else {
            channel.close();
            return;
        };

        {
            let mut state = pool.state.lock();
            if !channel.is_active() {
                state.channels.retain(|c| !Arc::ptr_eq(c, channel));
                tracing::debug!("Discarded inactive channel {} to {}", channel.id(), channel.address());
            } else if channel.is_stale() && channel.leases() == 0 {
                state.channels.retain(|c| !Arc::ptr_eq(c, channel));
                channel.close();
                tracing::debug!("Closed stale channel {} to {}", channel.id(), channel.address());
            }
        }
        pool.available.notify_one();
    }

    /// Mark every channel to `address` stale
    pub fn mark_stale(&self, address: SocketAddr) {
        if let Some(pool) = self.inner.addresses.lock().get(&address).cloned() {
            Self::mark_pool_stale(&pool);
        }
    }

    /// Mark every pooled channel stale, e.g. after a topology change
    pub fn mark_all_stale(&self) {
        let pools: Vec<_> = self.inner.addresses.lock().values().cloned().collect();
        for pool in pools {
            Self::mark_pool_stale(&pool);
        }
    }

    /// Close every channel and refuse further acquires
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let pools: Vec<_> = self.inner.addresses.lock().drain().map(|(_, p)| p).collect();
        for pool in pools {
            let channels = std::mem::take(&mut pool.state.lock().channels);
            for channel in channels {
                channel.close();
            }
            pool.available.notify_all();
        }
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Channels currently pooled for `address`
    pub fn channel_count(&self, address: SocketAddr) -> usize {
        self.inner
            .addresses
            .lock()
            .get(&address)
            .map(|p| p.state.lock().channels.len())
            .unwrap_or(0)
    }

    /// Leases currently held on channels to `address`
    pub fn leased_count(&self, address: SocketAddr) -> usize {
        self.inner
            .addresses
            .lock()
            .get(&address)
            .map(|p| p.state.lock().channels.iter().map(|c| c.leases()).sum())
            .unwrap_or(0)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn address_pool(&self, address: SocketAddr) -> Result<Arc<AddressPool>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(LifecycleError::AlreadyStopped("channel pool".to_string()).into());
        }
        let mut addresses = self.inner.addresses.lock();
        Ok(Arc::clone(addresses.entry(address).or_default()))
    }

    fn prune(state: &mut AddressState) {
        state.channels.retain(|c| {
            if !c.is_active() {
                return false;
            }
            if c.is_stale() && c.leases() == 0 {
                c.close();
                return false;
            }
            true
        });
    }

    fn mark_pool_stale(pool: &AddressPool) {
        let mut state = pool.state.lock();
        for channel in &state.channels {
            channel.mark_stale();
        }
        Self::prune(&mut state);
    }

    /// Connect without holding the address lock; the slot is reserved meanwhile
    fn open(
        &self,
        pool: &AddressPool,
        state: &mut MutexGuard<'_, AddressState>,
        address: SocketAddr,
    ) -> Result<Arc<Channel>> {
        state.opening += 1;
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed);
        let connected =
            MutexGuard::unlocked(state, || Channel::connect(id, address, &self.inner.config));
        state.opening -= 1;

        match connected {
            Ok(channel) => {
                channel.lease();
                state.channels.push(Arc::clone(&channel));
                Ok(channel)
            }
            Err(e) => {
                tracing::warn!("Failed to open channel to {}: {}", address, e);
                pool.available.notify_one();
                Err(e)
            }
        }
    }
}

impl std::fmt::Debug for ChannelPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelPool")
            .field("addresses", &self.inner.addresses.lock().len())
            .field("closed", &self.inner.closed.load(Ordering::Relaxed))
            .finish()
    }
}
