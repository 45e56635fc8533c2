//! Client operations
//!
//! One request/response exchange. An operation owns its body checkpoint, its
//! completion slot and the channel it borrowed from the pool.
//!
//! ## State Machine
//! ```text
//!   NEW ──► SENT ──► AWAITING_RESPONSE ──► DECODING ──► COMPLETE
//!    │        │              │                 │
//!    └────────┴──────────────┴─────────────────┴──────► FAILED
//! ```
//! COMPLETE and FAILED are terminal. The channel is released exactly once,
//! on whichever terminal transition happens first.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, WireError};
use crate::protocol::{
    decode_response_body, encode_request, BodyCheckpoint, Decoded, Header, RequestFrame,
    ResponseBody, ResponseFrame, Status,
};

use super::channel::Channel;
use super::completion::CompletionSlot;
use super::pool::ChannelPool;

/// Lifecycle of an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OperationState {
    New,
    Sent,
    AwaitingResponse,
    Decoding,
    Complete,
    Failed,
}

impl OperationState {
    /// COMPLETE or FAILED
    pub fn is_terminal(self) -> bool {
        matches!(self, OperationState::Complete | OperationState::Failed)
    }
}

struct OperationInner {
    state: OperationState,
    checkpoint: BodyCheckpoint,
    channel: Option<Arc<Channel>>,
    pool: Option<ChannelPool>,
    deadline: Option<Instant>,
}

/// One in-flight request
pub struct Operation {
    frame: RequestFrame,
    timeout: Duration,
    limit: usize,
    inner: Mutex<OperationInner>,
    slot: CompletionSlot<ResponseFrame>,
    released: AtomicBool,
}

impl Operation {
    /// Create an operation for `frame`
    pub fn new(frame: RequestFrame, timeout: Duration, max_frame_size: usize) -> Arc<Self> {
        Arc::new(Self {
            frame,
            timeout,
            limit: max_frame_size,
            inner: Mutex::new(OperationInner {
                state: OperationState::New,
                checkpoint: BodyCheckpoint::with_limit(max_frame_size),
                channel: None,
                pool: None,
                deadline: None,
            }),
            slot: CompletionSlot::new(),
            released: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn correlation_id(&self) -> u64 {
        self.frame.header().correlation_id()
    }

    pub fn frame(&self) -> &RequestFrame {
        &self.frame
    }

    pub fn state(&self) -> OperationState {
        self.inner.lock().state
    }

    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Snapshot of the body decode checkpoint
    pub fn checkpoint(&self) -> BodyCheckpoint {
        self.inner.lock().checkpoint.clone()
    }

    /// Take the stored result, if the operation is terminal and nobody
    /// has consumed it yet
    pub fn take_result(&self) -> Option<Result<ResponseFrame>> {
        self.slot.take()
    }

    /// Whether the channel has been handed back
    pub fn is_channel_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub(crate) fn is_overdue(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        !inner.state.is_terminal() && inner.deadline.is_some_and(|deadline| now >= deadline)
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Send the request to `address` on a channel from `pool`
    ///
    /// The returned handle yields the response once the channel's reader has
    /// decoded it, or a failure once the operation times out.
    pub fn execute(self: &Arc<Self>, pool: &ChannelPool, address: SocketAddr) -> Result<OperationHandle> {
        let bytes = encode_request(&self.frame);
        let deadline = Instant::now() + self.timeout;

        let channel = match pool.acquire(address) {
            Ok(channel) => channel,
            Err(e) => {
                self.settle(Err(e.duplicate()));
                return Err(e);
            }
        };

        {
            let mut inner = self.inner.lock();
            inner.channel = Some(Arc::clone(&channel));
            inner.pool = Some(pool.clone());
            inner.deadline = Some(deadline);
        }

        if !channel.is_active() {
            self.fail(channel.inactive_error());
            return Err(channel.inactive_error());
        }

        // Expect the response before it can possibly arrive
        if let Err(e) = channel.register(Arc::clone(self)) {
            self.fail(channel.inactive_error());
            return Err(e);
        }

        if let Err(e) = channel.write(&bytes) {
            tracing::debug!(
                "Write of operation {} to {} failed: {}",
                self.correlation_id(),
                address,
                e
            );
            channel.close();
            self.fail(channel.inactive_error());
            return Err(e);
        }

        self.transition(OperationState::Sent);
        self.transition(OperationState::AwaitingResponse);

        tracing::trace!(
            "Sent {} (id={}) to {}",
            self.frame.request().opcode().name(),
            self.correlation_id(),
            address
        );

        Ok(OperationHandle {
            operation: Arc::clone(self),
            deadline,
        })
    }

    /// Decode the response body from `buf`, resuming from the checkpoint
    ///
    /// Called by the channel reader each time more bytes arrive while this
    /// operation is the expected recipient. `buf` starts at the first body
    /// byte. Returns the body length once the response is complete.
    pub fn decode_payload(&self, buf: &[u8], header: &Header) -> Result<Option<usize>> {
        let status = header.status().unwrap_or(Status::Success);

        let outcome = {
            let mut inner = self.inner.lock();
            if inner.state.is_terminal() {
                return Err(WireError::protocol(format!(
                    "operation {} already finished",
                    self.correlation_id()
                )));
            }
            inner.state = OperationState::Decoding;

            let checkpoint = std::mem::replace(
                &mut inner.checkpoint,
                BodyCheckpoint::with_limit(self.limit),
            );
            match decode_response_body(header.opcode(), status, buf, checkpoint) {
                Ok(Decoded::NeedMoreData(checkpoint)) => {
                    inner.checkpoint = checkpoint;
                    return Ok(None);
                }
                Ok(Decoded::Parsed { value, consumed }) => Ok((value, consumed)),
                Err(e) => Err(e),
            }
        };

        match outcome {
            Ok((ResponseBody::Error(message), consumed)) if status.is_error() => {
                self.finish(Err(WireError::Application { status, message }));
                Ok(Some(consumed))
            }
            Ok((body, consumed)) => {
                self.finish(Ok(ResponseFrame::from_parts(header.clone(), body)));
                Ok(Some(consumed))
            }
            Err(e) => {
                self.fail(e.duplicate());
                Err(e)
            }
        }
    }

    /// Fail the operation; no effect once terminal
    pub fn fail(&self, error: WireError) -> bool {
        self.finish(Err(error))
    }

    /// Fail with a timeout and drop the channel, whose stream position is now unknown
    pub(crate) fn expire(&self) -> bool {
        let timeout = WireError::Timeout {
            correlation_id: self.correlation_id(),
            timeout_ms: self.timeout.as_millis() as u64,
        };
        if !self.settle(Err(timeout)) {
            return false;
        }
        tracing::debug!("Operation {} timed out", self.correlation_id());
        let channel = self.inner.lock().channel.clone();
        if let Some(channel) = channel {
            channel.close();
        }
        self.release_channel();
        true
    }

    /// Hand the channel back to the pool (or discard it). Runs at most once.
    pub fn release_channel(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let (channel, pool) = {
            let mut inner = self.inner.lock();
            (inner.channel.take(), inner.pool.take())
        };
        if let Some(channel) = channel {
            channel.forget(self.correlation_id());
            if let Some(pool) = pool {
                pool.release(&channel);
            }
        }
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn finish(&self, result: Result<ResponseFrame>) -> bool {
        let won = self.settle(result);
        if won {
            self.release_channel();
        }
        won
    }

    /// Terminal transition plus slot assignment, atomically; first caller wins
    fn settle(&self, result: Result<ResponseFrame>) -> bool {
        let mut inner = self.inner.lock();
        if inner.state.is_terminal() {
            return false;
        }
        inner.state = if result.is_ok() {
            OperationState::Complete
        } else {
            OperationState::Failed
        };
        self.slot.complete(result)
    }

    /// Move forward; never backwards, never out of a terminal state
    fn transition(&self, to: OperationState) {
        let mut inner = self.inner.lock();
        if !inner.state.is_terminal() && inner.state < to {
            inner.state = to;
        }
    }
}

/// Caller's side of an executed operation
pub struct OperationHandle {
    operation: Arc<Operation>,
    deadline: Instant,
}

impl OperationHandle {
    pub fn correlation_id(&self) -> u64 {
        self.operation.correlation_id()
    }

    pub fn operation(&self) -> &Arc<Operation> {
        &self.operation
    }

    /// Whether a result (or failure) is available
    pub fn is_complete(&self) -> bool {
        self.operation.slot.is_complete()
    }

    /// Block until the operation completes or its timer expires
    pub fn wait(self) -> Result<ResponseFrame> {
        if let Some(result) = self.operation.slot.wait_until(self.deadline) {
            return result;
        }
        self.operation.expire();
        self.operation.slot.take().unwrap_or_else(|| {
            Err(WireError::Timeout {
                correlation_id: self.operation.correlation_id(),
                timeout_ms: self.operation.timeout.as_millis() as u64,
            })
        })
    }
}
