//! Single-assignment completion slot
//!
//! The first `complete` call wins; later ones are discarded.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use crate::error::Result;

enum SlotState<T> {
    Pending,
    Ready(Result<T>),
    Taken,
}

/// Holds the one result of an operation
pub(crate) struct CompletionSlot<T> {
    state: Mutex<SlotState<T>>,
    ready: Condvar,
}

impl<T> CompletionSlot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending),
            ready: Condvar::new(),
        }
    }

    /// Store `result` unless a result was already stored
    pub(crate) fn complete(&self, result: Result<T>) -> bool {
        let mut state = self.state.lock();
        if !matches!(*state, SlotState::Pending) {
            return false;
        }
        *state = SlotState::Ready(result);
        self.ready.notify_all();
        true
    }

    pub(crate) fn is_complete(&self) -> bool {
        !matches!(*self.state.lock(), SlotState::Pending)
    }

    /// Take the result if one is ready
    pub(crate) fn take(&self) -> Option<Result<T>> {
        let mut state = self.state.lock();
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(result) => Some(result),
            SlotState::Pending => {
                *state = SlotState::Pending;
                None
            }
            SlotState::Taken => None,
        }
    }

    /// Block until a result is ready or `deadline` passes
    pub(crate) fn wait_until(&self, deadline: Instant) -> Option<Result<T>> {
        let mut state = self.state.lock();
        while matches!(*state, SlotState::Pending) {
            if self.ready.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
        match std::mem::replace(&mut *state, SlotState::Taken) {
            SlotState::Ready(result) => Some(result),
            SlotState::Pending => {
                *state = SlotState::Pending;
                None
            }
            SlotState::Taken => None,
        }
    }
}
