//! Error types for Hotwire
//!
//! Provides a unified error type for the codec, the client channels, the
//! protocol servers and the orchestrator.

use thiserror::Error;

use crate::protocol::Status;

/// Result type alias using WireError
pub type Result<T> = std::result::Result<T, WireError>;

/// Unified error type for Hotwire operations
#[derive(Debug, Error)]
pub enum WireError {
    // -------------------------------------------------------------------------
    // Transport Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Channel to {address} is not active")]
    ChannelInactive { address: String },

    #[error("Timed out connecting to {address}")]
    ConnectTimeout { address: String },

    #[error("No channel available for {address}")]
    PoolExhausted { address: String },

    #[error("Operation {correlation_id} timed out after {timeout_ms} ms")]
    Timeout { correlation_id: u64, timeout_ms: u64 },

    // -------------------------------------------------------------------------
    // Protocol Errors
    // -------------------------------------------------------------------------
    #[error("Protocol error: {0}")]
    Protocol(String),

    // -------------------------------------------------------------------------
    // Application Errors
    // -------------------------------------------------------------------------
    #[error("Server returned {status:?}: {message}")]
    Application { status: Status, message: String },

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Why a component refused work
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    /// The component has been stopped; retrying will never succeed
    #[error("{0} has been stopped")]
    AlreadyStopped(String),

    /// The component is saturated; retrying later may succeed
    #[error("{0} is overloaded")]
    Overloaded(String),

    /// The component has not finished starting
    #[error("{0} is not running")]
    NotRunning(String),
}

/// Coarse classification of a WireError
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transport,
    Protocol,
    Application,
    Lifecycle,
    Configuration,
}

impl WireError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            WireError::Io(_)
            | WireError::ChannelInactive { .. }
            | WireError::ConnectTimeout { .. }
            | WireError::PoolExhausted { .. }
            | WireError::Timeout { .. } => ErrorKind::Transport,
            WireError::Protocol(_) => ErrorKind::Protocol,
            WireError::Application { .. } => ErrorKind::Application,
            WireError::Lifecycle(_) => ErrorKind::Lifecycle,
            WireError::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Whether the caller may retry the failed work
    ///
    /// Transport failures and transient overload are retryable; a stopped
    /// component, a malformed frame or a business-level failure is not.
    pub fn is_retryable(&self) -> bool {
        match self {
            WireError::Lifecycle(LifecycleError::Overloaded(_)) => true,
            WireError::Lifecycle(_) => false,
            other => other.kind() == ErrorKind::Transport,
        }
    }

    /// A copy of this error with the same variant and message
    ///
    /// I/O errors keep their kind; the source chain is not carried over.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            WireError::Io(e) => WireError::Io(std::io::Error::new(e.kind(), e.to_string())),
            WireError::ChannelInactive { address } => WireError::ChannelInactive {
                address: address.clone(),
            },
            WireError::ConnectTimeout { address } => WireError::ConnectTimeout {
                address: address.clone(),
            },
            WireError::PoolExhausted { address } => WireError::PoolExhausted {
                address: address.clone(),
            },
            WireError::Timeout {
                correlation_id,
                timeout_ms,
            } => WireError::Timeout {
                correlation_id: *correlation_id,
                timeout_ms: *timeout_ms,
            },
            WireError::Protocol(message) => WireError::Protocol(message.clone()),
            WireError::Application { status, message } => WireError::Application {
                status: *status,
                message: message.clone(),
            },
            WireError::Lifecycle(e) => WireError::Lifecycle(e.clone()),
            WireError::Config(message) => WireError::Config(message.clone()),
        }
    }

    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        WireError::Protocol(message.into())
    }

    pub(crate) fn config(message: impl Into<String>) -> Self {
        WireError::Config(message.into())
    }
}
