//! # Hotwire
//!
//! A remote-cache wire protocol engine with:
//! - A binary request/response protocol with resumable, chunk-tolerant decoding
//! - A pooled, optionally multiplexed client with per-operation timeouts
//! - Protocol servers with bounded worker pools and clean lifecycles
//! - A single-port router that identifies protocols by their first bytes
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       CacheClient                            │
//! │          (ChannelPool · Operation · CompletionSlot)          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │  "HR" preamble + framed requests
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                  SinglePortRouter (optional)                 │
//! │             (signature match on the first bytes)             │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//!          ┌────────────┴────────────┐
//!          │                         │
//!          ▼                         ▼
//!   ┌─────────────┐          ┌─────────────┐
//!   │  Protocol   │          │  Protocol   │
//!   │  Server     │          │  Server     │
//!   │  (binary)   │          │  (http)     │
//!   └──────┬──────┘          └──────┬──────┘
//!          │                        │
//!          └───────────┬────────────┘
//!                      ▼
//!              ┌──────────────┐
//!              │ CacheManager │
//!              └──────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod protocol;
pub mod client;
pub mod server;
pub mod router;
pub mod cache;
pub mod security;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorKind, LifecycleError, Result, WireError};
pub use config::{
    ClientConfig, ConnectorConfig, ConnectorView, ExhaustedAction, ProtocolServerConfig,
    RouterConfig, ServerConfig, ServerConfigView,
};
pub use client::{CacheClient, RemoteCache};
pub use server::{Orchestrator, Protocol, ProtocolServer};
pub use router::SinglePortRouter;
pub use cache::{CacheManager, LocalCacheManager};
pub use security::SecurityProviders;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of Hotwire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
