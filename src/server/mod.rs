//! Server Module
//!
//! Protocol servers and the orchestrator that runs them.
//!
//! ## Architecture
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 │             Orchestrator             │
//!                 │  cache manager · admin · ignore set  │
//!                 └───┬──────────────┬──────────────┬────┘
//!                     │              │              │
//!              ┌──────▼─────┐ ┌──────▼─────┐ ┌──────▼──────┐
//!              │ Protocol   │ │ Protocol   │ │ Single-port │
//!              │ Server     │ │ Server     │ │ Router      │
//!              │ (binary)   │ │ (http)     │ └──────┬──────┘
//!              └──┬─────┬───┘ └──┬─────┬───┘        │ route_connection
//!       Transport │     │        │     │ ◄──────────┘
//!                 ▼     ▼        ▼     ▼
//!            connections  WorkerPool  (decode on I/O thread,
//!                                      execute on workers)
//! ```

pub mod admin;
mod binary;
pub mod executor;
pub(crate) mod http;
pub mod ignore;
pub mod lifecycle;
mod management;
mod orchestrator;
mod protocol_server;
pub mod registry;
pub mod transport;

use std::fmt;
use std::net::TcpStream;

use bytes::BytesMut;
use serde::Serialize;

use crate::error::Result;

pub use admin::{AdminOperationsHandler, LocalTaskManager, ServerAdminOperationsHandler, TaskManager};
pub use executor::{RejectReason, Submission, Task, WorkerPool};
pub use ignore::IgnoredCaches;
pub use lifecycle::ComponentStatus;
pub use management::{ProcessEnvironment, ServerManagement};
pub use orchestrator::Orchestrator;
pub use protocol_server::ProtocolServer;
pub use registry::{MetricSource, MetricsRegistry, ObservabilityRegistry};
pub use transport::{ConnectionAcceptor, Transport};

/// Protocols a server can speak
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// The binary cache protocol
    Binary,

    /// HTTP/1.1 management endpoints
    Http,
}

impl Protocol {
    pub fn name(self) -> &'static str {
        match self {
            Protocol::Binary => "binary",
            Protocol::Http => "http",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Serves one accepted connection until it closes
///
/// Runs on the connection's own I/O thread. `prefix` holds bytes already
/// read from the stream.
pub(crate) trait ConnectionHandler: Send + Sync {
    fn serve(&self, server: &ProtocolServer, stream: TcpStream, prefix: BytesMut) -> Result<()>;
}
