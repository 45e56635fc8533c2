//! Frame header
//!
//! ```text
//! ┌──────────┬────────────────┬──────────────┬────────────────────┬──────────┬────────────┐
//! │Opcode (1)│ Correlation id │ Topology id  │ Cache name         │ Flags (1)│ Status (1) │
//! │          │ (vlong)        │ (vint)       │ (vint len + UTF-8) │          │ resp. only │
//! └──────────┴────────────────┴──────────────┴────────────────────┴──────────┴────────────┘
//! ```

use super::{Opcode, Status};

/// An immutable frame header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    opcode: Opcode,
    correlation_id: u64,
    topology_id: u32,
    cache_name: String,
    flags: u8,
    status: Option<Status>,
}

impl Header {
    /// Header of a request
    pub fn request(
        opcode: Opcode,
        correlation_id: u64,
        topology_id: u32,
        cache_name: impl Into<String>,
        flags: u8,
    ) -> Self {
        Self {
            opcode,
            correlation_id,
            topology_id,
            cache_name: cache_name.into(),
            flags,
            status: None,
        }
    }

    /// Header of a response
    pub fn response(
        opcode: Opcode,
        correlation_id: u64,
        topology_id: u32,
        cache_name: impl Into<String>,
        flags: u8,
        status: Status,
    ) -> Self {
        Self {
            opcode,
            correlation_id,
            topology_id,
            cache_name: cache_name.into(),
            flags,
            status: Some(status),
        }
    }

    /// Header answering this request header
    pub fn reply(&self, status: Status, topology_id: u32) -> Self {
        Self::response(
            self.opcode,
            self.correlation_id,
            topology_id,
            self.cache_name.clone(),
            self.flags,
            status,
        )
    }

    pub fn opcode(&self) -> Opcode {
        self.opcode
    }

    pub fn correlation_id(&self) -> u64 {
        self.correlation_id
    }

    pub fn topology_id(&self) -> u32 {
        self.topology_id
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    /// Status of a response header; `None` on requests
    pub fn status(&self) -> Option<Status> {
        self.status
    }

    pub fn is_response(&self) -> bool {
        self.status.is_some()
    }
}
