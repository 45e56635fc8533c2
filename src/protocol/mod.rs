//! Protocol Module
//!
//! Defines the binary wire protocol spoken between cache clients and the
//! binary protocol server.
//!
//! ## Connection
//! ```text
//! ┌────────────┬─────────┬─────────┬─────────┬───
//! │ "HR" + ver │ Frame 1 │ Frame 2 │ Frame 3 │ ...
//! └────────────┴─────────┴─────────┴─────────┴───
//! ```
//!
//! ## Frame
//! ```text
//! ┌────────┬──────────┬──────────┬────────────┬───────┬──────────┬──────────┐
//! │ Opcode │ Corr. id │ Topo. id │ Cache name │ Flags │ [Status] │   Body   │
//! └────────┴──────────┴──────────┴────────────┴───────┴──────────┴──────────┘
//! ```
//!
//! ### Opcodes (request / response)
//! - 0x01 / 0x02: PUT
//! - 0x03 / 0x04: GET
//! - 0x0B / 0x0C: REMOVE
//! - 0x0F / 0x10: CONTAINS_KEY
//! - 0x13 / 0x14: CLEAR
//! - 0x17 / 0x18: PING
//! - 0x21 / 0x22: AUTH_MECH_LIST
//! - 0x29 / 0x2A: SIZE
//!
//! ### Status Codes
//! - 0x00: SUCCESS
//! - 0x01: NOT_EXECUTED
//! - 0x02: KEY_DOES_NOT_EXIST
//! - 0x85: SERVER_ERROR
//! - 0x86: CACHE_UNAVAILABLE

mod checkpoint;
mod codec;
mod command;
mod header;
mod response;
pub mod varint;

pub use checkpoint::{Checkpoint, Cursor, Decoded};
pub use codec::{
    decode_preamble, decode_request, decode_response, decode_response_body,
    decode_response_header, encode_request, encode_response, BodyCheckpoint, FrameCheckpoint,
    HeaderCheckpoint, PartialBody, PartialFrame, PartialHeader, RequestFrame, ResponseFrame,
    MAGIC, PREAMBLE, PROTOCOL_VERSION,
};
pub use command::{Opcode, Request, RequestShape, ResponseShape};
pub use header::Header;
pub use response::{ResponseBody, Status};

/// Default limit on any single length prefix (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Header flags
pub mod flags {
    /// No flags
    pub const NONE: u8 = 0x00;
}
