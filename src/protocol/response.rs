//! Response definitions
//!
//! Status codes and decoded response bodies.

use crate::error::{Result, WireError};

/// Response status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Status {
    Success = 0x00,
    NotExecuted = 0x01,
    KeyDoesNotExist = 0x02,
    ServerError = 0x85,
    CacheUnavailable = 0x86,
}

impl Status {
    /// Parse a status byte
    pub fn from_u8(byte: u8) -> Result<Self> {
        Ok(match byte {
            0x00 => Status::Success,
            0x01 => Status::NotExecuted,
            0x02 => Status::KeyDoesNotExist,
            0x85 => Status::ServerError,
            0x86 => Status::CacheUnavailable,
            _ => {
                return Err(WireError::protocol(format!(
                    "Unknown response status: 0x{:02x}",
                    byte
                )))
            }
        })
    }

    /// Statuses at or above 0x80 signal an application-level failure
    pub fn is_error(self) -> bool {
        (self as u8) >= 0x80
    }
}

/// A decoded response body
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseBody {
    /// No payload (status carries the answer)
    Empty,

    /// Value of a GET; `None` when the key does not exist
    Value(Option<Vec<u8>>),

    /// A count, such as SIZE
    Count(u64),

    /// A list of strings, such as AUTH_MECH_LIST
    Strings(Vec<String>),

    /// Error message accompanying an error status
    Error(String),
}
