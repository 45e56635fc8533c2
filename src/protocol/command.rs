//! Operation definitions
//!
//! One tagged variant per opcode. Wire codes and body layouts live in a
//! single table indexed by `Opcode`, so encoding, decoding and dispatch all
//! agree on what an opcode carries.

use crate::error::{Result, WireError};

/// Operation types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Put = 0,
    Get = 1,
    Remove = 2,
    ContainsKey = 3,
    Clear = 4,
    Ping = 5,
    AuthMechList = 6,
    Size = 7,
}

/// Fields carried by a request body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestShape {
    Empty,
    Key,
    KeyValue,
}

/// Fields carried by a successful response body
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseShape {
    Empty,
    Value,
    Count,
    Strings,
}

struct OpcodeInfo {
    request_code: u8,
    name: &'static str,
    request: RequestShape,
    response: ResponseShape,
}

const OPCODES: [OpcodeInfo; 8] = [
    OpcodeInfo { request_code: 0x01, name: "PUT", request: RequestShape::KeyValue, response: ResponseShape::Empty },
    OpcodeInfo { request_code: 0x03, name: "GET", request: RequestShape::Key, response: ResponseShape::Value },
    OpcodeInfo { request_code: 0x0B, name: "REMOVE", request: RequestShape::Key, response: ResponseShape::Empty },
    OpcodeInfo { request_code: 0x0F, name: "CONTAINS_KEY", request: RequestShape::Key, response: ResponseShape::Empty },
    OpcodeInfo { request_code: 0x13, name: "CLEAR", request: RequestShape::Empty, response: ResponseShape::Empty },
    OpcodeInfo { request_code: 0x17, name: "PING", request: RequestShape::Empty, response: ResponseShape::Empty },
    OpcodeInfo { request_code: 0x21, name: "AUTH_MECH_LIST", request: RequestShape::Empty, response: ResponseShape::Strings },
    OpcodeInfo { request_code: 0x29, name: "SIZE", request: RequestShape::Empty, response: ResponseShape::Count },
];

const ALL: [Opcode; 8] = [
    Opcode::Put,
    Opcode::Get,
    Opcode::Remove,
    Opcode::ContainsKey,
    Opcode::Clear,
    Opcode::Ping,
    Opcode::AuthMechList,
    Opcode::Size,
];

impl Opcode {
    fn info(self) -> &'static OpcodeInfo {
        &OPCODES[self as usize]
    }

    /// Every opcode, in table order
    pub fn all() -> &'static [Opcode] {
        &ALL
    }

    /// Wire byte of the request
    pub fn request_code(self) -> u8 {
        self.info().request_code
    }

    /// Wire byte of the response
    pub fn response_code(self) -> u8 {
        self.info().request_code + 1
    }

    /// Human readable name
    pub fn name(self) -> &'static str {
        self.info().name
    }

    pub fn request_shape(self) -> RequestShape {
        self.info().request
    }

    pub fn response_shape(self) -> ResponseShape {
        self.info().response
    }

    /// Look up a request wire byte
    pub fn from_request_code(code: u8) -> Result<Self> {
        ALL.iter()
            .copied()
            .find(|op| op.request_code() == code)
            .ok_or_else(|| WireError::protocol(format!("Unsupported request opcode: 0x{:02x}", code)))
    }

    /// Look up a response wire byte
    pub fn from_response_code(code: u8) -> Result<Self> {
        ALL.iter()
            .copied()
            .find(|op| op.response_code() == code)
            .ok_or_else(|| WireError::protocol(format!("Unsupported response opcode: 0x{:02x}", code)))
    }
}

/// A typed request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Store a value
    Put { key: Vec<u8>, value: Vec<u8> },

    /// Fetch a value
    Get { key: Vec<u8> },

    /// Delete a key
    Remove { key: Vec<u8> },

    /// Test for a key
    ContainsKey { key: Vec<u8> },

    /// Drop every entry of the cache
    Clear,

    /// Health check
    Ping,

    /// List the SASL mechanisms the server accepts
    AuthMechList,

    /// Count entries of the cache
    Size,
}

impl Request {
    /// Get the opcode
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::Put { .. } => Opcode::Put,
            Request::Get { .. } => Opcode::Get,
            Request::Remove { .. } => Opcode::Remove,
            Request::ContainsKey { .. } => Opcode::ContainsKey,
            Request::Clear => Opcode::Clear,
            Request::Ping => Opcode::Ping,
            Request::AuthMechList => Opcode::AuthMechList,
            Request::Size => Opcode::Size,
        }
    }

    /// Key of a keyed request
    pub fn key(&self) -> Option<&[u8]> {
        match self {
            Request::Put { key, .. }
            | Request::Get { key }
            | Request::Remove { key }
            | Request::ContainsKey { key } => Some(key),
            _ => None,
        }
    }

    /// Build a request from decoded body fields
    pub(crate) fn from_parts(opcode: Opcode, key: Option<Vec<u8>>, value: Option<Vec<u8>>) -> Result<Self> {
        let missing = || WireError::protocol(format!("{} request is missing a field", opcode.name()));
        Ok(match opcode {
            Opcode::Put => Request::Put {
                key: key.ok_or_else(missing)?,
                value: value.ok_or_else(missing)?,
            },
            Opcode::Get => Request::Get { key: key.ok_or_else(missing)? },
            Opcode::Remove => Request::Remove { key: key.ok_or_else(missing)? },
            Opcode::ContainsKey => Request::ContainsKey { key: key.ok_or_else(missing)? },
            Opcode::Clear => Request::Clear,
            Opcode::Ping => Request::Ping,
            Opcode::AuthMechList => Request::AuthMechList,
            Opcode::Size => Request::Size,
        })
    }
}
