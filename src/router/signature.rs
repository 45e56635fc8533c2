//! Protocol signatures
//!
//! A signature recognises a protocol from the first bytes of a connection.
//! Matching is three-valued so the router can tell "not yet" from "never".

use crate::protocol::MAGIC;
use crate::server::http::METHODS;
use crate::server::Protocol;

/// Outcome of matching a byte prefix against a signature
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureMatch {
    /// The prefix identifies this protocol
    Yes,

    /// The prefix is consistent with this protocol but too short to decide
    Maybe,

    /// The prefix can never belong to this protocol
    No,
}

/// Leading bytes that identify a protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolSignature {
    /// The `"HR"` connection preamble
    Binary,

    /// An HTTP request line: a method followed by a space
    Http,
}

impl ProtocolSignature {
    pub fn for_protocol(protocol: Protocol) -> Self {
        match protocol {
            Protocol::Binary => ProtocolSignature::Binary,
            Protocol::Http => ProtocolSignature::Http,
        }
    }

    pub fn protocol(self) -> Protocol {
        match self {
            ProtocolSignature::Binary => Protocol::Binary,
            ProtocolSignature::Http => Protocol::Http,
        }
    }

    /// Match the first bytes of a connection
    pub fn matches(self, prefix: &[u8]) -> SignatureMatch {
        match self {
            ProtocolSignature::Binary => match_token(prefix, &MAGIC),
            ProtocolSignature::Http => METHODS
                .iter()
                .map(|method| match_method(prefix, method.as_bytes()))
                .fold(SignatureMatch::No, |best, m| match (best, m) {
                    (SignatureMatch::Yes, _) | (_, SignatureMatch::Yes) => SignatureMatch::Yes,
                    (SignatureMatch::Maybe, _) | (_, SignatureMatch::Maybe) => SignatureMatch::Maybe,
                    _ => SignatureMatch::No,
                }),
        }
    }
}

fn match_token(prefix: &[u8], token: &[u8]) -> SignatureMatch {
    if prefix.len() >= token.len() {
        if prefix.starts_with(token) {
            SignatureMatch::Yes
        } else {
            SignatureMatch::No
        }
    } else if token.starts_with(prefix) {
        SignatureMatch::Maybe
    } else {
        SignatureMatch::No
    }
}

fn match_method(prefix: &[u8], method: &[u8]) -> SignatureMatch {
    match match_token(prefix, method) {
        SignatureMatch::Yes => match prefix.get(method.len()) {
            Some(b' ') => SignatureMatch::Yes,
            Some(_) => SignatureMatch::No,
            None => SignatureMatch::Maybe,
        },
        other => other,
    }
}
