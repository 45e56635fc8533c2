//! Variable-length integers
//!
//! Unsigned LEB128: 7 bits per byte, least-significant group first, high
//! bit set on every byte except the last.

use bytes::BufMut;

use crate::error::{Result, WireError};

/// Longest encoding of a u32
pub const MAX_VINT_BYTES: usize = 5;

/// Longest encoding of a u64
pub const MAX_VLONG_BYTES: usize = 10;

/// Append a u32 as a varint
pub fn put_vint<B: BufMut>(buf: &mut B, value: u32) {
    put_vlong(buf, u64::from(value));
}

/// Append a u64 as a varint
pub fn put_vlong<B: BufMut>(buf: &mut B, mut value: u64) {
    while value >= 0x80 {
        buf.put_u8((value as u8 & 0x7F) | 0x80);
        value >>= 7;
    }
    buf.put_u8(value as u8);
}

/// Read a u32 varint from the front of `buf`
///
/// Returns `Ok(None)` if `buf` ends before the last byte of the varint.
pub fn read_vint(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    match read_varint(buf, MAX_VINT_BYTES)? {
        Some((value, len)) => {
            let value = u32::try_from(value)
                .map_err(|_| WireError::protocol(format!("vint overflows u32: {}", value)))?;
            Ok(Some((value, len)))
        }
        None => Ok(None),
    }
}

/// Read a u64 varint from the front of `buf`
pub fn read_vlong(buf: &[u8]) -> Result<Option<(u64, usize)>> {
    read_varint(buf, MAX_VLONG_BYTES)
}

fn read_varint(buf: &[u8], max_bytes: usize) -> Result<Option<(u64, usize)>> {
    let mut value: u64 = 0;

    for (i, &byte) in buf.iter().enumerate() {
        if i >= max_bytes {
            break;
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }

    if buf.len() >= max_bytes {
        return Err(WireError::protocol(format!(
            "varint longer than {} bytes",
            max_bytes
        )));
    }
    Ok(None)
}
