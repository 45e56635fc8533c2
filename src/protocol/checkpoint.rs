//! Decode checkpoints
//!
//! A checkpoint is the explicit record of how far a resumable decoder got
//! through a buffer: the committed byte offset, how many fields were parsed,
//! and the partially built value. Decoders take a checkpoint by value and
//! hand back an updated one when they run out of bytes, so a retry with the
//! same buffer extended by more bytes resumes exactly where the last call
//! stopped.
//!
//! The offset only ever moves forward. A field is committed once it is fully
//! read; a field cut short by the end of the buffer is re-read from its first
//! byte on the next call, never from the middle.

use crate::error::{Result, WireError};

use super::varint;
use super::DEFAULT_MAX_FRAME_SIZE;

/// Outcome of a resumable decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded<T, C> {
    /// A complete value; `consumed` bytes of the buffer belong to it
    Parsed { value: T, consumed: usize },

    /// The buffer ended early; call again with more bytes and this checkpoint
    NeedMoreData(C),
}

impl<T, C> Decoded<T, C> {
    /// Whether a complete value was produced
    pub fn is_parsed(&self) -> bool {
        matches!(self, Decoded::Parsed { .. })
    }

    /// The parsed value and consumed byte count, if complete
    pub fn parsed(self) -> Option<(T, usize)> {
        match self {
            Decoded::Parsed { value, consumed } => Some((value, consumed)),
            Decoded::NeedMoreData(_) => None,
        }
    }
}

/// Committed position within a buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    offset: usize,
    fields_parsed: usize,
}

impl Cursor {
    /// Commit one field ending at `pos`
    pub(crate) fn advance_to(&mut self, pos: usize) {
        debug_assert!(pos >= self.offset, "checkpoint cursor moved backwards");
        self.offset = pos;
        self.fields_parsed += 1;
    }
}

/// Decode progress for a value of partial type `P`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint<P> {
    pub(crate) cursor: Cursor,
    pub(crate) limit: usize,
    pub(crate) partial: P,
}

impl<P: Default> Default for Checkpoint<P> {
    fn default() -> Self {
        Self::with_limit(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl<P: Default> Checkpoint<P> {
    /// Fresh checkpoint with the default length limit
    pub fn new() -> Self {
        Self::default()
    }

    /// Fresh checkpoint rejecting length prefixes above `limit`
    pub fn with_limit(limit: usize) -> Self {
        Self {
            cursor: Cursor::default(),
            limit,
            partial: P::default(),
        }
    }
}

impl<P> Checkpoint<P> {
    /// Bytes of the buffer already consumed by committed fields
    pub fn offset(&self) -> usize {
        self.cursor.offset
    }

    /// Number of fields committed so far
    pub fn fields_parsed(&self) -> usize {
        self.cursor.fields_parsed
    }

    /// Length limit applied to prefixes
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The partially decoded value
    pub fn partial(&self) -> &P {
        &self.partial
    }

    /// Reader positioned at the committed offset
    pub(crate) fn reader<'a>(&self, buf: &'a [u8]) -> Result<FieldReader<'a>> {
        if buf.len() < self.cursor.offset {
            return Err(WireError::protocol(format!(
                "buffer of {} bytes is shorter than checkpoint offset {}",
                buf.len(),
                self.cursor.offset
            )));
        }
        Ok(FieldReader {
            buf,
            pos: self.cursor.offset,
            limit: self.limit,
        })
    }
}

/// Fill `slot` from the reader unless an earlier call already did.
///
/// Returns `Ok(false)` when the buffer ends inside the field.
pub(crate) fn fill<T>(
    slot: &mut Option<T>,
    reader: &mut FieldReader<'_>,
    cursor: &mut Cursor,
    read: impl FnOnce(&mut FieldReader<'_>) -> Result<Option<T>>,
) -> Result<bool> {
    if slot.is_some() {
        return Ok(true);
    }
    match read(reader)? {
        Some(value) => {
            *slot = Some(value);
            cursor.advance_to(reader.pos());
            Ok(true)
        }
        None => Ok(false),
    }
}

// =============================================================================
// Field Reader
// =============================================================================

/// Reads wire fields from a borrowed buffer
///
/// Every read either consumes a whole field and returns `Some`, or leaves the
/// position untouched and returns `None`.
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn pos(&self) -> usize {
        self.pos
    }

    pub(crate) fn limit(&self) -> usize {
        self.limit
    }

    fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    pub(crate) fn u8(&mut self) -> Result<Option<u8>> {
        match self.rest().first() {
            Some(&byte) => {
                self.pos += 1;
                Ok(Some(byte))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn vint(&mut self) -> Result<Option<u32>> {
        match varint::read_vint(self.rest())? {
            Some((value, len)) => {
                self.pos += len;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub(crate) fn vlong(&mut self) -> Result<Option<u64>> {
        match varint::read_vlong(self.rest())? {
            Some((value, len)) => {
                self.pos += len;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// A `vint` length prefix, checked against the limit
    pub(crate) fn length(&mut self) -> Result<Option<usize>> {
        let rest = self.rest();
        let Some((len, prefix)) = varint::read_vint(rest)? else {
            return Ok(None);
        };
        let len = len as usize;
        if len > self.limit {
            return Err(WireError::protocol(format!(
                "length {} exceeds limit {}",
                len, self.limit
            )));
        }
        self.pos += prefix;
        Ok(Some(len))
    }

    /// A length-prefixed byte array
    pub(crate) fn bytes(&mut self) -> Result<Option<Vec<u8>>> {
        let start = self.pos;
        let Some(len) = self.length()? else {
            return Ok(None);
        };
        if self.rest().len() < len {
            self.pos = start;
            return Ok(None);
        }
        let value = self.rest()[..len].to_vec();
        self.pos += len;
        Ok(Some(value))
    }

    /// A length-prefixed UTF-8 string
    pub(crate) fn string(&mut self) -> Result<Option<String>> {
        match self.bytes()? {
            Some(raw) => String::from_utf8(raw)
                .map(Some)
                .map_err(|e| WireError::protocol(format!("invalid UTF-8 string: {}", e))),
            None => Ok(None),
        }
    }
}
