//! Protocol codec
//!
//! Encoding and resumable decoding functions for the wire protocol.
//!
//! ## Wire Format
//!
//! ### Connection preamble
//! ```text
//! ┌──────────┬─────────────┐
//! │ "HR" (2) │ Version (1) │
//! └──────────┴─────────────┘
//! ```
//!
//! ### Frame
//! ```text
//! ┌──────────────────────────┬───────────────────────────────┐
//! │ Header (see header.rs)   │ Body (depends on the opcode)  │
//! └──────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ### Body by Opcode
//! - PUT:            key (vint len + bytes) + value (vint len + bytes)
//! - GET / REMOVE / CONTAINS_KEY: key
//! - PING / CLEAR / SIZE / AUTH_MECH_LIST: empty
//!
//! ### Response Body
//! - error status:   message (vint len + UTF-8)
//! - GET:            value when found, empty otherwise
//! - SIZE:           vlong
//! - AUTH_MECH_LIST: vint count + count strings
//! - others:         empty
//!
//! Encoding is pure and infallible. Decoding never touches bytes a checkpoint
//! has already committed; see `checkpoint.rs`.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Result, WireError};

use super::checkpoint::{fill, Checkpoint, Cursor, Decoded, FieldReader};
use super::varint::{put_vint, put_vlong};
use super::{Header, Opcode, Request, RequestShape, ResponseBody, ResponseShape, Status};

/// Protocol magic opening every binary connection
pub const MAGIC: [u8; 2] = *b"HR";

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 0x01;

/// Magic followed by the version byte
pub const PREAMBLE: [u8; 3] = [MAGIC[0], MAGIC[1], PROTOCOL_VERSION];

// =============================================================================
// Frames
// =============================================================================

/// A request header plus its typed body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    header: Header,
    request: Request,
}

impl RequestFrame {
    /// Build a frame; the header opcode always matches the request
    pub fn new(
        request: Request,
        correlation_id: u64,
        topology_id: u32,
        cache_name: impl Into<String>,
        flags: u8,
    ) -> Self {
        let header = Header::request(request.opcode(), correlation_id, topology_id, cache_name, flags);
        Self { header, request }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn into_parts(self) -> (Header, Request) {
        (self.header, self.request)
    }
}

/// A response header plus its decoded body
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseFrame {
    header: Header,
    body: ResponseBody,
}

impl ResponseFrame {
    /// Response to `request`, carrying `status` and the server's topology id
    pub fn reply(request: &Header, status: Status, topology_id: u32, body: ResponseBody) -> Self {
        Self {
            header: request.reply(status, topology_id),
            body,
        }
    }

    pub(crate) fn from_parts(header: Header, body: ResponseBody) -> Self {
        Self { header, body }
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn body(&self) -> &ResponseBody {
        &self.body
    }

    pub fn status(&self) -> Status {
        self.header.status().unwrap_or(Status::Success)
    }

    pub fn into_parts(self) -> (Header, ResponseBody) {
        (self.header, self.body)
    }
}

// =============================================================================
// Partial Values
// =============================================================================

/// Header fields decoded so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialHeader {
    opcode: Option<Opcode>,
    correlation_id: Option<u64>,
    topology_id: Option<u32>,
    cache_name: Option<String>,
    flags: Option<u8>,
    status: Option<Status>,
}

impl PartialHeader {
    pub fn opcode(&self) -> Option<Opcode> {
        self.opcode
    }

    pub fn correlation_id(&self) -> Option<u64> {
        self.correlation_id
    }
}

/// Body fields decoded so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialBody {
    key: Option<Vec<u8>>,
    value: Option<Vec<u8>>,
    count: Option<u64>,
    item_count: Option<u32>,
    items: Vec<String>,
    message: Option<String>,
}

impl PartialBody {
    /// Number of list items announced, once the count has been read
    pub fn expected_items(&self) -> Option<usize> {
        self.item_count.map(|n| n as usize)
    }

    /// List items collected so far
    pub fn items(&self) -> &[String] {
        &self.items
    }
}

/// Header and body decoded so far
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartialFrame {
    header: PartialHeader,
    body: PartialBody,
}

impl PartialFrame {
    pub fn header(&self) -> &PartialHeader {
        &self.header
    }

    pub fn body(&self) -> &PartialBody {
        &self.body
    }
}

/// Progress through a response header
pub type HeaderCheckpoint = Checkpoint<PartialHeader>;

/// Progress through a response body
pub type BodyCheckpoint = Checkpoint<PartialBody>;

/// Progress through a whole frame
pub type FrameCheckpoint = Checkpoint<PartialFrame>;

// =============================================================================
// Encoding
// =============================================================================

/// Encode a request frame to bytes
pub fn encode_request(frame: &RequestFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    put_header(&mut buf, &frame.header);

    match &frame.request {
        Request::Put { key, value } => {
            put_bytes(&mut buf, key);
            put_bytes(&mut buf, value);
        }
        Request::Get { key } | Request::Remove { key } | Request::ContainsKey { key } => {
            put_bytes(&mut buf, key);
        }
        Request::Clear | Request::Ping | Request::AuthMechList | Request::Size => {}
    }

    buf.freeze()
}

/// Encode a response frame to bytes
pub fn encode_response(frame: &ResponseFrame) -> Bytes {
    let mut buf = BytesMut::with_capacity(64);
    put_header(&mut buf, &frame.header);

    match &frame.body {
        ResponseBody::Empty | ResponseBody::Value(None) => {}
        ResponseBody::Value(Some(value)) => put_bytes(&mut buf, value),
        ResponseBody::Count(count) => put_vlong(&mut buf, *count),
        ResponseBody::Strings(items) => {
            put_vint(&mut buf, items.len() as u32);
            for item in items {
                put_bytes(&mut buf, item.as_bytes());
            }
        }
        ResponseBody::Error(message) => put_bytes(&mut buf, message.as_bytes()),
    }

    buf.freeze()
}

fn put_header(buf: &mut BytesMut, header: &Header) {
    let opcode = header.opcode();
    match header.status() {
        Some(_) => buf.put_u8(opcode.response_code()),
        None => buf.put_u8(opcode.request_code()),
    }
    put_vlong(buf, header.correlation_id());
    put_vint(buf, header.topology_id());
    put_bytes(buf, header.cache_name().as_bytes());
    buf.put_u8(header.flags());
    if let Some(status) = header.status() {
        buf.put_u8(status as u8);
    }
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    put_vint(buf, bytes.len() as u32);
    buf.put_slice(bytes);
}

// =============================================================================
// Preamble
// =============================================================================

/// Check the connection preamble at the front of `buf`
///
/// Returns the preamble length once complete, `None` while it is still a
/// valid prefix.
pub fn decode_preamble(buf: &[u8]) -> Result<Option<usize>> {
    let n = buf.len().min(MAGIC.len());
    if buf[..n] != MAGIC[..n] {
        return Err(WireError::protocol(format!(
            "Invalid magic: {:02x?}",
            &buf[..n]
        )));
    }
    if buf.len() < PREAMBLE.len() {
        return Ok(None);
    }
    if buf[MAGIC.len()] != PROTOCOL_VERSION {
        return Err(WireError::protocol(format!(
            "Unsupported protocol version: 0x{:02x}",
            buf[MAGIC.len()]
        )));
    }
    Ok(Some(PREAMBLE.len()))
}

// =============================================================================
// Decoding
// =============================================================================

/// Decode a request frame, resuming from `checkpoint`
pub fn decode_request(
    buf: &[u8],
    checkpoint: FrameCheckpoint,
) -> Result<Decoded<RequestFrame, FrameCheckpoint>> {
    let mut checkpoint = checkpoint;
    let mut reader = checkpoint.reader(buf)?;

    let complete = {
        let Checkpoint { cursor, partial, .. } = &mut checkpoint;
        header_fields(&mut partial.header, &mut reader, cursor, false)?
            && request_body_fields(
                required_opcode(&partial.header)?,
                &mut partial.body,
                &mut reader,
                cursor,
            )?
    };
    if !complete {
        return Ok(Decoded::NeedMoreData(checkpoint));
    }

    let consumed = checkpoint.offset();
    let header = finish_header(&checkpoint.partial.header)?;
    let body = &mut checkpoint.partial.body;
    let request = Request::from_parts(header.opcode(), body.key.take(), body.value.take())?;

    Ok(Decoded::Parsed {
        value: RequestFrame { header, request },
        consumed,
    })
}

/// Decode a whole response frame, resuming from `checkpoint`
pub fn decode_response(
    buf: &[u8],
    checkpoint: FrameCheckpoint,
) -> Result<Decoded<ResponseFrame, FrameCheckpoint>> {
    let mut checkpoint = checkpoint;
    let mut reader = checkpoint.reader(buf)?;

    let complete = {
        let Checkpoint { cursor, partial, .. } = &mut checkpoint;
        header_fields(&mut partial.header, &mut reader, cursor, true)?
            && response_body_fields(
                required_opcode(&partial.header)?,
                required_status(&partial.header)?,
                &mut partial.body,
                &mut reader,
                cursor,
            )?
    };
    if !complete {
        return Ok(Decoded::NeedMoreData(checkpoint));
    }

    let consumed = checkpoint.offset();
    let header = finish_header(&checkpoint.partial.header)?;
    let status = required_status(&checkpoint.partial.header)?;
    let body = finish_response_body(header.opcode(), status, &mut checkpoint.partial.body);

    Ok(Decoded::Parsed {
        value: ResponseFrame { header, body },
        consumed,
    })
}

/// Decode only a response header, resuming from `checkpoint`
pub fn decode_response_header(
    buf: &[u8],
    checkpoint: HeaderCheckpoint,
) -> Result<Decoded<Header, HeaderCheckpoint>> {
    let mut checkpoint = checkpoint;
    let mut reader = checkpoint.reader(buf)?;

    let complete = {
        let Checkpoint { cursor, partial, .. } = &mut checkpoint;
        header_fields(partial, &mut reader, cursor, true)?
    };
    if !complete {
        return Ok(Decoded::NeedMoreData(checkpoint));
    }

    Ok(Decoded::Parsed {
        value: finish_header(&checkpoint.partial)?,
        consumed: checkpoint.offset(),
    })
}

/// Decode a response body for `opcode`/`status`, resuming from `checkpoint`
///
/// `buf` starts at the first body byte.
pub fn decode_response_body(
    opcode: Opcode,
    status: Status,
    buf: &[u8],
    checkpoint: BodyCheckpoint,
) -> Result<Decoded<ResponseBody, BodyCheckpoint>> {
    let mut checkpoint = checkpoint;
    let mut reader = checkpoint.reader(buf)?;

    let complete = {
        let Checkpoint { cursor, partial, .. } = &mut checkpoint;
        response_body_fields(opcode, status, partial, &mut reader, cursor)?
    };
    if !complete {
        return Ok(Decoded::NeedMoreData(checkpoint));
    }

    let consumed = checkpoint.offset();
    Ok(Decoded::Parsed {
        value: finish_response_body(opcode, status, &mut checkpoint.partial),
        consumed,
    })
}

// -----------------------------------------------------------------------------
// Field steps
// -----------------------------------------------------------------------------

fn header_fields(
    h: &mut PartialHeader,
    r: &mut FieldReader<'_>,
    c: &mut Cursor,
    response: bool,
) -> Result<bool> {
    Ok(fill(&mut h.opcode, r, c, |r| read_opcode(r, response))?
        && fill(&mut h.correlation_id, r, c, |r| r.vlong())?
        && fill(&mut h.topology_id, r, c, |r| r.vint())?
        && fill(&mut h.cache_name, r, c, |r| r.string())?
        && fill(&mut h.flags, r, c, |r| r.u8())?
        && (!response || fill(&mut h.status, r, c, read_status)?))
}

fn request_body_fields(
    opcode: Opcode,
    b: &mut PartialBody,
    r: &mut FieldReader<'_>,
    c: &mut Cursor,
) -> Result<bool> {
    Ok(match opcode.request_shape() {
        RequestShape::Empty => true,
        RequestShape::Key => fill(&mut b.key, r, c, |r| r.bytes())?,
        RequestShape::KeyValue => {
            fill(&mut b.key, r, c, |r| r.bytes())? && fill(&mut b.value, r, c, |r| r.bytes())?
        }
    })
}

fn response_body_fields(
    opcode: Opcode,
    status: Status,
    b: &mut PartialBody,
    r: &mut FieldReader<'_>,
    c: &mut Cursor,
) -> Result<bool> {
    if status.is_error() {
        return fill(&mut b.message, r, c, |r| r.string());
    }

    match opcode.response_shape() {
        ResponseShape::Empty => Ok(true),
        ResponseShape::Value if status == Status::KeyDoesNotExist => Ok(true),
        ResponseShape::Value => fill(&mut b.value, r, c, |r| r.bytes()),
        ResponseShape::Count => fill(&mut b.count, r, c, |r| r.vlong()),
        ResponseShape::Strings => {
            if !fill(&mut b.item_count, r, c, |r| r.vint())? {
                return Ok(false);
            }
            let expected = b.item_count.map(|n| n as usize).unwrap_or(0);
            if expected > r.limit() {
                return Err(WireError::protocol(format!(
                    "list of {} items exceeds limit {}",
                    expected,
                    r.limit()
                )));
            }
            if b.items.is_empty() {
                b.items.reserve(expected.min(64));
            }
            while b.items.len() < expected {
                match r.string()? {
                    Some(item) => {
                        b.items.push(item);
                        c.advance_to(r.pos());
                    }
                    None => return Ok(false),
                }
            }
            Ok(true)
        }
    }
}

fn finish_response_body(opcode: Opcode, status: Status, b: &mut PartialBody) -> ResponseBody {
    if status.is_error() {
        return ResponseBody::Error(b.message.take().unwrap_or_default());
    }
    match opcode.response_shape() {
        ResponseShape::Empty => ResponseBody::Empty,
        ResponseShape::Value => ResponseBody::Value(b.value.take()),
        ResponseShape::Count => ResponseBody::Count(b.count.unwrap_or(0)),
        ResponseShape::Strings => ResponseBody::Strings(std::mem::take(&mut b.items)),
    }
}

fn read_opcode(r: &mut FieldReader<'_>, response: bool) -> Result<Option<Opcode>> {
    match r.u8()? {
        Some(code) if response => Opcode::from_response_code(code).map(Some),
        Some(code) => Opcode::from_request_code(code).map(Some),
        None => Ok(None),
    }
}

fn read_status(r: &mut FieldReader<'_>) -> Result<Option<Status>> {
    match r.u8()? {
        Some(byte) => Status::from_u8(byte).map(Some),
        None => Ok(None),
    }
}

fn required_opcode(h: &PartialHeader) -> Result<Opcode> {
    h.opcode
        .ok_or_else(|| WireError::protocol("header decoded without an opcode"))
}

fn required_status(h: &PartialHeader) -> Result<Status> {
    h.status
        .ok_or_else(|| WireError::protocol("response header decoded without a status"))
}

fn finish_header(h: &PartialHeader) -> Result<Header> {
    match (h.opcode, h.correlation_id, h.topology_id, &h.cache_name, h.flags) {
        (Some(opcode), Some(correlation_id), Some(topology_id), Some(cache_name), Some(flags)) => {
            Ok(match h.status {
                Some(status) => Header::response(
                    opcode,
                    correlation_id,
                    topology_id,
                    cache_name.clone(),
                    flags,
                    status,
                ),
                None => Header::request(opcode, correlation_id, topology_id, cache_name.clone(), flags),
            })
        }
        _ => Err(WireError::protocol("incomplete header")),
    }
}
