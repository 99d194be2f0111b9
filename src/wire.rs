//! Wire Framing
//!
//! Length-prefixed frames exchanged with database servers. Every frame
//! starts with a 16 byte little-endian header
//! `(length, request_id, response_to, op_code)`; document payloads are
//! opaque blobs carried with a `u32` length prefix.

use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::Decoder;

use crate::error::{Error, Result};

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Largest frame accepted in either direction
pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

pub const OP_REPLY: u32 = 1;
pub const OP_UPDATE: u32 = 2001;
pub const OP_INSERT: u32 = 2002;
pub const OP_QUERY: u32 = 2004;
pub const OP_GET_MORE: u32 = 2005;
pub const OP_DELETE: u32 = 2006;
pub const OP_KILL_CURSORS: u32 = 2007;

/// Query may be served by a secondary
pub const QUERY_SLAVE_OK: u32 = 1 << 2;

/// Reply flag: the cursor named by a get-more no longer exists
pub const REPLY_CURSOR_NOT_FOUND: u32 = 1;
/// Reply flag: the query failed and the first document describes why
pub const REPLY_QUERY_FAILURE: u32 = 1 << 1;

/// Frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    /// Total frame length, header included
    pub length: u32,
    pub request_id: u32,
    pub response_to: u32,
    pub op_code: u32,
}

impl MsgHeader {
    /// Serialize header to bytes
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut bytes = [0u8; HEADER_SIZE];
        LittleEndian::write_u32(&mut bytes[0..4], self.length);
        LittleEndian::write_u32(&mut bytes[4..8], self.request_id);
        LittleEndian::write_u32(&mut bytes[8..12], self.response_to);
        LittleEndian::write_u32(&mut bytes[12..16], self.op_code);
        bytes
    }

    /// Deserialize header from the first [`HEADER_SIZE`] bytes
    pub fn from_bytes(bytes: &[u8]) -> Self {
        Self {
            length: LittleEndian::read_u32(&bytes[0..4]),
            request_id: LittleEndian::read_u32(&bytes[4..8]),
            response_to: LittleEndian::read_u32(&bytes[8..12]),
            op_code: LittleEndian::read_u32(&bytes[12..16]),
        }
    }
}

/// Query request body
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOp {
    /// Full collection name (`db.collection`)
    pub collection: String,
    pub flags: u32,
    pub skip: i32,
    pub limit: i32,
    pub query: Bytes,
    pub selector: Option<Bytes>,
}

/// Operation sent to a server
#[derive(Debug, Clone, PartialEq)]
pub enum Op {
    Query(QueryOp),
    GetMore {
        collection: String,
        limit: i32,
        cursor_id: i64,
    },
    Insert {
        collection: String,
        flags: u32,
        documents: Vec<Bytes>,
    },
    Update {
        collection: String,
        flags: u32,
        selector: Bytes,
        update: Bytes,
    },
    Delete {
        collection: String,
        flags: u32,
        selector: Bytes,
    },
    KillCursors {
        cursor_ids: Vec<i64>,
    },
}

impl Op {
    /// Wire op code
    pub fn op_code(&self) -> u32 {
        match self {
            Op::Query(_) => OP_QUERY,
            Op::GetMore { .. } => OP_GET_MORE,
            Op::Insert { .. } => OP_INSERT,
            Op::Update { .. } => OP_UPDATE,
            Op::Delete { .. } => OP_DELETE,
            Op::KillCursors { .. } => OP_KILL_CURSORS,
        }
    }

    /// Whether the server answers this operation with a reply frame
    pub fn expects_reply(&self) -> bool {
        matches!(self, Op::Query(_) | Op::GetMore { .. })
    }

    /// Whether this operation mutates data
    pub fn is_write(&self) -> bool {
        matches!(self, Op::Insert { .. } | Op::Update { .. } | Op::Delete { .. })
    }

    /// Get the operation name (for logging)
    pub fn type_name(&self) -> &'static str {
        match self {
            Op::Query(_) => "Query",
            Op::GetMore { .. } => "GetMore",
            Op::Insert { .. } => "Insert",
            Op::Update { .. } => "Update",
            Op::Delete { .. } => "Delete",
            Op::KillCursors { .. } => "KillCursors",
        }
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        match self {
            Op::Query(q) => {
                buf.put_u32_le(q.flags);
                put_cstring(buf, &q.collection)?;
                buf.put_i32_le(q.skip);
                buf.put_i32_le(q.limit);
                put_blob(buf, &q.query)?;
                if let Some(selector) = &q.selector {
                    put_blob(buf, selector)?;
                }
            }
            Op::GetMore { collection, limit, cursor_id } => {
                buf.put_i32_le(0);
                put_cstring(buf, collection)?;
                buf.put_i32_le(*limit);
                buf.put_i64_le(*cursor_id);
            }
            Op::Insert { collection, flags, documents } => {
                buf.put_u32_le(*flags);
                put_cstring(buf, collection)?;
                for doc in documents {
                    put_blob(buf, doc)?;
                }
            }
            Op::Update { collection, flags, selector, update } => {
                buf.put_i32_le(0);
                put_cstring(buf, collection)?;
                buf.put_u32_le(*flags);
                put_blob(buf, selector)?;
                put_blob(buf, update)?;
            }
            Op::Delete { collection, flags, selector } => {
                buf.put_i32_le(0);
                put_cstring(buf, collection)?;
                buf.put_u32_le(*flags);
                put_blob(buf, selector)?;
            }
            Op::KillCursors { cursor_ids } => {
                buf.put_i32_le(0);
                buf.put_i32_le(cursor_ids.len() as i32);
                for id in cursor_ids {
                    buf.put_i64_le(*id);
                }
            }
        }
        Ok(())
    }

    fn decode_body(op_code: u32, body: &mut Bytes) -> Result<Self> {
        let op = match op_code {
            OP_QUERY => {
                let flags = get_u32(body)?;
                let collection = get_cstring(body)?;
                let skip = get_u32(body)? as i32;
                let limit = get_u32(body)? as i32;
                let query = get_blob(body)?;
                let selector = if body.has_remaining() {
                    Some(get_blob(body)?)
                } else {
                    None
                };
                Op::Query(QueryOp { collection, flags, skip, limit, query, selector })
            }
            OP_GET_MORE => {
                get_u32(body)?;
                let collection = get_cstring(body)?;
                let limit = get_u32(body)? as i32;
                let cursor_id = get_i64(body)?;
                Op::GetMore { collection, limit, cursor_id }
            }
            OP_INSERT => {
                let flags = get_u32(body)?;
                let collection = get_cstring(body)?;
                let mut documents = Vec::new();
                while body.has_remaining() {
                    documents.push(get_blob(body)?);
                }
                Op::Insert { collection, flags, documents }
            }
            OP_UPDATE => {
                get_u32(body)?;
                let collection = get_cstring(body)?;
                let flags = get_u32(body)?;
                let selector = get_blob(body)?;
                let update = get_blob(body)?;
                Op::Update { collection, flags, selector, update }
            }
            OP_DELETE => {
                get_u32(body)?;
                let collection = get_cstring(body)?;
                let flags = get_u32(body)?;
                let selector = get_blob(body)?;
                Op::Delete { collection, flags, selector }
            }
            OP_KILL_CURSORS => {
                get_u32(body)?;
                let count = get_u32(body)? as usize;
                let mut cursor_ids = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    cursor_ids.push(get_i64(body)?);
                }
                Op::KillCursors { cursor_ids }
            }
            other => return Err(Error::Protocol(format!("unknown op code {}", other))),
        };
        if body.has_remaining() {
            return Err(Error::Protocol(format!(
                "{} trailing bytes after {}",
                body.remaining(),
                op.type_name()
            )));
        }
        Ok(op)
    }
}

/// Reply received from a server
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Reply {
    /// Request id this reply answers
    pub response_to: u32,
    pub flags: u32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub docs: Vec<Bytes>,
}

impl Reply {
    /// Build a reply answering `response_to` with the given documents
    pub fn new(response_to: u32, docs: Vec<Bytes>) -> Self {
        Self {
            response_to,
            docs,
            ..Default::default()
        }
    }

    pub fn is_query_failure(&self) -> bool {
        self.flags & REPLY_QUERY_FAILURE != 0
    }

    pub fn is_cursor_not_found(&self) -> bool {
        self.flags & REPLY_CURSOR_NOT_FOUND != 0
    }
}

/// Append one operation frame to `buf`
pub fn encode_op(buf: &mut BytesMut, request_id: u32, op: &Op) -> Result<()> {
    encode_frame(buf, request_id, 0, op.op_code(), |body| op.encode_body(body))
}

/// Append one reply frame to `buf`
pub fn encode_reply(buf: &mut BytesMut, request_id: u32, reply: &Reply) -> Result<()> {
    encode_frame(buf, request_id, reply.response_to, OP_REPLY, |body| {
        body.put_u32_le(reply.flags);
        body.put_i64_le(reply.cursor_id);
        body.put_i32_le(reply.starting_from);
        body.put_i32_le(reply.docs.len() as i32);
        for doc in &reply.docs {
            put_blob(body, doc)?;
        }
        Ok(())
    })
}

fn encode_frame<F>(buf: &mut BytesMut, request_id: u32, response_to: u32, op_code: u32, body: F) -> Result<()>
where
    F: FnOnce(&mut BytesMut) -> Result<()>,
{
    let start = buf.len();
    buf.put_bytes(0, HEADER_SIZE);
    if let Err(e) = body(buf) {
        buf.truncate(start);
        return Err(e);
    }
    let length = buf.len() - start;
    if length > MAX_MESSAGE_SIZE {
        buf.truncate(start);
        return Err(Error::Protocol(format!(
            "frame of {} bytes exceeds maximum of {}",
            length, MAX_MESSAGE_SIZE
        )));
    }
    let header = MsgHeader {
        length: length as u32,
        request_id,
        response_to,
        op_code,
    };
    buf[start..start + HEADER_SIZE].copy_from_slice(&header.to_bytes());
    Ok(())
}

/// Split a complete frame off `src`, if one is buffered
fn split_frame(src: &mut BytesMut) -> Result<Option<(MsgHeader, Bytes)>> {
    if src.len() < HEADER_SIZE {
        src.reserve(HEADER_SIZE - src.len());
        return Ok(None);
    }
    let header = MsgHeader::from_bytes(&src[..HEADER_SIZE]);
    let length = header.length as usize;
    if !(HEADER_SIZE..=MAX_MESSAGE_SIZE).contains(&length) {
        return Err(Error::Protocol(format!("invalid frame length {}", length)));
    }
    if src.len() < length {
        src.reserve(length - src.len());
        return Ok(None);
    }
    let mut frame = src.split_to(length).freeze();
    frame.advance(HEADER_SIZE);
    Ok(Some((header, frame)))
}

/// Client-side decoder for reply frames
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplyCodec;

impl Decoder for ReplyCodec {
    type Item = Reply;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Reply>> {
        let Some((header, mut body)) = split_frame(src)? else {
            return Ok(None);
        };
        if header.op_code != OP_REPLY {
            return Err(Error::Protocol(format!(
                "expected reply frame, got op code {}",
                header.op_code
            )));
        }
        let flags = get_u32(&mut body)?;
        let cursor_id = get_i64(&mut body)?;
        let starting_from = get_u32(&mut body)? as i32;
        let count = get_u32(&mut body)? as i32;
        if count < 0 {
            return Err(Error::Protocol(format!("negative document count {}", count)));
        }
        let mut docs = Vec::with_capacity((count as usize).min(1024));
        for _ in 0..count {
            docs.push(get_blob(&mut body)?);
        }
        if body.has_remaining() {
            return Err(Error::Protocol(format!(
                "reply declares {} documents but carries {} extra bytes",
                count,
                body.remaining()
            )));
        }
        Ok(Some(Reply {
            response_to: header.response_to,
            flags,
            cursor_id,
            starting_from,
            docs,
        }))
    }
}

/// Server-side decoder for operation frames
#[derive(Debug, Default, Clone, Copy)]
pub struct RequestCodec;

impl Decoder for RequestCodec {
    type Item = (MsgHeader, Op);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<(MsgHeader, Op)>> {
        let Some((header, mut body)) = split_frame(src)? else {
            return Ok(None);
        };
        let op = Op::decode_body(header.op_code, &mut body)?;
        Ok(Some((header, op)))
    }
}

fn put_cstring(buf: &mut BytesMut, s: &str) -> Result<()> {
    if s.as_bytes().contains(&0) {
        return Err(Error::Protocol(format!("collection name {:?} contains a nul byte", s)));
    }
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn put_blob(buf: &mut BytesMut, data: &[u8]) -> Result<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!("document of {} bytes is too large", data.len())));
    }
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
    Ok(())
}

fn need(body: &Bytes, n: usize) -> Result<()> {
    if body.remaining() < n {
        return Err(Error::Protocol(format!(
            "truncated frame: needed {} more bytes, {} left",
            n,
            body.remaining()
        )));
    }
    Ok(())
}

fn get_u32(body: &mut Bytes) -> Result<u32> {
    need(body, 4)?;
    Ok(body.get_u32_le())
}

fn get_i64(body: &mut Bytes) -> Result<i64> {
    need(body, 8)?;
    Ok(body.get_i64_le())
}

fn get_blob(body: &mut Bytes) -> Result<Bytes> {
    let len = get_u32(body)? as usize;
    need(body, len)?;
    Ok(body.split_to(len))
}

fn get_cstring(body: &mut Bytes) -> Result<String> {
    let end = body
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| Error::Protocol("unterminated collection name".into()))?;
    let raw = body.split_to(end);
    body.advance(1);
    String::from_utf8(raw.to_vec())
        .map_err(|_| Error::Protocol("collection name is not valid UTF-8".into()))
}
