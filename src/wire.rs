//! The deterministic binary wire protocol (§6): a length-prefixed frame per
//! message, `{u32 length}{u8 type}{payload}`, with a fixed-order,
//! big-endian, canonical payload encoding per message type. Hand-rolled
//! rather than built on a generic serializer, matching the teacher's
//! preference for explicit byte-level control over its own data model
//! (`HLC::to_bytes`/`from_bytes`-style codecs) instead of pulling in a crate
//! like `bytes` purely for framing.

use anyhow::{bail, Context};
use uuid::Uuid;

use crate::hlc::Hlc;
use crate::store::{EntityKey, Record};

pub const PROTOCOL_VERSION: u32 = 1;

pub const TYPE_HELLO: u8 = 0x01;
pub const TYPE_HELLO_ACK: u8 = 0x02;
pub const TYPE_TIME_QUERY: u8 = 0x03;
pub const TYPE_TIME_REPLY: u8 = 0x04;
pub const TYPE_CHUNKS: u8 = 0x10;
pub const TYPE_DRILL: u8 = 0x11;
pub const TYPE_ROWS: u8 = 0x12;
pub const TYPE_FETCH: u8 = 0x13;
pub const TYPE_PAYLOAD: u8 = 0x14;
pub const TYPE_COMMIT_VOTE: u8 = 0x20;
pub const TYPE_COMMIT_ACK: u8 = 0x21;
pub const TYPE_ERROR: u8 = 0xFE;

/// `(hlc_lo, hlc_hi, count, hash)` — a chunk's wire identity and summary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkDescriptor {
    pub lo: Hlc,
    pub hi: Hlc,
    pub count: u32,
    pub hash: [u8; 32],
}

/// A row's identity and HLCs, without its payload — what `ROWS` carries so
/// the receiver can classify Only-on-I/Only-on-R/Conflicting before paying
/// for a `FETCH`/`PAYLOAD` round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowDescriptor {
    pub entity_key: EntityKey,
    pub created_hlc: Hlc,
    pub modified_hlc: Hlc,
    pub payload_hash: [u8; 32],
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Hello {
        node_id: Uuid,
        protocol_version: u32,
        table: String,
        last_sync_time: Hlc,
        session_id: Uuid,
    },
    HelloAck {
        node_id: Uuid,
        last_sync_time: Hlc,
    },
    TimeQuery,
    TimeReply {
        t_master_ms: i64,
    },
    Chunks {
        chunks: Vec<ChunkDescriptor>,
    },
    Drill {
        lo: Hlc,
        hi: Hlc,
    },
    Rows {
        lo: Hlc,
        hi: Hlc,
        rows: Vec<RowDescriptor>,
    },
    Fetch {
        entity_keys: Vec<EntityKey>,
    },
    Payload {
        records: Vec<Record>,
    },
    CommitVote {
        ok: bool,
        reason: String,
    },
    CommitAck,
    Error {
        kind: String,
        detail: String,
    },
}

impl Message {
    pub fn type_code(&self) -> u8 {
        match self {
            Message::Hello { .. } => TYPE_HELLO,
            Message::HelloAck { .. } => TYPE_HELLO_ACK,
            Message::TimeQuery => TYPE_TIME_QUERY,
            Message::TimeReply { .. } => TYPE_TIME_REPLY,
            Message::Chunks { .. } => TYPE_CHUNKS,
            Message::Drill { .. } => TYPE_DRILL,
            Message::Rows { .. } => TYPE_ROWS,
            Message::Fetch { .. } => TYPE_FETCH,
            Message::Payload { .. } => TYPE_PAYLOAD,
            Message::CommitVote { .. } => TYPE_COMMIT_VOTE,
            Message::CommitAck => TYPE_COMMIT_ACK,
            Message::Error { .. } => TYPE_ERROR,
        }
    }
}

fn put_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

fn put_bytes_varlen(buf: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

fn put_str_varlen(buf: &mut Vec<u8>, s: &str) {
    put_bytes_varlen(buf, s.as_bytes());
}

fn put_hlc(buf: &mut Vec<u8>, hlc: &Hlc) {
    buf.extend_from_slice(&hlc.to_bytes());
}

/// Cursor over an immutable byte slice; every `take_*` call advances the
/// position and errors with `ProtocolViolation`-shaped context on underrun
/// rather than panicking on malformed input from the network.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            bail!(
                "wire payload underrun: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            );
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_u8(&mut self) -> anyhow::Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u32(&mut self) -> anyhow::Result<u32> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn take_i64(&mut self) -> anyhow::Result<i64> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn take_varlen(&mut self) -> anyhow::Result<Vec<u8>> {
        let len = self.take_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn take_string(&mut self) -> anyhow::Result<String> {
        String::from_utf8(self.take_varlen()?).context("non-UTF8 string in wire payload")
    }

    fn take_hlc(&mut self) -> anyhow::Result<Hlc> {
        Hlc::from_bytes(self.take(28)?)
    }

    fn take_uuid(&mut self) -> anyhow::Result<Uuid> {
        Uuid::from_slice(self.take(16)?).context("invalid uuid bytes")
    }

    fn take_hash32(&mut self) -> anyhow::Result<[u8; 32]> {
        Ok(self.take(32)?.try_into().unwrap())
    }

    fn finish(&self) -> anyhow::Result<()> {
        if self.pos != self.buf.len() {
            bail!(
                "trailing bytes in wire payload: consumed {} of {}",
                self.pos,
                self.buf.len()
            );
        }
        Ok(())
    }
}

fn encode_payload(msg: &Message) -> Vec<u8> {
    let mut buf = Vec::new();
    match msg {
        Message::Hello {
            node_id,
            protocol_version,
            table,
            last_sync_time,
            session_id,
        } => {
            buf.extend_from_slice(node_id.as_bytes());
            put_u32(&mut buf, *protocol_version);
            put_str_varlen(&mut buf, table);
            put_hlc(&mut buf, last_sync_time);
            buf.extend_from_slice(session_id.as_bytes());
        }
        Message::HelloAck { node_id, last_sync_time } => {
            buf.extend_from_slice(node_id.as_bytes());
            put_hlc(&mut buf, last_sync_time);
        }
        Message::TimeQuery => {}
        Message::TimeReply { t_master_ms } => {
            buf.extend_from_slice(&t_master_ms.to_be_bytes());
        }
        Message::Chunks { chunks } => {
            put_u32(&mut buf, chunks.len() as u32);
            for c in chunks {
                put_hlc(&mut buf, &c.lo);
                put_hlc(&mut buf, &c.hi);
                put_u32(&mut buf, c.count);
                buf.extend_from_slice(&c.hash);
            }
        }
        Message::Drill { lo, hi } => {
            put_hlc(&mut buf, lo);
            put_hlc(&mut buf, hi);
        }
        Message::Rows { lo, hi, rows } => {
            put_hlc(&mut buf, lo);
            put_hlc(&mut buf, hi);
            put_u32(&mut buf, rows.len() as u32);
            for r in rows {
                put_bytes_varlen(&mut buf, &r.entity_key);
                put_hlc(&mut buf, &r.created_hlc);
                put_hlc(&mut buf, &r.modified_hlc);
                buf.extend_from_slice(&r.payload_hash);
            }
        }
        Message::Fetch { entity_keys } => {
            put_u32(&mut buf, entity_keys.len() as u32);
            for k in entity_keys {
                put_bytes_varlen(&mut buf, k);
            }
        }
        Message::Payload { records } => {
            put_u32(&mut buf, records.len() as u32);
            for r in records {
                put_bytes_varlen(&mut buf, &r.entity_key);
                put_hlc(&mut buf, &r.created_hlc);
                put_hlc(&mut buf, &r.modified_hlc);
                buf.extend_from_slice(&r.payload_hash);
                put_bytes_varlen(&mut buf, &r.payload);
            }
        }
        Message::CommitVote { ok, reason } => {
            buf.push(if *ok { 1 } else { 0 });
            put_str_varlen(&mut buf, reason);
        }
        Message::CommitAck => {}
        Message::Error { kind, detail } => {
            put_str_varlen(&mut buf, kind);
            put_str_varlen(&mut buf, detail);
        }
    }
    buf
}

fn decode_payload(type_code: u8, payload: &[u8]) -> anyhow::Result<Message> {
    let mut r = Reader::new(payload);
    let msg = match type_code {
        TYPE_HELLO => {
            let node_id = r.take_uuid()?;
            let protocol_version = r.take_u32()?;
            let table = r.take_string()?;
            let last_sync_time = r.take_hlc()?;
            let session_id = r.take_uuid()?;
            Message::Hello {
                node_id,
                protocol_version,
                table,
                last_sync_time,
                session_id,
            }
        }
        TYPE_HELLO_ACK => Message::HelloAck {
            node_id: r.take_uuid()?,
            last_sync_time: r.take_hlc()?,
        },
        TYPE_TIME_QUERY => Message::TimeQuery,
        TYPE_TIME_REPLY => Message::TimeReply {
            t_master_ms: r.take_i64()?,
        },
        TYPE_CHUNKS => {
            let count = r.take_u32()?;
            let mut chunks = Vec::with_capacity(count as usize);
            for _ in 0..count {
                chunks.push(ChunkDescriptor {
                    lo: r.take_hlc()?,
                    hi: r.take_hlc()?,
                    count: r.take_u32()?,
                    hash: r.take_hash32()?,
                });
            }
            Message::Chunks { chunks }
        }
        TYPE_DRILL => Message::Drill {
            lo: r.take_hlc()?,
            hi: r.take_hlc()?,
        },
        TYPE_ROWS => {
            let lo = r.take_hlc()?;
            let hi = r.take_hlc()?;
            let count = r.take_u32()?;
            let mut rows = Vec::with_capacity(count as usize);
            for _ in 0..count {
                rows.push(RowDescriptor {
                    entity_key: r.take_varlen()?,
                    created_hlc: r.take_hlc()?,
                    modified_hlc: r.take_hlc()?,
                    payload_hash: r.take_hash32()?,
                });
            }
            Message::Rows { lo, hi, rows }
        }
        TYPE_FETCH => {
            let count = r.take_u32()?;
            let mut entity_keys = Vec::with_capacity(count as usize);
            for _ in 0..count {
                entity_keys.push(r.take_varlen()?);
            }
            Message::Fetch { entity_keys }
        }
        TYPE_PAYLOAD => {
            let count = r.take_u32()?;
            let mut records = Vec::with_capacity(count as usize);
            for _ in 0..count {
                records.push(Record {
                    entity_key: r.take_varlen()?,
                    created_hlc: r.take_hlc()?,
                    modified_hlc: r.take_hlc()?,
                    payload_hash: r.take_hash32()?,
                    payload: r.take_varlen()?,
                });
            }
            Message::Payload { records }
        }
        TYPE_COMMIT_VOTE => Message::CommitVote {
            ok: r.take_u8()? != 0,
            reason: r.take_string()?,
        },
        TYPE_COMMIT_ACK => Message::CommitAck,
        TYPE_ERROR => Message::Error {
            kind: r.take_string()?,
            detail: r.take_string()?,
        },
        other => bail!("unknown wire message type 0x{:02x}", other),
    };
    r.finish()?;
    Ok(msg)
}

/// Encodes `msg` into a full frame: `{u32 length}{u8 type}{payload}`, where
/// `length` counts the type byte plus the payload.
pub fn encode_message(msg: &Message) -> Vec<u8> {
    let payload = encode_payload(msg);
    let mut frame = Vec::with_capacity(5 + payload.len());
    put_u32(&mut frame, (payload.len() + 1) as u32);
    frame.push(msg.type_code());
    frame.extend_from_slice(&payload);
    frame
}

/// Attempts to decode one frame from the start of `buf`. Returns `Ok(None)`
/// if `buf` doesn't yet contain a complete frame (the caller should read more
/// bytes and retry), or `Ok(Some((message, frame_len)))` on success, where
/// `frame_len` is the number of bytes the frame occupied including its
/// length prefix.
pub fn try_decode_message(buf: &[u8]) -> anyhow::Result<Option<(Message, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let len = u32::from_be_bytes(buf[0..4].try_into().unwrap()) as usize;
    if buf.len() < 4 + len {
        return Ok(None);
    }
    if len == 0 {
        bail!("wire frame length must include at least the type byte");
    }
    let type_code = buf[4];
    let payload = &buf[5..4 + len];
    let msg = decode_payload(type_code, payload)?;
    Ok(Some((msg, 4 + len)))
}
