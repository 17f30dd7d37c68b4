//! Binary protocol: 24-byte big-endian header plus extras/key/value body.
//!
//! Request helpers only assemble and queue a packet; [`Client::bin_receive`]
//! flushes anything pending and reads exactly one response. The client keeps
//! a single [`Packet`] that is reset and reused for every exchange so steady
//! load does not churn allocations; no two packets are ever in flight
//! concurrently on one connection.
//!
//! Opaque tokens increment monotonically per connection and are echoed back
//! by the server. The receive path does not verify that a response's opaque
//! matches the request it is paired with: ordering on one connection is
//! trusted. Callers that interleave quiet-mode requests can correlate via
//! [`Item::opaque`] themselves.

use std::fmt;

use bytes::{BufMut, BytesMut};

use crate::error::{McError, Result};

use super::{Client, Connection, RespCode};

pub(crate) const HEADER_SIZE: usize = 24;
pub const REQUEST_MAGIC: u8 = 0x80;
pub const RESPONSE_MAGIC: u8 = 0x81;

/// Binary protocol opcodes.
pub mod opcode {
    pub const GET: u8 = 0x00;
    pub const SET: u8 = 0x01;
    pub const ADD: u8 = 0x02;
    pub const REPLACE: u8 = 0x03;
    pub const DELETE: u8 = 0x04;
    pub const INCREMENT: u8 = 0x05;
    pub const DECREMENT: u8 = 0x06;
    pub const QUIT: u8 = 0x07;
    pub const FLUSH: u8 = 0x08;
    pub const GETQ: u8 = 0x09;
    pub const NOOP: u8 = 0x0a;
    pub const VERSION: u8 = 0x0b;
    pub const GETK: u8 = 0x0c;
    pub const GETKQ: u8 = 0x0d;
    pub const APPEND: u8 = 0x0e;
    pub const PREPEND: u8 = 0x0f;
    pub const STAT: u8 = 0x10;
    pub const SETQ: u8 = 0x11;
    pub const ADDQ: u8 = 0x12;
    pub const REPLACEQ: u8 = 0x13;
    pub const DELETEQ: u8 = 0x14;
    pub const INCREMENTQ: u8 = 0x15;
    pub const DECREMENTQ: u8 = 0x16;
    pub const QUITQ: u8 = 0x17;
    pub const FLUSHQ: u8 = 0x18;
    pub const APPENDQ: u8 = 0x19;
    pub const PREPENDQ: u8 = 0x1a;
    pub const TOUCH: u8 = 0x1c;
}

/// Named conditions for the binary protocol's response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinStatus {
    ItemNotFound,
    ItemExists,
    ValueTooLarge,
    InvalidArguments,
    ItemNotStored,
    NonNumericValue,
    VbucketMismatch,
    AuthError,
    AuthContinue,
    UnknownCommand,
    OutOfMemory,
    NotSupported,
    InternalError,
    Busy,
    TemporaryFailure,
    /// Non-zero status with no entry in the table.
    Other(u16),
}

impl BinStatus {
    pub fn from_code(code: u16) -> BinStatus {
        match code {
            0x001 => BinStatus::ItemNotFound,
            0x002 => BinStatus::ItemExists,
            0x003 => BinStatus::ValueTooLarge,
            0x004 => BinStatus::InvalidArguments,
            0x005 => BinStatus::ItemNotStored,
            0x006 => BinStatus::NonNumericValue,
            0x007 => BinStatus::VbucketMismatch,
            0x008 => BinStatus::AuthError,
            0x009 => BinStatus::AuthContinue,
            0x081 => BinStatus::UnknownCommand,
            0x082 => BinStatus::OutOfMemory,
            0x083 => BinStatus::NotSupported,
            0x084 => BinStatus::InternalError,
            0x085 => BinStatus::Busy,
            0x086 => BinStatus::TemporaryFailure,
            other => BinStatus::Other(other),
        }
    }
}

impl fmt::Display for BinStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinStatus::ItemNotFound => write!(f, "item is not found"),
            BinStatus::ItemExists => write!(f, "item exists"),
            BinStatus::ValueTooLarge => write!(f, "value too large"),
            BinStatus::InvalidArguments => write!(f, "invalid arguments"),
            BinStatus::ItemNotStored => write!(f, "item is not stored"),
            BinStatus::NonNumericValue => write!(f, "incr/decr on non-numeric value"),
            BinStatus::VbucketMismatch => write!(f, "the vbucket belongs to another server"),
            BinStatus::AuthError => write!(f, "authentication error"),
            BinStatus::AuthContinue => write!(f, "authentication continue"),
            BinStatus::UnknownCommand => write!(f, "unknown command"),
            BinStatus::OutOfMemory => write!(f, "out of memory"),
            BinStatus::NotSupported => write!(f, "not supported"),
            BinStatus::InternalError => write!(f, "internal error"),
            BinStatus::Busy => write!(f, "busy"),
            BinStatus::TemporaryFailure => write!(f, "temporary failure"),
            BinStatus::Other(code) => {
                write!(f, "server response status code error: {code}")
            }
        }
    }
}

/// Fixed request/response header.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub magic: u8,
    pub opcode: u8,
    pub key_length: u16,
    pub extras_length: u8,
    pub data_type: u8,
    pub status: u16,
    pub body_length: u32,
    pub opaque: u32,
    pub cas: u64,
}

impl Header {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.magic);
        buf.put_u8(self.opcode);
        buf.put_u16(self.key_length);
        buf.put_u8(self.extras_length);
        buf.put_u8(self.data_type);
        buf.put_u16(self.status);
        buf.put_u32(self.body_length);
        buf.put_u32(self.opaque);
        buf.put_u64(self.cas);
    }

    /// Decode from exactly [`HEADER_SIZE`] bytes.
    pub fn decode(buf: &[u8; HEADER_SIZE]) -> Header {
        Header {
            magic: buf[0],
            opcode: buf[1],
            key_length: u16::from_be_bytes([buf[2], buf[3]]),
            extras_length: buf[4],
            data_type: buf[5],
            status: u16::from_be_bytes([buf[6], buf[7]]),
            body_length: u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]),
            opaque: u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]),
            cas: u64::from_be_bytes([
                buf[16], buf[17], buf[18], buf[19], buf[20], buf[21], buf[22], buf[23],
            ]),
        }
    }
}

/// One request or response: header plus extras/key/value segments.
#[derive(Debug, Default)]
pub struct Packet {
    pub header: Header,
    pub extras: Vec<u8>,
    pub key: String,
    pub value: Vec<u8>,
}

impl Packet {
    /// Back to the zero value so no state leaks between exchanges.
    pub fn reset(&mut self) {
        *self = Packet::default();
    }

    pub(crate) async fn write(&self, conn: &mut Connection) -> Result<()> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.header.body_length as usize);
        self.header.encode(&mut buf);
        buf.extend_from_slice(&self.extras);
        buf.extend_from_slice(self.key.as_bytes());
        buf.extend_from_slice(&self.value);
        conn.write_all(&buf).await
    }

    pub(crate) async fn read(&mut self, conn: &mut Connection) -> Result<()> {
        let mut hdr = [0u8; HEADER_SIZE];
        conn.read_exact(&mut hdr).await?;
        self.header = Header::decode(&hdr);
        let mut body = vec![0u8; self.header.body_length as usize];
        conn.read_exact(&mut body).await?;
        self.split_body(body)?;
        if self.header.status == 0 {
            return Ok(());
        }
        Err(McError::Status(BinStatus::from_code(self.header.status)))
    }

    /// Slice `body` into extras/key/value using the header's length fields.
    fn split_body(&mut self, body: Vec<u8>) -> Result<()> {
        let extras_len = self.header.extras_length as usize;
        let key_end = extras_len + self.header.key_length as usize;
        if body.len() < key_end {
            // Declared segment lengths overrun the body.
            return Err(McError::CorruptValue);
        }
        self.extras = body[..extras_len].to_vec();
        self.key = if self.header.key_length != 0 {
            String::from_utf8_lossy(&body[extras_len..key_end]).into_owned()
        } else {
            String::new()
        };
        self.value = if body.len() > key_end {
            body[key_end..].to_vec()
        } else {
            Vec::new()
        };
        Ok(())
    }
}

/// A binary-protocol cache entry, reused and reset across calls.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    pub expiration: u32,
    pub flags: u32,
    pub cas: u64,
    pub opaque: u32,
}

impl Item {
    pub fn reset(&mut self) {
        *self = Item::default();
    }
}

impl Client {
    /// Shared request path: key check, lazy connect, opaque bump, packet
    /// assembly, queue. Returns the opaque assigned to the request.
    async fn run_bin<F>(&mut self, key: &str, fill: F) -> Result<u32>
    where
        F: FnOnce(&mut Packet),
    {
        self.ready(key).await?;
        self.opaque = self.opaque.wrapping_add(1);
        let opaque = self.opaque;

        let Client {
            conn,
            pkt,
            pending_writes,
            ..
        } = self;
        let conn = match conn.as_mut() {
            Some(c) => c,
            None => unreachable!("ready() established the connection"),
        };
        pkt.reset();
        pkt.header.magic = REQUEST_MAGIC;
        pkt.header.opaque = opaque;
        fill(pkt);
        pkt.write(conn).await?;
        *pending_writes = true;
        Ok(opaque)
    }

    /// Queue a GETK for `key`.
    pub async fn bin_get(&mut self, key: &str) -> Result<u32> {
        let key_owned = key.to_string();
        self.run_bin(key, move |pkt| {
            pkt.header.opcode = opcode::GETK;
            pkt.header.key_length = key_owned.len() as u16;
            pkt.header.body_length = key_owned.len() as u32;
            pkt.key = key_owned;
        })
        .await
    }

    /// Queue a SET of `item` (8-byte extras: flags, expiration).
    pub async fn bin_set(&mut self, item: &Item) -> Result<u32> {
        let item = item.clone();
        let key = item.key.clone();
        self.run_bin(&key, move |pkt| {
            let mut extras = BytesMut::with_capacity(8);
            extras.put_u32(item.flags);
            extras.put_u32(item.expiration);

            pkt.header.opcode = opcode::SET;
            pkt.header.key_length = item.key.len() as u16;
            pkt.header.extras_length = 8;
            pkt.header.body_length = (item.key.len() + item.value.len() + 8) as u32;
            pkt.header.cas = item.cas;
            pkt.extras = extras.to_vec();
            pkt.key = item.key;
            pkt.value = item.value;
        })
        .await
    }

    /// Queue a TOUCH for `item.key` (4-byte extras: expiration).
    pub async fn bin_touch(&mut self, item: &Item) -> Result<u32> {
        let item = item.clone();
        let key = item.key.clone();
        self.run_bin(&key, move |pkt| {
            let mut extras = BytesMut::with_capacity(4);
            extras.put_u32(item.expiration);

            pkt.header.opcode = opcode::TOUCH;
            pkt.header.key_length = item.key.len() as u16;
            pkt.header.extras_length = 4;
            pkt.header.body_length = (item.key.len() + 4) as u32;
            pkt.header.cas = item.cas;
            pkt.extras = extras.to_vec();
            pkt.key = item.key;
        })
        .await
    }

    /// Queue a DELETE for `key`.
    pub async fn bin_delete(&mut self, key: &str) -> Result<u32> {
        let key_owned = key.to_string();
        self.run_bin(key, move |pkt| {
            pkt.header.opcode = opcode::DELETE;
            pkt.header.key_length = key_owned.len() as u16;
            pkt.header.body_length = key_owned.len() as u32;
            pkt.key = key_owned;
        })
        .await
    }

    /// Queue an INCREMENT (20-byte extras: delta, initial value, expiration).
    pub async fn bin_incr(
        &mut self,
        key: &str,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<u32> {
        self.bin_arith(opcode::INCREMENT, key, delta, initial, expiration).await
    }

    /// Queue a DECREMENT (same framing as INCREMENT).
    pub async fn bin_decr(
        &mut self,
        key: &str,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<u32> {
        self.bin_arith(opcode::DECREMENT, key, delta, initial, expiration).await
    }

    async fn bin_arith(
        &mut self,
        op: u8,
        key: &str,
        delta: u64,
        initial: u64,
        expiration: u32,
    ) -> Result<u32> {
        let key_owned = key.to_string();
        self.run_bin(key, move |pkt| {
            let mut extras = BytesMut::with_capacity(20);
            extras.put_u64(delta);
            extras.put_u64(initial);
            extras.put_u32(expiration);

            pkt.header.opcode = op;
            pkt.header.key_length = key_owned.len() as u16;
            pkt.header.extras_length = 20;
            pkt.header.body_length = (key_owned.len() + 20) as u32;
            pkt.extras = extras.to_vec();
            pkt.key = key_owned;
        })
        .await
    }

    /// Queue a NOOP (flush marker for quiet-mode batches).
    pub async fn bin_noop(&mut self) -> Result<u32> {
        self.run_bin("", |pkt| {
            pkt.header.opcode = opcode::NOOP;
        })
        .await
    }

    /// Queue a VERSION request.
    pub async fn bin_version(&mut self) -> Result<u32> {
        self.run_bin("", |pkt| {
            pkt.header.opcode = opcode::VERSION;
        })
        .await
    }

    /// Queue a QUIT.
    pub async fn bin_quit(&mut self) -> Result<u32> {
        self.run_bin("", |pkt| {
            pkt.header.opcode = opcode::QUIT;
        })
        .await
    }

    /// Queue a quiet QUIT (the server hangs up without responding).
    pub async fn bin_quitq(&mut self) -> Result<u32> {
        self.run_bin("", |pkt| {
            pkt.header.opcode = opcode::QUITQ;
        })
        .await
    }

    /// Queue a deliberately malformed packet (bad magic) to exercise server
    /// error handling.
    pub async fn bin_corrupt(&mut self) -> Result<u32> {
        self.run_bin("", |pkt| {
            pkt.header.opcode = opcode::GET;
            pkt.header.magic = 3;
        })
        .await
    }

    /// Flush queued binary requests without consuming responses.
    pub async fn bin_flush(&mut self) -> Result<()> {
        let conn = self.connected()?;
        conn.flush().await?;
        self.pending_writes = false;
        Ok(())
    }

    /// Flush pending requests if any, then read exactly one response into
    /// `item`. Do not call with nothing in the queue: it will wait forever.
    ///
    /// A non-zero status surfaces as [`McError::Status`]; semantic outcomes
    /// such as [`BinStatus::ItemNotFound`] are the caller's to classify.
    pub async fn bin_receive(&mut self, item: &mut Item) -> Result<(u8, RespCode)> {
        item.reset();
        let Client {
            conn,
            pkt,
            pending_writes,
            ..
        } = self;
        let conn = match conn.as_mut() {
            Some(c) => c,
            None => {
                return Err(McError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "no requests have been issued on this client",
                )))
            }
        };
        if *pending_writes {
            conn.flush().await?;
            *pending_writes = false;
        }

        let read_res = pkt.read(conn).await;
        item.opaque = pkt.header.opaque;
        read_res?;

        match pkt.header.opcode {
            opcode::SET
            | opcode::SETQ
            | opcode::ADD
            | opcode::ADDQ
            | opcode::REPLACE
            | opcode::REPLACEQ
            | opcode::APPEND
            | opcode::APPENDQ
            | opcode::PREPEND
            | opcode::PREPENDQ
            | opcode::TOUCH => {
                // Mutations carry a CAS and nothing else.
                item.cas = pkt.header.cas;
            }
            opcode::INCREMENT | opcode::INCREMENTQ | opcode::DECREMENT | opcode::DECREMENTQ => {
                item.cas = pkt.header.cas;
                item.value = std::mem::take(&mut pkt.value);
            }
            opcode::GET | opcode::GETQ | opcode::GETK | opcode::GETKQ => {
                if !pkt.value.is_empty() {
                    let flags = if pkt.extras.len() >= 4 {
                        u32::from_be_bytes([
                            pkt.extras[0],
                            pkt.extras[1],
                            pkt.extras[2],
                            pkt.extras[3],
                        ])
                    } else {
                        0
                    };
                    item.key = std::mem::take(&mut pkt.key);
                    item.value = std::mem::take(&mut pkt.value);
                    item.flags = flags;
                    item.cas = pkt.header.cas;
                }
            }
            opcode::VERSION => {
                item.value = std::mem::take(&mut pkt.value);
            }
            opcode::DELETE | opcode::DELETEQ | opcode::QUIT | opcode::QUITQ | opcode::NOOP
            | opcode::FLUSH | opcode::FLUSHQ => {
                // Nothing beyond the header.
            }
            _ => return Err(McError::UnknownStatus),
        }

        Ok((pkt.header.opcode, RespCode::Ok))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_every_field() {
        let hdr = Header {
            magic: RESPONSE_MAGIC,
            opcode: opcode::GETK,
            key_length: 0x1234,
            extras_length: 4,
            data_type: 0,
            status: 0x0086,
            body_length: 0xdead_beef,
            opaque: 0xcafe_f00d,
            cas: 0x0123_4567_89ab_cdef,
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);

        let mut raw = [0u8; HEADER_SIZE];
        raw.copy_from_slice(&buf);
        assert_eq!(Header::decode(&raw), hdr);
    }

    #[test]
    fn header_encodes_big_endian() {
        let hdr = Header {
            magic: REQUEST_MAGIC,
            opcode: opcode::SET,
            key_length: 0x0102,
            body_length: 0x0a0b0c0d,
            ..Default::default()
        };
        let mut buf = BytesMut::new();
        hdr.encode(&mut buf);
        assert_eq!(&buf[..4], &[0x80, 0x01, 0x01, 0x02]);
        assert_eq!(&buf[8..12], &[0x0a, 0x0b, 0x0c, 0x0d]);
    }

    #[test]
    fn split_body_slices_segments_by_header_lengths() {
        let mut pkt = Packet::default();
        pkt.header.extras_length = 4;
        pkt.header.key_length = 3;
        pkt.header.body_length = 12;

        let body = b"\x00\x00\x00\x07keyvalue!".to_vec();
        pkt.split_body(body).unwrap();
        assert_eq!(pkt.extras, b"\x00\x00\x00\x07");
        assert_eq!(pkt.key, "key");
        assert_eq!(pkt.value, b"value!");
    }

    #[test]
    fn split_body_rejects_overrunning_segments() {
        let mut pkt = Packet::default();
        pkt.header.extras_length = 8;
        pkt.header.key_length = 10;
        match pkt.split_body(vec![0u8; 4]) {
            Err(McError::CorruptValue) => {}
            other => panic!("expected CorruptValue, got {other:?}"),
        }
    }

    #[test]
    fn status_table_maps_known_codes() {
        assert_eq!(BinStatus::from_code(0x001), BinStatus::ItemNotFound);
        assert_eq!(BinStatus::from_code(0x005), BinStatus::ItemNotStored);
        assert_eq!(BinStatus::from_code(0x082), BinStatus::OutOfMemory);
        assert_eq!(BinStatus::from_code(0x086), BinStatus::TemporaryFailure);
        assert_eq!(BinStatus::from_code(0x777), BinStatus::Other(0x777));
        assert_eq!(
            BinStatus::from_code(0x777).to_string(),
            "server response status code error: 1911"
        );
    }

    #[test]
    fn packet_reset_clears_all_state() {
        let mut pkt = Packet {
            header: Header {
                opcode: opcode::SET,
                cas: 99,
                ..Default::default()
            },
            extras: vec![1, 2, 3],
            key: "stale".into(),
            value: vec![9, 9],
        };
        pkt.reset();
        assert_eq!(pkt.header, Header::default());
        assert!(pkt.extras.is_empty());
        assert!(pkt.key.is_empty());
        assert!(pkt.value.is_empty());
    }
}
