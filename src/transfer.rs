// ABOUTME: Length-prefixed frame codec for the Granite TCP protocol
// ABOUTME: Typed primitive readers/writers, outbound reset, and LOB MAC helpers

use crate::error::ProtocolError;
use crate::opcode::{Opcode, Status};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::io::Cursor;

type HmacSha256 = Hmac<Sha256>;

/// Builder for one outbound packet.
///
/// The four-byte length prefix is reserved up front and backfilled by
/// [`TransferOut::finish`], so a frame's declared length always equals its
/// actual payload size. All integers are big-endian.
#[derive(Debug)]
pub struct TransferOut {
    buf: BytesMut,
}

impl TransferOut {
    pub fn new() -> Self {
        let mut buf = BytesMut::with_capacity(crate::config::IO_BUFFER_SIZE);
        buf.put_u32(0);
        TransferOut { buf }
    }

    /// Start a request frame for `op`.
    pub fn request(op: Opcode) -> Self {
        let mut t = TransferOut::new();
        t.write_request_header(op);
        t
    }

    /// Start a response frame for `op`.
    pub fn response(op: Opcode) -> Self {
        let mut t = TransferOut::new();
        t.write_response_header(op);
        t
    }

    /// Header entry point for the request direction.
    pub fn write_request_header(&mut self, op: Opcode) {
        self.buf.put_i32(op.request_header());
    }

    /// Header entry point for the response direction.
    pub fn write_response_header(&mut self, op: Opcode) {
        self.buf.put_i32(op.response_header());
    }

    /// Response header for an opcode value that did not parse. Keeps the
    /// peer's correlation intact when rejecting garbage.
    pub fn write_raw_response_header(&mut self, raw_op: i32) {
        self.buf.put_i32((raw_op << 1) | 1);
    }

    /// Discard everything written into the current packet, including the
    /// header. Used when an error frame must replace a half-written
    /// response.
    pub fn reset(&mut self) {
        self.buf.truncate(4);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.put_u8(v as u8);
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn write_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn write_status(&mut self, status: Status) {
        self.buf.put_i32(status as i32);
    }

    /// Length-prefixed UTF-8 string; `None` travels as length -1.
    pub fn write_string(&mut self, v: Option<&str>) {
        match v {
            Some(s) => {
                self.buf.put_i32(s.len() as i32);
                self.buf.put_slice(s.as_bytes());
            }
            None => self.buf.put_i32(-1),
        }
    }

    /// Length-prefixed byte array; `None` travels as length -1.
    pub fn write_bytes(&mut self, v: Option<&[u8]>) {
        match v {
            Some(b) => {
                self.buf.put_i32(b.len() as i32);
                self.buf.put_slice(b);
            }
            None => self.buf.put_i32(-1),
        }
    }

    /// Sized raw blob, never null.
    pub fn write_buffer(&mut self, v: &[u8]) {
        self.buf.put_i32(v.len() as i32);
        self.buf.put_slice(v);
    }

    /// Raw bytes with no length prefix. The caller has already written the
    /// count in whatever form the operation requires.
    pub fn write_raw(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Payload bytes written so far (header included, prefix excluded).
    pub fn payload_len(&self) -> usize {
        self.buf.len() - 4
    }

    /// Backfill the length prefix and freeze the packet.
    pub fn finish(mut self) -> Bytes {
        let payload = (self.buf.len() - 4) as u32;
        self.buf[..4].copy_from_slice(&payload.to_be_bytes());
        self.buf.freeze()
    }
}

impl Default for TransferOut {
    fn default() -> Self {
        TransferOut::new()
    }
}

/// Reader over one reassembled packet payload.
///
/// Every accessor returns [`ProtocolError::Incomplete`] when the packet is
/// shorter than the field it claims to hold, so a truncated frame can never
/// be silently misread.
pub struct TransferIn<'a> {
    cur: Cursor<&'a [u8]>,
}

impl<'a> TransferIn<'a> {
    pub fn new(packet: &'a [u8]) -> Self {
        TransferIn {
            cur: Cursor::new(packet),
        }
    }

    pub fn remaining(&self) -> usize {
        self.cur.remaining()
    }

    pub fn read_bool(&mut self) -> Result<bool, ProtocolError> {
        if self.cur.remaining() < 1 {
            return Err(ProtocolError::Incomplete);
        }
        Ok(self.cur.get_u8() != 0)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtocolError> {
        if self.cur.remaining() < 4 {
            return Err(ProtocolError::Incomplete);
        }
        Ok(self.cur.get_i32())
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtocolError> {
        if self.cur.remaining() < 8 {
            return Err(ProtocolError::Incomplete);
        }
        Ok(self.cur.get_i64())
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtocolError> {
        if self.cur.remaining() < 1 {
            return Err(ProtocolError::Incomplete);
        }
        Ok(self.cur.get_u8())
    }

    pub fn read_status(&mut self) -> Result<Status, ProtocolError> {
        let raw = self.read_i32()?;
        Status::try_from(raw).map_err(|_| ProtocolError::InvalidStatus(raw))
    }

    pub fn read_string(&mut self) -> Result<Option<String>, ProtocolError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        let raw = self.take(len as usize)?;
        String::from_utf8(raw)
            .map(Some)
            .map_err(|source| ProtocolError::Utf8 {
                field: "string",
                source,
            })
    }

    pub fn read_bytes(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Ok(None);
        }
        Ok(Some(self.take(len as usize)?))
    }

    /// Sized raw blob; a negative length is a violation here.
    pub fn read_buffer(&mut self) -> Result<Vec<u8>, ProtocolError> {
        let len = self.read_i32()?;
        if len < 0 {
            return Err(ProtocolError::NegativeLength(len, "buffer"));
        }
        self.take(len as usize)
    }

    /// Raw bytes with no length prefix.
    pub fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        self.take(len)
    }

    /// All bytes left in the packet.
    pub fn read_rest(&mut self) -> Vec<u8> {
        let mut rest = vec![0u8; self.cur.remaining()];
        self.cur.copy_to_slice(&mut rest);
        rest
    }

    fn take(&mut self, len: usize) -> Result<Vec<u8>, ProtocolError> {
        if self.cur.remaining() < len {
            return Err(ProtocolError::Incomplete);
        }
        let mut out = vec![0u8; len];
        self.cur.copy_to_slice(&mut out);
        Ok(out)
    }
}

/// MAC a LOB reference under the per-connection key. The codec stamps this
/// onto outbound LOB values and checks it when a peer hands a reference
/// back, so a client can only read LOBs this connection was shown.
pub fn lob_mac(key: &[u8], lob_id: i64) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&lob_id.to_be_bytes());
    mac.finalize().into_bytes().into()
}

pub fn verify_lob_mac(key: &[u8], lob_id: i64, claimed: &[u8]) -> Result<(), ProtocolError> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts keys of any length");
    mac.update(&lob_id.to_be_bytes());
    mac.verify_slice(claimed)
        .map_err(|_| ProtocolError::LobMacMismatch(lob_id))
}
