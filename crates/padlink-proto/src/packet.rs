use bytes::{BufMut, BytesMut};

use crate::{error::ProtoError, msg_id::MsgId};

/// A single protocol packet: an octet buffer with ordered typed append and
/// sequential typed reads.
///
/// Writers append big-endian fields; readers consume the buffer from the
/// front. String bytes are appended raw; their length always travels as a
/// separate explicit field. Reading past the end is a protocol error, not a
/// panic.
#[derive(Debug, Clone, Default)]
pub struct Packet {
    buf: BytesMut,
    pos: usize,
}

impl Packet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a packet with its leading message-id octet.
    pub fn for_msg(id: MsgId) -> Self {
        let mut p = Self::new();
        p.put_u8(id as u8);
        p
    }

    /// Wrap an inbound payload for reading.
    pub fn from_payload(payload: impl AsRef<[u8]>) -> Self {
        Self {
            buf: BytesMut::from(payload.as_ref()),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Octets left to read.
    pub fn bytes_remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// The whole payload, independent of the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    /// Append raw string bytes. The length is not written; send it as an
    /// explicit field first.
    pub fn put_str(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    fn take(&mut self, n: usize) -> Result<&[u8], ProtoError> {
        let remaining = self.bytes_remaining();
        if remaining < n {
            return Err(ProtoError::Underflow {
                needed: n - remaining,
                remaining,
            });
        }
        let start = self.pos;
        self.pos += n;
        Ok(&self.buf[start..self.pos])
    }

    pub fn read_u8(&mut self) -> Result<u8, ProtoError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, ProtoError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ProtoError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, ProtoError> {
        let b = self.take(8)?;
        Ok(u64::from_be_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn read_i8(&mut self) -> Result<i8, ProtoError> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16, ProtoError> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32, ProtoError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64, ProtoError> {
        Ok(self.read_u64()? as i64)
    }

    /// Read `len` raw octets as text. Invalid UTF-8 is replaced, not fatal;
    /// peer names and chat come from humans, not from us.
    pub fn read_string(&mut self, len: usize) -> Result<String, ProtoError> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }
}
