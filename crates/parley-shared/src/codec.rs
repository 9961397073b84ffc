//! Length-prefixed binary codec shared by every persisted and wire record.
//!
//! Layout rules:
//! - integers are little-endian (`i32`, `i64`, `u64`)
//! - booleans are a single `0x00` / `0x01` byte
//! - byte sequences and strings carry a 4-byte signed length prefix followed
//!   by the raw bytes; a zero length encodes "absent" for optional fields
//!
//! There is no schema version. New fields may only be appended at the end of
//! a record, so readers accept trailing bytes but never a short read.

use bytes::{Buf, BufMut, BytesMut};

use crate::error::CodecError;

/// Append-only encoder.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: BytesMut,
}

impl WireWriter {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::new(),
        }
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buf.put_i32_le(value);
    }

    pub fn write_i64(&mut self, value: i64) {
        self.buf.put_i64_le(value);
    }

    pub fn write_u64(&mut self, value: u64) {
        self.buf.put_u64_le(value);
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buf.put_u8(u8::from(value));
    }

    /// Write a length-prefixed byte sequence.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_len(value.len());
        self.buf.put_slice(value);
    }

    /// Write an optional byte sequence; `None` and empty both encode as length 0.
    pub fn write_optional_bytes(&mut self, value: Option<&[u8]>) {
        match value {
            Some(bytes) => self.write_bytes(bytes),
            None => self.write_i32(0),
        }
    }

    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Write a nested record as a length-prefixed blob.
    pub fn write_record<R: WireRecord>(&mut self, record: &R) {
        self.write_bytes(&record.to_wire());
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf.to_vec()
    }

    fn write_len(&mut self, len: usize) {
        // Records never approach 2 GiB; saturate rather than wrap.
        self.write_i32(i32::try_from(len).unwrap_or(i32::MAX));
    }
}

/// Bounds-checked decoder over a borrowed buffer.
#[derive(Debug, Clone)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn is_empty(&self) -> bool {
        !self.buf.has_remaining()
    }

    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32_le())
    }

    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_i64_le())
    }

    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64_le())
    }

    pub fn read_bool(&mut self) -> Result<bool, CodecError> {
        self.ensure(1)?;
        match self.buf.get_u8() {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CodecError::InvalidBool(other)),
        }
    }

    /// Read a length-prefixed byte sequence. A zero length yields an empty vec.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>, CodecError> {
        let len = self.read_len()?;
        self.ensure(len)?;
        let out = self.buf[..len].to_vec();
        self.buf.advance(len);
        Ok(out)
    }

    /// Read an optional byte sequence; a zero length yields `None`.
    pub fn read_optional_bytes(&mut self) -> Result<Option<Vec<u8>>, CodecError> {
        let bytes = self.read_bytes()?;
        Ok(if bytes.is_empty() { None } else { Some(bytes) })
    }

    pub fn read_string(&mut self) -> Result<String, CodecError> {
        String::from_utf8(self.read_bytes()?).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a nested length-prefixed record. The nested blob must decode
    /// completely on its own.
    pub fn read_record<R: WireRecord>(&mut self) -> Result<R, CodecError> {
        let blob = self.read_bytes()?;
        R::from_wire(&blob)
    }

    fn read_len(&mut self) -> Result<usize, CodecError> {
        let len = self.read_i32()?;
        usize::try_from(len).map_err(|_| CodecError::NegativeLength(len))
    }

    fn ensure(&self, needed: usize) -> Result<(), CodecError> {
        let remaining = self.buf.remaining();
        if remaining < needed {
            return Err(CodecError::Truncated { needed, remaining });
        }
        Ok(())
    }
}

/// A record with a fixed field order in the wire format.
pub trait WireRecord: Sized {
    fn write_to(&self, writer: &mut WireWriter);

    fn read_from(reader: &mut WireReader<'_>) -> Result<Self, CodecError>;

    fn to_wire(&self) -> Vec<u8> {
        let mut writer = WireWriter::new();
        self.write_to(&mut writer);
        writer.finish()
    }

    /// Decode a record. Trailing bytes written by newer versions are ignored.
    fn from_wire(bytes: &[u8]) -> Result<Self, CodecError> {
        let mut reader = WireReader::new(bytes);
        let record = Self::read_from(&mut reader)?;
        if !reader.is_empty() {
            tracing::trace!(trailing = reader.remaining(), "ignoring trailing record bytes");
        }
        Ok(record)
    }
}
