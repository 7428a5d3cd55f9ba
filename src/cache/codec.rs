//! Versioned binary codec for cache entries
//!
//! File layout: `MAGIC(4) | VERSION(1) | COUNT(4) | [ENTRY]*`. All integers
//! are big-endian. Strings are encoded as `LEN(4) | UTF-8 bytes` and every
//! read validates UTF-8 before the bytes are reinterpreted as text. An
//! unknown version byte fails with `VersionMismatch`; any other structural
//! problem fails with `CorruptCache`.

use super::{CacheError, Result};
use crate::hash::Digest;

/// Four-byte magic, "BLDC".
pub const MAGIC: u32 = 0x424C_4443;

/// Current format version.
pub const VERSION: u8 = 1;

/// Types that can write themselves into the binary format.
pub trait BinaryEncode {
    /// Append this value's encoding to the writer.
    fn encode(&self, writer: &mut ByteWriter);
}

/// Types that can read themselves back out of the binary format.
pub trait BinaryDecode: Sized {
    /// Decode one value, advancing the reader.
    fn decode(reader: &mut ByteReader<'_>) -> Result<Self>;
}

/// Growable big-endian byte sink.
///
/// The internal buffer is reused across serializations; [`ByteWriter::finish`]
/// hands callers an independent copy and resets the buffer for the next use.
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// True when nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append one byte.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Append a big-endian u32.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a big-endian u64.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_be_bytes());
    }

    /// Append a bool as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    /// Append a length-prefixed byte string.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    /// Append a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }

    /// Append a raw 32-byte digest (no length prefix).
    pub fn write_digest(&mut self, value: &Digest) {
        self.buf.extend_from_slice(value.as_bytes());
    }

    /// Take an independent copy of the encoded bytes and reset the writer
    /// for reuse.
    pub fn finish(&mut self) -> Vec<u8> {
        let out = self.buf.clone();
        self.buf.clear();
        out
    }
}

/// Bounds-checked big-endian byte source.
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    /// Wrap a byte slice.
    pub fn new(data: &'a [u8]) -> Self {
        ByteReader { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True when fully consumed.
    pub fn is_exhausted(&self) -> bool {
        self.remaining() == 0
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.remaining() < n {
            return Err(CacheError::CorruptCache(format!(
                "Truncated data: wanted {} bytes, {} remain",
                n,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    /// Read one byte.
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a big-endian u32.
    pub fn read_u32(&mut self) -> Result<u32> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes(bytes.try_into().expect("4-byte slice")))
    }

    /// Read a big-endian u64.
    pub fn read_u64(&mut self) -> Result<u64> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes(bytes.try_into().expect("8-byte slice")))
    }

    /// Read a bool byte; anything other than 0 or 1 is corrupt.
    pub fn read_bool(&mut self) -> Result<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(CacheError::CorruptCache(format!(
                "Invalid bool byte: {:#04x}",
                other
            ))),
        }
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.take(len)
    }

    /// Read a length-prefixed string, validating UTF-8.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        let s = std::str::from_utf8(bytes).map_err(|_| CacheError::InvalidUtf8)?;
        Ok(s.to_string())
    }

    /// Read a raw 32-byte digest.
    pub fn read_digest(&mut self) -> Result<Digest> {
        let bytes = self.take(Digest::LEN)?;
        Ok(Digest::from_bytes(
            bytes.try_into().expect("32-byte slice"),
        ))
    }
}

/// Write the `MAGIC | VERSION | COUNT` file header.
pub fn write_header(writer: &mut ByteWriter, count: u32) {
    writer.write_u32(MAGIC);
    writer.write_u8(VERSION);
    writer.write_u32(count);
}

/// Read and validate the file header, returning the entry count.
pub fn read_header(reader: &mut ByteReader<'_>) -> Result<u32> {
    let magic = reader.read_u32()?;
    if magic != MAGIC {
        return Err(CacheError::CorruptCache(format!(
            "Bad magic: {:#010x}",
            magic
        )));
    }
    let version = reader.read_u8()?;
    if version != VERSION {
        return Err(CacheError::VersionMismatch {
            found: version,
            expected: VERSION,
        });
    }
    reader.read_u32()
}
