//! Bounds-checked cursor codec for cache protocol payloads
//!
//! Integers are little endian. Sizes and table offsets use a 7-bit varint
//! (low bits first, high bit = continuation). Strings are a varint byte length
//! followed by UTF-8.

use crate::{Error, Result};
use buildcache_cas::{CAS_KEY_SIZE, CasKey};

/// Number of bytes `value` occupies as a 7-bit varint
#[must_use]
pub const fn varint_len(mut value: u64) -> usize {
    let mut len = 1;
    while value >= 0x80 {
        value >>= 7;
        len += 1;
    }
    len
}

/// Append `value` to `out` as a 7-bit varint
pub fn push_7bit(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

/// Growable request writer with a capacity ceiling
#[derive(Debug, Clone)]
pub struct BinaryWriter {
    buf: Vec<u8>,
    limit: usize,
}

impl BinaryWriter {
    /// Writer that refuses to grow past `limit` bytes
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::new(),
            limit,
        }
    }

    /// Writer without a practical ceiling
    #[must_use]
    pub fn unbounded() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Bytes written so far
    #[must_use]
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    /// Bytes that can still be written
    #[must_use]
    pub fn capacity_left(&self) -> usize {
        self.limit.saturating_sub(self.buf.len())
    }

    fn reserve(&self, len: usize) -> Result<()> {
        let size = self.buf.len().saturating_add(len);
        if size > self.limit {
            return Err(Error::EntryTooLarge {
                size,
                limit: self.limit,
            });
        }
        Ok(())
    }

    /// Write one byte
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.write_bytes(&[value])
    }

    /// Write a bool as one byte
    pub fn write_bool(&mut self, value: bool) -> Result<()> {
        self.write_u8(u8::from(value))
    }

    /// Write a little-endian u16
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian u32
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write a little-endian u64
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.write_bytes(&value.to_le_bytes())
    }

    /// Write a 7-bit varint
    pub fn write_7bit(&mut self, value: u64) -> Result<()> {
        self.reserve(varint_len(value))?;
        push_7bit(&mut self.buf, value);
        Ok(())
    }

    /// Write a length-prefixed UTF-8 string
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_7bit(value.len() as u64)?;
        self.write_bytes(value.as_bytes())
    }

    /// Write a content key as raw bytes
    pub fn write_cas_key(&mut self, key: CasKey) -> Result<()> {
        self.write_bytes(key.as_bytes())
    }

    /// Write raw bytes
    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Written bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    /// Consume the writer
    #[must_use]
    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

/// Cursor over a response payload
#[derive(Debug, Clone)]
pub struct BinaryReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BinaryReader<'a> {
    /// Reader positioned at the start of `data`
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current position
    #[must_use]
    pub const fn position(&self) -> usize {
        self.pos
    }

    /// Bytes not yet consumed
    #[must_use]
    pub const fn left(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Returns true when nothing is left
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.left() == 0
    }

    /// Unconsumed remainder
    #[must_use]
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consume `len` bytes
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if len > self.left() {
            return Err(Error::protocol(format!(
                "read of {len} bytes at position {} overruns payload of {} bytes",
                self.pos,
                self.data.len()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    /// Read one byte
    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    /// Read a bool byte
    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Read a little-endian u16
    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian u32
    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    /// Read a little-endian u64
    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    /// Read a 7-bit varint
    pub fn read_7bit(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift > 63 {
                return Err(Error::protocol("varint longer than 64 bits"));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read a 7-bit varint that must fit a u32
    pub fn read_7bit_u32(&mut self) -> Result<u32> {
        let value = self.read_7bit()?;
        u32::try_from(value).map_err(|_| Error::protocol(format!("offset {value} exceeds u32")))
    }

    /// Read a varint length and the sub-slice that follows it
    pub fn read_sized(&mut self) -> Result<&'a [u8]> {
        let len = usize::try_from(self.read_7bit()?)
            .map_err(|_| Error::protocol("section length exceeds address space"))?;
        self.read_bytes(len)
    }

    /// Read a length-prefixed UTF-8 string
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_sized()?;
        String::from_utf8(bytes.to_vec()).map_err(|e| Error::protocol(format!("invalid UTF-8 string: {e}")))
    }

    /// Read a content key
    pub fn read_cas_key(&mut self) -> Result<CasKey> {
        Ok(CasKey::from_bytes(self.read_array::<CAS_KEY_SIZE>()?))
    }
}
