//! Little-endian byte cursor over the raw dump bytes
//!
//! All minidump structures are little-endian regardless of host order, so
//! every read goes through explicit `from_le_bytes` conversions.

use crate::errors::{MinidumpError, Result};

/// A bounds-checked cursor over a byte slice.
#[derive(Debug, Clone)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Cursor positioned at `offset` from the start of the same buffer.
    pub fn at(data: &'a [u8], offset: u64) -> Result<Self> {
        let pos = usize::try_from(offset).map_err(|_| MinidumpError::Truncated {
            offset,
            needed: 0,
            available: data.len(),
        })?;
        if pos > data.len() {
            return Err(MinidumpError::Truncated {
                offset,
                needed: 0,
                available: data.len(),
            });
        }
        Ok(Self { data, pos })
    }

    pub fn position(&self) -> u64 {
        self.pos as u64
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Take `len` raw bytes, advancing the cursor.
    pub fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(MinidumpError::Truncated {
                offset: self.pos as u64,
                needed: len,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    pub fn skip(&mut self, len: usize) -> Result<()> {
        self.bytes(len).map(|_| ())
    }

    pub fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn u32(&mut self) -> Result<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn u64(&mut self) -> Result<u64> {
        let b = self.bytes(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    /// 128-bit value split into (low, high) halves, as stored on disk.
    pub fn u128_pair(&mut self) -> Result<(u64, u64)> {
        let low = self.u64()?;
        let high = self.u64()?;
        Ok((low, high))
    }
}
