//! Big-endian binary cursor and writers used by every wire format.
//!
//! Encoding conventions:
//! - Fixed-size fields (hashes, addresses, integers) are written directly
//! - Integers are big-endian
//! - Variable-length items are framed as `[u32 length][bytes]`
//!
//! The reader never panics on short input; every read that would run past
//! the end yields [`ChainError::DataTooShort`].

use crate::error::{ChainError, ChainResult};
use crate::types::{Address, Hash, U256};

/// A cursor for reading bytes during decoding.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn read_bytes(&mut self, n: usize) -> ChainResult<&'a [u8]> {
        let end = self.pos.checked_add(n).filter(|end| *end <= self.data.len());
        let Some(end) = end else {
            return Err(ChainError::DataTooShort {
                offset: self.pos,
                needed: n,
                available: self.data.len(),
            });
        };
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    /// Consume everything left.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let slice = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        slice
    }

    pub fn read_array<const N: usize>(&mut self) -> ChainResult<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> ChainResult<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> ChainResult<u16> {
        Ok(u16::from_be_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> ChainResult<u32> {
        Ok(u32::from_be_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> ChainResult<u64> {
        Ok(u64::from_be_bytes(self.read_array()?))
    }

    pub fn read_hash(&mut self) -> ChainResult<Hash> {
        self.read_array()
    }

    pub fn read_address(&mut self) -> ChainResult<Address> {
        self.read_array()
    }

    pub fn read_u256(&mut self) -> ChainResult<U256> {
        Ok(U256::from_big_endian(self.read_bytes(32)?))
    }

    /// Read a `[u32 length][bytes]` frame.
    pub fn read_framed(&mut self) -> ChainResult<&'a [u8]> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }
}

// ── Encoding helpers ──

pub fn write_u8(buf: &mut Vec<u8>, v: u8) {
    buf.push(v);
}

pub fn write_u16(buf: &mut Vec<u8>, v: u16) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u32(buf: &mut Vec<u8>, v: u32) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_be_bytes());
}

pub fn write_u256(buf: &mut Vec<u8>, v: &U256) {
    buf.extend_from_slice(&crate::types::u256_to_word(v));
}

/// Write a `[u32 length][bytes]` frame.
pub fn write_framed(buf: &mut Vec<u8>, data: &[u8]) {
    write_u32(buf, data.len() as u32);
    buf.extend_from_slice(data);
}

/// Split a region made entirely of `[u32 length][bytes]` frames into the
/// frame bodies, in order. Trailing garbage is an error.
pub fn split_frames(region: &[u8]) -> ChainResult<Vec<&[u8]>> {
    let mut reader = Reader::new(region);
    let mut frames = Vec::new();
    while !reader.is_empty() {
        frames.push(reader.read_framed()?);
    }
    Ok(frames)
}
