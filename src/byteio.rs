//! Little-endian byte I/O over an in-memory buffer with a cursor (C1).
//!
//! The read half generalizes the teacher's `get_le_u16`/`get_le_u32`/
//! `get_ascii_string` helpers (`parser/utils.rs`) into a reusable cursor that
//! also supports absolute seeks, which the header parser never needed but
//! the resource codec (directory/data/string offsets are all absolute) does.
//! The write half has no analogue in the teacher — `winnow` only parses — so
//! it leans on `byteorder`'s `WriteBytesExt`, the write-side counterpart the
//! wider pack reaches for (`Gargafield-Lush`'s `rscil`).

use crate::error::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use winnow::token::take;
use winnow::Parser;

/// Cursor for reading little-endian primitives out of a borrowed byte slice.
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        ByteReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    /// Move the cursor to an absolute offset from the start of the buffer.
    pub fn seek(&mut self, pos: usize) -> Result<()> {
        if pos > self.buf.len() {
            return Err(Error::TruncatedInput {
                needed: pos,
                available: self.buf.len(),
            });
        }
        self.pos = pos;
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::TruncatedInput {
                needed: len,
                available: self.remaining(),
            });
        }
        let mut rest = &self.buf[self.pos..];
        let taken = take(len)
            .parse_next(&mut rest)
            .map_err(|_: winnow::error::ErrMode<winnow::error::ContextError>| {
                Error::TruncatedInput {
                    needed: len,
                    available: self.remaining(),
                }
            })?;
        self.pos += len;
        Ok(taken)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut arr = [0u8; 8];
        arr.copy_from_slice(b);
        Ok(u64::from_le_bytes(arr))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    pub fn read_tag8(&mut self) -> Result<[u8; 8]> {
        let b = self.take(8)?;
        let mut tag = [0u8; 8];
        tag.copy_from_slice(b);
        Ok(tag)
    }

    /// Read `len` UTF-16 code units and decode them, replacing unpaired
    /// surrogates with the replacement character (matches `char::decode_utf16`'s
    /// lossy mode; the resource string table is not expected to carry any).
    pub fn read_utf16(&mut self, len: usize) -> Result<String> {
        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(self.read_u16()?);
        }
        Ok(char::decode_utf16(units)
            .map(|r| r.unwrap_or(char::REPLACEMENT_CHARACTER))
            .collect())
    }
}

/// Growable little-endian output buffer with positional patch-back, used by
/// the container's header rewrite and the resource encoder's back-reference
/// patching (directory offsets and string offsets are only known after the
/// fact).
#[derive(Default)]
pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        ByteWriter { buf: Vec::new() }
    }

    pub fn with_capacity(cap: usize) -> Self {
        ByteWriter {
            buf: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.write_u16::<LittleEndian>(v).expect("Vec writes never fail");
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.write_u32::<LittleEndian>(v).expect("Vec writes never fail");
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.write_u64::<LittleEndian>(v).expect("Vec writes never fail");
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_zeros(&mut self, n: usize) {
        self.buf.resize(self.buf.len() + n, 0);
    }

    /// Overwrite the 4 bytes at `offset` with `v`, little-endian. `offset` must
    /// already have been written past (used for back-patching directory and
    /// string references recorded earlier in the encode pass).
    pub fn patch_u32(&mut self, offset: usize, v: u32) {
        self.buf[offset..offset + 4].copy_from_slice(&v.to_le_bytes());
    }
}
