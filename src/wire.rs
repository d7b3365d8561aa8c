// Copyright 2020 Joyent, Inc.

//! Bounds-checked cursors over wire buffers.
//!
//! Buffers arrive from another process and are treated as untrusted:
//! every read checks the remaining length first and fails with
//! [`HapiError::BrokenPacket`] instead of reading out of bounds.
//!
//! String fields in fixed-layout bodies are stored as a `(u16 offset,
//! u16 length)` pair. The offset is relative to the start of the body and
//! the bytes live in a variable region after the fixed fields, followed by
//! a NUL terminator that is not counted in the length.

use std::str;

use byteorder::{ByteOrder, LittleEndian};
use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{HapiError, Result};

pub struct WireReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

macro_rules! impl_read_le {
    ($name:ident, $t:ty, $size:expr, $read:ident) => {
        pub fn $name(&mut self) -> Result<$t> {
            let bytes = self.take($size, stringify!($t))?;
            Ok(LittleEndian::$read(bytes))
        }
    };
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8]) -> WireReader<'a> {
        WireReader { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// The unread part of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        if len > self.remaining() {
            return Err(HapiError::broken(format!(
                "need {} bytes for {} at offset {}, {} left",
                len,
                what,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1, "u8")?[0])
    }

    impl_read_le!(read_u16, u16, 2, read_u16);
    impl_read_le!(read_u32, u32, 4, read_u32);
    impl_read_le!(read_u64, u64, 8, read_u64);
    impl_read_le!(read_i64, i64, 8, read_i64);

    pub fn read_f64(&mut self) -> Result<f64> {
        let bytes = self.take(8, "f64")?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(f64::from_ne_bytes(raw))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len, "bytes")
    }

    /// Splits off the next `len` bytes as a reader of their own.
    pub fn sub_reader(&mut self, len: usize) -> Result<WireReader<'a>> {
        Ok(WireReader::new(self.take(len, "sub-record")?))
    }

    /// Reads a `u32` length, that many bytes and a NUL terminator.
    pub fn read_inline_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len, "string")?;
        if self.read_u8()? != 0 {
            return Err(HapiError::broken("string is not NUL terminated"));
        }
        to_string(bytes)
    }

    /// Reads an offset/length pair and resolves it against `body`.
    pub fn read_string_field(&mut self, body: &[u8]) -> Result<String> {
        let offset = self.read_u16()?;
        let len = self.read_u16()?;
        get_string(body, usize::from(offset), usize::from(len))
    }
}

/// Extracts the string at `offset..offset + length` of `body`.
///
/// Succeeds only when the terminator position lies inside the received
/// bytes and holds a NUL.
pub fn get_string(body: &[u8], offset: usize, length: usize) -> Result<String> {
    let end = offset
        .checked_add(length)
        .ok_or_else(|| HapiError::broken("string offset overflows"))?;
    if end >= body.len() {
        return Err(HapiError::broken(format!(
            "string at {}+{} exceeds received size {}",
            offset,
            length,
            body.len()
        )));
    }
    if body[end] != 0 {
        return Err(HapiError::broken(format!(
            "string at {}+{} is not NUL terminated",
            offset, length
        )));
    }
    to_string(&body[offset..end])
}

fn to_string(bytes: &[u8]) -> Result<String> {
    str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|_| HapiError::broken("string is not valid UTF-8"))
}

/// Writes the inline string form read by
/// [`WireReader::read_inline_string`].
pub fn put_inline_string(buf: &mut BytesMut, s: &str) {
    buf.reserve(4 + s.len() + 1);
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

/// Builds a body made of a fixed-size region followed by the bytes of its
/// string fields.
pub struct BodyWriter {
    fixed: BytesMut,
    var: BytesMut,
    fixed_size: usize,
}

impl BodyWriter {
    pub fn new(fixed_size: usize) -> BodyWriter {
        BodyWriter {
            fixed: BytesMut::with_capacity(fixed_size),
            var: BytesMut::new(),
            fixed_size,
        }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.fixed.put_u8(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.fixed.put_u16_le(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.fixed.put_u32_le(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.fixed.put_u64_le(v);
    }

    /// Appends `s` and its NUL to the variable region and writes the
    /// offset/length pair into the fixed region.
    pub fn put_string(&mut self, s: &str) -> Result<()> {
        let offset = self.fixed_size + self.var.len();
        if offset > usize::from(u16::max_value()) || s.len() > usize::from(u16::max_value()) {
            return Err(HapiError::Handler(format!(
                "string field of {} bytes does not fit in the body",
                s.len()
            )));
        }
        self.fixed.put_u16_le(offset as u16);
        self.fixed.put_u16_le(s.len() as u16);
        self.var.put_slice(s.as_bytes());
        self.var.put_u8(0);
        Ok(())
    }

    pub fn finish(mut self) -> Bytes {
        debug_assert_eq!(self.fixed.len(), self.fixed_size);
        self.fixed.unsplit(self.var);
        self.fixed.freeze()
    }
}
