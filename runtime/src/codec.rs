//! Wire codec.
//!
//! Fixed-width integers are little-endian, lengths are ULEB128, and a
//! `bytes` value is a ULEB128 length followed by the raw bytes.

use alloc::string::String;
use alloc::vec::Vec;

use crate::{Result, VmError};

/// Cursor over a serialized buffer.
#[derive(Debug, Clone)]
pub struct BufReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> BufReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        BufReader { data, pos: 0 }
    }

    /// Current read position.
    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Bytes between `from` and the current position.
    pub fn since(&self, from: usize) -> &'a [u8] {
        &self.data[from.min(self.pos)..self.pos]
    }

    pub fn read_fixed_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.data.len())
            .ok_or_else(|| {
                VmError::Codec(alloc::format!(
                    "read of {} bytes at {} overruns buffer of {}",
                    len,
                    self.pos,
                    self.data.len()
                ))
            })?;
        let out = &self.data[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_fixed_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(self.read_u16()? as i16)
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    /// Unsigned LEB128. Values wider than 64 bits are rejected.
    pub fn read_uleb(&mut self) -> Result<u64> {
        let mut result: u64 = 0;
        let mut shift = 0u32;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 || (shift == 63 && byte > 1) {
                return Err(VmError::Codec(String::from("ULEB128 value overflows u64")));
            }
            result |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
        }
    }

    /// A ULEB128 length checked against the remaining input.
    pub fn read_len(&mut self) -> Result<usize> {
        let len = self.read_uleb()?;
        usize::try_from(len)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or_else(|| VmError::Codec(alloc::format!("length {} exceeds input", len)))
    }

    /// Like `read_len` but for element counts, which may be smaller on the wire.
    pub fn read_count(&mut self) -> Result<usize> {
        let count = self.read_uleb()?;
        usize::try_from(count)
            .map_err(|_| VmError::Codec(alloc::format!("count {} too large", count)))
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_len()?;
        self.read_fixed_bytes(len)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        core::str::from_utf8(bytes)
            .map(String::from)
            .map_err(|e| VmError::Codec(alloc::format!("invalid utf-8: {}", e)))
    }

    /// Fails unless the whole buffer has been consumed.
    pub fn finish(&self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(VmError::Codec(alloc::format!(
                "{} trailing bytes",
                self.remaining()
            )))
        }
    }
}

/// Growable output buffer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BufWriter {
    data: Vec<u8>,
}

impl BufWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn write_fixed_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.data.extend_from_slice(bytes);
        self
    }

    pub fn write_u8(&mut self, v: u8) -> &mut Self {
        self.data.push(v);
        self
    }

    pub fn write_u16(&mut self, v: u16) -> &mut Self {
        self.write_fixed_bytes(&v.to_le_bytes())
    }

    pub fn write_u32(&mut self, v: u32) -> &mut Self {
        self.write_fixed_bytes(&v.to_le_bytes())
    }

    pub fn write_u64(&mut self, v: u64) -> &mut Self {
        self.write_fixed_bytes(&v.to_le_bytes())
    }

    pub fn write_i8(&mut self, v: i8) -> &mut Self {
        self.write_u8(v as u8)
    }

    pub fn write_i16(&mut self, v: i16) -> &mut Self {
        self.write_u16(v as u16)
    }

    pub fn write_i32(&mut self, v: i32) -> &mut Self {
        self.write_u32(v as u32)
    }

    pub fn write_i64(&mut self, v: i64) -> &mut Self {
        self.write_u64(v as u64)
    }

    pub fn write_f32(&mut self, v: f32) -> &mut Self {
        self.write_u32(v.to_bits())
    }

    pub fn write_f64(&mut self, v: f64) -> &mut Self {
        self.write_u64(v.to_bits())
    }

    pub fn write_bool(&mut self, v: bool) -> &mut Self {
        self.write_u8(u8::from(v))
    }

    pub fn write_uleb(&mut self, mut v: u64) -> &mut Self {
        loop {
            let byte = (v & 0x7f) as u8;
            v >>= 7;
            if v == 0 {
                self.data.push(byte);
                return self;
            }
            self.data.push(byte | 0x80);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.write_uleb(bytes.len() as u64);
        self.write_fixed_bytes(bytes)
    }

    pub fn write_string(&mut self, s: &str) -> &mut Self {
        self.write_bytes(s.as_bytes())
    }
}

/// Serialize a sequence of strings: ULEB count then each string.
pub fn write_str_seq<S: AsRef<str>>(w: &mut BufWriter, items: &[S]) {
    w.write_uleb(items.len() as u64);
    for item in items {
        w.write_string(item.as_ref());
    }
}

pub fn read_str_seq(r: &mut BufReader<'_>) -> Result<Vec<String>> {
    let count = r.read_count()?;
    let mut out = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        out.push(r.read_string()?);
    }
    Ok(out)
}
