//! Guest memory access.
//!
//! Every guest object lives behind an 8-byte pre-header written by the
//! guest's allocator: the runtime-type id at `ptr - 8` and the payload size
//! in bytes at `ptr - 4`. [`GuestMemory`] abstracts over a live wasm memory
//! and [`ScratchMemory`], a vec-backed stand-in with the same allocator
//! contract.

use alloc::vec::Vec;

use crate::{Result, VmError};

/// Page size in bytes (64 KB).
pub const PAGE_SIZE: usize = 65536;

/// Size of the object pre-header.
pub const HEADER_SIZE: u32 = 8;

/// Round `value` up to a multiple of `align` (a power of two, or 0/1).
pub fn align_to(value: u32, align: u32) -> u32 {
    if align <= 1 {
        return value;
    }
    (value + align - 1) & !(align - 1)
}

/// A value in guest memory or on the guest stack: a pointer, or a scalar of
/// 1/2/4/8 bytes. Stored as raw little-endian bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct WasmWord(u64);

impl WasmWord {
    pub const NULL: WasmWord = WasmWord(0);

    pub fn from_u32(v: u32) -> Self {
        WasmWord(u64::from(v))
    }

    pub fn from_u64(v: u64) -> Self {
        WasmWord(v)
    }

    /// Sign-extends so narrow signed values keep their sign as i32.
    pub fn from_i64(v: i64) -> Self {
        WasmWord(v as u64)
    }

    pub fn from_f32(v: f32) -> Self {
        WasmWord(u64::from(v.to_bits()))
    }

    pub fn from_f64(v: f64) -> Self {
        WasmWord(v.to_bits())
    }

    pub fn from_bool(v: bool) -> Self {
        WasmWord(u64::from(v))
    }

    /// Zero-extended read of up to 8 little-endian bytes.
    pub fn from_le_bytes(bytes: &[u8]) -> Self {
        let mut buf = [0u8; 8];
        let n = bytes.len().min(8);
        buf[..n].copy_from_slice(&bytes[..n]);
        WasmWord(u64::from_le_bytes(buf))
    }

    pub fn to_u32(self) -> u32 {
        self.0 as u32
    }

    pub fn to_u64(self) -> u64 {
        self.0
    }

    pub fn to_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    pub fn to_i64(self) -> i64 {
        self.0 as i64
    }

    pub fn to_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    pub fn to_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    pub fn to_bool(self) -> bool {
        self.0 != 0
    }

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Pointer view; fails on values that do not fit a 32-bit address.
    pub fn to_ptr(self) -> Result<u32> {
        u32::try_from(self.0)
            .map_err(|_| VmError::Execution(alloc::format!("{:#x} is not a pointer", self.0)))
    }

    pub fn align(self, n: u32) -> Self {
        WasmWord(u64::from(align_to(self.0 as u32, n)))
    }

    pub fn plus(self, n: u32) -> Self {
        WasmWord(self.0.wrapping_add(u64::from(n)))
    }

    pub fn minus(self, n: u32) -> Self {
        WasmWord(self.0.wrapping_sub(u64::from(n)))
    }

    /// Low `size` bytes, little-endian.
    pub fn serialize(self, size: u32) -> Vec<u8> {
        self.0.to_le_bytes()[..(size as usize).min(8)].to_vec()
    }
}

/// Byte-level access to a guest's linear memory.
pub trait GuestMemory {
    /// Borrow `len` bytes at `ptr`.
    fn read(&self, ptr: u32, len: u32) -> Result<&[u8]>;

    /// Write bytes at `ptr`.
    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()>;

    /// Allocate `size` bytes tagged with runtime-type id `rtid`, through the
    /// guest's own allocator.
    fn malloc(&mut self, size: u32, rtid: u32) -> Result<WasmWord>;

    fn read_u32(&self, ptr: u32) -> Result<u32> {
        Ok(WasmWord::from_le_bytes(self.read(ptr, 4)?).to_u32())
    }

    fn write_u32(&mut self, ptr: u32, value: u32) -> Result<()> {
        self.write(ptr, &value.to_le_bytes())
    }

    fn read_word(&self, ptr: u32, size: u32) -> Result<WasmWord> {
        Ok(WasmWord::from_le_bytes(self.read(ptr, size)?))
    }

    fn write_word(&mut self, ptr: u32, word: WasmWord, size: u32) -> Result<()> {
        self.write(ptr, &word.serialize(size))
    }

    /// `(rtid, size)` from the object pre-header.
    fn header(&self, ptr: u32) -> Result<(u32, u32)> {
        let base = ptr
            .checked_sub(HEADER_SIZE)
            .ok_or_else(|| VmError::Execution(alloc::format!("no object header at {:#x}", ptr)))?;
        Ok((self.read_u32(base)?, self.read_u32(base + 4)?))
    }

    /// Copy out an object's whole payload, sized by its pre-header.
    fn extract(&self, ptr: u32) -> Result<Vec<u8>> {
        let (_, size) = self.header(ptr)?;
        Ok(self.read(ptr, size)?.to_vec())
    }
}

/// Check that `[ptr, ptr + len)` fits in a memory of `size` bytes.
pub(crate) fn check_bounds(ptr: u32, len: u32, size: usize) -> Result<core::ops::Range<usize>> {
    let start = ptr as usize;
    let end = start
        .checked_add(len as usize)
        .filter(|end| *end <= size)
        .ok_or_else(|| {
            VmError::Execution(alloc::format!(
                "memory access {:#x}+{} out of bounds (size {})",
                ptr,
                len,
                size
            ))
        })?;
    Ok(start..end)
}

/// Vec-backed guest memory with a bump allocator that writes the same
/// object header a guest allocator would.
#[derive(Debug, Clone)]
pub struct ScratchMemory {
    data: Vec<u8>,
    next_alloc: u32,
}

impl ScratchMemory {
    /// Create a memory of `pages` wasm pages. Address 0 is never handed out.
    pub fn new(pages: u32) -> Self {
        ScratchMemory {
            data: alloc::vec![0u8; pages as usize * PAGE_SIZE],
            next_alloc: 16,
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Bytes handed out so far, header included.
    pub fn used(&self) -> u32 {
        self.next_alloc
    }
}

impl Default for ScratchMemory {
    fn default() -> Self {
        Self::new(1)
    }
}

impl GuestMemory for ScratchMemory {
    fn read(&self, ptr: u32, len: u32) -> Result<&[u8]> {
        let range = check_bounds(ptr, len, self.data.len())?;
        Ok(&self.data[range])
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        let range = check_bounds(ptr, bytes.len() as u32, self.data.len())?;
        self.data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn malloc(&mut self, size: u32, rtid: u32) -> Result<WasmWord> {
        let ptr = align_to(self.next_alloc + HEADER_SIZE, 8);
        let end = ptr
            .checked_add(size)
            .ok_or_else(|| VmError::Execution(alloc::format!("allocation of {} overflows", size)))?;
        check_bounds(ptr - HEADER_SIZE, end - (ptr - HEADER_SIZE), self.data.len())?;
        self.write_u32(ptr - 8, rtid)?;
        self.write_u32(ptr - 4, size)?;
        self.next_alloc = end;
        Ok(WasmWord::from_u32(ptr))
    }
}
