//! Value lowering: serialized bytes → guest memory.
//!
//! The lowerer reads one value of a given type from a [`BufReader`] and
//! rebuilds it in the guest's own object layout, allocating through the
//! guest allocator so every object carries the runtime-type id the compiled
//! program expects.

use alloc::vec::Vec;

use hashbrown::{HashMap, HashSet};

use crate::abi::{AbiAccess, AbiClass, AbiObject, Prim, Shape, TypeNode};
use crate::codec::{BufReader, BufWriter};
use crate::layout::{
    hash32, hash64, hash_capacity, hash_str, EntryLayout, ARRAY_HEADER_SIZE, BUF_RTID,
    HASH_HEADER_SIZE, STRING_RTID, TYPED_ARRAY_HEADER_SIZE,
};
use crate::lock::Lock;
use crate::memory::{GuestMemory, WasmWord};
use crate::output::{Output, Pointer};
use crate::{Result, VmError};

/// Size of a jig proxy: just the two base fields.
pub const PROXY_SIZE: u32 = 8;

/// Serialized form of the `Output` object stored in a jig's `$output` field.
pub fn output_object_bytes(origin: &Pointer, location: &Pointer, class_ptr: &Pointer) -> Vec<u8> {
    let mut w = BufWriter::new();
    w.write_bytes(&origin.to_bytes())
        .write_bytes(&location.to_bytes())
        .write_bytes(&class_ptr.to_bytes());
    w.into_bytes()
}

/// Serialized form of the `Lock` object stored in a jig's `$lock` field.
pub fn lock_object_bytes(origin: &Pointer, lock: &Lock) -> Vec<u8> {
    let mut w = BufWriter::new();
    w.write_bytes(&origin.to_bytes())
        .write_u32(u32::from(lock.code()))
        .write_bytes(&lock.data());
    w.into_bytes()
}

/// Type-directed encoder into one guest memory.
pub struct Lowerer<'a> {
    abi: &'a AbiAccess,
    mem: &'a mut dyn GuestMemory,
    residents: &'a HashMap<Pointer, WasmWord>,
}

impl<'a> Lowerer<'a> {
    /// `residents` maps the origins of jigs living in this memory to their
    /// live pointers; references to them resolve without a proxy.
    pub fn new(
        abi: &'a AbiAccess,
        mem: &'a mut dyn GuestMemory,
        residents: &'a HashMap<Pointer, WasmWord>,
    ) -> Self {
        Lowerer {
            abi,
            mem,
            residents,
        }
    }

    /// Lower a sequence of arguments. The buffer must hold exactly one value
    /// per type, with no statement references left in it.
    pub fn lower_args(&mut self, bytes: &[u8], types: &[TypeNode]) -> Result<Vec<WasmWord>> {
        let mut r = BufReader::new(bytes);
        let mut words = Vec::with_capacity(types.len());
        for ty in types {
            words.push(self.lower_value(&mut r, ty)?);
        }
        r.finish()?;
        Ok(words)
    }

    /// Lower a single value of type `ty`.
    pub fn lower_value(&mut self, r: &mut BufReader<'_>, ty: &TypeNode) -> Result<WasmWord> {
        if ty.nullable && r.read_u8()? == 0 {
            return Ok(WasmWord::NULL);
        }
        let abi = self.abi;
        match abi.shape(ty)? {
            Shape::Prim(prim) => read_prim(r, prim),
            Shape::String => self.lower_string(r),
            Shape::ArrayBuffer => {
                let bytes = r.read_bytes()?;
                self.alloc_bytes(bytes, BUF_RTID)
            }
            Shape::TypedArray(_) => {
                let bytes = r.read_bytes()?;
                let buffer = self.alloc_bytes(bytes, BUF_RTID)?;
                let header = self.mem.malloc(TYPED_ARRAY_HEADER_SIZE, abi.rtid_of(ty)?)?;
                self.write_u32s(header, &[buffer.to_u32(), buffer.to_u32(), bytes.len() as u32])?;
                Ok(header)
            }
            Shape::Array(elem) => {
                let count = r.read_count()?;
                let size = elem.own_size();
                let byte_len = checked_len(count, size)?;
                let buffer = self.mem.malloc(byte_len, BUF_RTID)?;
                self.lower_elements(r, elem, buffer, count)?;
                let header = self.mem.malloc(ARRAY_HEADER_SIZE, abi.rtid_of(ty)?)?;
                self.write_u32s(
                    header,
                    &[buffer.to_u32(), buffer.to_u32(), byte_len, count as u32],
                )?;
                Ok(header)
            }
            Shape::StaticArray(elem) => {
                let count = r.read_count()?;
                let byte_len = checked_len(count, elem.own_size())?;
                let buffer = self.mem.malloc(byte_len, abi.rtid_of(ty)?)?;
                self.lower_elements(r, elem, buffer, count)?;
                Ok(buffer)
            }
            Shape::Map(key, value) => self.lower_hash(r, ty, key, Some(value)),
            Shape::Set(key) => self.lower_hash(r, ty, key, None),
            Shape::Object(obj) => self.lower_object(r, obj),
            Shape::JigState(class) => self.lower_jig_state(r, class),
            Shape::JigRef(name) => {
                let origin = Pointer::read(r)?;
                self.lower_jig_ref(&origin, name)
            }
        }
    }

    /// Lower a `Output`/`Lock` style object from a standalone buffer.
    pub fn lower_object_bytes(&mut self, name: &str, bytes: &[u8]) -> Result<WasmWord> {
        let abi = self.abi;
        let obj = abi
            .object(name)
            .ok_or_else(|| VmError::NotFound(alloc::format!("object {}", name)))?;
        let mut r = BufReader::new(bytes);
        let word = self.lower_object(&mut r, obj)?;
        r.finish()?;
        Ok(word)
    }

    /// Reference to a jig: its live pointer if resident, otherwise a proxy.
    pub fn lower_jig_ref(&mut self, origin: &Pointer, type_name: &str) -> Result<WasmWord> {
        if let Some(ptr) = self.residents.get(origin) {
            return Ok(*ptr);
        }
        log::trace!("[VM Lower] proxy for {} ({})", origin, type_name);
        let output = output_object_bytes(origin, origin, &Pointer::new([0u8; 32], 0));
        let output_ptr = self.lower_object_bytes("Output", &output)?;
        let proxy = self.mem.malloc(PROXY_SIZE, self.abi.rtid_by_name(type_name)?)?;
        self.write_u32s(proxy, &[output_ptr.to_u32(), 0])?;
        Ok(proxy)
    }

    /// Rebuild a persisted jig as a live instance of the class at export
    /// `class_idx`: base fields from the output header, own fields from its
    /// state.
    pub fn lower_jig(&mut self, class_idx: u32, output: &Output) -> Result<WasmWord> {
        let abi = self.abi;
        let class = abi.class_at(class_idx)?;
        let ptr = self.mem.malloc(class.size, abi.rtid_by_name(&class.name)?)?;
        self.stamp_output(class_idx, ptr, &output.origin, &output.location, &output.class_ptr)?;
        self.stamp_lock(class_idx, ptr, &output.origin, &output.lock)?;
        let mut r = BufReader::new(&output.state);
        for field in class.own_fields() {
            let word = self.lower_value(&mut r, &field.ty)?;
            self.mem
                .write_word(ptr.to_u32() + field.offset, word, field.ty.own_size())?;
        }
        r.finish()?;
        log::trace!("[VM Lower] hydrated {} at {:#x}", output.origin, ptr.to_u32());
        Ok(ptr)
    }

    /// Point the jig's `$output` field at a fresh `Output` object.
    pub fn stamp_output(
        &mut self,
        class_idx: u32,
        ptr: WasmWord,
        origin: &Pointer,
        location: &Pointer,
        class_ptr: &Pointer,
    ) -> Result<()> {
        let abi = self.abi;
        let offset = abi.class_at(class_idx)?.field("$output")?.offset;
        let output = self.lower_object_bytes("Output", &output_object_bytes(origin, location, class_ptr))?;
        self.mem.write_u32(ptr.to_ptr()? + offset, output.to_u32())
    }

    /// Point the jig's `$lock` field at a fresh `Lock` object.
    pub fn stamp_lock(&mut self, class_idx: u32, ptr: WasmWord, origin: &Pointer, lock: &Lock) -> Result<()> {
        let abi = self.abi;
        let offset = abi.class_at(class_idx)?.field("$lock")?.offset;
        let lock = self.lower_object_bytes("Lock", &lock_object_bytes(origin, lock))?;
        self.mem.write_u32(ptr.to_ptr()? + offset, lock.to_u32())
    }

    fn lower_jig_state(&mut self, r: &mut BufReader<'_>, class: &AbiClass) -> Result<WasmWord> {
        let ptr = self.mem.malloc(class.size, self.abi.rtid_by_name(&class.name)?)?;
        for field in class.fields.iter() {
            let word = self.lower_value(r, &field.ty)?;
            self.mem
                .write_word(ptr.to_u32() + field.offset, word, field.ty.own_size())?;
        }
        Ok(ptr)
    }

    fn lower_object(&mut self, r: &mut BufReader<'_>, obj: &AbiObject) -> Result<WasmWord> {
        let ptr = self.mem.malloc(obj.size, self.abi.rtid_by_name(&obj.name)?)?;
        for field in obj.fields.iter() {
            let word = self.lower_value(r, &field.ty)?;
            self.mem
                .write_word(ptr.to_u32() + field.offset, word, field.ty.own_size())?;
        }
        Ok(ptr)
    }

    fn lower_string(&mut self, r: &mut BufReader<'_>) -> Result<WasmWord> {
        let s = r.read_string()?;
        let mut utf16 = Vec::with_capacity(s.len() * 2);
        for unit in s.encode_utf16() {
            utf16.extend_from_slice(&unit.to_le_bytes());
        }
        self.alloc_bytes(&utf16, STRING_RTID)
    }

    fn lower_elements(
        &mut self,
        r: &mut BufReader<'_>,
        elem: &TypeNode,
        buffer: WasmWord,
        count: usize,
    ) -> Result<()> {
        let size = elem.own_size();
        for i in 0..count {
            let word = self.lower_value(r, elem)?;
            self.mem
                .write_word(buffer.to_u32() + i as u32 * size, word, size)?;
        }
        Ok(())
    }

    fn lower_hash(
        &mut self,
        r: &mut BufReader<'_>,
        ty: &TypeNode,
        key: &TypeNode,
        value: Option<&TypeNode>,
    ) -> Result<WasmWord> {
        let count = r.read_count()?;
        let count32 = u32::try_from(count)
            .map_err(|_| VmError::Execution(alloc::format!("{} entries is too many", count)))?;
        let entry = EntryLayout::new(key, value);
        let (bucket_count, capacity) = hash_capacity(count32);

        let buckets = self.alloc_zeroed(checked_len(bucket_count as usize, 4)?, BUF_RTID)?;
        let entries = self.alloc_zeroed(checked_len(capacity as usize, entry.size)?, BUF_RTID)?;

        let mut seen: HashSet<&[u8]> = HashSet::with_capacity(count.min(r.remaining()));
        for i in 0..count32 {
            let base = entries.to_u32() + i * entry.size;
            let key_start = r.pos();
            let key_word = self.lower_value(r, key)?;
            if !seen.insert(r.since(key_start)) {
                return Err(VmError::Execution(alloc::format!(
                    "duplicate key in {}",
                    ty.normalized_name()
                )));
            }
            self.mem
                .write_word(base + entry.key_offset, key_word, key.own_size())?;
            if let (Some(value_ty), Some(offset)) = (value, entry.value_offset) {
                let value_word = self.lower_value(r, value_ty)?;
                self.mem
                    .write_word(base + offset, value_word, value_ty.own_size())?;
            }
            let hash = self.hash_key(key, key_word)?;
            let bucket = buckets.to_u32() + (hash & (bucket_count - 1)) * 4;
            let prev = self.mem.read_u32(bucket)?;
            self.mem.write_u32(base + entry.next_offset, prev)?;
            self.mem.write_u32(bucket, base)?;
        }

        let header = self.mem.malloc(HASH_HEADER_SIZE, self.abi.rtid_of(ty)?)?;
        self.write_u32s(
            header,
            &[
                buckets.to_u32(),
                bucket_count - 1,
                entries.to_u32(),
                capacity,
                count32,
                count32,
            ],
        )?;
        Ok(header)
    }

    /// Bucket hash as the guest runtime computes it.
    fn hash_key(&self, key: &TypeNode, word: WasmWord) -> Result<u32> {
        Ok(match self.abi.shape(key)? {
            Shape::Prim(prim) => match prim.size() {
                8 => hash64(word.to_u64()),
                size => hash32(word.to_u32(), size),
            },
            Shape::String => {
                let bytes = self.mem.extract(word.to_ptr()?)?;
                hash_str(&bytes)
            }
            _ => hash32(word.to_u32(), 4),
        })
    }

    fn alloc_bytes(&mut self, bytes: &[u8], rtid: u32) -> Result<WasmWord> {
        let len = u32::try_from(bytes.len())
            .map_err(|_| VmError::Execution(alloc::format!("buffer of {} bytes", bytes.len())))?;
        let ptr = self.mem.malloc(len, rtid)?;
        self.mem.write(ptr.to_u32(), bytes)?;
        Ok(ptr)
    }

    fn alloc_zeroed(&mut self, len: u32, rtid: u32) -> Result<WasmWord> {
        let ptr = self.mem.malloc(len, rtid)?;
        self.mem.write(ptr.to_u32(), &alloc::vec![0u8; len as usize])?;
        Ok(ptr)
    }

    fn write_u32s(&mut self, ptr: WasmWord, values: &[u32]) -> Result<()> {
        let mut bytes = Vec::with_capacity(values.len() * 4);
        for v in values {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        self.mem.write(ptr.to_u32(), &bytes)
    }
}

fn read_prim(r: &mut BufReader<'_>, prim: Prim) -> Result<WasmWord> {
    Ok(match prim {
        Prim::Bool => WasmWord::from_bool(r.read_bool()?),
        Prim::U8 => WasmWord::from_u32(u32::from(r.read_u8()?)),
        Prim::U16 => WasmWord::from_u32(u32::from(r.read_u16()?)),
        Prim::U32 => WasmWord::from_u32(r.read_u32()?),
        Prim::U64 => WasmWord::from_u64(r.read_u64()?),
        Prim::I8 => WasmWord::from_i64(i64::from(r.read_i8()?)),
        Prim::I16 => WasmWord::from_i64(i64::from(r.read_i16()?)),
        Prim::I32 => WasmWord::from_i64(i64::from(r.read_i32()?)),
        Prim::I64 => WasmWord::from_i64(r.read_i64()?),
        Prim::F32 => WasmWord::from_f32(r.read_f32()?),
        Prim::F64 => WasmWord::from_f64(r.read_f64()?),
    })
}

fn checked_len(count: usize, size: u32) -> Result<u32> {
    u32::try_from(count)
        .ok()
        .and_then(|c| c.checked_mul(size))
        .ok_or_else(|| VmError::Execution(alloc::format!("{} elements of {} bytes", count, size)))
}
