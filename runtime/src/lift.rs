//! Value lifting: guest memory → serialized bytes.
//!
//! The exact inverse of [`crate::lower`]. Offsets and entry sizes are
//! recomputed from the ABI, so the lifter can walk objects the guest built
//! itself.

use alloc::string::String;
use alloc::vec::Vec;

use crate::abi::{AbiAccess, AbiClass, Prim, Shape, TypeNode};
use crate::codec::BufWriter;
use crate::layout::{EntryLayout, EMPTY_TAG, HASH_ENTRIES_OFFSET};
use crate::memory::{GuestMemory, WasmWord};
use crate::output::Pointer;
use crate::{Result, VmError};

/// Type-directed decoder out of one guest memory.
pub struct Lifter<'a> {
    abi: &'a AbiAccess,
    mem: &'a dyn GuestMemory,
}

impl<'a> Lifter<'a> {
    pub fn new(abi: &'a AbiAccess, mem: &'a dyn GuestMemory) -> Self {
        Lifter { abi, mem }
    }

    /// Serialize the value `word` of type `ty`.
    pub fn lift(&self, ty: &TypeNode, word: WasmWord) -> Result<Vec<u8>> {
        let mut w = BufWriter::new();
        self.lift_value(&mut w, ty, word)?;
        Ok(w.into_bytes())
    }

    /// Persisted state of a jig: its own fields, base fields skipped.
    pub fn lift_state(&self, class: &AbiClass, ptr: WasmWord) -> Result<Vec<u8>> {
        let ptr = non_null(ptr, &class.name)?;
        let mut w = BufWriter::new();
        for field in class.own_fields() {
            let word = self.mem.read_word(ptr + field.offset, field.ty.own_size())?;
            self.lift_value(&mut w, &field.ty, word)?;
        }
        Ok(w.into_bytes())
    }

    /// Read one raw field of a jig instance.
    pub fn read_field(&self, class: &AbiClass, ptr: WasmWord, name: &str) -> Result<WasmWord> {
        let ptr = non_null(ptr, &class.name)?;
        let field = class.field(name)?;
        self.mem.read_word(ptr + field.offset, field.ty.own_size())
    }

    /// Origin of a jig or proxy, read through its `$output` object.
    pub fn lift_origin(&self, ptr: WasmWord) -> Result<Pointer> {
        let ptr = non_null(ptr, "jig")?;
        let output = self.mem.read_u32(ptr)?;
        if output == 0 {
            return Err(VmError::Execution(alloc::format!(
                "jig at {:#x} has no output header",
                ptr
            )));
        }
        let origin_field = self
            .abi
            .object("Output")
            .and_then(|o| o.field("origin"))
            .map(|f| f.offset)
            .unwrap_or(0);
        let origin_buf = self.mem.read_u32(output + origin_field)?;
        Pointer::from_bytes(&self.mem.extract(origin_buf)?)
    }

    pub fn lift_value(&self, w: &mut BufWriter, ty: &TypeNode, word: WasmWord) -> Result<()> {
        if ty.nullable {
            if word.is_null() {
                w.write_u8(0);
                return Ok(());
            }
            w.write_u8(1);
        }
        match self.abi.shape(ty)? {
            Shape::Prim(prim) => write_prim(w, prim, word),
            Shape::String => {
                let bytes = self.mem.extract(non_null(word, &ty.name)?)?;
                w.write_string(&decode_utf16(&bytes)?);
            }
            Shape::ArrayBuffer => {
                w.write_bytes(&self.mem.extract(non_null(word, &ty.name)?)?);
            }
            Shape::TypedArray(_) => {
                let ptr = non_null(word, &ty.name)?;
                let data_start = self.mem.read_u32(ptr + 4)?;
                let byte_len = self.mem.read_u32(ptr + 8)?;
                w.write_bytes(self.mem.read(data_start, byte_len)?);
            }
            Shape::Array(elem) => {
                let ptr = non_null(word, &ty.name)?;
                let data_start = self.mem.read_u32(ptr + 4)?;
                let length = self.mem.read_u32(ptr + 12)?;
                self.lift_elements(w, elem, data_start, length)?;
            }
            Shape::StaticArray(elem) => {
                let ptr = non_null(word, &ty.name)?;
                let (_, byte_len) = self.mem.header(ptr)?;
                self.lift_elements(w, elem, ptr, byte_len / elem.own_size())?;
            }
            Shape::Map(key, value) => self.lift_hash(w, word, ty, key, Some(value))?,
            Shape::Set(key) => self.lift_hash(w, word, ty, key, None)?,
            Shape::Object(obj) => {
                let ptr = non_null(word, &ty.name)?;
                for field in obj.fields.iter() {
                    let fw = self.mem.read_word(ptr + field.offset, field.ty.own_size())?;
                    self.lift_value(w, &field.ty, fw)?;
                }
            }
            Shape::JigState(class) => {
                let ptr = non_null(word, &ty.name)?;
                for field in class.fields.iter() {
                    let fw = self.mem.read_word(ptr + field.offset, field.ty.own_size())?;
                    self.lift_value(w, &field.ty, fw)?;
                }
            }
            Shape::JigRef(_) => {
                let origin = self.lift_origin(word)?;
                origin.write(w);
            }
        }
        Ok(())
    }

    fn lift_elements(&self, w: &mut BufWriter, elem: &TypeNode, start: u32, count: u32) -> Result<()> {
        let size = elem.own_size();
        w.write_uleb(u64::from(count));
        for i in 0..count {
            let offset = i
                .checked_mul(size)
                .and_then(|o| o.checked_add(start))
                .ok_or_else(|| VmError::Execution(String::from("array extends past memory")))?;
            let word = self.mem.read_word(offset, size)?;
            self.lift_value(w, elem, word)?;
        }
        Ok(())
    }

    fn lift_hash(
        &self,
        w: &mut BufWriter,
        word: WasmWord,
        ty: &TypeNode,
        key: &TypeNode,
        value: Option<&TypeNode>,
    ) -> Result<()> {
        let ptr = non_null(word, &ty.name)?;
        let header = self.mem.read(ptr + HASH_ENTRIES_OFFSET, 16)?;
        let field = |i: usize| WasmWord::from_le_bytes(&header[i * 4..i * 4 + 4]).to_u32();
        let (entries, offset, count) = (field(0), field(2), field(3));

        let layout = EntryLayout::new(key, value);
        w.write_uleb(u64::from(count));
        let mut seen = 0u32;
        for i in 0..offset {
            let base = entries + i * layout.size;
            let next = self.mem.read_u32(base + layout.next_offset)?;
            if next & EMPTY_TAG != 0 {
                continue;
            }
            let kw = self.mem.read_word(base + layout.key_offset, key.own_size())?;
            self.lift_value(w, key, kw)?;
            if let (Some(value_ty), Some(value_offset)) = (value, layout.value_offset) {
                let vw = self.mem.read_word(base + value_offset, value_ty.own_size())?;
                self.lift_value(w, value_ty, vw)?;
            }
            seen += 1;
        }
        if seen != count {
            return Err(VmError::Execution(alloc::format!(
                "{} lists {} entries but {} are live",
                ty.normalized_name(),
                count,
                seen
            )));
        }
        Ok(())
    }
}

fn non_null(word: WasmWord, what: &str) -> Result<u32> {
    let ptr = word.to_ptr()?;
    if ptr == 0 {
        return Err(VmError::Execution(alloc::format!(
            "null pointer for non-nullable {}",
            what
        )));
    }
    Ok(ptr)
}

fn write_prim(w: &mut BufWriter, prim: Prim, word: WasmWord) {
    match prim {
        Prim::Bool => w.write_bool(word.to_bool()),
        Prim::U8 => w.write_u8(word.to_u32() as u8),
        Prim::U16 => w.write_u16(word.to_u32() as u16),
        Prim::U32 => w.write_u32(word.to_u32()),
        Prim::U64 => w.write_u64(word.to_u64()),
        Prim::I8 => w.write_i8(word.to_u32() as u8 as i8),
        Prim::I16 => w.write_i16(word.to_u32() as u16 as i16),
        Prim::I32 => w.write_i32(word.to_i32()),
        Prim::I64 => w.write_i64(word.to_i64()),
        Prim::F32 => w.write_f32(word.to_f32()),
        Prim::F64 => w.write_f64(word.to_f64()),
    };
}

fn decode_utf16(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(VmError::Execution(alloc::format!(
            "string of odd byte length {}",
            bytes.len()
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|_| VmError::Execution(String::from("string is not valid UTF-16")))
}
