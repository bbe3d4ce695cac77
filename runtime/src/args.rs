//! Instruction argument buffers.
//!
//! An argument buffer starts with a ULEB count of u8 positions that are
//! passed *by reference*: at those positions the buffer holds a u16
//! statement index instead of a value. Jig-typed leaves anywhere in the
//! value tree are always statement indexes. [`ArgsResolver`] replaces every
//! index with the lifted bytes of that statement, producing a plain buffer
//! the lowerer can consume.

use alloc::vec::Vec;

use crate::abi::{AbiAccess, Shape, TypeNode};
use crate::codec::{BufReader, BufWriter};
use crate::{Result, VmError};

/// Source of statement values for the resolver.
pub trait StatementSource {
    /// Serialized value of statement `idx`, shaped as type `ty`.
    fn statement_bytes(&self, idx: u16, ty: &TypeNode) -> Result<Vec<u8>>;
}

/// Rewrites argument buffers, inlining referenced statements.
pub struct ArgsResolver<'a> {
    abi: &'a AbiAccess,
    source: &'a dyn StatementSource,
}

impl<'a> ArgsResolver<'a> {
    pub fn new(abi: &'a AbiAccess, source: &'a dyn StatementSource) -> Self {
        ArgsResolver { abi, source }
    }

    pub fn resolve(&self, bytes: &[u8], types: &[TypeNode]) -> Result<Vec<u8>> {
        let mut r = BufReader::new(bytes);
        let ref_count = r.read_count()?;
        let mut refs = Vec::with_capacity(ref_count.min(types.len()));
        for _ in 0..ref_count {
            let pos = r.read_u8()?;
            if pos as usize >= types.len() {
                return Err(VmError::Execution(alloc::format!(
                    "reference position {} but only {} arguments",
                    pos,
                    types.len()
                )));
            }
            refs.push(pos);
        }

        let mut w = BufWriter::new();
        for (pos, ty) in types.iter().enumerate() {
            if refs.contains(&(pos as u8)) {
                let idx = r.read_u16()?;
                w.write_fixed_bytes(&self.source.statement_bytes(idx, ty)?);
            } else {
                self.copy_value(&mut r, &mut w, ty)?;
            }
        }
        r.finish()?;
        Ok(w.into_bytes())
    }

    /// Copy one literal value, following the lowerer's grammar.
    fn copy_value(&self, r: &mut BufReader<'_>, w: &mut BufWriter, ty: &TypeNode) -> Result<()> {
        if ty.nullable {
            let flag = r.read_u8()?;
            w.write_u8(flag);
            if flag == 0 {
                return Ok(());
            }
        }
        match self.abi.shape(ty)? {
            Shape::Prim(prim) => {
                w.write_fixed_bytes(r.read_fixed_bytes(prim.size() as usize)?);
            }
            Shape::String | Shape::ArrayBuffer | Shape::TypedArray(_) => {
                w.write_bytes(r.read_bytes()?);
            }
            Shape::Array(elem) | Shape::StaticArray(elem) | Shape::Set(elem) => {
                let count = r.read_count()?;
                w.write_uleb(count as u64);
                for _ in 0..count {
                    self.copy_value(r, w, elem)?;
                }
            }
            Shape::Map(key, value) => {
                let count = r.read_count()?;
                w.write_uleb(count as u64);
                for _ in 0..count {
                    self.copy_value(r, w, key)?;
                    self.copy_value(r, w, value)?;
                }
            }
            Shape::Object(obj) => {
                for field in obj.fields.iter() {
                    self.copy_value(r, w, &field.ty)?;
                }
            }
            Shape::JigState(class) => {
                for field in class.fields.iter() {
                    self.copy_value(r, w, &field.ty)?;
                }
            }
            Shape::JigRef(_) => {
                let idx = r.read_u16()?;
                w.write_fixed_bytes(&self.source.statement_bytes(idx, &ty.non_null())?);
            }
        }
        Ok(())
    }
}

/// Builder for argument buffers.
#[derive(Debug, Default, Clone)]
pub struct ArgsWriter {
    refs: Vec<u8>,
    body: BufWriter,
    pos: u8,
}

impl ArgsWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pass statement `idx` by reference at the next position.
    pub fn reference(&mut self, idx: u16) -> &mut Self {
        self.refs.push(self.pos);
        self.body.write_u16(idx);
        self.pos += 1;
        self
    }

    /// Write a literal value at the next position.
    pub fn value(&mut self, f: impl FnOnce(&mut BufWriter)) -> &mut Self {
        f(&mut self.body);
        self.pos += 1;
        self
    }

    /// A jig-typed literal: the statement index holding the jig.
    pub fn jig(&mut self, idx: u16) -> &mut Self {
        self.value(|w| {
            w.write_u16(idx);
        })
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.value(|w| {
            w.write_u32(v);
        })
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.value(|w| {
            w.write_u64(v);
        })
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.value(|w| {
            w.write_string(s);
        })
    }

    /// An `Array<string>` or `StaticArray<string>` literal.
    pub fn strings(&mut self, items: &[&str]) -> &mut Self {
        self.value(|w| {
            w.write_uleb(items.len() as u64);
            for s in items {
                w.write_string(s);
            }
        })
    }

    pub fn build(&self) -> Vec<u8> {
        let mut w = BufWriter::new();
        w.write_uleb(self.refs.len() as u64);
        w.write_fixed_bytes(&self.refs);
        w.write_fixed_bytes(self.body.as_slice());
        w.into_bytes()
    }
}
