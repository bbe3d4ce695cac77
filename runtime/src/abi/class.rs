//! Class and object layouts.
//!
//! Fields are laid out in declaration order, each aligned to its own size.
//! A class is preceded by the two base fields every jig carries (`$output`,
//! `$lock`) and then its parent's fields.

use alloc::string::String;
use alloc::vec::Vec;

use super::{ArgNode, FieldNode, MethodKind, TypeNode};
use crate::memory::align_to;
use crate::{Result, VmError};

/// Number of base fields at the start of every jig.
pub const BASE_FIELD_COUNT: usize = 2;

/// A field with its computed byte offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLayout {
    pub name: String,
    pub ty: TypeNode,
    pub offset: u32,
}

/// Compute offsets for `fields`; returns the layout and the instance size
/// (last offset plus last field size).
pub fn layout_fields<'a, I>(fields: I) -> (Vec<FieldLayout>, u32)
where
    I: IntoIterator<Item = &'a FieldNode>,
{
    let mut out = Vec::new();
    let mut cursor = 0u32;
    let mut size = 0u32;
    for field in fields {
        let width = field.ty.own_size();
        let offset = align_to(cursor, width);
        out.push(FieldLayout {
            name: field.name.clone(),
            ty: field.ty.clone(),
            offset,
        });
        cursor = offset + width;
        size = cursor;
    }
    (out, size)
}

/// The fields injected at the start of every jig.
pub fn base_fields() -> [FieldNode; BASE_FIELD_COUNT] {
    [
        FieldNode {
            name: String::from("$output"),
            ty: TypeNode::new("Output"),
        },
        FieldNode {
            name: String::from("$lock"),
            ty: TypeNode::new("Lock"),
        },
    ]
}

/// Plain, field-only object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiObject {
    pub name: String,
    pub fields: Vec<FieldLayout>,
    pub size: u32,
}

impl AbiObject {
    pub fn new(name: &str, fields: &[FieldNode]) -> Self {
        let (fields, size) = layout_fields(fields);
        AbiObject {
            name: String::from(name),
            fields,
            size,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A callable method with its position in the class's method table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiMethod {
    pub idx: u16,
    pub class_name: String,
    pub name: String,
    pub kind: MethodKind,
    pub is_static: bool,
    pub args: Vec<ArgNode>,
    pub rtype: Option<TypeNode>,
}

impl AbiMethod {
    pub fn is_constructor(&self) -> bool {
        self.name == "constructor"
    }

    /// Name of the guest export implementing this method.
    pub fn export_name(&self) -> String {
        alloc::format!("__{}_{}", self.class_name, self.name)
    }

    pub fn arg_types(&self) -> Vec<TypeNode> {
        self.args.iter().map(|a| a.ty.clone()).collect()
    }

    /// Return type; constructors return the jig itself.
    pub fn return_type(&self) -> Option<TypeNode> {
        if self.is_constructor() {
            Some(TypeNode::new(&self.class_name))
        } else {
            self.rtype.clone()
        }
    }
}

/// Exported class with full layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AbiClass {
    /// Position in the package's export list.
    pub idx: u32,
    pub name: String,
    pub parent: Option<String>,
    /// All fields, base fields first, then inherited, then own.
    pub fields: Vec<FieldLayout>,
    /// Number of fields declared by parents (excluding base fields).
    pub inherited: usize,
    pub size: u32,
    pub constructor: AbiMethod,
    /// Non-constructor methods, parents first.
    pub methods: Vec<AbiMethod>,
}

impl AbiClass {
    /// Fields persisted as jig state: everything after the base fields.
    pub fn own_fields(&self) -> &[FieldLayout] {
        &self.fields[BASE_FIELD_COUNT..]
    }

    pub fn field(&self, name: &str) -> Result<&FieldLayout> {
        self.fields.iter().find(|f| f.name == name).ok_or_else(|| {
            VmError::NotFound(alloc::format!("field {} on class {}", name, self.name))
        })
    }

    pub fn method_at(&self, idx: u16) -> Result<&AbiMethod> {
        self.methods.get(idx as usize).ok_or_else(|| {
            VmError::NotFound(alloc::format!("method #{} on class {}", idx, self.name))
        })
    }

    pub fn method_by_name(&self, name: &str) -> Result<&AbiMethod> {
        self.methods.iter().find(|m| m.name == name).ok_or_else(|| {
            VmError::NotFound(alloc::format!("method {} on class {}", name, self.name))
        })
    }
}
