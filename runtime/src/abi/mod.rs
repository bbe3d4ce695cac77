//! Package ABI: the structural description of a package's public types.
//!
//! The compiler emits an [`Abi`] document next to each module. Everything the
//! host knows about guest memory layouts is derived from it: class field
//! offsets, method numbering, and the runtime-type ids the guest assigned to
//! each concrete type.

pub mod access;
pub mod class;

use alloc::string::String;
use alloc::vec::Vec;

use serde::{Deserialize, Serialize};

use crate::{Result, VmError};

pub use access::{AbiAccess, Prim, Shape};
pub use class::{AbiClass, AbiMethod, AbiObject, FieldLayout};

/// Current ABI document version.
pub const ABI_VERSION: u16 = 1;

/// Recursive type reference: `Map<string, Array<u8>>`, `Badge | null`, …
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TypeNode {
    pub name: String,
    pub nullable: bool,
    pub args: Vec<TypeNode>,
}

impl TypeNode {
    pub fn new(name: &str) -> Self {
        TypeNode {
            name: String::from(name),
            nullable: false,
            args: Vec::new(),
        }
    }

    pub fn with_args(name: &str, args: Vec<TypeNode>) -> Self {
        TypeNode {
            name: String::from(name),
            nullable: false,
            args,
        }
    }

    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// The same type with the nullable flag cleared.
    pub fn non_null(&self) -> TypeNode {
        TypeNode {
            nullable: false,
            ..self.clone()
        }
    }

    /// Width of the value's in-memory representation. Anything that is not a
    /// primitive is a pointer.
    pub fn own_size(&self) -> u32 {
        match self.name.as_str() {
            "bool" | "u8" | "i8" => 1,
            "u16" | "i16" => 2,
            "u64" | "i64" | "f64" => 8,
            _ => 4,
        }
    }

    /// Name used for runtime-type id lookups: `Map<string,u32>`,
    /// `Array<Badge | null>`. A leading `*` is dropped.
    pub fn normalized_name(&self) -> String {
        let mut out = String::from(self.name.trim_start_matches('*'));
        if !self.args.is_empty() {
            out.push('<');
            for (i, arg) in self.args.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(&arg.normalized_name());
                if arg.nullable {
                    out.push_str(" | null");
                }
            }
            out.push('>');
        }
        out
    }

    pub fn arg(&self, idx: usize) -> Result<&TypeNode> {
        self.args.get(idx).ok_or_else(|| {
            VmError::Execution(alloc::format!(
                "type {} is missing type argument {}",
                self.name,
                idx
            ))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgNode {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeNode,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldNode {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: TypeNode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MethodKind {
    Public,
    Protected,
    Private,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodNode {
    pub kind: MethodKind,
    pub is_static: bool,
    pub name: String,
    pub args: Vec<ArgNode>,
    pub rtype: Option<TypeNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassNode {
    pub name: String,
    pub extends: Option<String>,
    pub implements: Vec<String>,
    pub fields: Vec<FieldNode>,
    pub methods: Vec<MethodNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionNode {
    pub name: String,
    pub args: Vec<ArgNode>,
    pub rtype: Option<TypeNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceNode {
    pub name: String,
    pub extends: Vec<String>,
    pub fields: Vec<FieldNode>,
    pub methods: Vec<FunctionNode>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectNode {
    pub name: String,
    pub fields: Vec<FieldNode>,
}

/// Code imported from another package.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyNode {
    pub name: String,
    pub pkg: [u8; 32],
}

/// One definition in the ABI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeDef {
    Class(ClassNode),
    Function(FunctionNode),
    Interface(InterfaceNode),
    Object(ObjectNode),
    ProxyClass(ProxyNode),
    ProxyFunction(ProxyNode),
    ProxyInterface(ProxyNode),
}

impl CodeDef {
    pub fn name(&self) -> &str {
        match self {
            CodeDef::Class(n) => &n.name,
            CodeDef::Function(n) => &n.name,
            CodeDef::Interface(n) => &n.name,
            CodeDef::Object(n) => &n.name,
            CodeDef::ProxyClass(n) | CodeDef::ProxyFunction(n) | CodeDef::ProxyInterface(n) => {
                &n.name
            }
        }
    }

    /// Whether values of this type are jigs (passed by origin).
    pub fn is_jig_like(&self) -> bool {
        matches!(
            self,
            CodeDef::Class(_)
                | CodeDef::Interface(_)
                | CodeDef::ProxyClass(_)
                | CodeDef::ProxyInterface(_)
        )
    }
}

/// Runtime-type id assigned by the compiler to a concrete type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeIdNode {
    pub id: u32,
    pub name: String,
}

/// ABI document as emitted by the compiler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Abi {
    pub version: u16,
    /// Indices into `defs` of exported code, in export order.
    pub exports: Vec<u32>,
    /// Indices into `defs` of imported code.
    pub imports: Vec<u32>,
    pub defs: Vec<CodeDef>,
    pub type_ids: Vec<TypeIdNode>,
}

impl Abi {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        postcard::to_allocvec(self)
            .map_err(|e| VmError::Codec(alloc::format!("abi encode: {}", e)))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let abi: Abi = postcard::from_bytes(bytes)
            .map_err(|e| VmError::Codec(alloc::format!("abi decode: {}", e)))?;
        if abi.version != ABI_VERSION {
            return Err(VmError::Codec(alloc::format!(
                "unsupported abi version {}",
                abi.version
            )));
        }
        Ok(abi)
    }
}
