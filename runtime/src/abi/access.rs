//! Indexed view over an [`Abi`].
//!
//! `AbiAccess` precomputes class layouts and method tables, injects the
//! well-known objects every package relies on, and classifies any
//! [`TypeNode`] into the [`Shape`] the marshaling code dispatches on.

use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;

use super::class::{base_fields, layout_fields, AbiClass, AbiMethod, AbiObject, BASE_FIELD_COUNT};
use super::{Abi, ClassNode, CodeDef, FieldNode, FunctionNode, MethodKind, ProxyNode, TypeNode};
use crate::{Result, VmError};

/// Primitive value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prim {
    Bool,
    U8,
    U16,
    U32,
    U64,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
}

impl Prim {
    pub fn from_name(name: &str) -> Option<Prim> {
        Some(match name {
            "bool" => Prim::Bool,
            "u8" => Prim::U8,
            "u16" => Prim::U16,
            "u32" | "usize" => Prim::U32,
            "u64" => Prim::U64,
            "i8" => Prim::I8,
            "i16" => Prim::I16,
            "i32" | "isize" => Prim::I32,
            "i64" => Prim::I64,
            "f32" => Prim::F32,
            "f64" => Prim::F64,
            _ => return None,
        })
    }

    pub fn size(&self) -> u32 {
        match self {
            Prim::Bool | Prim::U8 | Prim::I8 => 1,
            Prim::U16 | Prim::I16 => 2,
            Prim::U32 | Prim::I32 | Prim::F32 => 4,
            Prim::U64 | Prim::I64 | Prim::F64 => 8,
        }
    }

    fn typed_array(name: &str) -> Option<Prim> {
        Some(match name {
            "Uint8Array" => Prim::U8,
            "Uint16Array" => Prim::U16,
            "Uint32Array" => Prim::U32,
            "Uint64Array" => Prim::U64,
            "Int8Array" => Prim::I8,
            "Int16Array" => Prim::I16,
            "Int32Array" => Prim::I32,
            "Int64Array" => Prim::I64,
            "Float32Array" => Prim::F32,
            "Float64Array" => Prim::F64,
            _ => return None,
        })
    }
}

/// How a type is represented in guest memory.
#[derive(Debug, Clone, Copy)]
pub enum Shape<'a> {
    Prim(Prim),
    String,
    ArrayBuffer,
    TypedArray(Prim),
    Array(&'a TypeNode),
    StaticArray(&'a TypeNode),
    Map(&'a TypeNode, &'a TypeNode),
    Set(&'a TypeNode),
    Object(&'a AbiObject),
    /// `*Class`: the jig itself with its full state.
    JigState(&'a AbiClass),
    /// A reference to a jig, passed by origin.
    JigRef(&'a str),
}

/// Well-known objects injected into every package.
fn well_known_objects() -> [AbiObject; 2] {
    let buf = |name: &str| FieldNode {
        name: String::from(name),
        ty: TypeNode::new("ArrayBuffer"),
    };
    [
        AbiObject::new("Output", &[buf("origin"), buf("location"), buf("classPtr")]),
        AbiObject::new(
            "Lock",
            &[
                buf("origin"),
                FieldNode {
                    name: String::from("type"),
                    ty: TypeNode::new("u32"),
                },
                buf("data"),
            ],
        ),
    ]
}

/// Precomputed lookup tables over an ABI.
#[derive(Debug, Clone)]
pub struct AbiAccess {
    abi: Abi,
    classes: Vec<Option<AbiClass>>,
    objects: HashMap<String, AbiObject>,
    exports_by_name: HashMap<String, u32>,
    imports_by_name: HashMap<String, usize>,
    rtids: HashMap<String, u32>,
}

impl AbiAccess {
    pub fn new(mut abi: Abi) -> Result<Self> {
        if !abi.defs.iter().any(|d| d.name() == "Coin") {
            abi.defs.push(CodeDef::ProxyClass(ProxyNode {
                name: String::from("Coin"),
                pkg: [0u8; 32],
            }));
            abi.imports.push((abi.defs.len() - 1) as u32);
        }

        let mut exports_by_name = HashMap::new();
        for (idx, def_idx) in abi.exports.iter().enumerate() {
            let def = def_at(&abi, *def_idx)?;
            exports_by_name.insert(String::from(def.name()), idx as u32);
        }
        let mut imports_by_name = HashMap::new();
        for def_idx in abi.imports.iter() {
            let def = def_at(&abi, *def_idx)?;
            imports_by_name.insert(String::from(def.name()), *def_idx as usize);
        }

        let mut objects = HashMap::new();
        for obj in well_known_objects() {
            objects.insert(obj.name.clone(), obj);
        }
        for def in abi.defs.iter() {
            if let CodeDef::Object(node) = def {
                objects.insert(node.name.clone(), AbiObject::new(&node.name, &node.fields));
            }
        }

        let rtids = abi
            .type_ids
            .iter()
            .map(|t| (t.name.clone(), t.id))
            .collect();

        let mut access = AbiAccess {
            abi,
            classes: Vec::new(),
            objects,
            exports_by_name,
            imports_by_name,
            rtids,
        };
        let mut classes = Vec::with_capacity(access.abi.exports.len());
        for idx in 0..access.abi.exports.len() {
            let class = match access.export_at(idx as u32)? {
                CodeDef::Class(node) => Some(access.build_class(idx as u32, node)?),
                _ => None,
            };
            classes.push(class);
        }
        access.classes = classes;
        Ok(access)
    }

    pub fn abi(&self) -> &Abi {
        &self.abi
    }

    pub fn exports_len(&self) -> usize {
        self.abi.exports.len()
    }

    pub fn export_at(&self, idx: u32) -> Result<&CodeDef> {
        let def_idx = self
            .abi
            .exports
            .get(idx as usize)
            .ok_or_else(|| VmError::NotFound(alloc::format!("export #{}", idx)))?;
        def_at(&self.abi, *def_idx)
    }

    pub fn export_index(&self, name: &str) -> Option<u32> {
        self.exports_by_name.get(name).copied()
    }

    pub fn exported_by_name(&self, name: &str) -> Option<&CodeDef> {
        let idx = self.export_index(name)?;
        self.export_at(idx).ok()
    }

    pub fn imported_by_name(&self, name: &str) -> Option<&CodeDef> {
        let def_idx = self.imports_by_name.get(name)?;
        self.abi.defs.get(*def_idx)
    }

    pub fn class_at(&self, idx: u32) -> Result<&AbiClass> {
        self.classes
            .get(idx as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| VmError::NotFound(alloc::format!("class at export #{}", idx)))
    }

    pub fn class_by_name(&self, name: &str) -> Option<&AbiClass> {
        let idx = self.export_index(name)?;
        self.class_at(idx).ok()
    }

    pub fn function_at(&self, idx: u32) -> Result<&FunctionNode> {
        match self.export_at(idx)? {
            CodeDef::Function(node) => Ok(node),
            other => Err(VmError::NotFound(alloc::format!(
                "export #{} ({}) is not a function",
                idx,
                other.name()
            ))),
        }
    }

    pub fn function_by_name(&self, name: &str) -> Result<&FunctionNode> {
        match self.exported_by_name(name) {
            Some(CodeDef::Function(node)) => Ok(node),
            _ => Err(VmError::NotFound(alloc::format!("function {}", name))),
        }
    }

    /// Type names a reference to the class at export `idx` satisfies:
    /// `Jig`, then each ancestor and the class itself with its interfaces.
    pub fn hierarchy_names(&self, idx: u32) -> Result<Vec<String>> {
        let class = self.class_at(idx)?;
        let node = self
            .class_node(&class.name)
            .ok_or_else(|| VmError::NotFound(alloc::format!("jig class {}", class.name)))?;
        let mut names = alloc::vec![String::from("Jig")];
        for n in self.ancestors(node)?.into_iter().chain(core::iter::once(node)) {
            names.push(n.name.clone());
            names.extend(n.implements.iter().cloned());
        }
        Ok(names)
    }

    pub fn object(&self, name: &str) -> Option<&AbiObject> {
        self.objects.get(name)
    }

    pub fn rtid_by_name(&self, name: &str) -> Result<u32> {
        self.rtids
            .get(name)
            .copied()
            .ok_or_else(|| VmError::NotFound(alloc::format!("runtime type id for {}", name)))
    }

    pub fn rtid_of(&self, ty: &TypeNode) -> Result<u32> {
        self.rtid_by_name(&ty.normalized_name())
    }

    /// Classify a (non-nullable view of a) type.
    pub fn shape<'a>(&'a self, ty: &'a TypeNode) -> Result<Shape<'a>> {
        let name = ty.name.as_str();
        if let Some(prim) = Prim::from_name(name) {
            return Ok(Shape::Prim(prim));
        }
        if let Some(prim) = Prim::typed_array(name) {
            return Ok(Shape::TypedArray(prim));
        }
        let shape = match name {
            "string" | "String" => Shape::String,
            "ArrayBuffer" => Shape::ArrayBuffer,
            "Array" => Shape::Array(ty.arg(0)?),
            "StaticArray" => Shape::StaticArray(ty.arg(0)?),
            "Map" => Shape::Map(ty.arg(0)?, ty.arg(1)?),
            "Set" => Shape::Set(ty.arg(0)?),
            _ if name.starts_with('*') => {
                let class_name = &name[1..];
                let class = self.class_by_name(class_name).ok_or_else(|| {
                    VmError::NotFound(alloc::format!("jig class {}", class_name))
                })?;
                Shape::JigState(class)
            }
            _ => return self.compound_shape(name),
        };
        Ok(shape)
    }

    fn compound_shape<'a>(&'a self, name: &'a str) -> Result<Shape<'a>> {
        if let Some(def) = self.exported_by_name(name) {
            return match def {
                CodeDef::Object(_) => self.object_shape(name),
                CodeDef::Class(_) | CodeDef::Interface(_) => Ok(Shape::JigRef(name)),
                CodeDef::Function(_) => Err(VmError::Execution(alloc::format!(
                    "function {} cannot be used as a value",
                    name
                ))),
                _ => Err(not_implemented(name)),
            };
        }
        if let Some(def) = self.imported_by_name(name) {
            return match def {
                CodeDef::Object(_) => self.object_shape(name),
                CodeDef::ProxyClass(_) | CodeDef::ProxyInterface(_) => Ok(Shape::JigRef(name)),
                _ => Err(not_implemented(name)),
            };
        }
        self.object_shape(name)
    }

    fn object_shape<'a>(&'a self, name: &str) -> Result<Shape<'a>> {
        self.object(name)
            .map(Shape::Object)
            .ok_or_else(|| not_implemented(name))
    }

    fn class_node(&self, name: &str) -> Option<&ClassNode> {
        match self.exported_by_name(name)? {
            CodeDef::Class(node) => Some(node),
            _ => None,
        }
    }

    /// Parent chain of `node`, root first, excluding `node` itself.
    fn ancestors<'a>(&'a self, node: &'a ClassNode) -> Result<Vec<&'a ClassNode>> {
        let mut chain = Vec::new();
        let mut current = node;
        while let Some(parent) = current.extends.as_deref() {
            if parent == "Jig" {
                break;
            }
            if chain.len() > self.abi.defs.len() {
                return Err(VmError::Execution(alloc::format!(
                    "inheritance cycle through {}",
                    parent
                )));
            }
            let parent_node = self.class_node(parent).ok_or_else(|| {
                VmError::NotFound(alloc::format!("parent class {} of {}", parent, current.name))
            })?;
            chain.push(parent_node);
            current = parent_node;
        }
        chain.reverse();
        Ok(chain)
    }

    fn build_class(&self, idx: u32, node: &ClassNode) -> Result<AbiClass> {
        let ancestors = self.ancestors(node)?;

        let base = base_fields();
        let inherited: usize = ancestors.iter().map(|a| a.fields.len()).sum();
        let all_fields = base
            .iter()
            .chain(ancestors.iter().flat_map(|a| a.fields.iter()))
            .chain(node.fields.iter());
        let (fields, size) = layout_fields(all_fields);

        let mut methods: Vec<AbiMethod> = Vec::new();
        for method in ancestors
            .iter()
            .flat_map(|a| a.methods.iter())
            .chain(node.methods.iter())
            .filter(|m| m.name != "constructor")
        {
            methods.push(AbiMethod {
                idx: methods.len() as u16,
                class_name: node.name.clone(),
                name: method.name.clone(),
                kind: method.kind,
                is_static: method.is_static,
                args: method.args.clone(),
                rtype: method.rtype.clone(),
            });
        }

        let constructor = node
            .methods
            .iter()
            .find(|m| m.name == "constructor")
            .map(|m| AbiMethod {
                idx: 0,
                class_name: node.name.clone(),
                name: m.name.clone(),
                kind: m.kind,
                is_static: false,
                args: m.args.clone(),
                rtype: None,
            })
            .unwrap_or_else(|| AbiMethod {
                idx: 0,
                class_name: node.name.clone(),
                name: String::from("constructor"),
                kind: MethodKind::Public,
                is_static: false,
                args: Vec::new(),
                rtype: None,
            });

        debug_assert!(fields.len() >= BASE_FIELD_COUNT);
        Ok(AbiClass {
            idx,
            name: node.name.clone(),
            parent: node.extends.clone().filter(|p| p != "Jig"),
            fields,
            inherited,
            size,
            constructor,
            methods,
        })
    }
}

fn def_at(abi: &Abi, def_idx: u32) -> Result<&CodeDef> {
    abi.defs
        .get(def_idx as usize)
        .ok_or_else(|| VmError::Execution(alloc::format!("abi references missing def #{}", def_idx)))
}

fn not_implemented(name: &str) -> VmError {
    VmError::NotFound(alloc::format!("marshaling not implemented for type {}", name))
}
