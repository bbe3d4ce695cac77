//! Packages and the compiler collaborator.
//!
//! A package is immutable once built: its id is a hash over the entry list
//! and source map it was compiled from, so two deploys of the same sources
//! land on the same id.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use crate::abi::Abi;
use crate::codec::BufWriter;
use crate::{PackageId, Result};

/// Output of a compiler run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPackage {
    pub wasm: Vec<u8>,
    pub abi: Abi,
    pub docs: BTreeMap<String, String>,
}

/// Turns sources into a guest module and its ABI.
pub trait Compiler {
    fn compile(&self, entries: &[String], sources: &BTreeMap<String, String>) -> Result<CompiledPackage>;
}

/// An installed or in-flight package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Package {
    pub id: PackageId,
    pub entries: Vec<String>,
    pub sources: BTreeMap<String, String>,
    pub wasm: Vec<u8>,
    pub abi: Abi,
    pub docs: BTreeMap<String, String>,
}

impl Package {
    pub fn new(entries: Vec<String>, sources: BTreeMap<String, String>, compiled: CompiledPackage) -> Self {
        Package {
            id: package_id(&entries, &sources),
            entries,
            sources,
            wasm: compiled.wasm,
            abi: compiled.abi,
            docs: compiled.docs,
        }
    }

    /// Compile and wrap in one step.
    pub fn build(
        compiler: &dyn Compiler,
        entries: Vec<String>,
        sources: BTreeMap<String, String>,
    ) -> Result<Self> {
        let compiled = compiler.compile(&entries, &sources)?;
        Ok(Self::new(entries, sources, compiled))
    }
}

/// Deterministic package id: blake3 over the sorted entries followed by the
/// sources sorted by file name.
pub fn package_id(entries: &[String], sources: &BTreeMap<String, String>) -> PackageId {
    let mut sorted: Vec<&str> = entries.iter().map(String::as_str).collect();
    sorted.sort_unstable();

    let mut w = BufWriter::new();
    w.write_uleb(sorted.len() as u64);
    for entry in sorted {
        w.write_string(entry);
    }
    w.write_uleb(sources.len() as u64);
    for (name, body) in sources {
        w.write_string(name).write_string(body);
    }
    *blake3::hash(w.as_slice()).as_bytes()
}
