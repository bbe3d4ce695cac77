//! The append-only statement log.

use alloc::string::String;
use alloc::vec::Vec;

use crate::abi::TypeNode;
use crate::memory::WasmWord;
use crate::output::Pointer;
use crate::{PackageId, Result, VmError};

/// What an instruction produced.
#[derive(Debug, Clone, PartialEq)]
pub enum StatementValue {
    Empty,
    Package(PackageId),
    /// A jig, identified by origin.
    Jig(Pointer),
    /// A plain value living in the memory of package `pkg`.
    Value {
        pkg: PackageId,
        ty: TypeNode,
        word: WasmWord,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub idx: u16,
    pub value: StatementValue,
}

/// Statements in execution order; statement `i` came from instruction `i`.
#[derive(Debug, Default)]
pub struct StatementLog {
    statements: Vec<Statement>,
}

impl StatementLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Index the next statement will get.
    pub fn next_idx(&self) -> Result<u16> {
        u16::try_from(self.statements.len())
            .map_err(|_| VmError::Execution(String::from("statement log is full")))
    }

    pub fn push(&mut self, value: StatementValue) -> Result<u16> {
        let idx = self.next_idx()?;
        self.statements.push(Statement { idx, value });
        Ok(idx)
    }

    /// Look up an earlier statement. References are strictly backwards, so
    /// anything not yet in the log is an error.
    pub fn get(&self, idx: u16) -> Result<&Statement> {
        self.statements.get(idx as usize).ok_or_else(|| {
            VmError::Execution(alloc::format!(
                "statement {} referenced but only {} exist",
                idx,
                self.statements.len()
            ))
        })
    }

    pub fn jig(&self, idx: u16) -> Result<Pointer> {
        match &self.get(idx)?.value {
            StatementValue::Jig(origin) => Ok(*origin),
            other => Err(VmError::Execution(alloc::format!(
                "statement {} is not a jig: {}",
                idx,
                describe(other)
            ))),
        }
    }

    pub fn package(&self, idx: u16) -> Result<PackageId> {
        match &self.get(idx)?.value {
            StatementValue::Package(id) => Ok(*id),
            other => Err(VmError::Execution(alloc::format!(
                "statement {} is not a package: {}",
                idx,
                describe(other)
            ))),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Statement> {
        self.statements.iter()
    }
}

fn describe(value: &StatementValue) -> &'static str {
    match value {
        StatementValue::Empty => "empty",
        StatementValue::Package(_) => "package",
        StatementValue::Jig(_) => "jig",
        StatementValue::Value { .. } => "value",
    }
}
