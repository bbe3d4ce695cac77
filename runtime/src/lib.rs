//! JigVM Runtime
//!
//! This crate executes transactions against WebAssembly guest packages whose
//! exported classes are instantiated as *jigs*: stateful objects with a
//! permanent origin, an authorization lock, and a content-addressed output
//! every time their state is committed.
//!
//! The host never shares a pointer with the guest. Values cross the boundary
//! as flat serialized buffers which are *lowered* into the guest's own object
//! layout and *lifted* back out of it, driven purely by the package ABI.
//!
//! # Architecture
//!
//! - `codec`: little-endian/ULEB128 wire reader and writer
//! - `output`: pointers, addresses and the persisted `Output`
//! - `lock`: jig locks and the authorization state machine
//! - `abi`: package type descriptors, class layouts, runtime-type ids
//! - `memory` / `layout`: memory words, guest memory trait, object layouts
//! - `lower` / `lift`: type-directed marshaling in both directions
//! - `args`: argument buffers with references to earlier statements
//! - `instruction`: opcodes, instructions, transactions and sighashes
//! - `engine` / `container` / `host`: wasmi backend, module containers and host imports
//! - `statement` / `jig` / `execution`: the transaction interpreter
//! - `result` / `package` / `storage` / `signature`: collaborators and results
//! - `vm`: the facade tying a storage, compiler and verifier together

extern crate alloc;

pub mod abi;
pub mod args;
pub mod codec;
pub mod container;
pub mod engine;
pub mod execution;
pub mod host;
pub mod instruction;
pub mod jig;
pub mod layout;
pub mod lift;
pub mod lock;
pub mod lower;
pub mod memory;
pub mod output;
pub mod package;
pub mod result;
pub mod signature;
pub mod statement;
pub mod storage;
pub mod vm;

use alloc::boxed::Box;
use alloc::string::String;

pub use execution::TxExecution;
pub use instruction::{Instruction, OpCode, Tx};
pub use lock::Lock;
pub use output::{Address, Output, Pointer};
pub use result::ExecutionResult;
pub use vm::Vm;

/// Package identifier: a content hash over entries and sources.
pub type PackageId = [u8; 32];

/// Runtime error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Bad reference, type mismatch, guest trap or memory violation.
    #[error("execution error: {0}")]
    Execution(String),
    /// A lock or signature check failed.
    #[error("auth error: {0}")]
    Auth(String),
    /// Unknown package, output, method, field or type.
    #[error("not found: {0}")]
    NotFound(String),
    /// Private or protected member invoked from outside its package.
    #[error("permission error: {0}")]
    Permission(String),
    /// Malformed wire input.
    #[error("codec error: {0}")]
    Codec(String),
    /// Failure while executing a transaction instruction.
    #[error("instruction {index} ({opcode:?}) failed: {source}")]
    Instruction {
        index: usize,
        opcode: OpCode,
        #[source]
        source: Box<VmError>,
    },
}

impl VmError {
    /// The underlying error, with instruction context stripped.
    pub fn root(&self) -> &VmError {
        match self {
            VmError::Instruction { source, .. } => source.root(),
            other => other,
        }
    }

    /// Index of the failing instruction, if known.
    pub fn instruction_index(&self) -> Option<usize> {
        match self {
            VmError::Instruction { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_auth(&self) -> bool {
        matches!(self.root(), VmError::Auth(_))
    }

    pub fn is_execution(&self) -> bool {
        matches!(self.root(), VmError::Execution(_) | VmError::Codec(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), VmError::NotFound(_))
    }

    pub fn is_permission(&self) -> bool {
        matches!(self.root(), VmError::Permission(_))
    }

    pub(crate) fn at(self, index: usize, opcode: OpCode) -> VmError {
        match self {
            err @ VmError::Instruction { .. } => err,
            other => VmError::Instruction {
                index,
                opcode,
                source: Box::new(other),
            },
        }
    }
}

/// Crate-wide result alias.
pub type Result<T> = core::result::Result<T, VmError>;

/// VM configuration.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Minimum amount a transaction must fund before it can finalize.
    pub min_fund_amount: u64,
    /// Package that holds the built-in `Coin` class at export index 0.
    pub coin_package: PackageId,
    /// Maximum number of instructions accepted in one transaction.
    pub max_instructions: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        VmConfig {
            min_fund_amount: 100,
            coin_package: [0u8; 32],
            max_instructions: 1024,
        }
    }
}

impl VmConfig {
    /// Class pointer of the built-in coin.
    pub fn coin_class(&self) -> Pointer {
        Pointer::new(self.coin_package, 0)
    }
}
