//! The state transition produced by a finished transaction.

use alloc::vec::Vec;

use crate::output::Output;
use crate::package::Package;

/// Everything a storage backend needs to persist one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecutionResult {
    pub tx_hash: [u8; 32],
    /// New outputs, in the order of their location index.
    pub outputs: Vec<Output>,
    /// Prior outputs consumed by this transaction.
    pub spends: Vec<Output>,
    /// Prior outputs read but left untouched.
    pub reads: Vec<Output>,
    /// Packages deployed by this transaction.
    pub deploys: Vec<Package>,
}

impl ExecutionResult {
    pub fn output_by_origin(&self, origin: &crate::Pointer) -> Option<&Output> {
        self.outputs.iter().find(|o| &o.origin == origin)
    }

    pub fn spent_ids(&self) -> Vec<[u8; 32]> {
        self.spends.iter().map(Output::id).collect()
    }
}
