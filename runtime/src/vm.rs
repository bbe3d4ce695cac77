//! The VM facade: one storage, compiler and verifier, many transactions.

use alloc::collections::BTreeMap;
use alloc::string::String;

use crate::execution::TxExecution;
use crate::instruction::Tx;
use crate::output::{to_hex, Output};
use crate::package::{Compiler, Package};
use crate::result::ExecutionResult;
use crate::signature::SignatureVerifier;
use crate::storage::MemoryStorage;
use crate::storage::Storage;
use crate::{PackageId, Result, VmConfig};

pub struct Vm<C, V> {
    storage: MemoryStorage,
    compiler: C,
    verifier: V,
    config: VmConfig,
}

impl<C: Compiler, V: SignatureVerifier> Vm<C, V> {
    pub fn new(compiler: C, verifier: V, config: VmConfig) -> Self {
        Vm {
            storage: MemoryStorage::new(),
            compiler,
            verifier,
            config,
        }
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut VmConfig {
        &mut self.config
    }

    pub fn storage(&self) -> &MemoryStorage {
        &self.storage
    }

    /// Run `tx` and persist its result. Nothing is stored on failure.
    pub fn execute(&self, tx: &Tx) -> Result<ExecutionResult> {
        let result = self.dry_run(tx)?;
        self.storage.persist(&result)?;
        Ok(result)
    }

    /// Run `tx` against current state without persisting anything.
    pub fn dry_run(&self, tx: &Tx) -> Result<ExecutionResult> {
        TxExecution::new(&self.storage, &self.compiler, &self.verifier, &self.config).run(tx)
    }

    /// Compile and install a package outside any transaction.
    pub fn deploy_package(&self, entries: &[&str], sources: &[(&str, &str)]) -> Result<PackageId> {
        let entries = entries.iter().map(|e| String::from(*e)).collect();
        let sources: BTreeMap<String, String> = sources
            .iter()
            .map(|(k, v)| (String::from(*k), String::from(*v)))
            .collect();
        let package = Package::build(&self.compiler, entries, sources)?;
        let id = package.id;
        log::debug!("[VM] installed package {}", to_hex(&id));
        self.storage.add_package(package);
        Ok(id)
    }

    /// Seed storage with an output, e.g. genesis coins.
    pub fn add_output(&self, output: Output) -> [u8; 32] {
        let id = output.id();
        self.storage.add_output(output);
        id
    }

    pub fn output(&self, id: &[u8; 32]) -> Result<Output> {
        self.storage.output_by_id(id)
    }
}
