//! Snapshot storage.
//!
//! The interpreter only reads through [`Storage`]; writes happen once, in
//! [`Storage::persist`], after a transaction finalized.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;
use spin::Mutex;

use crate::output::{to_hex, Output, Pointer};
use crate::package::Package;
use crate::result::ExecutionResult;
use crate::{PackageId, Result, VmError};

/// Read view of prior state plus the commit hook.
pub trait Storage {
    fn output_by_id(&self, id: &[u8; 32]) -> Result<Output>;
    /// Latest output of the jig with this origin.
    fn output_by_origin(&self, origin: &Pointer) -> Result<Output>;
    fn package_by_id(&self, id: &PackageId) -> Result<Package>;
    fn persist(&self, result: &ExecutionResult) -> Result<()>;
}

#[derive(Default)]
struct Tables {
    outputs: HashMap<[u8; 32], Output>,
    /// Origin → id of the latest output.
    latest: HashMap<Pointer, [u8; 32]>,
    packages: BTreeMap<PackageId, Package>,
}

/// In-memory storage backend.
#[derive(Default)]
pub struct MemoryStorage {
    tables: Mutex<Tables>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an output as the latest location of its jig.
    pub fn add_output(&self, output: Output) {
        let mut tables = self.tables.lock();
        let id = output.id();
        tables.latest.insert(output.origin, id);
        tables.outputs.insert(id, output);
    }

    pub fn add_package(&self, package: Package) {
        log::debug!("[VM Storage] package {}", to_hex(&package.id));
        self.tables.lock().packages.insert(package.id, package);
    }

    pub fn has_package(&self, id: &PackageId) -> bool {
        self.tables.lock().packages.contains_key(id)
    }

    /// Whether `output` is still the latest location of its jig.
    pub fn is_latest(&self, output: &Output) -> bool {
        self.tables.lock().latest.get(&output.origin) == Some(&output.id())
    }

    pub fn output_count(&self) -> usize {
        self.tables.lock().outputs.len()
    }
}

impl Storage for MemoryStorage {
    fn output_by_id(&self, id: &[u8; 32]) -> Result<Output> {
        self.tables
            .lock()
            .outputs
            .get(id)
            .cloned()
            .ok_or_else(|| VmError::NotFound(alloc::format!("output {}", to_hex(id))))
    }

    fn output_by_origin(&self, origin: &Pointer) -> Result<Output> {
        let tables = self.tables.lock();
        tables
            .latest
            .get(origin)
            .and_then(|id| tables.outputs.get(id))
            .cloned()
            .ok_or_else(|| VmError::NotFound(alloc::format!("jig with origin {}", origin)))
    }

    fn package_by_id(&self, id: &PackageId) -> Result<Package> {
        self.tables
            .lock()
            .packages
            .get(id)
            .cloned()
            .ok_or_else(|| VmError::NotFound(alloc::format!("package {}", to_hex(id))))
    }

    fn persist(&self, result: &ExecutionResult) -> Result<()> {
        let mut tables = self.tables.lock();
        let stale: Vec<String> = result
            .spends
            .iter()
            .chain(result.reads.iter())
            .filter(|o| tables.latest.get(&o.origin) != Some(&o.id()))
            .map(|o| alloc::format!("{}", o.origin))
            .collect();
        if !stale.is_empty() {
            log::warn!("[VM Storage] rejected tx {}: stale inputs", to_hex(&result.tx_hash));
            return Err(VmError::Execution(alloc::format!(
                "double spend: outputs of {} are no longer current",
                stale.join(", ")
            )));
        }

        for output in result.outputs.iter() {
            let id = output.id();
            tables.latest.insert(output.origin, id);
            tables.outputs.insert(id, output.clone());
        }
        for package in result.deploys.iter() {
            tables.packages.insert(package.id, package.clone());
        }
        log::debug!(
            "[VM Storage] persisted tx {}: {} outputs, {} spends",
            to_hex(&result.tx_hash),
            result.outputs.len(),
            result.spends.len()
        );
        Ok(())
    }
}
