//! Test harness: a VM with both fixture packages installed, plus helpers for
//! building and signing transactions.

use alloc::vec::Vec;
use core::sync::atomic::{AtomicU32, Ordering};

use jigvm_runtime::args::ArgsWriter;
use jigvm_runtime::execution::TxExecution;
use jigvm_runtime::instruction::SIG_LEN;
use jigvm_runtime::result::ExecutionResult;
use jigvm_runtime::{Instruction, Lock, Output, PackageId, Pointer, Result, Tx, Vm, VmConfig};

use crate::fixtures::{TestCompiler, TestKey, TestVerifier, BADGE_SOURCE, COIN_SOURCE};

pub struct TestHarness {
    pub vm: Vm<TestCompiler, TestVerifier>,
    pub badge_pkg: PackageId,
    pub coin_pkg: PackageId,
    minted: AtomicU32,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_min_fund(VmConfig::default().min_fund_amount)
    }

    pub fn with_min_fund(min_fund_amount: u64) -> Self {
        let mut vm = Vm::new(TestCompiler, TestVerifier, VmConfig::default());
        let badge_pkg = deploy(&vm, BADGE_SOURCE);
        let coin_pkg = deploy(&vm, COIN_SOURCE);
        let config = vm.config_mut();
        config.coin_package = coin_pkg;
        config.min_fund_amount = min_fund_amount;
        TestHarness {
            vm,
            badge_pkg,
            coin_pkg,
            minted: AtomicU32::new(0),
        }
    }

    /// Seed a genesis coin owned by `owner`; returns its output.
    pub fn mint_coin(&self, owner: &TestKey, amount: u64) -> Output {
        let n = self.minted.fetch_add(1, Ordering::Relaxed);
        let mut seed = Vec::from(&b"genesis"[..]);
        seed.extend_from_slice(&n.to_le_bytes());
        let origin = Pointer::new(*blake3::hash(&seed).as_bytes(), 0);
        let output = Output::new(
            origin,
            origin,
            Pointer::new(self.coin_pkg, 0),
            Lock::Address(owner.address()),
            amount.to_le_bytes().to_vec(),
        );
        self.vm.add_output(output.clone());
        output
    }

    pub fn execute(&self, tx: &Tx) -> Result<ExecutionResult> {
        self.vm.execute(tx)
    }

    /// A stepwise execution over current state, for inspecting statements.
    pub fn execution(&self) -> TxExecution<'_> {
        TxExecution::new(self.vm.storage(), &TestCompiler, &TestVerifier, self.vm.config())
    }

    pub fn latest(&self, origin: &Pointer) -> Output {
        use jigvm_runtime::storage::Storage;
        match self.vm.storage().output_by_origin(origin) {
            Ok(output) => output,
            Err(err) => panic!("no output for {}: {}", origin, err),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

fn deploy(vm: &Vm<TestCompiler, TestVerifier>, entry: &str) -> PackageId {
    match vm.deploy_package(&[entry], &[(entry, "// fixture")]) {
        Ok(id) => id,
        Err(err) => panic!("deploying {} failed: {}", entry, err),
    }
}

/// Append SIGN instructions for every key. Each SIGN covers the whole
/// transaction, so all of them are added before any is filled in.
pub fn sign_all(tx: &mut Tx, keys: &[&TestKey]) {
    let first = tx.instructions.len();
    for key in keys {
        tx.push(Instruction::Sign {
            sig: [0u8; SIG_LEN],
            pubkey: key.pubkey,
        });
    }
    let msg = tx.sighash(None);
    for (i, key) in keys.iter().enumerate() {
        tx.instructions[first + i] = Instruction::Sign {
            sig: key.sign(&msg),
            pubkey: key.pubkey,
        };
    }
}

/// Append a SIGNTO covering everything pushed so far.
pub fn sign_to(tx: &mut Tx, key: &TestKey) {
    let msg = tx.sighash(Some(tx.instructions.len()));
    tx.push(Instruction::SignTo {
        sig: key.sign(&msg),
        pubkey: key.pubkey,
    });
}

/// Arguments buffer holding a single `Array<string>`.
pub fn names_arg(names: &[&str]) -> Vec<u8> {
    ArgsWriter::new().strings(names).build()
}

pub fn no_args() -> Vec<u8> {
    ArgsWriter::new().build()
}

/// Origin of a jig created at statement `idx` of `tx`.
pub fn origin_at(tx: &Tx, idx: u32) -> Pointer {
    Pointer::new(tx.hash(), idx)
}
