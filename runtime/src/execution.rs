//! The transaction interpreter.
//!
//! [`TxExecution`] walks a transaction's instruction log against one
//! snapshot of prior state. Every instruction appends exactly one
//! statement, so statement `i` is the result of instruction `i` and later
//! instructions refer back to it by index. Jigs are tracked by origin;
//! loaded jigs stay remote (persisted bytes only) until code runs on them.
//!
//! Guest code composes through the host: a method, constructor or
//! function call raised from inside a guest suspends it while the
//! interpreter runs the callee, moving arguments and the result between
//! containers by lifting in one and lowering in the other. The call stack
//! of executing jigs grows by one for every method or constructor entered.
//!
//! Nothing is written anywhere while the log runs. [`TxExecution::finalize`]
//! turns the final jig states into an [`ExecutionResult`] which the caller
//! hands to storage, or an error aborts the transaction as a whole.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;

use crate::abi::{AbiAccess, MethodKind, Shape, TypeNode};
use crate::args::{ArgsResolver, StatementSource};
use crate::codec::{BufReader, BufWriter};
use crate::container::{GuestCall, ModuleContainer};
use crate::host::{CallFrame, HostRequest};
use crate::instruction::{Instruction, Tx};
use crate::jig::{JigBacking, JigRef};
use crate::lock::{AuthContext, Lock};
use crate::memory::WasmWord;
use crate::output::{to_hex, Address, Output, Pointer};
use crate::package::{Compiler, Package};
use crate::result::ExecutionResult;
use crate::signature::{SignatureVerifier, SignerTable};
use crate::statement::{StatementLog, StatementValue};
use crate::storage::Storage;
use crate::{PackageId, Result, VmConfig, VmError};

/// Nesting limit for guest-to-guest calls.
pub const MAX_CALL_DEPTH: usize = 64;

/// Statement indices are u16, so origins of jigs constructed by guest code
/// are numbered from here to stay clear of them.
pub const CREATED_ORIGIN_BASE: u32 = 1 << 16;

/// What a guest call needs after its target was resolved.
struct Callable {
    pkg: PackageId,
    export: String,
    arg_types: Vec<TypeNode>,
    rtype: Option<TypeNode>,
}

pub struct TxExecution<'a> {
    storage: &'a dyn Storage,
    compiler: &'a dyn Compiler,
    verifier: &'a dyn SignatureVerifier,
    config: &'a VmConfig,
    tx_hash: [u8; 32],
    statements: StatementLog,
    jigs: HashMap<Pointer, JigRef>,
    /// Origins in the order the transaction first saw them.
    jig_order: Vec<Pointer>,
    containers: HashMap<PackageId, ModuleContainer>,
    container_order: Vec<PackageId>,
    /// Jigs that get a new output, in location order.
    affected: Vec<Pointer>,
    fund_total: u64,
    deploys: Vec<Package>,
    signers: SignerTable,
    /// Index of the instruction being executed.
    current: usize,
    /// Jigs constructed by guest code so far.
    created: u32,
    /// Guest calls currently running.
    depth: usize,
}

impl<'a> TxExecution<'a> {
    pub fn new(
        storage: &'a dyn Storage,
        compiler: &'a dyn Compiler,
        verifier: &'a dyn SignatureVerifier,
        config: &'a VmConfig,
    ) -> Self {
        TxExecution {
            storage,
            compiler,
            verifier,
            config,
            tx_hash: [0u8; 32],
            statements: StatementLog::new(),
            jigs: HashMap::new(),
            jig_order: Vec::new(),
            containers: HashMap::new(),
            container_order: Vec::new(),
            affected: Vec::new(),
            fund_total: 0,
            deploys: Vec::new(),
            signers: SignerTable::default(),
            current: 0,
            created: 0,
            depth: 0,
        }
    }

    /// Execute `tx` from start to finish.
    pub fn run(mut self, tx: &Tx) -> Result<ExecutionResult> {
        let outcome = self.run_inner(tx);
        self.release_pins();
        match &outcome {
            Ok(result) => log::debug!(
                "[VM Exec] tx {} finalized: {} outputs",
                to_hex(&result.tx_hash),
                result.outputs.len()
            ),
            Err(err) => log::warn!("[VM Exec] tx {} aborted: {}", to_hex(&self.tx_hash), err),
        }
        outcome
    }

    fn run_inner(&mut self, tx: &Tx) -> Result<ExecutionResult> {
        if tx.instructions.len() > self.config.max_instructions {
            return Err(VmError::Execution(alloc::format!(
                "{} instructions exceed the limit of {}",
                tx.instructions.len(),
                self.config.max_instructions
            )));
        }
        self.tx_hash = tx.hash();
        self.signers = SignerTable::verify(tx, self.verifier).map_err(|(index, err)| {
            let opcode = tx.instructions[index].opcode();
            err.at(index, opcode)
        })?;

        for (index, ix) in tx.instructions.iter().enumerate() {
            self.current = index;
            log::debug!("[VM Exec] #{} {:?}", index, ix.opcode());
            self.execute(ix).map_err(|e| e.at(index, ix.opcode()))?;
        }
        self.finalize()
    }

    /// Execute one instruction and append its statement.
    pub fn execute(&mut self, ix: &Instruction) -> Result<u16> {
        let value = match ix {
            Instruction::Import { pkg_id } => self.import_package(pkg_id)?,
            Instruction::Load { output_id } => self.load(output_id)?,
            Instruction::LoadByOrigin { origin } => self.load_by_origin(origin)?,
            Instruction::New {
                idx,
                export_idx,
                args,
            } => self.instantiate(*idx, *export_idx, args)?,
            Instruction::Call {
                idx,
                method_idx,
                args,
            } => self.call(*idx, *method_idx, args)?,
            Instruction::Exec {
                idx,
                export_idx,
                method_idx,
                args,
            } => self.exec(*idx, *export_idx, *method_idx, args)?,
            Instruction::ExecFunc {
                idx,
                export_idx,
                args,
            } => self.exec_func(*idx, *export_idx, args)?,
            Instruction::Fund { idx } => self.fund(*idx)?,
            Instruction::Lock { idx, address } => self.lock(*idx, *address)?,
            Instruction::Deploy { entries, sources } => self.deploy(entries, sources)?,
            Instruction::Sign { .. } | Instruction::SignTo { .. } => StatementValue::Empty,
        };
        self.statements.push(value)
    }

    pub fn tx_hash(&self) -> [u8; 32] {
        self.tx_hash
    }

    pub fn statements(&self) -> &StatementLog {
        &self.statements
    }

    pub fn fund_total(&self) -> u64 {
        self.fund_total
    }

    pub fn jig(&self, origin: &Pointer) -> Result<&JigRef> {
        self.jigs
            .get(origin)
            .ok_or_else(|| VmError::NotFound(alloc::format!("jig {}", origin)))
    }

    // ── Opcodes ──────────────────────────────────────────────────────

    pub fn import_package(&mut self, pkg_id: &PackageId) -> Result<StatementValue> {
        self.ensure_container(pkg_id)?;
        Ok(StatementValue::Package(*pkg_id))
    }

    pub fn load(&mut self, output_id: &[u8; 32]) -> Result<StatementValue> {
        let output = self.storage.output_by_id(output_id)?;
        self.adopt_output(output)
    }

    pub fn load_by_origin(&mut self, origin: &Pointer) -> Result<StatementValue> {
        if self.jigs.contains_key(origin) {
            return Ok(StatementValue::Jig(*origin));
        }
        let output = self.storage.output_by_origin(origin)?;
        self.adopt_output(output)
    }

    /// NEW: run a class constructor and register the result as a new jig.
    pub fn instantiate(&mut self, pkg_idx: u16, export_idx: u16, args: &[u8]) -> Result<StatementValue> {
        let pkg = self.statements.package(pkg_idx)?;
        let class_idx = u32::from(export_idx);
        let (class_name, ctor) = {
            let class = self.container(&pkg)?.abi().class_at(class_idx)?;
            (class.name.clone(), class.constructor.clone())
        };

        let words = self.lower_args(&pkg, args, &ctor.arg_types())?;
        let origin = Pointer::new(self.tx_hash, u32::from(self.statements.next_idx()?));
        let ptr = self.invoke(&pkg, &ctor.export_name(), &words, alloc::vec![origin])?;
        self.register_created(pkg, class_idx, &class_name, origin, ptr)?;
        Ok(StatementValue::Jig(origin))
    }

    /// CALL: public instance method on a jig the actor may call.
    pub fn call(&mut self, jig_idx: u16, method_idx: u16, args: &[u8]) -> Result<StatementValue> {
        let origin = self.statements.jig(jig_idx)?;
        self.check_call(&origin)?;
        let ptr = self.ensure_local(&origin)?;

        let (pkg, class_idx) = {
            let jig = self.jig(&origin)?;
            (jig.package_id(), jig.class_idx())
        };
        let method = self
            .container(&pkg)?
            .abi()
            .class_at(class_idx)?
            .method_at(method_idx)?
            .clone();
        if method.is_static {
            return Err(VmError::Permission(alloc::format!(
                "{}.{} is static",
                method.class_name,
                method.name
            )));
        }
        check_public(method.kind, &method.class_name, &method.name)?;

        let mut words = alloc::vec![ptr];
        words.extend(self.lower_args(&pkg, args, &method.arg_types())?);
        let ret = self.invoke(&pkg, &method.export_name(), &words, alloc::vec![origin])?;
        self.touch(origin);
        self.record_return(&pkg, method.return_type(), ret)
    }

    /// EXEC: static method of an exported class.
    pub fn exec(&mut self, pkg_idx: u16, export_idx: u16, method_idx: u16, args: &[u8]) -> Result<StatementValue> {
        let pkg = self.statements.package(pkg_idx)?;
        let method = self
            .container(&pkg)?
            .abi()
            .class_at(u32::from(export_idx))?
            .method_at(method_idx)?
            .clone();
        if !method.is_static {
            return Err(VmError::Permission(alloc::format!(
                "{}.{} is not static",
                method.class_name,
                method.name
            )));
        }
        check_public(method.kind, &method.class_name, &method.name)?;
        self.run_callable(
            Callable {
                pkg,
                export: method.export_name(),
                arg_types: method.arg_types(),
                rtype: method.return_type(),
            },
            args,
        )
    }

    /// EXECFUNC: exported free function.
    pub fn exec_func(&mut self, pkg_idx: u16, export_idx: u16, args: &[u8]) -> Result<StatementValue> {
        let pkg = self.statements.package(pkg_idx)?;
        let func = self.container(&pkg)?.abi().function_at(u32::from(export_idx))?.clone();
        self.run_callable(
            Callable {
                pkg,
                export: func.name,
                arg_types: func.args.into_iter().map(|a| a.ty).collect(),
                rtype: func.rtype,
            },
            args,
        )
    }

    /// FUND: freeze a coin the actor controls and count its amount.
    pub fn fund(&mut self, jig_idx: u16) -> Result<StatementValue> {
        let origin = self.statements.jig(jig_idx)?;
        let (pkg, class_idx, class_ptr) = {
            let jig = self.jig(&origin)?;
            (jig.package_id(), jig.class_idx(), jig.class_ptr)
        };
        if class_ptr != self.config.coin_class() {
            return Err(VmError::Execution(alloc::format!("jig {} is not a coin", origin)));
        }
        self.check_call(&origin)?;
        let ptr = self.ensure_local(&origin)?;

        let amount = {
            let container = self.container(&pkg)?;
            let class = container.abi().class_at(class_idx)?;
            container.lifter().read_field(class, ptr, "amount")?.to_u64()
        };
        self.fund_total = self
            .fund_total
            .checked_add(amount)
            .ok_or_else(|| VmError::Execution(String::from("funding total overflows")))?;
        log::debug!("[VM Exec] fund {} with {}", origin, amount);
        self.set_lock(origin, Lock::Frozen)?;
        Ok(StatementValue::Empty)
    }

    /// LOCK: relock a jig to an address.
    pub fn lock(&mut self, jig_idx: u16, address: Address) -> Result<StatementValue> {
        let origin = self.statements.jig(jig_idx)?;
        let next = Lock::Address(address);
        {
            let jig = self.jig(&origin)?;
            let signers = self.signers.signers_for(self.current);
            jig.lock
                .check_change(&next, &origin, &AuthContext::new(&[], &signers))?;
        }
        self.set_lock(origin, next)?;
        Ok(StatementValue::Empty)
    }

    /// DEPLOY: compile sources into a package usable by later instructions.
    pub fn deploy(&mut self, entries: &[String], sources: &BTreeMap<String, String>) -> Result<StatementValue> {
        let package = Package::build(self.compiler, entries.to_vec(), sources.clone())?;
        let id = package.id;
        if !self.containers.contains_key(&id) {
            self.install(id, &package.wasm, package.abi.clone())?;
        }
        if !self.deploys.iter().any(|p| p.id == id) {
            log::debug!("[VM Exec] deploy {}", to_hex(&id));
            self.deploys.push(package);
        }
        Ok(StatementValue::Package(id))
    }

    // ── Finalization ─────────────────────────────────────────────────

    /// Build the state transition.
    pub fn finalize(&mut self) -> Result<ExecutionResult> {
        if self.fund_total < self.config.min_fund_amount {
            return Err(VmError::Execution(alloc::format!(
                "not enough funding: {} < {}",
                self.fund_total,
                self.config.min_fund_amount
            )));
        }
        for origin in self.jig_order.iter() {
            if self.jig(origin)?.lock == Lock::None {
                return Err(VmError::Permission(alloc::format!("jig {} is left unlocked", origin)));
            }
        }

        let mut states: HashMap<Pointer, Vec<u8>> = HashMap::with_capacity(self.jig_order.len());
        for origin in self.jig_order.clone() {
            let state = self.current_state(&origin)?;
            let jig = self.jig(&origin)?;
            let changed = jig.is_new() || jig.source.as_ref().is_some_and(|s| s.state != state);
            if changed {
                self.touch(origin);
            }
            states.insert(origin, state);
        }

        let mut outputs = Vec::with_capacity(self.affected.len());
        let mut spends = Vec::new();
        for (i, origin) in self.affected.iter().enumerate() {
            let jig = self.jig(origin)?;
            let state = states.remove(origin).unwrap_or_default();
            let location = Pointer::new(self.tx_hash, i as u32);
            outputs.push(Output::new(*origin, location, jig.class_ptr, jig.lock, state));
            if let Some(source) = &jig.source {
                spends.push(source.clone());
            }
        }
        let reads = self
            .jig_order
            .iter()
            .filter(|o| !self.affected.contains(o))
            .filter_map(|o| self.jigs.get(o).and_then(|j| j.source.clone()))
            .collect();

        Ok(ExecutionResult {
            tx_hash: self.tx_hash,
            outputs,
            spends,
            reads,
            deploys: self.deploys.clone(),
        })
    }

    // ── Composition ──────────────────────────────────────────────────

    /// Serve a request raised by guest code of package `caller` running
    /// with `stack`; the result is the word handed back to the guest.
    fn serve(&mut self, caller: &PackageId, stack: &[Pointer], request: &HostRequest) -> Result<Option<WasmWord>> {
        log::debug!("[VM Exec] {} requested by {}", request, to_hex(caller));
        match request {
            HostRequest::CallMethod { target, method, args } => {
                self.call_method(caller, stack, target, method, args)
            }
            HostRequest::GetProp { target, prop } => self.get_prop(caller, target, prop),
            HostRequest::ConstructLocal { class, args } => self.construct(caller, *caller, stack, class, args),
            HostRequest::ConstructRemote { pkg, class, args } => {
                self.construct(caller, *pkg, stack, class, args)
            }
            HostRequest::CallFunction { pkg, function, args } => {
                self.call_function(caller, *pkg, stack, function, args)
            }
        }
    }

    /// Method call from guest code. The target's lock is checked against
    /// the calling stack, so a JIG-locked child answers to its parent.
    fn call_method(
        &mut self,
        caller: &PackageId,
        stack: &[Pointer],
        target: &Pointer,
        name: &str,
        args: &[u8],
    ) -> Result<Option<WasmWord>> {
        {
            let jig = self.jig(target)?;
            let signers = self.signers.signers_for(self.current);
            jig.lock.check_call(target, &AuthContext::new(stack, &signers))?;
        }
        let ptr = self.ensure_local(target)?;
        let (pkg, class_idx) = {
            let jig = self.jig(target)?;
            (jig.package_id(), jig.class_idx())
        };
        let method = self
            .container(&pkg)?
            .abi()
            .class_at(class_idx)?
            .method_by_name(name)?
            .clone();
        if method.is_static {
            return Err(VmError::Permission(alloc::format!(
                "{}.{} is static",
                method.class_name,
                method.name
            )));
        }
        check_visible(method.kind, *caller == pkg, &method.class_name, &method.name)?;

        let mut words = alloc::vec![ptr];
        words.extend(self.transfer_args(caller, &pkg, args, &method.arg_types())?);
        let mut nested = stack.to_vec();
        nested.push(*target);
        let ret = self.invoke(&pkg, &method.export_name(), &words, nested)?;
        self.touch(*target);
        self.transfer_return(&pkg, caller, method.return_type(), ret)
    }

    /// Field read from guest code; reading needs no authorization.
    fn get_prop(&mut self, caller: &PackageId, target: &Pointer, prop: &str) -> Result<Option<WasmWord>> {
        let ptr = self.ensure_local(target)?;
        let (pkg, class_idx) = {
            let jig = self.jig(target)?;
            (jig.package_id(), jig.class_idx())
        };
        let (ty, word) = {
            let container = self.container(&pkg)?;
            let class = container.abi().class_at(class_idx)?;
            let field = class.field(prop)?;
            (field.ty.clone(), container.lifter().read_field(class, ptr, prop)?)
        };
        self.transfer_return(&pkg, caller, Some(ty), Some(word))
    }

    /// Constructor call from guest code. The new jig gets the next guest
    /// origin and runs its constructor as itself.
    fn construct(
        &mut self,
        caller: &PackageId,
        pkg: PackageId,
        stack: &[Pointer],
        class_name: &str,
        args: &[u8],
    ) -> Result<Option<WasmWord>> {
        self.ensure_container(&pkg)?;
        let (class_idx, ctor) = {
            let class = self
                .container(&pkg)?
                .abi()
                .class_by_name(class_name)
                .ok_or_else(|| VmError::NotFound(alloc::format!("jig class {}", class_name)))?;
            (class.idx, class.constructor.clone())
        };
        check_visible(ctor.kind, *caller == pkg, class_name, &ctor.name)?;

        let words = self.transfer_args(caller, &pkg, args, &ctor.arg_types())?;
        let origin = self.next_created_origin()?;
        let mut nested = stack.to_vec();
        nested.push(origin);
        let ret = self.invoke(&pkg, &ctor.export_name(), &words, nested)?;
        let ptr = self.register_created(pkg, class_idx, class_name, origin, ret)?;
        if pkg == *caller {
            return Ok(Some(ptr));
        }
        self.container_mut(caller)?
            .lowerer()
            .lower_jig_ref(&origin, class_name)
            .map(Some)
    }

    /// Free function call from guest code; no jig is entered.
    fn call_function(
        &mut self,
        caller: &PackageId,
        pkg: PackageId,
        stack: &[Pointer],
        name: &str,
        args: &[u8],
    ) -> Result<Option<WasmWord>> {
        self.ensure_container(&pkg)?;
        let func = self.container(&pkg)?.abi().function_by_name(name)?.clone();
        let arg_types: Vec<TypeNode> = func.args.into_iter().map(|a| a.ty).collect();
        let words = self.transfer_args(caller, &pkg, args, &arg_types)?;
        let ret = self.invoke(&pkg, &func.name, &words, stack.to_vec())?;
        self.transfer_return(&pkg, caller, func.rtype, ret)
    }

    /// Move packed argument words from `from` into `to`. Within one
    /// package the words are valid as they are.
    fn transfer_args(
        &mut self,
        from: &PackageId,
        to: &PackageId,
        packed: &[u8],
        types: &[TypeNode],
    ) -> Result<Vec<WasmWord>> {
        let mut r = BufReader::new(packed);
        let mut words = Vec::with_capacity(types.len());
        for ty in types {
            words.push(WasmWord::from_le_bytes(r.read_fixed_bytes(ty.own_size() as usize)?));
        }
        r.finish()?;
        if from == to {
            return Ok(words);
        }
        let bytes = {
            let lifter = self.container(from)?.lifter();
            let mut w = BufWriter::new();
            for (ty, word) in types.iter().zip(words) {
                lifter.lift_value(&mut w, ty, word)?;
            }
            w.into_bytes()
        };
        self.container_mut(to)?.lowerer().lower_args(&bytes, types)
    }

    /// Move a callee's return value into the caller's container.
    fn transfer_return(
        &mut self,
        from: &PackageId,
        to: &PackageId,
        rtype: Option<TypeNode>,
        word: Option<WasmWord>,
    ) -> Result<Option<WasmWord>> {
        let (ty, word) = match (rtype, word) {
            (Some(ty), Some(word)) if ty.name != "void" => (ty, word),
            _ => return Ok(None),
        };
        if from == to {
            return Ok(Some(word));
        }
        let bytes = self.container(from)?.lifter().lift(&ty, word)?;
        let mut words = self
            .container_mut(to)?
            .lowerer()
            .lower_args(&bytes, core::slice::from_ref(&ty))?;
        Ok(words.pop())
    }

    fn next_created_origin(&mut self) -> Result<Pointer> {
        let idx = CREATED_ORIGIN_BASE
            .checked_add(self.created)
            .ok_or_else(|| VmError::Execution(String::from("too many jigs created")))?;
        self.created += 1;
        Ok(Pointer::new(self.tx_hash, idx))
    }

    /// Stamp a freshly constructed instance and start tracking it.
    fn register_created(
        &mut self,
        pkg: PackageId,
        class_idx: u32,
        class_name: &str,
        origin: Pointer,
        ret: Option<WasmWord>,
    ) -> Result<WasmWord> {
        let ptr = ret.filter(|w| !w.is_null()).ok_or_else(|| {
            VmError::Execution(alloc::format!("constructor of {} returned no instance", class_name))
        })?;
        let class_ptr = Pointer::new(pkg, class_idx);
        let container = self.container_mut(&pkg)?;
        {
            let mut lowerer = container.lowerer();
            lowerer.stamp_output(class_idx, ptr, &origin, &origin, &class_ptr)?;
            lowerer.stamp_lock(class_idx, ptr, &origin, &Lock::None)?;
        }
        container.retain(ptr)?;
        container.register_resident(origin, ptr);

        log::debug!("[VM Exec] new {} {}", class_name, origin);
        self.insert_jig(JigRef::created(origin, class_ptr, ptr));
        self.touch(origin);
        Ok(ptr)
    }

    // ── Helpers ──────────────────────────────────────────────────────

    /// Call a static method or free function; no jig is executing.
    fn run_callable(&mut self, callable: Callable, args: &[u8]) -> Result<StatementValue> {
        let words = self.lower_args(&callable.pkg, args, &callable.arg_types)?;
        let ret = self.invoke(&callable.pkg, &callable.export, &words, Vec::new())?;
        self.record_return(&callable.pkg, callable.rtype, ret)
    }

    fn container(&self, id: &PackageId) -> Result<&ModuleContainer> {
        self.containers
            .get(id)
            .ok_or_else(|| VmError::NotFound(alloc::format!("package {} is not imported", to_hex(id))))
    }

    fn container_mut(&mut self, id: &PackageId) -> Result<&mut ModuleContainer> {
        self.containers
            .get_mut(id)
            .ok_or_else(|| VmError::NotFound(alloc::format!("package {} is not imported", to_hex(id))))
    }

    /// Instantiate a stored package unless it is already running.
    fn ensure_container(&mut self, id: &PackageId) -> Result<()> {
        if self.containers.contains_key(id) {
            return Ok(());
        }
        let package = self.storage.package_by_id(id)?;
        self.install(package.id, &package.wasm, package.abi)
    }

    fn install(&mut self, id: PackageId, wasm: &[u8], abi: crate::abi::Abi) -> Result<()> {
        let container = ModuleContainer::new(id, wasm, abi)?;
        self.containers.insert(id, container);
        self.container_order.push(id);
        Ok(())
    }

    fn jig_mut(&mut self, origin: &Pointer) -> Result<&mut JigRef> {
        self.jigs
            .get_mut(origin)
            .ok_or_else(|| VmError::NotFound(alloc::format!("jig {}", origin)))
    }

    fn insert_jig(&mut self, jig: JigRef) {
        let origin = jig.origin;
        if self.jigs.insert(origin, jig).is_none() {
            self.jig_order.push(origin);
        }
    }

    /// Mark a jig as getting a new output.
    fn touch(&mut self, origin: Pointer) {
        if !self.affected.contains(&origin) {
            self.affected.push(origin);
        }
    }

    fn adopt_output(&mut self, output: Output) -> Result<StatementValue> {
        let origin = output.origin;
        if let Some(existing) = self.jigs.get(&origin) {
            return match &existing.source {
                Some(source) if source.id() == output.id() => Ok(StatementValue::Jig(origin)),
                _ => Err(VmError::Execution(alloc::format!(
                    "jig {} is already loaded at another location",
                    origin
                ))),
            };
        }
        let jig = JigRef::loaded(output);
        let resident = self.containers.contains_key(&jig.package_id());
        log::debug!("[VM Exec] load {} at {}", origin, jig.prior_location());
        self.insert_jig(jig);
        if resident {
            self.ensure_local(&origin)?;
        }
        Ok(StatementValue::Jig(origin))
    }

    /// Hydrate a remote jig into its package container.
    fn ensure_local(&mut self, origin: &Pointer) -> Result<WasmWord> {
        let (header, pkg, class_idx) = {
            let jig = self.jig(origin)?;
            match &jig.backing {
                JigBacking::Local { ptr } => return Ok(*ptr),
                JigBacking::Remote { state } => (jig.header(state.clone()), jig.package_id(), jig.class_idx()),
            }
        };
        self.ensure_container(&pkg)?;
        let container = self.container_mut(&pkg)?;
        let ptr = container.lowerer().lower_jig(class_idx, &header)?;
        container.retain(ptr)?;
        container.register_resident(*origin, ptr);
        self.jig_mut(origin)?.backing = JigBacking::Local { ptr };
        Ok(ptr)
    }

    fn current_state(&self, origin: &Pointer) -> Result<Vec<u8>> {
        let jig = self.jig(origin)?;
        match &jig.backing {
            JigBacking::Remote { state } => Ok(state.clone()),
            JigBacking::Local { ptr } => {
                let container = self.container(&jig.package_id())?;
                let class = container.abi().class_at(jig.class_idx())?;
                container.lifter().lift_state(class, *ptr)
            }
        }
    }

    fn check_call(&self, origin: &Pointer) -> Result<()> {
        let jig = self.jig(origin)?;
        let signers = self.signers.signers_for(self.current);
        jig.lock.check_call(origin, &AuthContext::new(&[], &signers))
    }

    /// Change a jig's lock and mirror it into guest memory.
    fn set_lock(&mut self, origin: Pointer, lock: Lock) -> Result<()> {
        let (ptr, pkg, class_idx) = {
            let jig = self.jig_mut(&origin)?;
            jig.lock = lock;
            (jig.local_ptr(), jig.package_id(), jig.class_idx())
        };
        if let Some(ptr) = ptr {
            self.container_mut(&pkg)?
                .lowerer()
                .stamp_lock(class_idx, ptr, &origin, &lock)?;
        }
        log::debug!("[VM Exec] lock {} -> {}", origin, lock.describe());
        self.touch(origin);
        Ok(())
    }

    fn frame(&self, stack: Vec<Pointer>) -> CallFrame {
        let mut frame = CallFrame {
            stack,
            signers: self.signers.signers_for(self.current),
            ..CallFrame::default()
        };
        for origin in self.jig_order.iter() {
            if let Some(jig) = self.jigs.get(origin) {
                frame.locks.insert(*origin, jig.lock);
            }
        }
        frame
    }

    /// Call a guest export, serving its composition requests, and apply
    /// the lock changes it requested.
    fn invoke(
        &mut self,
        pkg: &PackageId,
        export: &str,
        words: &[WasmWord],
        stack: Vec<Pointer>,
    ) -> Result<Option<WasmWord>> {
        if self.depth >= MAX_CALL_DEPTH {
            return Err(VmError::Execution(alloc::format!(
                "{} nests deeper than {} calls",
                export,
                MAX_CALL_DEPTH
            )));
        }
        self.depth += 1;
        let result = self.invoke_inner(pkg, export, words, stack);
        self.depth -= 1;
        result
    }

    fn invoke_inner(
        &mut self,
        pkg: &PackageId,
        export: &str,
        words: &[WasmWord],
        stack: Vec<Pointer>,
    ) -> Result<Option<WasmWord>> {
        let frame = self.frame(stack.clone());
        let (result, frame) = self.container_mut(pkg)?.start(export, words, frame);
        let mut call = self.apply_locks(result, frame)?;
        loop {
            let suspension = match call {
                GuestCall::Finished(word) => return Ok(word),
                GuestCall::Suspended(suspension) => suspension,
            };
            let reply = self.serve(pkg, &stack, &suspension.request)?;
            let frame = self.frame(stack.clone());
            let (result, frame) = self.container_mut(pkg)?.resume(suspension, reply, frame);
            call = self.apply_locks(result, frame)?;
        }
    }

    fn apply_locks(&mut self, result: Result<GuestCall>, frame: CallFrame) -> Result<GuestCall> {
        let call = result?;
        for (origin, lock) in frame.lock_requests {
            self.set_lock(origin, lock)?;
        }
        Ok(call)
    }

    /// Resolve statement references and lower the arguments into `pkg`.
    fn lower_args(&mut self, pkg: &PackageId, args: &[u8], types: &[TypeNode]) -> Result<Vec<WasmWord>> {
        let resolved = {
            let this: &Self = self;
            ArgsResolver::new(this.container(pkg)?.abi(), this).resolve(args, types)?
        };
        self.container_mut(pkg)?.lowerer().lower_args(&resolved, types)
    }

    /// Turn a guest return value into a statement.
    fn record_return(
        &mut self,
        pkg: &PackageId,
        rtype: Option<TypeNode>,
        word: Option<WasmWord>,
    ) -> Result<StatementValue> {
        let (ty, word) = match (rtype, word) {
            (Some(ty), Some(word)) if ty.name != "void" => (ty, word),
            _ => return Ok(StatementValue::Empty),
        };
        let container = self.container(pkg)?;
        let base = ty.non_null();
        let shape = container.abi().shape(&base)?;
        match shape {
            Shape::JigRef(_) | Shape::JigState(_) if !word.is_null() => {
                let origin = container.lifter().lift_origin(word)?;
                if !self.jigs.contains_key(&origin) {
                    return Err(VmError::Execution(alloc::format!(
                        "guest returned unknown jig {}",
                        origin
                    )));
                }
                Ok(StatementValue::Jig(origin))
            }
            Shape::Prim(_) => Ok(StatementValue::Value { pkg: *pkg, ty, word }),
            _ => {
                if !word.is_null() {
                    self.container_mut(pkg)?.retain(word)?;
                }
                Ok(StatementValue::Value { pkg: *pkg, ty, word })
            }
        }
    }

    fn release_pins(&mut self) {
        for id in self.container_order.iter() {
            if let Some(container) = self.containers.get_mut(id) {
                if let Err(err) = container.release_all() {
                    log::warn!("[VM Exec] releasing pins of {}: {}", to_hex(id), err);
                }
            }
        }
    }
}

impl TxExecution<'_> {
    /// Type names the jig `origin` can be passed as.
    fn jig_type_names(&self, origin: &Pointer) -> Result<Vec<String>> {
        let class_ptr = self.jig(origin)?.class_ptr;
        match self.containers.get(&class_ptr.id) {
            Some(container) => container.abi().hierarchy_names(class_ptr.idx),
            None => {
                let package = self.storage.package_by_id(&class_ptr.id)?;
                AbiAccess::new(package.abi)?.hierarchy_names(class_ptr.idx)
            }
        }
    }
}

impl StatementSource for TxExecution<'_> {
    fn statement_bytes(&self, idx: u16, ty: &TypeNode) -> Result<Vec<u8>> {
        let expected = ty.non_null().normalized_name();
        let (bytes, nullable) = match &self.statements.get(idx)?.value {
            StatementValue::Jig(origin) => {
                if !self.jig_type_names(origin)?.contains(&expected) {
                    return Err(VmError::Execution(alloc::format!(
                        "statement {} holds jig {}, which is not a {}",
                        idx,
                        origin,
                        expected
                    )));
                }
                (origin.to_bytes().to_vec(), false)
            }
            StatementValue::Value { pkg, ty: vty, word } => {
                let actual = vty.non_null().normalized_name();
                if actual != expected {
                    return Err(VmError::Execution(alloc::format!(
                        "statement {} holds a {}, expected {}",
                        idx,
                        actual,
                        expected
                    )));
                }
                let container = self.container(pkg)?;
                (container.lifter().lift(vty, *word)?, vty.nullable)
            }
            StatementValue::Empty | StatementValue::Package(_) => {
                return Err(VmError::Execution(alloc::format!("statement {} holds no value", idx)))
            }
        };
        adapt_nullability(bytes, nullable, ty.nullable)
    }
}

/// Add or strip the presence flag when a statement's nullability differs
/// from the argument's.
fn adapt_nullability(mut bytes: Vec<u8>, from: bool, to: bool) -> Result<Vec<u8>> {
    match (from, to) {
        (false, true) => {
            bytes.insert(0, 1);
            Ok(bytes)
        }
        (true, false) => match bytes.first() {
            Some(1) => Ok(bytes.split_off(1)),
            _ => Err(VmError::Execution(String::from("null passed for a non-nullable argument"))),
        },
        _ => Ok(bytes),
    }
}

/// Protected and private members are reachable from their own package only.
fn check_visible(kind: MethodKind, same_package: bool, class: &str, method: &str) -> Result<()> {
    if same_package {
        return Ok(());
    }
    check_public(kind, class, method)
}

fn check_public(kind: MethodKind, class: &str, method: &str) -> Result<()> {
    match kind {
        MethodKind::Public => Ok(()),
        MethodKind::Protected | MethodKind::Private => Err(VmError::Permission(alloc::format!(
            "{}.{} is not public",
            class,
            method
        ))),
    }
}
