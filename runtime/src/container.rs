//! Module containers.
//!
//! A [`ModuleContainer`] owns one instantiated guest package: its wasmi
//! store and linear memory, its ABI, the jigs currently resident in its
//! memory, and the table of guest pointers the host keeps pinned.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::vec::Vec;

use hashbrown::HashMap;
use wasmi::core::{ValueType, F32, F64};
use wasmi::{Instance, Linker, Memory, ResumableCall, ResumableInvocation, Store, TypedFunc, Value};

use crate::abi::{Abi, AbiAccess};
use crate::engine;
use crate::host::{self, CallFrame, HostRequest, HostState};
use crate::lift::Lifter;
use crate::lower::Lowerer;
use crate::memory::{check_bounds, GuestMemory, WasmWord};
use crate::output::{to_hex, Pointer};
use crate::{PackageId, Result, VmError};

/// Guest allocator export: `__new(size, rtid) -> ptr`.
pub const ALLOC_EXPORT: &str = "__new";
/// Optional guest export retaining an object: `__pin(ptr) -> ptr`.
pub const PIN_EXPORT: &str = "__pin";
/// Optional guest export releasing an object: `__unpin(ptr)`.
pub const UNPIN_EXPORT: &str = "__unpin";

/// Where a guest call stands after running.
pub enum GuestCall {
    Finished(Option<WasmWord>),
    /// Stopped inside a composition import; resume with the reply.
    Suspended(Suspension),
}

/// A guest call paused on a [`HostRequest`].
pub struct Suspension {
    pub request: HostRequest,
    export: String,
    invocation: ResumableInvocation,
    outputs: Vec<Value>,
}

impl core::fmt::Debug for Suspension {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Suspension")
            .field("export", &self.export)
            .field("request", &self.request)
            .finish()
    }
}

/// A running wasmi instance and its memory.
pub struct WasmGuest {
    store: Store<HostState>,
    instance: Instance,
    memory: Memory,
    alloc_fn: TypedFunc<(i32, i32), i32>,
}

impl WasmGuest {
    pub fn instantiate(wasm: &[u8]) -> Result<Self> {
        let engine = engine::get();
        let module = engine::compile(&engine, wasm)?;
        let mut store = Store::new(&engine, HostState::default());
        let mut linker: Linker<HostState> = Linker::new(&engine);
        host::define_imports(&mut store, &mut linker)?;

        let instance = linker
            .instantiate(&mut store, &module)
            .map_err(|e| VmError::Execution(alloc::format!("instantiation failed: {}", e)))?
            .start(&mut store)
            .map_err(|e| VmError::Execution(alloc::format!("start function failed: {}", e)))?;
        let memory = instance
            .get_memory(&store, "memory")
            .ok_or_else(|| VmError::Execution(String::from("guest exports no memory")))?;
        let alloc_fn = instance
            .get_typed_func::<(i32, i32), i32>(&store, ALLOC_EXPORT)
            .map_err(|e| VmError::Execution(alloc::format!("guest allocator {}: {}", ALLOC_EXPORT, e)))?;

        Ok(WasmGuest {
            store,
            instance,
            memory,
            alloc_fn,
        })
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.instance.get_func(&self.store, name).is_some()
    }

    /// Call export `name` to completion. Host imports see `frame`, which is
    /// handed back together with the result. A composition request is an
    /// error here; use [`WasmGuest::start`] to serve it.
    pub fn call(
        &mut self,
        name: &str,
        args: &[WasmWord],
        frame: CallFrame,
    ) -> (Result<Option<WasmWord>>, CallFrame) {
        let (result, frame) = self.start(name, args, frame);
        let result = result.and_then(|call| match call {
            GuestCall::Finished(word) => Ok(word),
            GuestCall::Suspended(suspension) => Err(VmError::Execution(alloc::format!(
                "{} cannot {} here",
                name,
                suspension.request
            ))),
        });
        (result, frame)
    }

    /// Run export `name` until it finishes or raises a [`HostRequest`].
    pub fn start(
        &mut self,
        name: &str,
        args: &[WasmWord],
        frame: CallFrame,
    ) -> (Result<GuestCall>, CallFrame) {
        self.store.data_mut().frame = frame;
        let result = self.start_inner(name, args);
        self.settle(result)
    }

    /// Continue a suspended call; `reply` is the requested import's result.
    pub fn resume(
        &mut self,
        suspension: Suspension,
        reply: Option<WasmWord>,
        frame: CallFrame,
    ) -> (Result<GuestCall>, CallFrame) {
        self.store.data_mut().frame = frame;
        let result = self.resume_inner(suspension, reply);
        self.settle(result)
    }

    /// Take the frame back; a failure recorded by a host import wins over
    /// the trap it caused.
    fn settle(&mut self, result: Result<GuestCall>) -> (Result<GuestCall>, CallFrame) {
        let mut frame = core::mem::take(&mut self.store.data_mut().frame);
        let result = match (result, frame.failure.take()) {
            (Err(_), Some(failure)) => Err(failure),
            (result, _) => result,
        };
        (result, frame)
    }

    fn start_inner(&mut self, name: &str, args: &[WasmWord]) -> Result<GuestCall> {
        let func = self
            .instance
            .get_func(&self.store, name)
            .ok_or_else(|| VmError::NotFound(alloc::format!("guest export {}", name)))?;
        let ty = func.ty(&self.store);
        if ty.params().len() != args.len() {
            return Err(VmError::Execution(alloc::format!(
                "{} takes {} arguments, got {}",
                name,
                ty.params().len(),
                args.len()
            )));
        }
        let params: Vec<Value> = ty
            .params()
            .iter()
            .zip(args.iter())
            .map(|(t, w)| to_value(*t, *w))
            .collect();
        let mut outputs: Vec<Value> = ty.results().iter().map(|t| zero_value(*t)).collect();
        let call = func
            .call_resumable(&mut self.store, &params, &mut outputs)
            .map_err(|e| VmError::Execution(alloc::format!("guest trap in {}: {}", name, e)))?;
        step(name, call, outputs)
    }

    fn resume_inner(&mut self, suspension: Suspension, reply: Option<WasmWord>) -> Result<GuestCall> {
        let Suspension {
            export,
            invocation,
            mut outputs,
            ..
        } = suspension;
        let reply = reply.unwrap_or(WasmWord::NULL);
        let inputs: Vec<Value> = invocation
            .host_func()
            .ty(&self.store)
            .results()
            .iter()
            .map(|t| to_value(*t, reply))
            .collect();
        let call = invocation
            .resume(&mut self.store, &inputs, &mut outputs)
            .map_err(|e| VmError::Execution(alloc::format!("guest trap in {}: {}", export, e)))?;
        step(&export, call, outputs)
    }
}

impl GuestMemory for WasmGuest {
    fn read(&self, ptr: u32, len: u32) -> Result<&[u8]> {
        let data = self.memory.data(&self.store);
        let range = check_bounds(ptr, len, data.len())?;
        Ok(&data[range])
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        let data = self.memory.data_mut(&mut self.store);
        let range = check_bounds(ptr, bytes.len() as u32, data.len())?;
        data[range].copy_from_slice(bytes);
        Ok(())
    }

    fn malloc(&mut self, size: u32, rtid: u32) -> Result<WasmWord> {
        let ptr = self
            .alloc_fn
            .call(&mut self.store, (size as i32, rtid as i32))
            .map_err(|e| VmError::Execution(alloc::format!("guest allocation of {} failed: {}", size, e)))?;
        if ptr == 0 {
            return Err(VmError::Execution(alloc::format!(
                "guest allocator returned null for {} bytes",
                size
            )));
        }
        Ok(WasmWord::from_u32(ptr as u32))
    }
}

/// Classify a resumable call outcome; only a [`HostRequest`] may suspend.
fn step(name: &str, call: ResumableCall, outputs: Vec<Value>) -> Result<GuestCall> {
    let invocation = match call {
        ResumableCall::Finished => return Ok(GuestCall::Finished(outputs.first().map(from_value))),
        ResumableCall::Resumable(invocation) => invocation,
    };
    let request = match invocation.host_error().downcast_ref::<HostRequest>() {
        Some(request) => request.clone(),
        None => {
            return Err(VmError::Execution(alloc::format!(
                "guest trap in {}: {}",
                name,
                invocation.host_error()
            )))
        }
    };
    Ok(GuestCall::Suspended(Suspension {
        request,
        export: String::from(name),
        invocation,
        outputs,
    }))
}

fn to_value(ty: ValueType, word: WasmWord) -> Value {
    match ty {
        ValueType::I64 => Value::I64(word.to_i64()),
        ValueType::F32 => Value::F32(F32::from_bits(word.to_u32())),
        ValueType::F64 => Value::F64(F64::from_bits(word.to_u64())),
        _ => Value::I32(word.to_i32()),
    }
}

fn zero_value(ty: ValueType) -> Value {
    to_value(ty, WasmWord::NULL)
}

fn from_value(value: &Value) -> WasmWord {
    match value {
        Value::I32(v) => WasmWord::from_u32(*v as u32),
        Value::I64(v) => WasmWord::from_i64(*v),
        Value::F32(v) => WasmWord::from_u32(v.to_bits()),
        Value::F64(v) => WasmWord::from_u64(v.to_bits()),
        _ => WasmWord::NULL,
    }
}

/// One instantiated package.
pub struct ModuleContainer {
    pub id: PackageId,
    abi: AbiAccess,
    guest: WasmGuest,
    residents: HashMap<Pointer, WasmWord>,
    pins: BTreeMap<u32, u32>,
}

impl ModuleContainer {
    pub fn new(id: PackageId, wasm: &[u8], abi: Abi) -> Result<Self> {
        let abi = AbiAccess::new(abi)?;
        let guest = WasmGuest::instantiate(wasm)?;
        log::debug!("[VM Container] instantiated package {}", to_hex(&id));
        Ok(ModuleContainer {
            id,
            abi,
            guest,
            residents: HashMap::new(),
            pins: BTreeMap::new(),
        })
    }

    pub fn abi(&self) -> &AbiAccess {
        &self.abi
    }

    pub fn lowerer(&mut self) -> Lowerer<'_> {
        Lowerer::new(&self.abi, &mut self.guest, &self.residents)
    }

    pub fn lifter(&self) -> Lifter<'_> {
        Lifter::new(&self.abi, &self.guest)
    }

    pub fn has_export(&self, name: &str) -> bool {
        self.guest.has_export(name)
    }

    pub fn call(
        &mut self,
        name: &str,
        args: &[WasmWord],
        frame: CallFrame,
    ) -> (Result<Option<WasmWord>>, CallFrame) {
        log::trace!("[VM Container] call {} with {} args", name, args.len());
        self.guest.call(name, args, frame)
    }

    pub fn start(
        &mut self,
        name: &str,
        args: &[WasmWord],
        frame: CallFrame,
    ) -> (Result<GuestCall>, CallFrame) {
        log::trace!("[VM Container] start {} with {} args", name, args.len());
        self.guest.start(name, args, frame)
    }

    pub fn resume(
        &mut self,
        suspension: Suspension,
        reply: Option<WasmWord>,
        frame: CallFrame,
    ) -> (Result<GuestCall>, CallFrame) {
        log::trace!("[VM Container] resume {}", suspension.export);
        self.guest.resume(suspension, reply, frame)
    }

    /// Record that the jig `origin` lives at `ptr` in this memory.
    pub fn register_resident(&mut self, origin: Pointer, ptr: WasmWord) {
        self.residents.insert(origin, ptr);
    }

    pub fn resident(&self, origin: &Pointer) -> Option<WasmWord> {
        self.residents.get(origin).copied()
    }

    /// Pin a guest object for as long as the host holds it.
    pub fn retain(&mut self, ptr: WasmWord) -> Result<()> {
        let key = ptr.to_ptr()?;
        let count = self.pins.entry(key).or_insert(0);
        *count += 1;
        if *count == 1 && self.guest.has_export(PIN_EXPORT) {
            self.guest.call(PIN_EXPORT, &[ptr], CallFrame::default()).0?;
        }
        Ok(())
    }

    /// Drop one pin; the guest is told once the last pin is gone.
    pub fn release(&mut self, ptr: WasmWord) -> Result<()> {
        let key = ptr.to_ptr()?;
        let remaining = match self.pins.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => {
                return Err(VmError::Execution(alloc::format!(
                    "release of unpinned pointer {:#x}",
                    key
                )))
            }
        };
        if remaining == 0 {
            self.pins.remove(&key);
            self.unpin(key)?;
        }
        Ok(())
    }

    /// Release every pin.
    pub fn release_all(&mut self) -> Result<()> {
        let pinned: Vec<u32> = self.pins.keys().copied().collect();
        self.pins.clear();
        for key in pinned {
            self.unpin(key)?;
        }
        Ok(())
    }

    pub fn pin_count(&self, ptr: WasmWord) -> u32 {
        self.pins.get(&ptr.to_u32()).copied().unwrap_or(0)
    }

    fn unpin(&mut self, key: u32) -> Result<()> {
        if self.guest.has_export(UNPIN_EXPORT) {
            self.guest
                .call(UNPIN_EXPORT, &[WasmWord::from_u32(key)], CallFrame::default())
                .0?;
        }
        Ok(())
    }
}

impl GuestMemory for ModuleContainer {
    fn read(&self, ptr: u32, len: u32) -> Result<&[u8]> {
        self.guest.read(ptr, len)
    }

    fn write(&mut self, ptr: u32, bytes: &[u8]) -> Result<()> {
        self.guest.write(ptr, bytes)
    }

    fn malloc(&mut self, size: u32, rtid: u32) -> Result<WasmWord> {
        self.guest.malloc(size, rtid)
    }
}
