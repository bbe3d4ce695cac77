//! Host functions imported by guest modules.
//!
//! Guest code runs against a [`CallFrame`]: a snapshot of who is executing,
//! which addresses signed, and every known jig's lock. Host imports consult
//! and update the frame; the interpreter hands it in before a guest call and
//! takes it back afterwards to apply the lock changes the guest requested.
//!
//! | import                  | signature              |
//! |-------------------------|------------------------|
//! | `vm.jig_lock`           | (i32, i32, i32) -> ()  |
//! | `vm.jig_auth_check`     | (i32, i32) -> i32      |
//! | `vm.caller_is`          | (i32) -> i32           |
//! | `vm.debug_str`          | (i32) -> ()            |
//! | `vm.call_method`        | (i32, i32, i32) -> i64 |
//! | `vm.get_prop`           | (i32, i32) -> i64      |
//! | `vm.constructor_local`  | (i32, i32) -> i32      |
//! | `vm.constructor_remote` | (i32, i32, i32) -> i32 |
//! | `vm.call_function`      | (i32, i32, i32) -> i64 |
//! | `env.abort`             | (i32, i32, i32, i32)   |
//!
//! The composition imports (`call_method` through `call_function`) cannot
//! be served from inside the store: they run other guest code, possibly in
//! other containers. They raise a [`HostRequest`] instead, which suspends
//! the guest until the interpreter resumes it with the reply word. Origins
//! and package ids are passed as `ArrayBuffer`s, names as strings, and
//! arguments as one `ArrayBuffer` of packed words, each as wide as the
//! parameter's own size.

use alloc::string::String;
use alloc::vec::Vec;
use core::fmt;

use hashbrown::HashMap;
use wasmi::core::{HostError, Trap};
use wasmi::{Caller, Extern, Func, Linker, Memory, Store};

use crate::lock::{AuthContext, Lock, LOCK_ADDRESS, LOCK_JIG};
use crate::output::{Address, Pointer};
use crate::{PackageId, Result, VmError};

/// `jig_auth_check` query: may the actor call the jig?
pub const AUTH_CHECK_CALL: i32 = 0;
/// `jig_auth_check` query: may the actor relock the jig?
pub const AUTH_CHECK_LOCK: i32 = 1;

/// Authorization state visible to guest code during one call.
#[derive(Debug, Clone, Default)]
pub struct CallFrame {
    /// Origins of the jigs whose code is executing, innermost last.
    pub stack: Vec<Pointer>,
    /// Addresses whose signatures cover the current instruction.
    pub signers: Vec<Address>,
    /// Current lock of every jig known to the transaction.
    pub locks: HashMap<Pointer, Lock>,
    /// Lock changes granted during the call, in request order.
    pub lock_requests: Vec<(Pointer, Lock)>,
    /// Error raised by a host import; the guest trapped because of it.
    pub failure: Option<VmError>,
}

impl CallFrame {
    fn auth(&self) -> AuthContext<'_> {
        AuthContext::new(&self.stack, &self.signers)
    }

    fn lock_of(&self, origin: &Pointer) -> Result<Lock> {
        self.locks
            .get(origin)
            .copied()
            .ok_or_else(|| VmError::NotFound(alloc::format!("jig {} is not loaded", origin)))
    }

    /// Apply a lock change requested by guest code.
    pub fn request_lock(&mut self, origin: Pointer, next: Lock) -> Result<()> {
        let current = self.lock_of(&origin)?;
        current.check_change(&next, &origin, &self.auth())?;
        self.locks.insert(origin, next);
        self.lock_requests.push((origin, next));
        Ok(())
    }

    pub fn auth_check(&self, origin: &Pointer, check: i32) -> Result<bool> {
        let lock = self.lock_of(origin)?;
        let ctx = self.auth();
        match check {
            AUTH_CHECK_CALL => Ok(lock.can_call(origin, &ctx)),
            AUTH_CHECK_LOCK => Ok(lock.can_relock(origin, &ctx)),
            other => Err(VmError::Execution(alloc::format!("unknown auth check {}", other))),
        }
    }

    /// Whether the jig one level below the executing jig is `origin`.
    pub fn caller_is(&self, origin: &Pointer) -> bool {
        self.stack.len() >= 2 && self.stack[self.stack.len() - 2] == *origin
    }
}

/// Composition step requested by guest code.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostRequest {
    /// Call an instance method on another jig.
    CallMethod {
        target: Pointer,
        method: String,
        args: Vec<u8>,
    },
    /// Read a field of another jig.
    GetProp { target: Pointer, prop: String },
    /// Construct a jig of a class from the requesting package.
    ConstructLocal { class: String, args: Vec<u8> },
    /// Construct a jig of a class from another package.
    ConstructRemote {
        pkg: PackageId,
        class: String,
        args: Vec<u8>,
    },
    /// Call a free function of a package.
    CallFunction {
        pkg: PackageId,
        function: String,
        args: Vec<u8>,
    },
}

impl fmt::Display for HostRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostRequest::CallMethod { target, method, .. } => write!(f, "call {}.{}", target, method),
            HostRequest::GetProp { target, prop } => write!(f, "get {}.{}", target, prop),
            HostRequest::ConstructLocal { class, .. } => write!(f, "new {}", class),
            HostRequest::ConstructRemote { pkg, class, .. } => {
                write!(f, "new {} from {}", class, crate::output::to_hex(pkg))
            }
            HostRequest::CallFunction { pkg, function, .. } => {
                write!(f, "call {} from {}", function, crate::output::to_hex(pkg))
            }
        }
    }
}

impl HostError for HostRequest {}

/// Store data of every module container.
#[derive(Debug, Default)]
pub struct HostState {
    pub frame: CallFrame,
}

type HostCaller<'a> = Caller<'a, HostState>;

/// Record `err` as the reason for the trap and build the trap.
fn fail(caller: &mut HostCaller<'_>, err: VmError) -> Trap {
    let trap = Trap::new(err.to_string());
    caller.data_mut().frame.failure = Some(err);
    trap
}

fn guest_memory(caller: &HostCaller<'_>) -> Result<Memory> {
    caller
        .get_export("memory")
        .and_then(Extern::into_memory)
        .ok_or_else(|| VmError::Execution(String::from("guest exports no memory")))
}

/// Copy the payload of the guest object at `ptr`, sized by its pre-header.
fn read_object(caller: &HostCaller<'_>, ptr: i32) -> Result<Vec<u8>> {
    let memory = guest_memory(caller)?;
    let data = memory.data(caller);
    let ptr = ptr as u32 as usize;
    let oob = || VmError::Execution(alloc::format!("guest object at {:#x} out of bounds", ptr));
    let header = ptr.checked_sub(4).ok_or_else(oob)?;
    let size_bytes = data.get(header..ptr).ok_or_else(oob)?;
    let size = u32::from_le_bytes([size_bytes[0], size_bytes[1], size_bytes[2], size_bytes[3]]) as usize;
    let end = ptr.checked_add(size).ok_or_else(oob)?;
    data.get(ptr..end).map(<[u8]>::to_vec).ok_or_else(oob)
}

fn read_origin(caller: &HostCaller<'_>, ptr: i32) -> Result<Pointer> {
    Pointer::from_bytes(&read_object(caller, ptr)?)
}

fn read_guest_string(caller: &HostCaller<'_>, ptr: i32) -> Result<String> {
    if ptr == 0 {
        return Ok(String::new());
    }
    let bytes = read_object(caller, ptr)?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Ok(String::from_utf16_lossy(&units))
}

fn jig_lock(caller: &mut HostCaller<'_>, origin_ptr: i32, lock_type: i32, data_ptr: i32) -> Result<()> {
    let origin = read_origin(caller, origin_ptr)?;
    let code = lock_type as u8;
    let next = match code {
        LOCK_ADDRESS => Lock::from_parts(code, &read_object(caller, data_ptr)?)?,
        LOCK_JIG => {
            let parent = caller.data().frame.stack.last().copied().ok_or_else(|| {
                VmError::Execution(String::from("jig lock requested outside jig code"))
            })?;
            Lock::Jig(parent)
        }
        other => Lock::from_parts(other, &[])?,
    };
    log::debug!("[VM Host] lock {} -> {}", origin, next.describe());
    caller.data_mut().frame.request_lock(origin, next)
}

/// Packed argument words; a null pointer means no arguments.
fn read_args(caller: &HostCaller<'_>, ptr: i32) -> Result<Vec<u8>> {
    if ptr == 0 {
        return Ok(Vec::new());
    }
    read_object(caller, ptr)
}

fn read_package_id(caller: &HostCaller<'_>, ptr: i32) -> Result<PackageId> {
    let bytes = read_object(caller, ptr)?;
    PackageId::try_from(bytes.as_slice()).map_err(|_| {
        VmError::Execution(alloc::format!("package id must be 32 bytes, got {}", bytes.len()))
    })
}

fn call_method_request(caller: &HostCaller<'_>, origin: i32, name: i32, args: i32) -> Result<HostRequest> {
    Ok(HostRequest::CallMethod {
        target: read_origin(caller, origin)?,
        method: read_guest_string(caller, name)?,
        args: read_args(caller, args)?,
    })
}

fn construct_remote_request(caller: &HostCaller<'_>, pkg: i32, class: i32, args: i32) -> Result<HostRequest> {
    Ok(HostRequest::ConstructRemote {
        pkg: read_package_id(caller, pkg)?,
        class: read_guest_string(caller, class)?,
        args: read_args(caller, args)?,
    })
}

fn call_function_request(caller: &HostCaller<'_>, pkg: i32, name: i32, args: i32) -> Result<HostRequest> {
    Ok(HostRequest::CallFunction {
        pkg: read_package_id(caller, pkg)?,
        function: read_guest_string(caller, name)?,
        args: read_args(caller, args)?,
    })
}

/// Suspend the guest with `request`, or fail if it could not be read.
fn suspend(caller: &mut HostCaller<'_>, request: Result<HostRequest>) -> Trap {
    match request {
        Ok(request) => {
            log::trace!("[VM Host] suspend for {}", request);
            Trap::from(request)
        }
        Err(e) => fail(caller, e),
    }
}

fn link_err<E: core::fmt::Display>(e: E) -> VmError {
    VmError::Execution(alloc::format!("linker: {}", e))
}

/// Register every host import on `linker`.
pub fn define_imports(store: &mut Store<HostState>, linker: &mut Linker<HostState>) -> Result<()> {
    let jig_lock_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, origin: i32, lock_type: i32, data: i32| -> core::result::Result<(), Trap> {
            jig_lock(&mut caller, origin, lock_type, data).map_err(|e| fail(&mut caller, e))
        },
    );
    let auth_check_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, origin: i32, check: i32| -> core::result::Result<i32, Trap> {
            let result = read_origin(&caller, origin)
                .and_then(|origin| caller.data().frame.auth_check(&origin, check));
            match result {
                Ok(allowed) => Ok(i32::from(allowed)),
                Err(e) => Err(fail(&mut caller, e)),
            }
        },
    );
    let caller_is_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, origin: i32| -> core::result::Result<i32, Trap> {
            match read_origin(&caller, origin) {
                Ok(origin) => Ok(i32::from(caller.data().frame.caller_is(&origin))),
                Err(e) => Err(fail(&mut caller, e)),
            }
        },
    );
    let debug_str_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, msg: i32| -> core::result::Result<(), Trap> {
            match read_guest_string(&caller, msg) {
                Ok(msg) => {
                    log::debug!("[VM Guest] {}", msg);
                    Ok(())
                }
                Err(e) => Err(fail(&mut caller, e)),
            }
        },
    );
    let abort_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, msg: i32, file: i32, line: i32, col: i32| -> core::result::Result<(), Trap> {
            let msg = read_guest_string(&caller, msg).unwrap_or_default();
            let file = read_guest_string(&caller, file).unwrap_or_default();
            let err = VmError::Execution(alloc::format!(
                "guest aborted: {} ({}:{}:{})",
                msg,
                file,
                line,
                col
            ));
            Err(fail(&mut caller, err))
        },
    );

    let call_method_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, origin: i32, name: i32, args: i32| -> core::result::Result<i64, Trap> {
            let request = call_method_request(&caller, origin, name, args);
            Err(suspend(&mut caller, request))
        },
    );
    let get_prop_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, origin: i32, name: i32| -> core::result::Result<i64, Trap> {
            let request = read_origin(&caller, origin).and_then(|target| {
                Ok(HostRequest::GetProp {
                    target,
                    prop: read_guest_string(&caller, name)?,
                })
            });
            Err(suspend(&mut caller, request))
        },
    );
    let constructor_local_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, class: i32, args: i32| -> core::result::Result<i32, Trap> {
            let request = read_guest_string(&caller, class).and_then(|class| {
                Ok(HostRequest::ConstructLocal {
                    class,
                    args: read_args(&caller, args)?,
                })
            });
            Err(suspend(&mut caller, request))
        },
    );
    let constructor_remote_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, pkg: i32, class: i32, args: i32| -> core::result::Result<i32, Trap> {
            let request = construct_remote_request(&caller, pkg, class, args);
            Err(suspend(&mut caller, request))
        },
    );
    let call_function_fn = Func::wrap(
        &mut *store,
        |mut caller: HostCaller<'_>, pkg: i32, name: i32, args: i32| -> core::result::Result<i64, Trap> {
            let request = call_function_request(&caller, pkg, name, args);
            Err(suspend(&mut caller, request))
        },
    );

    linker
        .define("vm", "jig_lock", jig_lock_fn)
        .map_err(link_err)?
        .define("vm", "jig_auth_check", auth_check_fn)
        .map_err(link_err)?
        .define("vm", "caller_is", caller_is_fn)
        .map_err(link_err)?
        .define("vm", "debug_str", debug_str_fn)
        .map_err(link_err)?
        .define("vm", "call_method", call_method_fn)
        .map_err(link_err)?
        .define("vm", "get_prop", get_prop_fn)
        .map_err(link_err)?
        .define("vm", "constructor_local", constructor_local_fn)
        .map_err(link_err)?
        .define("vm", "constructor_remote", constructor_remote_fn)
        .map_err(link_err)?
        .define("vm", "call_function", call_function_fn)
        .map_err(link_err)?
        .define("env", "abort", abort_fn)
        .map_err(link_err)?;
    Ok(())
}
