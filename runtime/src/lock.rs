//! Jig locks and the authorization state machine.
//!
//! Every jig carries exactly one lock. The lock decides whether the current
//! actor (top-level transaction code, or the jig whose code is executing)
//! may call the jig or replace its lock:
//!
//! | lock            | call                     | relock                          |
//! |-----------------|--------------------------|---------------------------------|
//! | `None`          | anyone                   | anyone                          |
//! | `Address(a)`    | tx signed by `a`         | tx signed by `a`                |
//! | `Jig(parent)`   | code running as `parent` | code running as `parent`        |
//! | `Public`        | anyone                   | only the jig itself, to `Frozen`|
//! | `Frozen`        | nobody                   | nobody                          |

use bitflags::bitflags;

use crate::codec::{BufReader, BufWriter};
use crate::output::{Address, Pointer, ADDRESS_LEN, POINTER_LEN};
use crate::{Result, VmError};

/// Wire codes of each lock type.
pub const LOCK_NONE: u8 = 0;
pub const LOCK_ADDRESS: u8 = 1;
pub const LOCK_JIG: u8 = 2;
pub const LOCK_PUBLIC: u8 = 3;
pub const LOCK_FROZEN: u8 = 0xff;

bitflags! {
    /// What the current actor may do to a jig.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Grants: u8 {
        /// Invoke instance methods.
        const CALL = 1 << 0;
        /// Replace the lock with any other lock.
        const RELOCK = 1 << 1;
        /// Replace the lock with `Frozen` only.
        const FREEZE = 1 << 2;
    }
}

/// Authorization object attached to a jig.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Lock {
    #[default]
    None,
    Address(Address),
    Jig(Pointer),
    Public,
    Frozen,
}

/// Who is acting: the stack of executing jigs and the signers covering the
/// current instruction.
#[derive(Debug, Clone, Copy)]
pub struct AuthContext<'a> {
    pub stack: &'a [Pointer],
    pub signers: &'a [Address],
}

impl<'a> AuthContext<'a> {
    pub fn new(stack: &'a [Pointer], signers: &'a [Address]) -> Self {
        AuthContext { stack, signers }
    }

    /// The jig whose code is currently executing, if any.
    pub fn current(&self) -> Option<&Pointer> {
        self.stack.last()
    }

    pub fn signed_by(&self, addr: &Address) -> bool {
        self.signers.contains(addr)
    }
}

impl Lock {
    pub fn code(&self) -> u8 {
        match self {
            Lock::None => LOCK_NONE,
            Lock::Address(_) => LOCK_ADDRESS,
            Lock::Jig(_) => LOCK_JIG,
            Lock::Public => LOCK_PUBLIC,
            Lock::Frozen => LOCK_FROZEN,
        }
    }

    /// Lock payload as stored in guest memory and on the wire.
    pub fn data(&self) -> alloc::vec::Vec<u8> {
        match self {
            Lock::Address(addr) => addr.0.to_vec(),
            Lock::Jig(parent) => parent.to_bytes().to_vec(),
            _ => alloc::vec::Vec::new(),
        }
    }

    /// Build a lock from its code and payload.
    pub fn from_parts(code: u8, data: &[u8]) -> Result<Self> {
        match code {
            LOCK_NONE => Ok(Lock::None),
            LOCK_ADDRESS => Ok(Lock::Address(Address::from_bytes(data)?)),
            LOCK_JIG => Ok(Lock::Jig(Pointer::from_bytes(data)?)),
            LOCK_PUBLIC => Ok(Lock::Public),
            LOCK_FROZEN => Ok(Lock::Frozen),
            other => Err(VmError::Execution(alloc::format!("unknown lock type {}", other))),
        }
    }

    pub fn write(&self, w: &mut BufWriter) {
        w.write_u8(self.code());
        w.write_fixed_bytes(&self.data());
    }

    pub fn read(r: &mut BufReader<'_>) -> Result<Self> {
        let code = r.read_u8()?;
        let len = match code {
            LOCK_ADDRESS => ADDRESS_LEN,
            LOCK_JIG => POINTER_LEN,
            _ => 0,
        };
        let data = r.read_fixed_bytes(len)?;
        Lock::from_parts(code, data)
    }

    /// Grants held by the acting context over the jig `target` locked by `self`.
    pub fn grants(&self, target: &Pointer, ctx: &AuthContext<'_>) -> Grants {
        match self {
            Lock::None => Grants::CALL | Grants::RELOCK,
            Lock::Address(addr) if ctx.signed_by(addr) => Grants::CALL | Grants::RELOCK,
            Lock::Jig(parent) if ctx.current() == Some(parent) => Grants::CALL | Grants::RELOCK,
            Lock::Public if ctx.current() == Some(target) => Grants::CALL | Grants::FREEZE,
            Lock::Public => Grants::CALL,
            _ => Grants::empty(),
        }
    }

    pub fn can_call(&self, target: &Pointer, ctx: &AuthContext<'_>) -> bool {
        self.grants(target, ctx).contains(Grants::CALL)
    }

    pub fn can_relock(&self, target: &Pointer, ctx: &AuthContext<'_>) -> bool {
        self.grants(target, ctx).contains(Grants::RELOCK)
    }

    /// Whether the lock may be replaced by `next`.
    pub fn can_change_to(&self, next: &Lock, target: &Pointer, ctx: &AuthContext<'_>) -> bool {
        let grants = self.grants(target, ctx);
        grants.contains(Grants::RELOCK)
            || (grants.contains(Grants::FREEZE) && *next == Lock::Frozen)
    }

    pub fn check_call(&self, target: &Pointer, ctx: &AuthContext<'_>) -> Result<()> {
        if self.can_call(target, ctx) {
            Ok(())
        } else {
            Err(VmError::Auth(alloc::format!(
                "jig {} is not callable under lock {}",
                target,
                self.describe()
            )))
        }
    }

    pub fn check_change(&self, next: &Lock, target: &Pointer, ctx: &AuthContext<'_>) -> Result<()> {
        if self.can_change_to(next, target, ctx) {
            Ok(())
        } else {
            Err(VmError::Auth(alloc::format!(
                "lock {} of jig {} cannot be changed to {}",
                self.describe(),
                target,
                next.describe()
            )))
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            Lock::None => "NONE",
            Lock::Address(_) => "ADDRESS",
            Lock::Jig(_) => "JIG",
            Lock::Public => "PUBLIC",
            Lock::Frozen => "FROZEN",
        }
    }
}
