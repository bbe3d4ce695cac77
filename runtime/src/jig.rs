//! Jig handles tracked by the interpreter.

use alloc::vec::Vec;

use crate::lock::Lock;
use crate::memory::WasmWord;
use crate::output::{Output, Pointer};
use crate::PackageId;

/// Where a jig's state currently lives.
#[derive(Debug, Clone, PartialEq)]
pub enum JigBacking {
    /// Instance at `ptr` in the container of its class package.
    Local { ptr: WasmWord },
    /// Not yet hydrated; only the persisted state is known.
    Remote { state: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct JigRef {
    pub origin: Pointer,
    pub class_ptr: Pointer,
    pub lock: Lock,
    pub backing: JigBacking,
    /// Output the jig was loaded from; `None` for jigs created by this
    /// transaction.
    pub source: Option<Output>,
}

impl JigRef {
    pub fn loaded(output: Output) -> Self {
        JigRef {
            origin: output.origin,
            class_ptr: output.class_ptr,
            lock: output.lock,
            backing: JigBacking::Remote {
                state: output.state.clone(),
            },
            source: Some(output),
        }
    }

    pub fn created(origin: Pointer, class_ptr: Pointer, ptr: WasmWord) -> Self {
        JigRef {
            origin,
            class_ptr,
            lock: Lock::None,
            backing: JigBacking::Local { ptr },
            source: None,
        }
    }

    pub fn package_id(&self) -> PackageId {
        self.class_ptr.id
    }

    pub fn class_idx(&self) -> u32 {
        self.class_ptr.idx
    }

    pub fn is_new(&self) -> bool {
        self.source.is_none()
    }

    pub fn local_ptr(&self) -> Option<WasmWord> {
        match self.backing {
            JigBacking::Local { ptr } => Some(ptr),
            JigBacking::Remote { .. } => None,
        }
    }

    /// Location before this transaction; for new jigs, the origin.
    pub fn prior_location(&self) -> Pointer {
        self.source
            .as_ref()
            .map(|o| o.location)
            .unwrap_or(self.origin)
    }

    /// Output header as seen from inside the guest before commit.
    pub fn header(&self, state: Vec<u8>) -> Output {
        Output::new(self.origin, self.prior_location(), self.class_ptr, self.lock, state)
    }
}
