//! Shared wasmi engine.
//!
//! One interpreter engine backs every module container so compiled code and
//! function types can be shared between stores.

use alloc::sync::Arc;
use spin::Mutex;

use wasmi::{Engine, Module};

use crate::{Result, VmError};

/// Global engine instance, created on first use.
static WASM_ENGINE: Mutex<Option<Arc<Engine>>> = Mutex::new(None);

/// Get the global engine, initializing it if needed.
pub fn get() -> Arc<Engine> {
    let mut guard = WASM_ENGINE.lock();
    guard
        .get_or_insert_with(|| {
            log::debug!("[VM Engine] initializing wasmi engine");
            Arc::new(Engine::default())
        })
        .clone()
}

/// Parse and validate a module against the global engine.
pub fn compile(engine: &Engine, wasm: &[u8]) -> Result<Module> {
    Module::new(engine, wasm)
        .map_err(|e| VmError::Execution(alloc::format!("invalid guest module: {}", e)))
}
