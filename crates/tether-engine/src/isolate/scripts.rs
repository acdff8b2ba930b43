//! Unbound scripts

use super::{IsolateCore, ScopeKind};
use crate::context::Context;
use crate::error::{fatal, MisuseError, Result};
use crate::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_sdk::{CachedData, NativeEngine, ScriptPtr};

pub(crate) struct ScriptEntry {
    ptr: ScriptPtr,
    released: AtomicBool,
}

/// Compiled scripts owned by one isolate, released together at disposal
#[derive(Default)]
pub(crate) struct ScriptSet {
    entries: Mutex<Vec<Arc<ScriptEntry>>>,
}

impl ScriptSet {
    pub(crate) fn insert(&self, ptr: ScriptPtr) -> Arc<ScriptEntry> {
        let entry = Arc::new(ScriptEntry {
            ptr,
            released: AtomicBool::new(false),
        });
        self.entries.lock().push(Arc::clone(&entry));
        entry
    }

    pub(crate) fn release_all(&self, engine: &dyn NativeEngine) -> usize {
        let entries = std::mem::take(&mut *self.entries.lock());
        let mut released = 0;
        for entry in entries {
            if !entry.released.swap(true, Ordering::AcqRel) {
                engine.release_script(entry.ptr);
                released += 1;
            }
        }
        released
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

/// A compiled script not bound to any context
///
/// Runs in any context of the isolate that compiled it. The native script is
/// released when the isolate is disposed.
#[derive(Clone)]
pub struct UnboundScript {
    entry: Arc<ScriptEntry>,
    core: Arc<IsolateCore>,
    cached_data_rejected: bool,
}

impl UnboundScript {
    pub(crate) fn new(core: Arc<IsolateCore>, entry: Arc<ScriptEntry>, rejected: bool) -> Self {
        Self {
            entry,
            core,
            cached_data_rejected: rejected,
        }
    }

    /// Whether the engine rejected the code cache passed at compile time
    pub fn cached_data_rejected(&self) -> bool {
        self.cached_data_rejected
    }

    /// Bind the script to `ctx` and run it
    pub fn run(&self, ctx: &Context) -> Result<Value> {
        if !Arc::ptr_eq(&self.core, ctx.core()) {
            fatal(MisuseError::ForeignValue);
        }
        let _scope = self.core.scope(ScopeKind::Host);
        let raw = self
            .core
            .engine
            .run_unbound_script(ctx.native_ptr(), self.live_ptr())?;
        Ok(Value::track(&self.core, raw))
    }

    /// Produce a code cache that later compilations can consume
    pub fn create_code_cache(&self) -> CachedData {
        let _scope = self.core.scope(ScopeKind::Host);
        self.core.engine.create_code_cache(self.live_ptr())
    }

    fn live_ptr(&self) -> ScriptPtr {
        if self.entry.released.load(Ordering::Acquire) {
            fatal(MisuseError::IsolateDisposed);
        }
        self.entry.ptr
    }
}

impl std::fmt::Debug for UnboundScript {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("UnboundScript").field(&self.entry.ptr).finish()
    }
}
