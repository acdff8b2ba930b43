//! Execution contexts
//!
//! A context is an independent global scope inside an isolate. Each one is
//! given a process-unique [`ContextRef`] at creation and registered in the
//! process-wide [`ContextDirectory`]; native call-ins carry only that number
//! and resolve it back through the directory.

use crate::error::{fatal, MisuseError, Result};
use crate::isolate::{IsolateCore, IsolateHandle, ScopeKind};
use crate::registry::ContextDirectory;
use crate::template::ObjectTemplate;
use crate::value::{Object, Value};
use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_sdk::{ContextPtr, ContextRef, Primitive};

static CONTEXTS: Lazy<ContextDirectory<Context>> = Lazy::new(ContextDirectory::new);

/// The process-wide context directory
pub fn directory() -> &'static ContextDirectory<Context> {
    &CONTEXTS
}

/// Options for creating a context
#[derive(Debug, Default, Clone, Copy)]
pub struct ContextOptions<'a> {
    /// Template for the context's global object
    pub global_template: Option<&'a ObjectTemplate>,
}

struct ContextShared {
    ctx_ref: ContextRef,
    ptr: ContextPtr,
    core: Arc<IsolateCore>,
    closed: AtomicBool,
    // The isolate's internal context belongs to the native isolate
    owned: bool,
}

/// An execution context
///
/// Cloning is cheap and every clone refers to the same native context.
#[derive(Clone)]
pub struct Context(Arc<ContextShared>);

impl Context {
    /// Create a context in `iso`
    pub fn new(iso: &IsolateHandle) -> Self {
        Self::with_options(iso, ContextOptions::default())
    }

    /// Create a context in `iso` with options
    pub fn with_options(iso: &IsolateHandle, options: ContextOptions<'_>) -> Self {
        let core = iso.core();
        let _scope = core.scope(ScopeKind::Host);

        let global_template = options.global_template.map(|t| {
            t.assert_isolate(core);
            t.ptr()
        });

        let ctx_ref = CONTEXTS.next_ref();
        let ptr = core.engine.new_context(core.ptr, global_template, ctx_ref);
        let ctx = Context(Arc::new(ContextShared {
            ctx_ref,
            ptr,
            core: Arc::clone(core),
            closed: AtomicBool::new(false),
            owned: true,
        }));

        CONTEXTS.register(ctx_ref, ctx.clone());
        core.add_context(ctx.clone());
        ctx
    }

    pub(crate) fn internal(core: Arc<IsolateCore>, ctx_ref: ContextRef, ptr: ContextPtr) -> Self {
        Context(Arc::new(ContextShared {
            ctx_ref,
            ptr,
            core,
            closed: AtomicBool::new(false),
            owned: false,
        }))
    }

    pub(crate) fn core(&self) -> &Arc<IsolateCore> {
        &self.0.core
    }

    /// The reference native call-ins use for this context
    pub fn ref_id(&self) -> ContextRef {
        self.0.ctx_ref
    }

    /// The isolate this context belongs to
    pub fn isolate(&self) -> IsolateHandle {
        IsolateHandle::from_core(Arc::clone(&self.0.core))
    }

    /// Whether the context has been closed
    pub fn is_closed(&self) -> bool {
        self.0.closed.load(Ordering::Acquire)
    }

    /// Native context pointer; fatal once closed
    #[track_caller]
    pub fn native_ptr(&self) -> ContextPtr {
        if self.is_closed() {
            fatal(MisuseError::ContextClosed);
        }
        self.0.ptr
    }

    /// The global object
    pub fn global(&self) -> Object {
        let core = self.core();
        let _scope = core.scope(ScopeKind::Host);
        let raw = core.engine.context_global(self.native_ptr());
        Object::from_value_unchecked(Value::track(core, raw))
    }

    /// Create a primitive value in this context
    pub fn new_value(&self, value: impl Into<Primitive>) -> Value {
        let value = value.into();
        let core = self.core();
        let _scope = core.scope(ScopeKind::Host);
        let raw = core.engine.new_value(self.native_ptr(), &value);
        Value::track(core, raw)
    }

    /// Compile and run `source`, returning the value of its last statement
    ///
    /// `origin` names the script in error locations.
    pub fn run_script(&self, source: &str, origin: &str) -> Result<Value> {
        let core = self.core();
        let _scope = core.scope(ScopeKind::Host);
        let raw = core.engine.run_script(self.native_ptr(), source, origin)?;
        Ok(Value::track(core, raw))
    }

    /// Run pending microtasks until the queue is empty
    pub fn perform_microtask_checkpoint(&self) {
        let core = self.core();
        let _scope = core.scope(ScopeKind::Host);
        self.native_ptr();
        core.engine.perform_microtask_checkpoint(core.ptr);
    }

    /// Close the context
    ///
    /// Deregisters the context reference and frees the native context.
    /// Values created in the context stay valid until released. Closing twice
    /// is a no-op, and the isolate's internal context cannot be closed.
    pub fn close(&self) {
        if !self.0.owned {
            tracing::warn!(context = %self.0.ctx_ref, "internal context cannot be closed");
            return;
        }
        if self.is_closed() {
            return;
        }

        let core = self.core();
        let _scope = core.scope(ScopeKind::Host);
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        core.forget_context(self.0.ctx_ref);
        self.release_native();
    }

    pub(crate) fn close_for_dispose(&self) {
        if !self.0.closed.swap(true, Ordering::AcqRel) {
            self.release_native();
        }
    }

    fn release_native(&self) {
        CONTEXTS.deregister(self.0.ctx_ref);
        if self.0.owned {
            self.0.core.engine.free_context(self.0.ptr);
        }
        tracing::debug!(context = %self.0.ctx_ref, "context closed");
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Context {}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("ref", &self.0.ctx_ref)
            .field("ptr", &self.0.ptr)
            .field("closed", &self.is_closed())
            .finish()
    }
}
