//! Isolate lifecycle
//!
//! An isolate is one independent engine instance. It owns the handle table,
//! the callback and template registries, and every compiled script and open
//! context created against it.
//!
//! # States
//!
//! ```text
//! Created ──▶ Running ──▶ Stopping ──▶ Disposed
//! ```
//!
//! Disposal runs in a fixed order so no stage touches memory freed by an
//! earlier one:
//!
//! 1. stop the handle table (no new tracking, releases become no-ops)
//! 2. drain every tracked and releasable handle in native batches
//! 3. release compiled scripts
//! 4. close contexts still open, including the isolate's internal context
//! 5. release templates
//! 6. drop host callbacks
//! 7. dispose the native isolate
//!
//! Any operation after that is fatal, as is a second disposal.

mod scope;
mod scripts;

pub(crate) use scope::{NativeScope, ScopeKind};
pub use scripts::UnboundScript;

use crate::config::IsolateOptions;
use crate::context::{self, Context};
use crate::dispatch::FunctionCallback;
use crate::error::{fatal, Error, MisuseError, Result};
use crate::handles::{HandleSlot, HandleState, HandleStats, HandleTable};
use crate::registry::{CallbackRegistry, TemplateRegistry};
use crate::value::Value;
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use scripts::ScriptSet;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tether_sdk::{
    CompileMode, CompileOptions, ContextPtr, ContextRef, HeapStatistics, IsolatePtr,
    NativeEngine, Primitive, RawHandle,
};

/// Lifecycle state of an isolate
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateState {
    /// Native isolate exists, singletons not yet created
    Created = 0,
    /// Accepting work
    Running = 1,
    /// Disposal in progress
    Stopping = 2,
    /// Terminal
    Disposed = 3,
}

impl IsolateState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => IsolateState::Created,
            1 => IsolateState::Running,
            2 => IsolateState::Stopping,
            _ => IsolateState::Disposed,
        }
    }
}

/// Shared state of one isolate
pub(crate) struct IsolateCore {
    pub(crate) engine: Arc<dyn NativeEngine>,
    pub(crate) ptr: IsolatePtr,
    state: AtomicU8,
    pub(crate) handles: HandleTable,
    pub(crate) callbacks: CallbackRegistry<FunctionCallback>,
    pub(crate) templates: TemplateRegistry,
    scripts: ScriptSet,
    contexts: Mutex<Vec<Context>>,
    internal_ptr: ContextPtr,
    null: Arc<HandleSlot>,
    undefined: Arc<HandleSlot>,
    entry: ReentrantMutex<()>,
    depth: AtomicUsize,
    parked: Mutex<Vec<Value>>,
    native_alive: RwLock<bool>,
    options: IsolateOptions,
}

impl IsolateCore {
    pub(crate) fn state(&self) -> IsolateState {
        IsolateState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[track_caller]
    pub(crate) fn assert_running(&self) {
        if self.state() != IsolateState::Running {
            fatal(MisuseError::IsolateDisposed);
        }
    }

    pub(crate) fn scope(&self, kind: ScopeKind) -> NativeScope<'_> {
        NativeScope::enter(self, kind)
    }

    pub(crate) fn internal_ptr(&self) -> ContextPtr {
        self.internal_ptr
    }

    pub(crate) fn null_slot(&self) -> &Arc<HandleSlot> {
        &self.null
    }

    pub(crate) fn undefined_slot(&self) -> &Arc<HandleSlot> {
        &self.undefined
    }

    pub(crate) fn add_context(&self, ctx: Context) {
        self.contexts.lock().push(ctx);
    }

    pub(crate) fn forget_context(&self, r: ContextRef) {
        self.contexts.lock().retain(|c| c.ref_id() != r);
    }

    /// Keep a value handed to native code alive until the host regains control
    pub(crate) fn park(&self, value: Value) {
        self.parked.lock().push(value);
    }

    /// Move handles to releasable, flushing if the batch threshold is hit
    pub(crate) fn mark_releasable(&self, slots: &[Arc<HandleSlot>]) {
        self.handles.mark_releasable(slots);

        let batch = self.options.release_batch_size;
        if batch > 0 && self.handles.releasable_count() >= batch {
            self.try_flush();
        }
    }

    /// Flush releasable handles if no other thread is inside the isolate
    pub(crate) fn try_flush(&self) -> Option<usize> {
        let _entry = self.entry.try_lock()?;
        if self.state() != IsolateState::Running {
            return None;
        }
        Some(self.handles.flush_releasable(&*self.engine))
    }

    fn on_outermost_exit(&self) {
        let parked = std::mem::take(&mut *self.parked.lock());
        if !parked.is_empty() {
            let slots: Vec<_> = parked.into_iter().map(Value::into_slot).collect();
            tracing::trace!(count = slots.len(), "releasing returned values");
            self.handles.mark_releasable(&slots);
        }

        if self.options.flush_on_exit && self.state() == IsolateState::Running {
            self.handles.flush_releasable(&*self.engine);
        }
    }

    pub(crate) fn dispose(&self) {
        let entry = self.entry.lock();
        if self.depth.load(Ordering::Acquire) > 0 {
            drop(entry);
            fatal(MisuseError::DisposeDuringCall);
        }
        if self
            .state
            .compare_exchange(
                IsolateState::Running as u8,
                IsolateState::Stopping as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            drop(entry);
            fatal(MisuseError::DoubleDispose);
        }
        tracing::debug!(isolate = ?self.ptr, "isolate stopping");

        self.handles.stop();
        let freed = self.handles.drain_all(&*self.engine);
        drop(std::mem::take(&mut *self.parked.lock()));

        let scripts = self.scripts.release_all(&*self.engine);

        let contexts = std::mem::take(&mut *self.contexts.lock());
        let closed = contexts.len();
        for ctx in contexts {
            ctx.close_for_dispose();
        }

        let templates = self.templates.release_all(&*self.engine);
        let callbacks = self.callbacks.clear();

        *self.native_alive.write() = false;
        self.engine.dispose_isolate(self.ptr);
        self.state.store(IsolateState::Disposed as u8, Ordering::Release);

        tracing::debug!(
            isolate = ?self.ptr,
            freed,
            scripts,
            contexts = closed,
            templates,
            callbacks,
            "isolate disposed"
        );
    }
}

/// A shared reference to an isolate
///
/// Handles are cheap to clone and may be captured by host callbacks. They
/// cannot dispose the isolate; only the owning [`Isolate`] can.
#[derive(Clone)]
pub struct IsolateHandle {
    core: Arc<IsolateCore>,
}

impl IsolateHandle {
    pub(crate) fn from_core(core: Arc<IsolateCore>) -> Self {
        Self { core }
    }

    pub(crate) fn core(&self) -> &Arc<IsolateCore> {
        &self.core
    }

    /// The native engine this isolate runs on
    pub fn engine(&self) -> &Arc<dyn NativeEngine> {
        &self.core.engine
    }

    /// Current lifecycle state
    pub fn state(&self) -> IsolateState {
        self.core.state()
    }

    /// Whether the isolate has been disposed
    pub fn is_disposed(&self) -> bool {
        self.core.state() == IsolateState::Disposed
    }

    /// The `null` singleton
    pub fn null(&self) -> Value {
        self.core.assert_running();
        Value::pinned(&self.core, self.core.null_slot())
    }

    /// The `undefined` singleton
    pub fn undefined(&self) -> Value {
        self.core.assert_running();
        Value::pinned(&self.core, self.core.undefined_slot())
    }

    /// Create a primitive value in the isolate's internal context
    pub fn new_value(&self, value: impl Into<Primitive>) -> Value {
        let value = value.into();
        let _scope = self.core.scope(ScopeKind::Host);
        let raw = self.core.engine.new_value(self.core.internal_ptr(), &value);
        Value::track(&self.core, raw)
    }

    /// Create a context with a default global object
    pub fn new_context(&self) -> Context {
        Context::new(self)
    }

    /// Compile a script that can later run in any context of this isolate
    ///
    /// Consuming a code cache and forcing eager compilation are mutually
    /// exclusive.
    pub fn compile_unbound_script(
        &self,
        source: &str,
        origin: &str,
        options: CompileOptions,
    ) -> Result<UnboundScript> {
        if options.cached_data.is_some() && options.mode != CompileMode::Default {
            return Err(Error::InvalidArgument(
                "compile mode and cached data cannot both be set".to_string(),
            ));
        }

        let _scope = self.core.scope(ScopeKind::Host);
        let compiled = self
            .core
            .engine
            .compile_unbound_script(self.core.ptr, source, origin, &options)?;
        let entry = self.core.scripts.insert(compiled.ptr);
        if compiled.cached_data_rejected {
            tracing::debug!(origin, "code cache rejected");
        }
        Ok(UnboundScript::new(
            Arc::clone(&self.core),
            entry,
            compiled.cached_data_rejected,
        ))
    }

    /// Ask the running script to stop
    ///
    /// Asynchronous: the script may still be running when this returns.
    pub fn terminate_execution(&self) {
        self.terminate_handle().terminate();
    }

    /// Whether a termination is unwinding script frames right now
    pub fn is_execution_terminating(&self) -> bool {
        let alive = self.core.native_alive.read();
        *alive && self.core.engine.is_execution_terminating(self.core.ptr)
    }

    /// A handle that can terminate execution from any thread
    pub fn terminate_handle(&self) -> TerminateHandle {
        TerminateHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Schedule `exception` to be thrown when the current callback returns
    pub fn throw_exception(&self, exception: &Value) -> Value {
        exception.assert_isolate(&self.core);
        let _scope = self.core.scope(ScopeKind::Host);
        let raw = self.core.engine.throw_exception(self.core.ptr, exception.raw());
        Value::track(&self.core, raw)
    }

    /// Heap statistics reported by the engine
    pub fn heap_statistics(&self) -> HeapStatistics {
        let _scope = self.core.scope(ScopeKind::Host);
        self.core.engine.heap_statistics(self.core.ptr)
    }

    /// Number of handles not yet freed (tracked plus releasable)
    pub fn traced_value_count(&self) -> usize {
        self.core.handles.tracked_count() + self.core.handles.releasable_count()
    }

    /// Handle table counters
    pub fn handle_stats(&self) -> HandleStats {
        self.core.handles.stats()
    }

    /// Where `raw` stands in this isolate's handle table
    ///
    /// `None` once the handle was freed, or if it was never tracked here.
    pub fn handle_state(&self, raw: RawHandle) -> Option<HandleState> {
        if self.core.handles.is_tracked(raw) {
            Some(HandleState::Tracked)
        } else if self.core.handles.is_releasable(raw) {
            Some(HandleState::Releasable)
        } else {
            None
        }
    }

    /// Mark several values releasable with one table update
    pub fn batch_mark_releasable(&self, values: impl IntoIterator<Item = Value>) {
        let slots: Vec<_> = values
            .into_iter()
            .filter_map(|v| {
                v.assert_isolate(&self.core);
                v.into_releasable_slot()
            })
            .collect();
        self.core.mark_releasable(&slots);
    }

    /// Free every releasable handle now
    pub fn flush_releasable(&self) -> usize {
        let _scope = self.core.scope(ScopeKind::Host);
        self.core.handles.flush_releasable(&*self.core.engine)
    }

    /// Number of compiled scripts awaiting release
    pub fn script_count(&self) -> usize {
        self.core.scripts.len()
    }

    /// Number of templates awaiting release
    pub fn template_count(&self) -> usize {
        self.core.templates.len()
    }

    /// Number of registered host callbacks
    pub fn callback_count(&self) -> usize {
        self.core.callbacks.len()
    }

    /// Whether two handles refer to the same isolate
    pub fn same_isolate(&self, other: &IsolateHandle) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }
}

impl std::fmt::Debug for IsolateHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Isolate")
            .field("ptr", &self.core.ptr)
            .field("state", &self.core.state())
            .finish()
    }
}

/// Terminates script execution from any thread
#[derive(Clone)]
pub struct TerminateHandle {
    core: Arc<IsolateCore>,
}

impl TerminateHandle {
    /// Request termination; ignored once the isolate is gone
    pub fn terminate(&self) -> bool {
        let alive = self.core.native_alive.read();
        if !*alive {
            return false;
        }
        tracing::debug!(isolate = ?self.core.ptr, "terminating execution");
        self.core.engine.terminate_execution(self.core.ptr);
        true
    }
}

/// The owner of an isolate
///
/// Dropping the owner disposes the isolate if [`dispose`](Self::dispose) was
/// not called. Shared access goes through [`IsolateHandle`], which this type
/// dereferences to.
pub struct Isolate {
    handle: IsolateHandle,
}

impl Isolate {
    /// Create an isolate with default options
    pub fn new(engine: Arc<dyn NativeEngine>) -> Self {
        Self::with_options(engine, IsolateOptions::default())
    }

    /// Create an isolate
    pub fn with_options(engine: Arc<dyn NativeEngine>, options: IsolateOptions) -> Self {
        let internal_ref = context::directory().next_ref();
        let ptr = engine.new_isolate(internal_ref);
        let internal_ptr = engine.default_context(ptr);

        let handles = HandleTable::new(options.trace_memory);
        let null = handles.track(engine.new_value(internal_ptr, &Primitive::Null));
        let undefined = handles.track(engine.new_value(internal_ptr, &Primitive::Undefined));

        let core = Arc::new(IsolateCore {
            engine,
            ptr,
            state: AtomicU8::new(IsolateState::Created as u8),
            handles,
            callbacks: CallbackRegistry::new(),
            templates: TemplateRegistry::new(),
            scripts: ScriptSet::default(),
            contexts: Mutex::new(Vec::new()),
            internal_ptr,
            null,
            undefined,
            entry: ReentrantMutex::new(()),
            depth: AtomicUsize::new(0),
            parked: Mutex::new(Vec::new()),
            native_alive: RwLock::new(true),
            options,
        });

        let internal = Context::internal(Arc::clone(&core), internal_ref, internal_ptr);
        context::directory().register(internal_ref, internal.clone());
        core.add_context(internal);

        core.state.store(IsolateState::Running as u8, Ordering::Release);
        tracing::debug!(isolate = ?ptr, internal = %internal_ref, "isolate created");

        Self {
            handle: IsolateHandle::from_core(core),
        }
    }

    /// Get a shareable handle
    pub fn handle(&self) -> IsolateHandle {
        self.handle.clone()
    }

    /// Dispose the isolate
    ///
    /// Fatal if called twice or from inside one of the isolate's callbacks.
    pub fn dispose(&self) {
        self.handle.core.dispose();
    }
}

impl std::ops::Deref for Isolate {
    type Target = IsolateHandle;

    fn deref(&self) -> &IsolateHandle {
        &self.handle
    }
}

impl Drop for Isolate {
    fn drop(&mut self) {
        let core = &self.handle.core;
        // waits out call-ins on other threads; a call-in on this thread still shows depth > 0
        let _entry = core.entry.lock();
        if core.state() != IsolateState::Running {
            return;
        }
        if core.depth.load(Ordering::Acquire) > 0 {
            tracing::warn!(isolate = ?core.ptr, "isolate dropped during a native call, not disposing");
            return;
        }
        core.dispose();
    }
}

impl std::fmt::Debug for Isolate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}
