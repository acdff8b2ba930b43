//! The native engine contract
//!
//! Defines every call the bridge makes into the native engine. An engine
//! binding implements [`NativeEngine`]; the bridge never touches native
//! memory except through these methods.
//!
//! Call-ins travel the other way: when script code invokes a host function
//! the engine calls the bridge's dispatch entry point with the context and
//! callback references it was given here.

use crate::error::NativeResult;
use crate::handle::{CallbackRef, ContextPtr, ContextRef, IsolatePtr, RawHandle, ScriptPtr, TemplatePtr};
use crate::value::{Primitive, PropertyAttribute, TemplateValue, ValueKind};

/// Heap statistics for one isolate
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatistics {
    /// Total heap size in bytes
    pub total_heap_size: u64,
    /// Executable part of the heap in bytes
    pub total_heap_size_executable: u64,
    /// Committed physical memory in bytes
    pub total_physical_size: u64,
    /// Bytes available before hitting the limit
    pub total_available_size: u64,
    /// Bytes in use by live objects
    pub used_heap_size: u64,
    /// Heap size limit in bytes
    pub heap_size_limit: u64,
    /// Memory allocated outside the managed heap
    pub malloced_memory: u64,
    /// External memory reported by embedders
    pub external_memory: u64,
    /// Peak of `malloced_memory`
    pub peak_malloced_memory: u64,
    /// Number of live native contexts
    pub number_of_native_contexts: u64,
    /// Number of contexts detached but not yet collected
    pub number_of_detached_contexts: u64,
}

/// How an unbound script should be compiled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompileMode {
    /// Let the engine decide
    #[default]
    Default,
    /// Compile every function eagerly
    Eager,
}

/// A code cache produced by a previous compilation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedData {
    /// Engine-specific cache bytes
    pub bytes: Vec<u8>,
}

/// Options for compiling an unbound script
///
/// `cached_data` and a non-default `mode` are mutually exclusive.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Code cache to consume
    pub cached_data: Option<CachedData>,
    /// Compilation mode
    pub mode: CompileMode,
}

/// Result of compiling an unbound script
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompiledScript {
    /// The compiled script
    pub ptr: ScriptPtr,
    /// Whether the supplied code cache was rejected
    pub cached_data_rejected: bool,
}

/// The single native free the bridge is allowed to issue for value handles
pub trait BatchRelease {
    /// Free every handle in `handles` exactly once
    ///
    /// The bridge guarantees it holds no isolate lock while calling this, so
    /// an implementation may re-enter the bridge (for example by running
    /// finalizers that mark more handles releasable).
    fn release_batch(&self, handles: &[RawHandle]);
}

/// Every call-out from the bridge into the native engine.
///
/// Methods returning [`RawHandle`] hand ownership of a fresh native record
/// to the bridge. Methods taking one only borrow it.
pub trait NativeEngine: BatchRelease + Send + Sync {
    // ========================================================================
    // Isolates
    // ========================================================================

    /// Create an isolate whose default context answers to `internal_ref`
    fn new_isolate(&self, internal_ref: ContextRef) -> IsolatePtr;

    /// Get the default context created together with the isolate
    fn default_context(&self, iso: IsolatePtr) -> ContextPtr;

    /// Dispose the isolate and everything it still owns natively
    fn dispose_isolate(&self, iso: IsolatePtr);

    /// Ask the running script to stop (asynchronous, thread-safe)
    fn terminate_execution(&self, iso: IsolatePtr);

    /// Whether a termination is currently unwinding script frames
    fn is_execution_terminating(&self, iso: IsolatePtr) -> bool;

    /// Run the default microtask queue until empty
    fn perform_microtask_checkpoint(&self, iso: IsolatePtr);

    /// Read heap statistics
    fn heap_statistics(&self, iso: IsolatePtr) -> HeapStatistics;

    /// Schedule `exception` to be thrown when control returns to script
    fn throw_exception(&self, iso: IsolatePtr, exception: RawHandle) -> RawHandle;

    // ========================================================================
    // Contexts
    // ========================================================================

    /// Create a context, optionally shaping its global object from a template
    fn new_context(
        &self,
        iso: IsolatePtr,
        global_template: Option<TemplatePtr>,
        ctx_ref: ContextRef,
    ) -> ContextPtr;

    /// Free a context created by [`NativeEngine::new_context`]
    fn free_context(&self, ctx: ContextPtr);

    /// Get a fresh handle to the context's global object
    fn context_global(&self, ctx: ContextPtr) -> RawHandle;

    /// Compile and run a script in the context
    fn run_script(&self, ctx: ContextPtr, source: &str, origin: &str) -> NativeResult<RawHandle>;

    // ========================================================================
    // Unbound scripts
    // ========================================================================

    /// Compile a context-independent script
    fn compile_unbound_script(
        &self,
        iso: IsolatePtr,
        source: &str,
        origin: &str,
        options: &CompileOptions,
    ) -> NativeResult<CompiledScript>;

    /// Bind a compiled script to a context and run it
    fn run_unbound_script(&self, ctx: ContextPtr, script: ScriptPtr) -> NativeResult<RawHandle>;

    /// Produce a code cache for a compiled script
    fn create_code_cache(&self, script: ScriptPtr) -> CachedData;

    /// Release a compiled script
    fn release_script(&self, script: ScriptPtr);

    // ========================================================================
    // Templates
    // ========================================================================

    /// Create a function template that calls back into the host with `callback`
    fn new_function_template(&self, iso: IsolatePtr, callback: CallbackRef) -> TemplatePtr;

    /// Create an object template
    fn new_object_template(&self, iso: IsolatePtr) -> TemplatePtr;

    /// Set a property on a template
    fn template_set(
        &self,
        tmpl: TemplatePtr,
        name: &str,
        value: &TemplateValue,
        attributes: PropertyAttribute,
    );

    /// Instantiate a function template in a context
    fn function_template_get_function(
        &self,
        tmpl: TemplatePtr,
        ctx: ContextPtr,
    ) -> NativeResult<RawHandle>;

    /// Instantiate an object template in a context
    fn object_template_new_instance(
        &self,
        tmpl: TemplatePtr,
        ctx: ContextPtr,
    ) -> NativeResult<RawHandle>;

    /// Set the number of internal fields instances of an object template get
    fn object_template_set_internal_field_count(&self, tmpl: TemplatePtr, count: u32);

    /// Get the number of internal fields instances of an object template get
    fn object_template_internal_field_count(&self, tmpl: TemplatePtr) -> u32;

    /// Release a template
    fn release_template(&self, tmpl: TemplatePtr);

    // ========================================================================
    // Values
    // ========================================================================

    /// Create a primitive value bound to a context
    fn new_value(&self, ctx: ContextPtr, value: &Primitive) -> RawHandle;

    /// Classify a value
    fn value_kind(&self, value: RawHandle) -> ValueKind;

    /// Read a primitive back; `None` for objects and functions
    fn value_primitive(&self, value: RawHandle) -> Option<Primitive>;

    /// Convert a value to its string form (`String(value)`)
    fn value_to_string(&self, value: RawHandle) -> String;

    /// Read a property from an object
    fn object_get(&self, object: RawHandle, key: &str) -> NativeResult<RawHandle>;

    /// Write a property on an object
    fn object_set(&self, object: RawHandle, key: &str, value: RawHandle) -> NativeResult<()>;

    /// Call a function with a receiver and arguments
    fn function_call(
        &self,
        function: RawHandle,
        receiver: RawHandle,
        args: &[RawHandle],
    ) -> NativeResult<RawHandle>;
}
