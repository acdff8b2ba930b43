//! An in-process simulated engine
//!
//! [`SimEngine`] implements [`NativeEngine`] on a plain heap so the bridge
//! can be driven end to end without a real script engine. Scripts are
//! written in a very small expression language (see the `script` module):
//!
//! ```text
//! greet("world"); config.retries = 3; throw "nope"
//! ```
//!
//! Every allocation the bridge is responsible for is counted, and frees of
//! unknown handles are recorded instead of crashing, so tests can assert
//! that nothing leaked and nothing was freed twice.

mod heap;
mod interp;
mod script;

pub use heap::SimCounters;

use heap::{Heap, Shape, Val};
use interp::Interp;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tether_sdk::{
    BatchRelease, CachedData, CallbackRef, CompiledScript, CompileOptions, ContextPtr, ContextRef,
    HeapStatistics, IsolatePtr, NativeEngine, NativeResult, Primitive, PropertyAttribute,
    RawHandle, ScriptError, ScriptPtr, TemplatePtr, TemplateValue, ValueKind,
};

const CACHE_MAGIC: &[u8; 4] = b"TSC1";

type ReleaseHook = dyn Fn(&[RawHandle]) + Send + Sync;

/// Simulated native engine
pub struct SimEngine {
    heap: Mutex<Heap>,
    release_hook: RwLock<Option<Arc<ReleaseHook>>>,
}

impl SimEngine {
    /// Create an engine with an empty heap
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            heap: Mutex::new(Heap::default()),
            release_hook: RwLock::new(None),
        })
    }

    /// Run `hook` after every batch release, outside the engine lock
    ///
    /// Stands in for native finalizers that call back into the host.
    pub fn set_release_hook<F>(&self, hook: F)
    where
        F: Fn(&[RawHandle]) + Send + Sync + 'static,
    {
        *self.release_hook.write() = Some(Arc::new(hook));
    }

    /// Allocations still owned by the bridge: isolates, user contexts,
    /// value records, templates and scripts
    pub fn live_allocations(&self) -> usize {
        self.heap.lock().live_allocations()
    }

    /// Value records not yet freed
    pub fn live_records(&self) -> usize {
        self.heap.lock().records.len()
    }

    /// Whether a value record is still allocated
    pub fn is_record_live(&self, raw: RawHandle) -> bool {
        self.heap.lock().records.contains_key(&raw)
    }

    /// Allocation counters
    pub fn counters(&self) -> SimCounters {
        self.heap.lock().counters
    }

    /// Frees of handles that were already freed
    pub fn double_frees(&self) -> u64 {
        self.heap.lock().counters.double_frees
    }

    /// Allocations still alive when their isolate was disposed
    pub fn leaked_at_dispose(&self) -> u64 {
        self.heap.lock().counters.leaked_at_dispose
    }

    /// Number of batch release calls
    pub fn release_batches(&self) -> u64 {
        self.heap.lock().counters.release_batches
    }

    /// Value records freed so far
    pub fn records_freed(&self) -> u64 {
        self.heap.lock().counters.records_freed
    }

    fn run_program(
        &self,
        ctx: ContextPtr,
        program: &script::Program,
        origin: &str,
    ) -> NativeResult<RawHandle> {
        let val = Interp::new(self, ctx, origin).run(program)?;
        Ok(self.heap.lock().new_record(ctx, val))
    }
}

fn syntax_error(err: script::SyntaxError, origin: &str) -> ScriptError {
    let location = format!("{}:{}", origin, err.pos);
    let stack = format!("{}\n    at {}", err.message, location);
    ScriptError::new(err.message)
        .with_location(location)
        .with_stack_trace(stack)
}

fn cache_key(source: &str) -> u64 {
    let mut hasher = FxHasher::default();
    source.hash(&mut hasher);
    hasher.finish()
}

fn cache_bytes(key: u64) -> Vec<u8> {
    let mut bytes = CACHE_MAGIC.to_vec();
    bytes.extend_from_slice(&key.to_le_bytes());
    bytes
}

impl std::fmt::Debug for SimEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let heap = self.heap.lock();
        f.debug_struct("SimEngine")
            .field("isolates", &heap.isolates.len())
            .field("records", &heap.records.len())
            .field("counters", &heap.counters)
            .finish()
    }
}

impl BatchRelease for SimEngine {
    fn release_batch(&self, handles: &[RawHandle]) {
        self.heap.lock().release_records(handles);

        let hook = self.release_hook.read().clone();
        if let Some(hook) = hook {
            hook(handles);
        }
    }
}

impl NativeEngine for SimEngine {
    fn new_isolate(&self, internal_ref: ContextRef) -> IsolatePtr {
        self.heap.lock().new_isolate(internal_ref)
    }

    fn default_context(&self, iso: IsolatePtr) -> ContextPtr {
        self.heap.lock().isolate(iso).default_ctx
    }

    fn dispose_isolate(&self, iso: IsolatePtr) {
        self.heap.lock().dispose_isolate(iso);
    }

    fn terminate_execution(&self, iso: IsolatePtr) {
        if let Some(state) = self.heap.lock().isolates.get_mut(&iso) {
            state.terminating = true;
        }
    }

    fn is_execution_terminating(&self, iso: IsolatePtr) -> bool {
        self.heap
            .lock()
            .isolates
            .get(&iso)
            .is_some_and(|state| state.terminating)
    }

    fn perform_microtask_checkpoint(&self, iso: IsolatePtr) {
        loop {
            let (ctx, task) = {
                let mut heap = self.heap.lock();
                match heap.isolates.get_mut(&iso).and_then(|s| s.microtasks.pop_front()) {
                    Some(next) => next,
                    None => break,
                }
            };
            if !self.heap.lock().contexts.contains_key(&ctx) {
                tracing::debug!(context = ?ctx, "sim: dropping microtask of a freed context");
                continue;
            }

            let interp = Interp::new(self, ctx, "microtask");
            if let Err(err) = interp.call(task, Val::Undefined, Vec::new()) {
                tracing::debug!(error = %err, "sim: microtask threw");
            }
        }
    }

    fn heap_statistics(&self, iso: IsolatePtr) -> HeapStatistics {
        self.heap.lock().heap_statistics(iso)
    }

    fn throw_exception(&self, iso: IsolatePtr, exception: RawHandle) -> RawHandle {
        let mut heap = self.heap.lock();
        let val = heap.record(exception).val.clone();
        let state = heap.isolate(iso);
        state.pending_exception = Some(val);
        let ctx = state.default_ctx;
        heap.new_record(ctx, Val::Undefined)
    }

    fn new_context(
        &self,
        iso: IsolatePtr,
        global_template: Option<TemplatePtr>,
        ctx_ref: ContextRef,
    ) -> ContextPtr {
        self.heap.lock().new_context(iso, global_template, ctx_ref, false)
    }

    fn free_context(&self, ctx: ContextPtr) {
        self.heap.lock().free_context(ctx);
    }

    fn context_global(&self, ctx: ContextPtr) -> RawHandle {
        let mut heap = self.heap.lock();
        let global = heap.context(ctx).global;
        heap.new_record(ctx, Val::Obj(global))
    }

    fn run_script(&self, ctx: ContextPtr, source: &str, origin: &str) -> NativeResult<RawHandle> {
        let program = script::parse(source).map_err(|e| syntax_error(e, origin))?;
        self.run_program(ctx, &program, origin)
    }

    fn compile_unbound_script(
        &self,
        iso: IsolatePtr,
        source: &str,
        origin: &str,
        options: &CompileOptions,
    ) -> NativeResult<CompiledScript> {
        let program = script::parse(source).map_err(|e| syntax_error(e, origin))?;
        let key = cache_key(source);
        let cached_data_rejected = options
            .cached_data
            .as_ref()
            .is_some_and(|cache| cache.bytes != cache_bytes(key));

        let ptr = self.heap.lock().new_script(iso, origin, program, key);
        Ok(CompiledScript {
            ptr,
            cached_data_rejected,
        })
    }

    fn run_unbound_script(&self, ctx: ContextPtr, script: ScriptPtr) -> NativeResult<RawHandle> {
        let (program, origin) = {
            let heap = self.heap.lock();
            match heap.scripts.get(&script) {
                Some(s) => (Arc::clone(&s.program), s.origin.clone()),
                None => return Err(ScriptError::new("Error: script has been released")),
            }
        };
        self.run_program(ctx, &program, &origin)
    }

    fn create_code_cache(&self, script: ScriptPtr) -> CachedData {
        let key = self
            .heap
            .lock()
            .scripts
            .get(&script)
            .map_or(0, |s| s.cache_key);
        CachedData {
            bytes: cache_bytes(key),
        }
    }

    fn release_script(&self, script: ScriptPtr) {
        self.heap.lock().release_script(script);
    }

    fn new_function_template(&self, iso: IsolatePtr, callback: CallbackRef) -> TemplatePtr {
        self.heap.lock().new_template(iso, Shape::Function(callback))
    }

    fn new_object_template(&self, iso: IsolatePtr) -> TemplatePtr {
        self.heap.lock().new_template(iso, Shape::Object)
    }

    fn template_set(
        &self,
        tmpl: TemplatePtr,
        name: &str,
        value: &TemplateValue,
        attributes: PropertyAttribute,
    ) {
        let mut heap = self.heap.lock();
        if let Some(t) = heap.templates.get_mut(&tmpl) {
            t.props.retain(|(n, _, _)| n != name);
            t.props.push((name.to_string(), value.clone(), attributes));
        }
    }

    fn function_template_get_function(
        &self,
        tmpl: TemplatePtr,
        ctx: ContextPtr,
    ) -> NativeResult<RawHandle> {
        let mut heap = self.heap.lock();
        let iso = heap.context(ctx).iso;
        let function = heap.instantiate(tmpl, iso);
        Ok(heap.new_record(ctx, Val::Obj(function)))
    }

    fn object_template_new_instance(
        &self,
        tmpl: TemplatePtr,
        ctx: ContextPtr,
    ) -> NativeResult<RawHandle> {
        let mut heap = self.heap.lock();
        let iso = heap.context(ctx).iso;
        let object = heap.instantiate(tmpl, iso);
        Ok(heap.new_record(ctx, Val::Obj(object)))
    }

    fn object_template_set_internal_field_count(&self, tmpl: TemplatePtr, count: u32) {
        if let Some(t) = self.heap.lock().templates.get_mut(&tmpl) {
            t.internal_fields = count;
        }
    }

    fn object_template_internal_field_count(&self, tmpl: TemplatePtr) -> u32 {
        self.heap.lock().template(tmpl).internal_fields
    }

    fn release_template(&self, tmpl: TemplatePtr) {
        self.heap.lock().release_template(tmpl);
    }

    fn new_value(&self, ctx: ContextPtr, value: &Primitive) -> RawHandle {
        self.heap.lock().new_record(ctx, Val::from(value))
    }

    fn value_kind(&self, value: RawHandle) -> ValueKind {
        let heap = self.heap.lock();
        heap.kind(&heap.record(value).val)
    }

    fn value_primitive(&self, value: RawHandle) -> Option<Primitive> {
        self.heap.lock().record(value).val.to_primitive()
    }

    fn value_to_string(&self, value: RawHandle) -> String {
        let heap = self.heap.lock();
        heap.to_display(&heap.record(value).val)
    }

    fn object_get(&self, object: RawHandle, key: &str) -> NativeResult<RawHandle> {
        let mut heap = self.heap.lock();
        let val = match heap.record(object).val.clone() {
            Val::Obj(id) => heap.get_prop(id, key),
            target @ (Val::Undefined | Val::Null) => {
                return Err(ScriptError::new(format!(
                    "TypeError: Cannot read properties of {} (reading '{}')",
                    heap.to_display(&target),
                    key
                )))
            }
            _ => Val::Undefined,
        };
        let ctx = heap.record_context(object);
        Ok(heap.new_record(ctx, val))
    }

    fn object_set(&self, object: RawHandle, key: &str, value: RawHandle) -> NativeResult<()> {
        let mut heap = self.heap.lock();
        let val = heap.record(value).val.clone();
        match heap.record(object).val.clone() {
            Val::Obj(id) => heap.assign_prop(id, key, val),
            target @ (Val::Undefined | Val::Null) => {
                return Err(ScriptError::new(format!(
                    "TypeError: Cannot set properties of {} (setting '{}')",
                    heap.to_display(&target),
                    key
                )))
            }
            _ => {}
        }
        Ok(())
    }

    fn function_call(
        &self,
        function: RawHandle,
        receiver: RawHandle,
        args: &[RawHandle],
    ) -> NativeResult<RawHandle> {
        let (ctx, callee, this, args) = {
            let mut heap = self.heap.lock();
            let ctx = heap.record_context(function);
            let callee = heap.record(function).val.clone();
            let this = heap.record(receiver).val.clone();
            let args: Vec<Val> = args.iter().map(|&a| heap.record(a).val.clone()).collect();
            (ctx, callee, this, args)
        };

        let result = Interp::new(self, ctx, "<native>").call(callee, this, args)?;
        Ok(self.heap.lock().new_record(ctx, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_isolate() -> (Arc<SimEngine>, IsolatePtr, ContextPtr) {
        let engine = SimEngine::new();
        let iso = engine.new_isolate(ContextRef::from_u32(u32::MAX - 1));
        let ctx = engine.default_context(iso);
        (engine, iso, ctx)
    }

    fn eval(engine: &SimEngine, ctx: ContextPtr, source: &str) -> NativeResult<Primitive> {
        let raw = engine.run_script(ctx, source, "test.js")?;
        let value = engine.value_primitive(raw).unwrap_or(Primitive::Undefined);
        engine.release_batch(&[raw]);
        Ok(value)
    }

    #[test]
    fn test_run_script_values() {
        let (engine, _, ctx) = engine_with_isolate();

        assert_eq!(eval(&engine, ctx, "1").unwrap(), Primitive::Number(1.0));
        assert_eq!(eval(&engine, ctx, "-2.5").unwrap(), Primitive::Number(-2.5));
        assert_eq!(
            eval(&engine, ctx, "'a'; \"b\"").unwrap(),
            Primitive::String("b".to_string())
        );
        assert_eq!(eval(&engine, ctx, "null").unwrap(), Primitive::Null);
        assert_eq!(eval(&engine, ctx, "").unwrap(), Primitive::Undefined);
    }

    #[test]
    fn test_globals_and_properties() {
        let (engine, _, ctx) = engine_with_isolate();

        eval(&engine, ctx, "config = { retries: 3, nested: { on: true } }").unwrap();
        assert_eq!(
            eval(&engine, ctx, "config.retries").unwrap(),
            Primitive::Number(3.0)
        );
        assert_eq!(
            eval(&engine, ctx, "config.nested.on").unwrap(),
            Primitive::Bool(true)
        );
        assert_eq!(eval(&engine, ctx, "config.missing").unwrap(), Primitive::Undefined);
    }

    #[test]
    fn test_script_errors() {
        let (engine, _, ctx) = engine_with_isolate();

        let err = eval(&engine, ctx, "missing").unwrap_err();
        assert_eq!(err.message, "ReferenceError: missing is not defined");
        assert_eq!(err.location, "test.js:1:1");

        let err = eval(&engine, ctx, "x = 1;\nx()").unwrap_err();
        assert_eq!(err.message, "TypeError: x is not a function");
        assert_eq!(err.location, "test.js:2:2");

        let err = eval(&engine, ctx, "undefined.foo").unwrap_err();
        assert_eq!(
            err.message,
            "TypeError: Cannot read properties of undefined (reading 'foo')"
        );

        let err = eval(&engine, ctx, "throw 'boom'").unwrap_err();
        assert_eq!(err.message, "boom");
        assert!(err.stack_trace.contains("at test.js:1:1"));

        let err = eval(&engine, ctx, "1 +").unwrap_err();
        assert!(err.message.starts_with("SyntaxError"));
    }

    #[test]
    fn test_release_batch_counts_double_frees() {
        let (engine, _, ctx) = engine_with_isolate();
        let a = engine.new_value(ctx, &Primitive::Number(1.0));
        let b = engine.new_value(ctx, &Primitive::Bool(false));

        engine.release_batch(&[a, b]);
        assert!(!engine.is_record_live(a));
        assert_eq!(engine.records_freed(), 2);
        assert_eq!(engine.double_frees(), 0);

        engine.release_batch(&[a]);
        assert_eq!(engine.double_frees(), 1);
        assert_eq!(engine.release_batches(), 2);
    }

    #[test]
    fn test_dispose_reports_leaks() {
        let (engine, iso, ctx) = engine_with_isolate();
        engine.new_value(ctx, &Primitive::Null);
        let user = engine.new_context(iso, None, ContextRef::from_u32(u32::MAX - 2));
        assert_eq!(engine.live_allocations(), 3);

        engine.dispose_isolate(iso);
        assert_eq!(engine.leaked_at_dispose(), 2);
        assert_eq!(engine.live_allocations(), 0);

        engine.free_context(user);
        assert_eq!(engine.double_frees(), 1);
    }

    #[test]
    fn test_default_context_is_not_freed() {
        let (engine, iso, ctx) = engine_with_isolate();
        engine.free_context(ctx);
        assert_eq!(engine.default_context(iso), ctx);
        assert_eq!(eval(&engine, ctx, "1").unwrap(), Primitive::Number(1.0));
    }

    #[test]
    fn test_code_cache() {
        let (engine, iso, _) = engine_with_isolate();
        let compiled = engine
            .compile_unbound_script(iso, "1", "a.js", &CompileOptions::default())
            .unwrap();
        let cache = engine.create_code_cache(compiled.ptr);
        assert_eq!(&cache.bytes[..4], CACHE_MAGIC);

        let reuse = CompileOptions {
            cached_data: Some(cache.clone()),
            ..Default::default()
        };
        let same = engine.compile_unbound_script(iso, "1", "a.js", &reuse).unwrap();
        assert!(!same.cached_data_rejected);
        let other = engine.compile_unbound_script(iso, "2", "a.js", &reuse).unwrap();
        assert!(other.cached_data_rejected);
    }

    #[test]
    fn test_read_only_template_property() {
        let (engine, iso, ctx) = engine_with_isolate();
        let tmpl = engine.new_object_template(iso);
        engine.template_set(
            tmpl,
            "version",
            &TemplateValue::Primitive(Primitive::Number(1.0)),
            PropertyAttribute::READ_ONLY,
        );
        let global_ctx = engine.new_context(iso, Some(tmpl), ContextRef::from_u32(u32::MAX - 3));

        assert_eq!(
            eval(&engine, global_ctx, "version = 2; version").unwrap(),
            Primitive::Number(1.0)
        );
        assert!(eval(&engine, ctx, "queueMicrotask").is_ok());
    }

    #[test]
    fn test_terminate_clears_after_script() {
        let (engine, iso, ctx) = engine_with_isolate();
        engine.terminate_execution(iso);
        assert!(engine.is_execution_terminating(iso));

        let err = eval(&engine, ctx, "1").unwrap_err();
        assert_eq!(err.message, TERMINATED_MESSAGE);
        assert!(!engine.is_execution_terminating(iso));
        assert_eq!(eval(&engine, ctx, "1").unwrap(), Primitive::Number(1.0));
    }

    const TERMINATED_MESSAGE: &str = "ExecutionTerminated: script execution has been terminated";
}
