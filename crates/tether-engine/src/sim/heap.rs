//! The sim engine's native heap
//!
//! Plain data guarded by the engine's lock. Every allocation the bridge is
//! responsible for (value records, contexts, templates, scripts) is counted,
//! so tests can check that nothing outlives its isolate.

use super::script::{format_number, Program};
use rustc_hash::FxHashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tether_sdk::{
    CallbackRef, ContextPtr, ContextRef, IsolatePtr, PropertyAttribute, Primitive, RawHandle,
    ScriptPtr, TemplatePtr, TemplateValue, ValueKind,
};

pub(crate) type ObjId = u64;

/// A script value inside the heap
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Val {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    Str(String),
    Obj(ObjId),
}

impl From<&Primitive> for Val {
    fn from(p: &Primitive) -> Self {
        match p {
            Primitive::Undefined => Val::Undefined,
            Primitive::Null => Val::Null,
            Primitive::Bool(b) => Val::Bool(*b),
            Primitive::Number(n) => Val::Number(*n),
            Primitive::String(s) => Val::Str(s.clone()),
        }
    }
}

impl Val {
    pub fn to_primitive(&self) -> Option<Primitive> {
        Some(match self {
            Val::Undefined => Primitive::Undefined,
            Val::Null => Primitive::Null,
            Val::Bool(b) => Primitive::Bool(*b),
            Val::Number(n) => Primitive::Number(*n),
            Val::Str(s) => Primitive::String(s.clone()),
            Val::Obj(_) => return None,
        })
    }

    pub fn as_number(&self) -> f64 {
        match self {
            Val::Number(n) => *n,
            Val::Bool(true) => 1.0,
            Val::Bool(false) | Val::Null => 0.0,
            Val::Str(s) if s.trim().is_empty() => 0.0,
            Val::Str(s) => s.trim().parse().unwrap_or(f64::NAN),
            Val::Undefined | Val::Obj(_) => f64::NAN,
        }
    }
}

/// What happens when an object is called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Callable {
    NotCallable,
    Host(CallbackRef),
    QueueMicrotask,
}

#[derive(Debug, Clone)]
pub(crate) struct Prop {
    pub val: Val,
    pub read_only: bool,
}

#[derive(Debug)]
pub(crate) struct SimObject {
    pub iso: IsolatePtr,
    pub props: FxHashMap<String, Prop>,
    pub call: Callable,
    pub internal_fields: u32,
}

#[derive(Debug, Default)]
pub(crate) struct SimIsolate {
    pub default_ctx: ContextPtr,
    pub terminating: bool,
    pub pending_exception: Option<Val>,
    pub microtasks: VecDeque<(ContextPtr, Val)>,
    pub js_depth: usize,
    pub peak_malloced: u64,
}

#[derive(Debug)]
pub(crate) struct SimContext {
    pub iso: IsolatePtr,
    pub ctx_ref: ContextRef,
    pub global: ObjId,
    pub isolate_owned: bool,
}

#[derive(Debug)]
pub(crate) struct Record {
    pub iso: IsolatePtr,
    pub ctx: ContextPtr,
    pub val: Val,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    Function(CallbackRef),
    Object,
}

#[derive(Debug)]
pub(crate) struct SimTemplate {
    pub iso: IsolatePtr,
    pub shape: Shape,
    pub props: Vec<(String, TemplateValue, PropertyAttribute)>,
    pub internal_fields: u32,
}

#[derive(Debug)]
pub(crate) struct SimScript {
    pub iso: IsolatePtr,
    pub origin: String,
    pub program: Arc<Program>,
    pub cache_key: u64,
}

/// Counters observable from tests
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    /// Value records freed through batch release
    pub records_freed: u64,
    /// Number of batch release calls
    pub release_batches: u64,
    /// Frees of something already freed or never allocated
    pub double_frees: u64,
    /// Bridge-owned allocations still alive when their isolate was disposed
    pub leaked_at_dispose: u64,
}

pub(crate) const RECORD_SIZE: u64 = 16;
pub(crate) const OBJECT_SIZE: u64 = 64;
const HEAP_CHUNK: u64 = 256 * 1024;
const HEAP_LIMIT: u64 = 64 * 1024 * 1024;

#[derive(Default)]
pub(crate) struct Heap {
    next: u64,
    pub isolates: FxHashMap<IsolatePtr, SimIsolate>,
    pub contexts: FxHashMap<ContextPtr, SimContext>,
    pub objects: FxHashMap<ObjId, SimObject>,
    pub records: FxHashMap<RawHandle, Record>,
    pub templates: FxHashMap<TemplatePtr, SimTemplate>,
    pub scripts: FxHashMap<ScriptPtr, SimScript>,
    pub counters: SimCounters,
}

impl Heap {
    fn alloc_id(&mut self) -> u64 {
        self.next += 1;
        // keep ids pointer-like and never zero
        self.next << 4
    }

    pub fn isolate(&mut self, iso: IsolatePtr) -> &mut SimIsolate {
        match self.isolates.get_mut(&iso) {
            Some(i) => i,
            None => dangling("isolate", iso.as_raw()),
        }
    }

    pub fn context(&self, ctx: ContextPtr) -> &SimContext {
        match self.contexts.get(&ctx) {
            Some(c) => c,
            None => dangling("context", ctx.as_raw()),
        }
    }

    pub fn record(&self, raw: RawHandle) -> &Record {
        match self.records.get(&raw) {
            Some(r) => r,
            None => dangling("value record", raw.as_raw()),
        }
    }

    pub fn template(&self, tmpl: TemplatePtr) -> &SimTemplate {
        match self.templates.get(&tmpl) {
            Some(t) => t,
            None => dangling("template", tmpl.as_raw()),
        }
    }

    pub fn new_isolate(&mut self, internal_ref: ContextRef) -> IsolatePtr {
        let iso = IsolatePtr::from_raw(self.alloc_id());
        self.isolates.insert(iso, SimIsolate::default());
        let ctx = self.new_context(iso, None, internal_ref, true);
        self.isolate(iso).default_ctx = ctx;
        iso
    }

    pub fn new_context(
        &mut self,
        iso: IsolatePtr,
        global_template: Option<TemplatePtr>,
        ctx_ref: ContextRef,
        isolate_owned: bool,
    ) -> ContextPtr {
        let global = match global_template {
            Some(tmpl) => self.instantiate(tmpl, iso),
            None => self.new_object(iso, Callable::NotCallable),
        };
        if !self.objects[&global].props.contains_key("queueMicrotask") {
            let qm = self.new_object(iso, Callable::QueueMicrotask);
            self.set_prop(global, "queueMicrotask", Val::Obj(qm), false);
        }

        let ctx = ContextPtr::from_raw(self.alloc_id());
        self.contexts.insert(
            ctx,
            SimContext {
                iso,
                ctx_ref,
                global,
                isolate_owned,
            },
        );
        ctx
    }

    pub fn new_object(&mut self, iso: IsolatePtr, call: Callable) -> ObjId {
        let id = self.alloc_id();
        self.objects.insert(
            id,
            SimObject {
                iso,
                props: FxHashMap::default(),
                call,
                internal_fields: 0,
            },
        );
        id
    }

    pub fn new_record(&mut self, ctx: ContextPtr, val: Val) -> RawHandle {
        let iso = self.context(ctx).iso;
        let raw = RawHandle::from_raw(self.alloc_id());
        self.records.insert(raw, Record { iso, ctx, val });

        let malloced = self.malloced(iso);
        let entry = self.isolate(iso);
        entry.peak_malloced = entry.peak_malloced.max(malloced);
        raw
    }

    pub fn new_template(&mut self, iso: IsolatePtr, shape: Shape) -> TemplatePtr {
        let tmpl = TemplatePtr::from_raw(self.alloc_id());
        self.templates.insert(
            tmpl,
            SimTemplate {
                iso,
                shape,
                props: Vec::new(),
                internal_fields: 0,
            },
        );
        tmpl
    }

    pub fn new_script(&mut self, iso: IsolatePtr, origin: &str, program: Program, key: u64) -> ScriptPtr {
        let ptr = ScriptPtr::from_raw(self.alloc_id());
        self.scripts.insert(
            ptr,
            SimScript {
                iso,
                origin: origin.to_string(),
                program: Arc::new(program),
                cache_key: key,
            },
        );
        ptr
    }

    /// Build an object (or function) from a template, recursively
    pub fn instantiate(&mut self, tmpl: TemplatePtr, iso: IsolatePtr) -> ObjId {
        let (shape, props, fields) = {
            let t = self.template(tmpl);
            (t.shape, t.props.clone(), t.internal_fields)
        };
        let call = match shape {
            Shape::Function(cb) => Callable::Host(cb),
            Shape::Object => Callable::NotCallable,
        };

        let obj = self.new_object(iso, call);
        if let Some(o) = self.objects.get_mut(&obj) {
            o.internal_fields = fields;
        }
        for (name, value, attrs) in props {
            let val = match value {
                TemplateValue::Primitive(p) => Val::from(&p),
                TemplateValue::FunctionTemplate(t) | TemplateValue::ObjectTemplate(t) => {
                    Val::Obj(self.instantiate(t, iso))
                }
            };
            self.set_prop(obj, &name, val, attrs.contains(PropertyAttribute::READ_ONLY));
        }
        obj
    }

    pub fn get_prop(&self, obj: ObjId, name: &str) -> Val {
        self.objects
            .get(&obj)
            .and_then(|o| o.props.get(name))
            .map_or(Val::Undefined, |p| p.val.clone())
    }

    /// Assign a property; read-only properties silently keep their value
    pub fn assign_prop(&mut self, obj: ObjId, name: &str, val: Val) {
        if let Some(o) = self.objects.get_mut(&obj) {
            match o.props.get_mut(name) {
                Some(p) if p.read_only => {}
                Some(p) => p.val = val,
                None => {
                    o.props.insert(name.to_string(), Prop { val, read_only: false });
                }
            }
        }
    }

    fn set_prop(&mut self, obj: ObjId, name: &str, val: Val, read_only: bool) {
        if let Some(o) = self.objects.get_mut(&obj) {
            o.props.insert(name.to_string(), Prop { val, read_only });
        }
    }

    pub fn callable(&self, val: &Val) -> Callable {
        match val {
            Val::Obj(id) => self.objects.get(id).map_or(Callable::NotCallable, |o| o.call),
            _ => Callable::NotCallable,
        }
    }

    pub fn kind(&self, val: &Val) -> ValueKind {
        match val {
            Val::Undefined => ValueKind::Undefined,
            Val::Null => ValueKind::Null,
            Val::Bool(_) => ValueKind::Bool,
            Val::Number(_) => ValueKind::Number,
            Val::Str(_) => ValueKind::String,
            Val::Obj(_) if self.callable(val) != Callable::NotCallable => ValueKind::Function,
            Val::Obj(_) => ValueKind::Object,
        }
    }

    pub fn to_display(&self, val: &Val) -> String {
        match val {
            Val::Undefined => "undefined".to_string(),
            Val::Null => "null".to_string(),
            Val::Bool(b) => b.to_string(),
            Val::Number(n) => format_number(*n),
            Val::Str(s) => s.clone(),
            Val::Obj(_) if self.callable(val) != Callable::NotCallable => {
                "function () { [native code] }".to_string()
            }
            Val::Obj(_) => "[object Object]".to_string(),
        }
    }

    /// Context to run in for a record whose own context may be gone
    pub fn record_context(&mut self, raw: RawHandle) -> ContextPtr {
        let (iso, ctx) = {
            let r = self.record(raw);
            (r.iso, r.ctx)
        };
        if self.contexts.contains_key(&ctx) {
            ctx
        } else {
            self.isolate(iso).default_ctx
        }
    }

    pub fn release_records(&mut self, handles: &[RawHandle]) {
        for raw in handles {
            if self.records.remove(raw).is_some() {
                self.counters.records_freed += 1;
            } else {
                tracing::error!(handle = ?raw, "sim: value record freed twice");
                self.counters.double_frees += 1;
            }
        }
        self.counters.release_batches += 1;
    }

    pub fn free_context(&mut self, ctx: ContextPtr) {
        match self.contexts.get(&ctx) {
            Some(c) if c.isolate_owned => {
                tracing::warn!(context = ?ctx, "sim: default context is owned by its isolate");
            }
            Some(_) => {
                self.contexts.remove(&ctx);
            }
            None => self.counters.double_frees += 1,
        }
    }

    pub fn release_template(&mut self, tmpl: TemplatePtr) {
        if self.templates.remove(&tmpl).is_none() {
            self.counters.double_frees += 1;
        }
    }

    pub fn release_script(&mut self, script: ScriptPtr) {
        if self.scripts.remove(&script).is_none() {
            self.counters.double_frees += 1;
        }
    }

    pub fn dispose_isolate(&mut self, iso: IsolatePtr) {
        if self.isolates.remove(&iso).is_none() {
            self.counters.double_frees += 1;
            return;
        }

        let before = self.records.len() + self.templates.len() + self.scripts.len();
        self.records.retain(|_, r| r.iso != iso);
        self.templates.retain(|_, t| t.iso != iso);
        self.scripts.retain(|_, s| s.iso != iso);
        let after = self.records.len() + self.templates.len() + self.scripts.len();

        let user_contexts = self
            .contexts
            .values()
            .filter(|c| c.iso == iso && !c.isolate_owned)
            .count();
        self.contexts.retain(|_, c| c.iso != iso);
        self.objects.retain(|_, o| o.iso != iso);

        let leaked = (before - after + user_contexts) as u64;
        if leaked > 0 {
            tracing::warn!(isolate = ?iso, leaked, "sim: allocations alive at isolate disposal");
        }
        self.counters.leaked_at_dispose += leaked;
    }

    fn malloced(&self, iso: IsolatePtr) -> u64 {
        self.records.values().filter(|r| r.iso == iso).count() as u64 * RECORD_SIZE
    }

    pub fn heap_statistics(&mut self, iso: IsolatePtr) -> tether_sdk::HeapStatistics {
        let objects = self.objects.values().filter(|o| o.iso == iso).count() as u64;
        let contexts = self.contexts.values().filter(|c| c.iso == iso).count() as u64;
        let malloced = self.malloced(iso);
        let used = objects * OBJECT_SIZE;
        let total = used.div_ceil(HEAP_CHUNK).max(1) * HEAP_CHUNK;
        let peak = self.isolate(iso).peak_malloced;

        tether_sdk::HeapStatistics {
            total_heap_size: total,
            total_heap_size_executable: 0,
            total_physical_size: total,
            total_available_size: HEAP_LIMIT - total,
            used_heap_size: used,
            heap_size_limit: HEAP_LIMIT,
            malloced_memory: malloced,
            external_memory: 0,
            peak_malloced_memory: peak,
            number_of_native_contexts: contexts,
            number_of_detached_contexts: 0,
        }
    }

    /// Allocations the bridge is responsible for freeing
    pub fn live_allocations(&self) -> usize {
        let user_contexts = self.contexts.values().filter(|c| !c.isolate_owned).count();
        self.isolates.len()
            + user_contexts
            + self.records.len()
            + self.templates.len()
            + self.scripts.len()
    }
}

#[cold]
fn dangling(what: &str, raw: u64) -> ! {
    tracing::error!("sim: use of freed {} {:#x}", what, raw);
    panic!("sim: use of freed {} {:#x}", what, raw);
}
