//! Function and object templates
//!
//! Templates are long-lived blueprints. They belong to their isolate's
//! [`TemplateRegistry`](crate::registry::TemplateRegistry) and are released
//! only when the isolate is disposed.

use crate::context::Context;
use crate::dispatch::{FunctionCallback, FunctionCallbackInfo};
use crate::error::{fatal, MisuseError, Result};
use crate::isolate::{IsolateCore, IsolateHandle, ScopeKind};
use crate::registry::{TemplateEntry, TemplateKind};
use crate::value::{Function, Object, Value};
use std::sync::Arc;
use tether_sdk::{CallbackRef, PropertyAttribute, TemplatePtr, TemplateValue};

/// State shared by both template variants
#[derive(Clone)]
struct TemplateBase {
    entry: Arc<TemplateEntry>,
    core: Arc<IsolateCore>,
}

impl TemplateBase {
    fn register(iso: &IsolateHandle, ptr: TemplatePtr, kind: TemplateKind) -> Self {
        let core = Arc::clone(iso.core());
        let entry = TemplateEntry::new(ptr, kind);
        core.templates.register(Arc::clone(&entry));
        tracing::trace!(template = ?ptr, ?kind, "template created");
        Self { entry, core }
    }

    #[track_caller]
    fn live_ptr(&self) -> TemplatePtr {
        if self.entry.is_released() {
            fatal(MisuseError::IsolateDisposed);
        }
        self.entry.ptr()
    }

    fn set(&self, name: &str, value: TemplateValue, attributes: PropertyAttribute) {
        let _scope = self.core.scope(ScopeKind::Host);
        self.core
            .engine
            .template_set(self.live_ptr(), name, &value, attributes);
    }

    fn assert_isolate(&self, core: &Arc<IsolateCore>) {
        if !Arc::ptr_eq(&self.core, core) {
            fatal(MisuseError::ForeignValue);
        }
    }
}

/// Blueprint for functions that call back into the host
#[derive(Clone)]
pub struct FunctionTemplate {
    base: TemplateBase,
    callback: CallbackRef,
}

impl FunctionTemplate {
    /// Create a template whose functions invoke `callback`
    ///
    /// The callback returns the value handed back to script, or `None` for
    /// `undefined`.
    pub fn new<F>(iso: &IsolateHandle, callback: F) -> Self
    where
        F: Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync + 'static,
    {
        let core = iso.core();
        let _scope = core.scope(ScopeKind::Host);
        let callback: Arc<FunctionCallback> = Arc::new(callback);
        let cb_ref = core.callbacks.register(callback);
        let ptr = core.engine.new_function_template(core.ptr, cb_ref);
        Self {
            base: TemplateBase::register(iso, ptr, TemplateKind::Function { callback: cb_ref }),
            callback: cb_ref,
        }
    }

    /// Reference of the callback this template's functions invoke
    pub fn callback_ref(&self) -> CallbackRef {
        self.callback
    }

    /// Set a property on every function this template produces
    pub fn set(
        &self,
        name: &str,
        value: impl Into<TemplateValue>,
        attributes: PropertyAttribute,
    ) {
        self.base.set(name, value.into(), attributes);
    }

    /// Instantiate the template in `ctx`
    pub fn get_function(&self, ctx: &Context) -> Result<Function> {
        self.base.assert_isolate(ctx.core());
        let core = &self.base.core;
        let _scope = core.scope(ScopeKind::Host);
        let raw = core
            .engine
            .function_template_get_function(self.base.live_ptr(), ctx.native_ptr())?;
        Ok(Function::from_value_unchecked(Value::track(core, raw)))
    }

    pub(crate) fn ptr(&self) -> TemplatePtr {
        self.base.live_ptr()
    }
}

impl std::fmt::Debug for FunctionTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionTemplate")
            .field("ptr", &self.base.entry.ptr())
            .field("callback", &self.callback)
            .finish()
    }
}

/// Blueprint for plain objects
#[derive(Clone)]
pub struct ObjectTemplate {
    base: TemplateBase,
}

impl ObjectTemplate {
    /// Create an empty object template
    pub fn new(iso: &IsolateHandle) -> Self {
        let core = iso.core();
        let _scope = core.scope(ScopeKind::Host);
        let ptr = core.engine.new_object_template(core.ptr);
        Self {
            base: TemplateBase::register(iso, ptr, TemplateKind::Object),
        }
    }

    /// Set a property on every object this template produces
    pub fn set(
        &self,
        name: &str,
        value: impl Into<TemplateValue>,
        attributes: PropertyAttribute,
    ) {
        self.base.set(name, value.into(), attributes);
    }

    /// Instantiate the template in `ctx`
    pub fn new_instance(&self, ctx: &Context) -> Result<Object> {
        self.base.assert_isolate(ctx.core());
        let core = &self.base.core;
        let _scope = core.scope(ScopeKind::Host);
        let raw = core
            .engine
            .object_template_new_instance(self.base.live_ptr(), ctx.native_ptr())?;
        Ok(Object::from_value_unchecked(Value::track(core, raw)))
    }

    /// Set how many internal fields instances get
    pub fn set_internal_field_count(&self, count: u32) {
        let _scope = self.base.core.scope(ScopeKind::Host);
        self.base
            .core
            .engine
            .object_template_set_internal_field_count(self.base.live_ptr(), count);
    }

    /// How many internal fields instances get
    pub fn internal_field_count(&self) -> u32 {
        let _scope = self.base.core.scope(ScopeKind::Host);
        self.base
            .core
            .engine
            .object_template_internal_field_count(self.base.live_ptr())
    }

    pub(crate) fn ptr(&self) -> TemplatePtr {
        self.base.live_ptr()
    }

    pub(crate) fn assert_isolate(&self, core: &Arc<IsolateCore>) {
        self.base.assert_isolate(core);
    }
}

impl std::fmt::Debug for ObjectTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectTemplate")
            .field("ptr", &self.base.entry.ptr())
            .finish()
    }
}

impl From<&FunctionTemplate> for TemplateValue {
    fn from(t: &FunctionTemplate) -> Self {
        TemplateValue::FunctionTemplate(t.ptr())
    }
}

impl From<&ObjectTemplate> for TemplateValue {
    fn from(t: &ObjectTemplate) -> Self {
        TemplateValue::ObjectTemplate(t.ptr())
    }
}
