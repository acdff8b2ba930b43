//! Value wrappers
//!
//! A [`Value`] owns one tracked native handle. Dropping it is the
//! finalization hook: the handle moves from tracked to releasable, and the
//! next flush frees it in a batch. [`Value::release`] does the same
//! explicitly.
//!
//! [`Object`] and [`Function`] are views over a value already known to be an
//! object or a function.

use crate::error::{fatal, MisuseError, Result};
use crate::handles::{HandleSlot, HandleState};
use crate::isolate::{IsolateCore, IsolateHandle, ScopeKind};
use std::sync::Arc;
use tether_sdk::{Primitive, RawHandle, ValueKind};

/// A script value held by the host
pub struct Value {
    slot: Arc<HandleSlot>,
    core: Arc<IsolateCore>,
    // null/undefined singletons live until the isolate is disposed
    pinned: bool,
}

impl Value {
    /// Track a fresh native record
    pub(crate) fn track(core: &Arc<IsolateCore>, raw: RawHandle) -> Self {
        Self {
            slot: core.handles.track(raw),
            core: Arc::clone(core),
            pinned: false,
        }
    }

    pub(crate) fn pinned(core: &Arc<IsolateCore>, slot: &Arc<HandleSlot>) -> Self {
        Self {
            slot: Arc::clone(slot),
            core: Arc::clone(core),
            pinned: true,
        }
    }

    /// Give up the slot without marking it
    pub(crate) fn into_slot(mut self) -> Arc<HandleSlot> {
        self.pinned = true;
        Arc::clone(&self.slot)
    }

    /// Give up the slot if it is still due for release
    pub(crate) fn into_releasable_slot(self) -> Option<Arc<HandleSlot>> {
        if self.pinned {
            return None;
        }
        Some(self.into_slot())
    }

    pub(crate) fn is_pinned(&self) -> bool {
        self.pinned
    }

    #[track_caller]
    pub(crate) fn assert_isolate(&self, core: &Arc<IsolateCore>) {
        if !Arc::ptr_eq(&self.core, core) {
            fatal(MisuseError::ForeignValue);
        }
    }

    /// The native handle; fatal once released or freed
    #[track_caller]
    pub fn raw(&self) -> RawHandle {
        self.slot.assert_live();
        self.slot.raw()
    }

    /// Lifecycle state of the underlying handle
    pub fn handle_state(&self) -> HandleState {
        self.slot.state()
    }

    /// The isolate this value belongs to
    pub fn isolate(&self) -> IsolateHandle {
        IsolateHandle::from_core(Arc::clone(&self.core))
    }

    /// Mark the handle releasable now instead of at drop
    pub fn release(self) {
        drop(self);
    }

    /// Classify the value
    pub fn kind(&self) -> ValueKind {
        let _scope = self.core.scope(ScopeKind::Host);
        self.core.engine.value_kind(self.raw())
    }

    /// Whether the value is `undefined`
    pub fn is_undefined(&self) -> bool {
        self.kind() == ValueKind::Undefined
    }

    /// Whether the value is `null`
    pub fn is_null(&self) -> bool {
        self.kind() == ValueKind::Null
    }

    /// Whether the value is `null` or `undefined`
    pub fn is_nullish(&self) -> bool {
        matches!(self.kind(), ValueKind::Null | ValueKind::Undefined)
    }

    /// Whether the value is a boolean
    pub fn is_boolean(&self) -> bool {
        self.kind() == ValueKind::Bool
    }

    /// Whether the value is a number
    pub fn is_number(&self) -> bool {
        self.kind() == ValueKind::Number
    }

    /// Whether the value is a string
    pub fn is_string(&self) -> bool {
        self.kind() == ValueKind::String
    }

    /// Whether the value is an object (functions included)
    pub fn is_object(&self) -> bool {
        self.kind().is_object()
    }

    /// Whether the value is callable
    pub fn is_function(&self) -> bool {
        self.kind() == ValueKind::Function
    }

    /// Read a primitive value back; `None` for objects
    pub fn to_primitive(&self) -> Option<Primitive> {
        let _scope = self.core.scope(ScopeKind::Host);
        self.core.engine.value_primitive(self.raw())
    }

    /// The value as a number, if it is one
    pub fn as_number(&self) -> Option<f64> {
        self.to_primitive().and_then(|p| p.as_number())
    }

    /// The value as a boolean, if it is one
    pub fn as_bool(&self) -> Option<bool> {
        self.to_primitive().and_then(|p| p.as_bool())
    }

    /// View the value as an object
    pub fn into_object(self) -> std::result::Result<Object, Value> {
        if self.is_object() {
            Ok(Object(self))
        } else {
            Err(self)
        }
    }

    /// View the value as a function
    pub fn into_function(self) -> std::result::Result<Function, Value> {
        if self.is_function() {
            Ok(Function(Object(self)))
        } else {
            Err(self)
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        if self.pinned || self.slot.state() != HandleState::Tracked {
            return;
        }
        self.core.mark_releasable(std::slice::from_ref(&self.slot));
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = {
            let _scope = self.core.scope(ScopeKind::Host);
            self.core.engine.value_to_string(self.raw())
        };
        f.write_str(&s)
    }
}

impl std::fmt::Debug for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("Value")
            .field(&self.slot.raw())
            .field(&self.slot.state())
            .finish()
    }
}

/// A value known to be an object
#[derive(Debug)]
pub struct Object(Value);

impl Object {
    pub(crate) fn from_value_unchecked(value: Value) -> Self {
        Object(value)
    }

    /// Read a property
    pub fn get(&self, key: &str) -> Result<Value> {
        let core = &self.0.core;
        let _scope = core.scope(ScopeKind::Host);
        let raw = core.engine.object_get(self.raw(), key)?;
        Ok(Value::track(core, raw))
    }

    /// Write a property
    pub fn set(&self, key: &str, value: &Value) -> Result<()> {
        value.assert_isolate(&self.0.core);
        let core = &self.0.core;
        let _scope = core.scope(ScopeKind::Host);
        core.engine.object_set(self.raw(), key, value.raw())?;
        Ok(())
    }

    /// Write a primitive property
    pub fn set_primitive(&self, key: &str, value: impl Into<Primitive>) -> Result<()> {
        let value = value.into();
        let core = &self.0.core;
        let _scope = core.scope(ScopeKind::Host);
        let raw = core.engine.new_value(core.internal_ptr(), &value);
        let v = Value::track(core, raw);
        core.engine.object_set(self.raw(), key, v.raw())?;
        Ok(())
    }

    /// Back to a plain value
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl std::ops::Deref for Object {
    type Target = Value;

    fn deref(&self) -> &Value {
        &self.0
    }
}

/// A value known to be callable
#[derive(Debug)]
pub struct Function(Object);

impl Function {
    pub(crate) fn from_value_unchecked(value: Value) -> Self {
        Function(Object(value))
    }

    /// Call with an explicit receiver
    pub fn call(&self, receiver: &Value, args: &[&Value]) -> Result<Value> {
        let core = &self.0 .0.core;
        receiver.assert_isolate(core);
        for arg in args {
            arg.assert_isolate(core);
        }

        let _scope = core.scope(ScopeKind::Host);
        let raws: Vec<RawHandle> = args.iter().map(|a| a.raw()).collect();
        let raw = core.engine.function_call(self.raw(), receiver.raw(), &raws)?;
        Ok(Value::track(core, raw))
    }

    /// Call with `undefined` as the receiver
    pub fn call_undefined(&self, args: &[&Value]) -> Result<Value> {
        let receiver = self.isolate().undefined();
        self.call(&receiver, args)
    }

    /// Back to an object
    pub fn into_object(self) -> Object {
        self.0
    }

    /// Back to a plain value
    pub fn into_value(self) -> Value {
        self.0.into_value()
    }
}

impl std::ops::Deref for Function {
    type Target = Object;

    fn deref(&self) -> &Object {
        &self.0
    }
}
