//! Native call-in dispatch
//!
//! When script code calls a host function the engine calls back with the
//! context reference, the callback reference, and the receiver followed by
//! the arguments. Each invocation runs through five stages:
//!
//! 1. resolve the context through the process-wide directory
//! 2. wrap receiver and arguments as tracked values
//! 3. look up and invoke the host closure
//! 4. mark receiver and arguments releasable in one batch
//! 5. hand the returned value back, keeping it tracked until the host
//!    regains control
//!
//! An unresolvable context or callback reference is fatal.

use crate::context::{self, Context};
use crate::error::{fatal, ResolutionError};
use crate::isolate::{IsolateHandle, ScopeKind};
use crate::value::Value;
use tether_sdk::{CallbackRef, ContextRef, RawHandle};

/// Host closure type stored in the callback registry
pub type FunctionCallback = dyn Fn(&FunctionCallbackInfo) -> Option<Value> + Send + Sync;

/// Arguments of one host function invocation
pub struct FunctionCallbackInfo {
    ctx: Context,
    this: Value,
    args: Vec<Value>,
}

impl FunctionCallbackInfo {
    /// The context the function was called in
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// The isolate the function was called in
    pub fn isolate(&self) -> IsolateHandle {
        self.ctx.isolate()
    }

    /// The receiver (`this`)
    pub fn this(&self) -> &Value {
        &self.this
    }

    /// The arguments
    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Argument `index`, if passed
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    fn into_values(self) -> impl Iterator<Item = Value> {
        std::iter::once(self.this).chain(self.args)
    }
}

impl std::fmt::Debug for FunctionCallbackInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionCallbackInfo")
            .field("context", &self.ctx.ref_id())
            .field("argc", &self.args.len())
            .finish()
    }
}

/// Resolve a context reference or abort
#[track_caller]
pub fn resolve_context(ctx_ref: ContextRef) -> Context {
    match context::directory().resolve(ctx_ref) {
        Ok(ctx) => ctx,
        Err(e) => fatal(e),
    }
}

/// Invoke the host callback `cb_ref` on behalf of native code
///
/// `this_and_args` holds the receiver followed by the arguments. Returns the
/// handle of the callback's result, or `None` for no value.
pub fn function_callback(
    ctx_ref: ContextRef,
    cb_ref: CallbackRef,
    this_and_args: &[RawHandle],
) -> Option<RawHandle> {
    let ctx = resolve_context(ctx_ref);
    let core = ctx.core().clone();
    let scope = core.scope(ScopeKind::CallIn);

    let Some((&this, args)) = this_and_args.split_first() else {
        fatal("function call-in without a receiver");
    };
    let info = FunctionCallbackInfo {
        this: Value::track(&core, this),
        args: args.iter().map(|&raw| Value::track(&core, raw)).collect(),
        ctx,
    };

    let Some(callback) = core.callbacks.lookup(cb_ref) else {
        fatal(ResolutionError::UnknownCallback(cb_ref));
    };
    tracing::trace!(
        context = %ctx_ref,
        callback = %cb_ref,
        argc = args.len(),
        depth = scope.depth(),
        "dispatching call-in"
    );

    let result = callback(&info);

    // the engine holds no reference to receiver or arguments past this point
    let slots: Vec<_> = info.into_values().filter_map(Value::into_releasable_slot).collect();
    core.mark_releasable(&slots);

    let value = result?;
    value.assert_isolate(&core);
    let raw = value.raw();
    if !value.is_pinned() {
        core.park(value);
    }
    Some(raw)
}
