//! Tree-walking evaluator for sim scripts
//!
//! The heap lock is taken per step and always released before a host
//! function is invoked, so host callbacks may freely call back into the
//! engine (and the bridge may flush handles) while a script is running.

use super::heap::{Callable, Val};
use super::script::{Expr, Pos, Program, Stmt};
use super::SimEngine;
use crate::dispatch;
use tether_sdk::{CallbackRef, ContextPtr, IsolatePtr, ScriptError};

const TERMINATED: &str = "ExecutionTerminated: script execution has been terminated";

/// Why evaluation stopped early
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Abrupt {
    Throw { value: Val, pos: Option<Pos> },
    Terminated,
}

impl Abrupt {
    fn error(message: String, pos: Pos) -> Self {
        Abrupt::Throw {
            value: Val::Str(message),
            pos: Some(pos),
        }
    }
}

type Completion = Result<Val, Abrupt>;

/// Marks the isolate as executing script for its lifetime
struct Running<'e> {
    engine: &'e SimEngine,
    iso: IsolatePtr,
}

impl<'e> Running<'e> {
    fn enter(engine: &'e SimEngine, iso: IsolatePtr) -> Self {
        engine.heap.lock().isolate(iso).js_depth += 1;
        Self { engine, iso }
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        let mut heap = self.engine.heap.lock();
        if let Some(state) = heap.isolates.get_mut(&self.iso) {
            state.js_depth -= 1;
            if state.js_depth == 0 {
                state.terminating = false;
            }
        }
    }
}

pub(crate) struct Interp<'e> {
    engine: &'e SimEngine,
    iso: IsolatePtr,
    ctx: ContextPtr,
    origin: String,
}

impl<'e> Interp<'e> {
    pub fn new(engine: &'e SimEngine, ctx: ContextPtr, origin: &str) -> Self {
        let iso = engine.heap.lock().context(ctx).iso;
        Self {
            engine,
            iso,
            ctx,
            origin: origin.to_string(),
        }
    }

    /// Run a whole program; its value is the value of the last statement
    pub fn run(&self, program: &Program) -> Result<Val, ScriptError> {
        let _running = Running::enter(self.engine, self.iso);
        let mut last = Val::Undefined;
        for stmt in &program.stmts {
            let step = self.check_terminating().and_then(|_| self.stmt(stmt));
            match step {
                Ok(v) => last = v,
                Err(abrupt) => return Err(self.to_script_error(abrupt)),
            }
        }
        Ok(last)
    }

    /// Call a function value from outside script code
    pub fn call(&self, callee: Val, this: Val, args: Vec<Val>) -> Result<Val, ScriptError> {
        let _running = Running::enter(self.engine, self.iso);
        let callable = self.engine.heap.lock().callable(&callee);
        let result = match callable {
            Callable::NotCallable => Err(Abrupt::Throw {
                value: Val::Str("TypeError: value is not a function".to_string()),
                pos: None,
            }),
            _ => self.invoke(callable, this, args, None),
        };
        result.map_err(|abrupt| self.to_script_error(abrupt))
    }

    fn to_script_error(&self, abrupt: Abrupt) -> ScriptError {
        match abrupt {
            Abrupt::Terminated => ScriptError::new(TERMINATED),
            Abrupt::Throw { value, pos } => {
                let message = self.engine.heap.lock().to_display(&value);
                match pos {
                    Some(pos) => {
                        let location = format!("{}:{}", self.origin, pos);
                        let stack = format!("{}\n    at {}", message, location);
                        ScriptError::new(message)
                            .with_location(location)
                            .with_stack_trace(stack)
                    }
                    None => ScriptError::new(message),
                }
            }
        }
    }

    fn check_terminating(&self) -> Result<(), Abrupt> {
        if self.engine.heap.lock().isolate(self.iso).terminating {
            return Err(Abrupt::Terminated);
        }
        Ok(())
    }

    fn stmt(&self, stmt: &Stmt) -> Completion {
        match stmt {
            Stmt::Expr(expr) => self.eval(expr),
            Stmt::Throw(expr, pos) => {
                let value = self.eval(expr)?;
                Err(Abrupt::Throw {
                    value,
                    pos: Some(*pos),
                })
            }
        }
    }

    fn eval(&self, expr: &Expr) -> Completion {
        match expr {
            Expr::Number(n) => Ok(Val::Number(*n)),
            Expr::Str(s) => Ok(Val::Str(s.clone())),
            Expr::Bool(b) => Ok(Val::Bool(*b)),
            Expr::Null => Ok(Val::Null),
            Expr::Undefined => Ok(Val::Undefined),
            Expr::Neg(inner) => {
                let v = self.eval(inner)?;
                Ok(Val::Number(-v.as_number()))
            }
            Expr::Ident { name, pos } => {
                let heap = self.engine.heap.lock();
                let global = heap.context(self.ctx).global;
                match heap.objects.get(&global).and_then(|o| o.props.get(name)) {
                    Some(prop) => Ok(prop.val.clone()),
                    None => Err(Abrupt::error(
                        format!("ReferenceError: {} is not defined", name),
                        *pos,
                    )),
                }
            }
            Expr::Object(fields) => {
                let mut values = Vec::with_capacity(fields.len());
                for (key, value) in fields {
                    values.push((key, self.eval(value)?));
                }
                let mut heap = self.engine.heap.lock();
                let obj = heap.new_object(self.iso, Callable::NotCallable);
                for (key, value) in values {
                    heap.assign_prop(obj, key, value);
                }
                Ok(Val::Obj(obj))
            }
            Expr::Member { object, name, pos } => {
                let target = self.eval(object)?;
                self.get(&target, name, *pos)
            }
            Expr::Assign { target, value, pos } => self.assign(target, value, *pos),
            Expr::Call { callee, args, pos } => self.eval_call(callee, args, *pos),
        }
    }

    fn get(&self, target: &Val, name: &str, pos: Pos) -> Completion {
        match target {
            Val::Obj(id) => Ok(self.engine.heap.lock().get_prop(*id, name)),
            Val::Undefined | Val::Null => Err(Abrupt::error(
                format!(
                    "TypeError: Cannot read properties of {} (reading '{}')",
                    self.engine.heap.lock().to_display(target),
                    name
                ),
                pos,
            )),
            _ => Ok(Val::Undefined),
        }
    }

    fn assign(&self, target: &Expr, value: &Expr, pos: Pos) -> Completion {
        match target {
            Expr::Ident { name, .. } => {
                let value = self.eval(value)?;
                let mut heap = self.engine.heap.lock();
                let global = heap.context(self.ctx).global;
                heap.assign_prop(global, name, value.clone());
                Ok(value)
            }
            Expr::Member { object, name, .. } => {
                let object = self.eval(object)?;
                let value = self.eval(value)?;
                match object {
                    Val::Obj(id) => {
                        self.engine.heap.lock().assign_prop(id, name, value.clone());
                        Ok(value)
                    }
                    Val::Undefined | Val::Null => Err(Abrupt::error(
                        format!(
                            "TypeError: Cannot set properties of {} (setting '{}')",
                            self.engine.heap.lock().to_display(&object),
                            name
                        ),
                        pos,
                    )),
                    // primitives drop the write
                    _ => Ok(value),
                }
            }
            _ => Err(Abrupt::error(
                "SyntaxError: Invalid left-hand side in assignment".to_string(),
                pos,
            )),
        }
    }

    fn eval_call(&self, callee: &Expr, args: &[Expr], pos: Pos) -> Completion {
        let (function, this) = match callee {
            Expr::Member { object, name, pos } => {
                let this = self.eval(object)?;
                (self.get(&this, name, *pos)?, this)
            }
            _ => {
                let function = self.eval(callee)?;
                let global = self.engine.heap.lock().context(self.ctx).global;
                (function, Val::Obj(global))
            }
        };

        let mut values = Vec::with_capacity(args.len());
        for arg in args {
            values.push(self.eval(arg)?);
        }

        let callable = self.engine.heap.lock().callable(&function);
        if callable == Callable::NotCallable {
            return Err(Abrupt::error(
                format!("TypeError: {} is not a function", callee.describe()),
                pos,
            ));
        }
        self.invoke(callable, this, values, Some(pos))
    }

    fn invoke(&self, callable: Callable, this: Val, args: Vec<Val>, pos: Option<Pos>) -> Completion {
        match callable {
            Callable::Host(cb) => self.call_host(cb, this, args, pos),
            Callable::QueueMicrotask => {
                let task = args.into_iter().next().unwrap_or(Val::Undefined);
                let mut heap = self.engine.heap.lock();
                if heap.callable(&task) == Callable::NotCallable {
                    return Err(Abrupt::Throw {
                        value: Val::Str(
                            "TypeError: queueMicrotask argument must be a function".to_string(),
                        ),
                        pos,
                    });
                }
                let ctx = self.ctx;
                heap.isolate(self.iso).microtasks.push_back((ctx, task));
                Ok(Val::Undefined)
            }
            Callable::NotCallable => Ok(Val::Undefined),
        }
    }

    fn call_host(&self, cb: CallbackRef, this: Val, args: Vec<Val>, pos: Option<Pos>) -> Completion {
        let (ctx_ref, handles) = {
            let mut heap = self.engine.heap.lock();
            let ctx_ref = heap.context(self.ctx).ctx_ref;
            let mut handles = Vec::with_capacity(args.len() + 1);
            handles.push(heap.new_record(self.ctx, this));
            for arg in args {
                handles.push(heap.new_record(self.ctx, arg));
            }
            (ctx_ref, handles)
        };

        // receiver and argument records now belong to the bridge
        let result = dispatch::function_callback(ctx_ref, cb, &handles);

        let mut heap = self.engine.heap.lock();
        let value = match result {
            Some(raw) => heap.record(raw).val.clone(),
            None => Val::Undefined,
        };
        let state = heap.isolate(self.iso);
        if state.terminating {
            return Err(Abrupt::Terminated);
        }
        if let Some(exception) = state.pending_exception.take() {
            return Err(Abrupt::Throw {
                value: exception,
                pos,
            });
        }
        Ok(value)
    }
}
