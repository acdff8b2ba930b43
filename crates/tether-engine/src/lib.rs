//! Tether Engine
//!
//! The handle lifecycle and registry bridge between a garbage-collected host
//! and a native script engine reached through [`NativeEngine`]:
//! - **Handles**: every native value record the host holds is tracked,
//!   marked releasable when its wrapper is dropped, and freed in batches
//!   (`handles` module)
//! - **Registries**: the process-wide context directory and per-isolate
//!   callback and template registries (`registry` module)
//! - **Isolates and contexts**: ordered creation and disposal
//!   (`isolate`, `context` modules)
//! - **Dispatch**: native call-ins back into host callbacks
//!   (`dispatch`, `ffi` modules)
//! - **Sim**: an in-process engine for tests and benches (`sim` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use tether_engine::{Context, FunctionTemplate, Isolate, SimEngine};
//!
//! let iso = Isolate::new(SimEngine::new());
//! let ctx = Context::new(&iso);
//!
//! let add = FunctionTemplate::new(&iso, |info| {
//!     let sum: f64 = info.args().iter().filter_map(|v| v.as_number()).sum();
//!     Some(info.context().new_value(sum))
//! });
//! ctx.global().set("add", &add.get_function(&ctx)?)?;
//!
//! let result = ctx.run_script("add(1, 2)", "main.js")?;
//! assert_eq!(result.as_number(), Some(3.0));
//!
//! iso.dispose();
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod config;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod ffi;
pub mod handles;
pub mod isolate;
pub mod registry;
pub mod sim;
pub mod sweeper;
pub mod template;
pub mod value;

pub use config::{IsolateOptions, RuntimeConfig, SweeperOptions};
pub use context::{Context, ContextOptions};
pub use dispatch::{FunctionCallback, FunctionCallbackInfo};
pub use error::{Error, MisuseError, ResolutionError, Result};
pub use handles::{HandleState, HandleStats};
pub use isolate::{Isolate, IsolateHandle, IsolateState, TerminateHandle, UnboundScript};
pub use sim::{SimCounters, SimEngine};
pub use sweeper::Sweeper;
pub use template::{FunctionTemplate, ObjectTemplate};
pub use value::{Function, Object, Value};

pub use tether_sdk::{
    BatchRelease, CachedData, CallbackRef, CompileMode, CompileOptions, ContextPtr, ContextRef,
    HeapStatistics, IsolatePtr, NativeEngine, Primitive, PropertyAttribute, RawHandle,
    ScriptError, TemplateValue, ValueKind,
};
