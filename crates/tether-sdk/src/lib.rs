//! Tether SDK - the boundary contract of the tether handle bridge
//!
//! This crate holds the types both sides of the native boundary agree on:
//!
//! - Opaque, fixed-width pointers ([`RawHandle`], [`IsolatePtr`], ...)
//! - Small integer references echoed by call-ins ([`ContextRef`], [`CallbackRef`])
//! - The [`NativeEngine`] trait an engine binding implements
//! - [`ScriptError`], the recoverable failure raised by script code
//!
//! Engine bindings depend on this crate alone; the lifecycle machinery lives
//! in `tether-engine`.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod engine;
pub mod error;
pub mod handle;
pub mod value;

pub use engine::{
    BatchRelease, CachedData, CompileMode, CompileOptions, CompiledScript, HeapStatistics,
    NativeEngine,
};
pub use error::{NativeResult, ScriptError};
pub use handle::{CallbackRef, ContextPtr, ContextRef, IsolatePtr, RawHandle, ScriptPtr, TemplatePtr};
pub use value::{Primitive, PropertyAttribute, TemplateValue, ValueKind};
