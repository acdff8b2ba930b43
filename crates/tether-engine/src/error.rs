//! Error taxonomy
//!
//! Three classes of failure exist:
//!
//! - **Script errors** ([`Error::Script`]) are recoverable and returned as
//!   ordinary `Result` values.
//! - **Resolution errors** ([`ResolutionError`]) mean the host and native
//!   sides disagree about which contexts or callbacks exist.
//! - **Misuse errors** ([`MisuseError`]) are lifecycle bugs in the caller:
//!   using a disposed isolate, disposing twice, touching a freed handle.
//!
//! Resolution and misuse errors are never retried. They go through [`fatal`],
//! which logs and panics.

use tether_sdk::{CallbackRef, ContextRef, RawHandle, ScriptError};
use thiserror::Error;

/// Recoverable errors returned by the public API
#[derive(Debug, Error)]
pub enum Error {
    /// Script code raised an exception
    #[error("{0}")]
    Script(#[from] ScriptError),

    /// An argument combination the API does not accept
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration could not be parsed
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error while reading configuration
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Get the script error, if this is one
    pub fn as_script_error(&self) -> Option<&ScriptError> {
        match self {
            Error::Script(e) => Some(e),
            _ => None,
        }
    }
}

/// Result type for the public API
pub type Result<T> = std::result::Result<T, Error>;

/// A reference carried by a call-in could not be resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// No context is registered under this reference
    #[error("Unknown context reference {0}")]
    UnknownContext(ContextRef),

    /// No callback is registered under this reference
    #[error("Unknown callback reference {0}")]
    UnknownCallback(CallbackRef),
}

impl ResolutionError {
    /// Resolution errors always indicate host/native desynchronization
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// A lifecycle rule was broken by the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MisuseError {
    /// The isolate was already disposed
    #[error("Isolate has been disposed")]
    IsolateDisposed,

    /// `dispose` was called a second time
    #[error("Isolate disposed twice")]
    DoubleDispose,

    /// The isolate was disposed from inside one of its own native calls
    #[error("Isolate disposed while a native call is in progress")]
    DisposeDuringCall,

    /// The context was already closed
    #[error("Context has been closed")]
    ContextClosed,

    /// The handle was already freed on the native side
    #[error("Value handle {0:?} used after it was freed")]
    HandleFreed(RawHandle),

    /// The handle was already handed over for release
    #[error("Value handle {0:?} used after it was released")]
    HandleReleased(RawHandle),

    /// A handle tried to move back to an earlier lifecycle state
    #[error("Value handle {0:?} cannot move back to an earlier state")]
    StateRegression(RawHandle),

    /// A value, template, or script from another isolate was passed in
    #[error("Value belongs to a different isolate")]
    ForeignValue,
}

impl MisuseError {
    /// Misuse errors are programming errors
    pub fn is_fatal(&self) -> bool {
        true
    }
}

/// Abort the current operation on a fatal error
///
/// The error is logged before panicking so it is visible even when the panic
/// unwinds through foreign frames and aborts the process.
#[cold]
#[track_caller]
pub fn fatal(err: impl std::fmt::Display) -> ! {
    tracing::error!("fatal: {}", err);
    panic!("{}", err);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_error_conversion() {
        let err: Error = ScriptError::new("TypeError: boom").into();
        assert!(err.as_script_error().is_some());
        assert_eq!(err.to_string(), "TypeError: boom");
    }

    #[test]
    fn test_resolution_error_is_fatal() {
        let err = ResolutionError::UnknownContext(ContextRef::from_u32(42));
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Unknown context reference ctx#42");
    }

    #[test]
    fn test_misuse_messages() {
        assert_eq!(
            MisuseError::HandleFreed(RawHandle::from_raw(16)).to_string(),
            "Value handle RawHandle(0x10) used after it was freed"
        );
        assert!(MisuseError::DoubleDispose.is_fatal());
    }

    #[test]
    #[should_panic(expected = "Isolate has been disposed")]
    fn test_fatal_panics() {
        fatal(MisuseError::IsolateDisposed);
    }
}
