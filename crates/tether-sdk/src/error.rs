//! Script errors reported by the engine

use std::fmt;

/// An exception raised while the engine was executing script code
///
/// Script errors are recoverable: the isolate keeps running and the caller
/// decides what to do with the failure.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub struct ScriptError {
    /// Exception message (`e.message` or the stringified thrown value)
    pub message: String,
    /// Source location, usually `origin:line:column`
    pub location: String,
    /// Stack trace text, if the engine captured one
    pub stack_trace: String,
}

impl ScriptError {
    /// Create an error with only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            location: String::new(),
            stack_trace: String::new(),
        }
    }

    /// Attach a source location
    pub fn with_location(mut self, location: impl Into<String>) -> Self {
        self.location = location.into();
        self
    }

    /// Attach a stack trace
    pub fn with_stack_trace(mut self, stack: impl Into<String>) -> Self {
        self.stack_trace = stack.into();
        self
    }
}

impl fmt::Display for ScriptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // `{:#}` prints the stack as well
        if f.alternate() && !self.stack_trace.is_empty() {
            return write!(f, "{}", self.stack_trace);
        }
        if self.location.is_empty() {
            write!(f, "{}", self.message)
        } else {
            write!(f, "{} ({})", self.message, self.location)
        }
    }
}

/// Result of a native call that may raise a script exception
pub type NativeResult<T> = Result<T, ScriptError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let err = ScriptError::new("ReferenceError: x is not defined");
        assert_eq!(err.to_string(), "ReferenceError: x is not defined");

        let err = err.with_location("main.js:1:1");
        assert_eq!(
            err.to_string(),
            "ReferenceError: x is not defined (main.js:1:1)"
        );
    }

    #[test]
    fn test_alternate_display_prints_stack() {
        let err = ScriptError::new("boom").with_stack_trace("Error: boom\n    at main.js:1:1");
        assert_eq!(format!("{:#}", err), "Error: boom\n    at main.js:1:1");
    }
}
