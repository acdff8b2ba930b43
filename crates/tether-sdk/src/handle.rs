//! Opaque identifiers that cross the native boundary
//!
//! Every value that travels between the host and the native engine is a
//! fixed-width integer. The host never dereferences these; equality is used
//! only for identity and registry lookups.

use std::fmt;

macro_rules! opaque_ptr {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(u64);

        impl $name {
            /// The null pointer value
            pub const NULL: Self = $name(0);

            /// Wrap a raw pointer-sized value handed over by the engine
            #[inline]
            pub const fn from_raw(raw: u64) -> Self {
                $name(raw)
            }

            /// Get the raw value to hand back to the engine
            #[inline]
            pub const fn as_raw(self) -> u64 {
                self.0
            }

            /// Check whether this is the null pointer
            #[inline]
            pub const fn is_null(self) -> bool {
                self.0 == 0
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({:#x})"), self.0)
            }
        }
    };
}

opaque_ptr!(
    /// Opaque pointer to a native value record
    ///
    /// Each record is produced by exactly one native call and is owned by the
    /// host until it is handed back through a batch release.
    RawHandle
);

opaque_ptr!(
    /// Opaque pointer to a native engine instance (an isolate)
    IsolatePtr
);

opaque_ptr!(
    /// Opaque pointer to a native execution context
    ContextPtr
);

opaque_ptr!(
    /// Opaque pointer to a native object or function template
    TemplatePtr
);

opaque_ptr!(
    /// Opaque pointer to a compiled, context-independent script
    ScriptPtr
);

/// Small integer reference to an execution context
///
/// The native side is given this number when the context is created and
/// echoes it unchanged on every call-in for that context.
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextRef(u32);

impl ContextRef {
    /// Create a reference from its numeric value
    pub const fn from_u32(id: u32) -> Self {
        ContextRef(id)
    }

    /// Get the numeric value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ContextRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx#{}", self.0)
    }
}

/// Small integer reference to a host callback, scoped to one isolate
#[repr(transparent)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackRef(u32);

impl CallbackRef {
    /// Create a reference from its numeric value
    pub const fn from_u32(id: u32) -> Self {
        CallbackRef(id)
    }

    /// Get the numeric value
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for CallbackRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cb#{}", self.0)
    }
}
