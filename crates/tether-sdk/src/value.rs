//! Value descriptions shared by both sides of the boundary
//!
//! Marshaling of rich types (typed arrays, dates, ...) is the engine's
//! business. The core only needs enough to create the common primitives and
//! to tell handles apart by kind.

use crate::handle::TemplatePtr;
use std::fmt;

/// A primitive that can be created on, or read back from, the native heap
#[derive(Debug, Clone, PartialEq)]
pub enum Primitive {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool(bool),
    /// Number (IEEE-754 double)
    Number(f64),
    /// String
    String(String),
}

impl Primitive {
    /// Get the kind of value this primitive produces
    pub fn kind(&self) -> ValueKind {
        match self {
            Primitive::Undefined => ValueKind::Undefined,
            Primitive::Null => ValueKind::Null,
            Primitive::Bool(_) => ValueKind::Bool,
            Primitive::Number(_) => ValueKind::Number,
            Primitive::String(_) => ValueKind::String,
        }
    }

    /// Read the number, if this is one
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Primitive::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Read the string, if this is one
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Primitive::String(s) => Some(s),
            _ => None,
        }
    }

    /// Read the boolean, if this is one
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Primitive::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

impl From<bool> for Primitive {
    fn from(b: bool) -> Self {
        Primitive::Bool(b)
    }
}

impl From<f64> for Primitive {
    fn from(n: f64) -> Self {
        Primitive::Number(n)
    }
}

impl From<i32> for Primitive {
    fn from(n: i32) -> Self {
        Primitive::Number(n as f64)
    }
}

impl From<u32> for Primitive {
    fn from(n: u32) -> Self {
        Primitive::Number(n as f64)
    }
}

impl From<&str> for Primitive {
    fn from(s: &str) -> Self {
        Primitive::String(s.to_string())
    }
}

impl From<String> for Primitive {
    fn from(s: String) -> Self {
        Primitive::String(s)
    }
}

/// Coarse classification of a native value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    /// `undefined`
    Undefined,
    /// `null`
    Null,
    /// Boolean
    Bool,
    /// Number
    Number,
    /// String
    String,
    /// Plain object
    Object,
    /// Callable object
    Function,
}

impl ValueKind {
    /// Check if values of this kind are objects (functions included)
    pub fn is_object(self) -> bool {
        matches!(self, ValueKind::Object | ValueKind::Function)
    }

    /// Get the type name as reported by `typeof`
    pub fn type_name(self) -> &'static str {
        match self {
            ValueKind::Undefined => "undefined",
            ValueKind::Null => "object",
            ValueKind::Bool => "boolean",
            ValueKind::Number => "number",
            ValueKind::String => "string",
            ValueKind::Object => "object",
            ValueKind::Function => "function",
        }
    }
}

/// Attribute flags for a property on an object or template
#[derive(Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct PropertyAttribute(u8);

impl PropertyAttribute {
    /// No attributes
    pub const NONE: Self = PropertyAttribute(0);
    /// Not writable
    pub const READ_ONLY: Self = PropertyAttribute(1 << 1);
    /// Not enumerable
    pub const DONT_ENUM: Self = PropertyAttribute(1 << 2);
    /// Not configurable
    pub const DONT_DELETE: Self = PropertyAttribute(1 << 3);

    /// Get the raw bits passed to the engine
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Check whether all flags in `other` are set
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Combine a list of attributes into one set
    pub fn combine(attrs: &[PropertyAttribute]) -> Self {
        attrs.iter().fold(Self::NONE, |acc, a| acc | *a)
    }
}

impl std::ops::BitOr for PropertyAttribute {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        PropertyAttribute(self.0 | rhs.0)
    }
}

impl fmt::Debug for PropertyAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Self::READ_ONLY) {
            names.push("READ_ONLY");
        }
        if self.contains(Self::DONT_ENUM) {
            names.push("DONT_ENUM");
        }
        if self.contains(Self::DONT_DELETE) {
            names.push("DONT_DELETE");
        }
        if names.is_empty() {
            write!(f, "PropertyAttribute(NONE)")
        } else {
            write!(f, "PropertyAttribute({})", names.join(" | "))
        }
    }
}

/// A property value that can be placed on a template
///
/// Templates outlive every context, so they may only hold primitives or
/// other templates, never context-bound values.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplateValue {
    /// A primitive copied into every instance
    Primitive(Primitive),
    /// A function template, instantiated per context
    FunctionTemplate(TemplatePtr),
    /// An object template, instantiated per context
    ObjectTemplate(TemplatePtr),
}

impl From<Primitive> for TemplateValue {
    fn from(value: Primitive) -> Self {
        TemplateValue::Primitive(value)
    }
}

macro_rules! template_value_from {
    ($($ty:ty),*) => {
        $(
            impl From<$ty> for TemplateValue {
                fn from(value: $ty) -> Self {
                    TemplateValue::Primitive(Primitive::from(value))
                }
            }
        )*
    };
}

template_value_from!(bool, f64, i32, u32, &str, String);
