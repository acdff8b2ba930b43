//! Integer-reference registries
//!
//! Native code never holds a host reference. It holds small integers that
//! these tables resolve back to live objects:
//!
//! - [`ContextDirectory`] - process-wide, context reference to context
//! - [`CallbackRegistry`] - per isolate, callback reference to host closure
//! - [`TemplateRegistry`] - per isolate, every template awaiting release

mod callbacks;
mod contexts;
mod templates;

pub use callbacks::CallbackRegistry;
pub use contexts::ContextDirectory;
pub use templates::{TemplateEntry, TemplateKind, TemplateRegistry};
