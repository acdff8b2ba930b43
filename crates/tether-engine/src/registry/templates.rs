//! Per-isolate template registry

use crate::error::{fatal, MisuseError};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tether_sdk::{CallbackRef, NativeEngine, TemplatePtr};

/// The two template variants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateKind {
    /// Produces functions that call back into the host
    Function {
        /// Callback invoked by instances
        callback: CallbackRef,
    },
    /// Produces plain objects
    Object,
}

/// A native template and its release state
#[derive(Debug)]
pub struct TemplateEntry {
    ptr: TemplatePtr,
    kind: TemplateKind,
    released: AtomicBool,
}

impl TemplateEntry {
    pub(crate) fn new(ptr: TemplatePtr, kind: TemplateKind) -> Arc<Self> {
        Arc::new(Self {
            ptr,
            kind,
            released: AtomicBool::new(false),
        })
    }

    /// Native pointer
    pub fn ptr(&self) -> TemplatePtr {
        self.ptr
    }

    /// Variant
    pub fn kind(&self) -> TemplateKind {
        self.kind
    }

    /// Whether the native template is gone
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Release the native template; later calls do nothing
    fn release(&self, engine: &dyn NativeEngine) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        engine.release_template(self.ptr);
        true
    }
}

#[derive(Default)]
struct Inner {
    entries: Vec<Arc<TemplateEntry>>,
    closed: bool,
}

/// Every template an isolate has created
///
/// There is no individual removal. [`release_all`](Self::release_all) takes
/// the whole list under the insertion lock and closes the registry.
#[derive(Default)]
pub struct TemplateRegistry {
    inner: Mutex<Inner>,
}

impl TemplateRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a template
    pub fn register(&self, entry: Arc<TemplateEntry>) {
        let mut inner = self.inner.lock();
        if inner.closed {
            drop(inner);
            fatal(MisuseError::IsolateDisposed);
        }
        inner.entries.push(entry);
    }

    /// Release every template exactly once, in creation order
    pub fn release_all(&self, engine: &dyn NativeEngine) -> usize {
        let entries = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            std::mem::take(&mut inner.entries)
        };

        let released = entries.iter().filter(|e| e.release(engine)).count();
        tracing::debug!(released, "templates released");
        released
    }

    /// Number of templates awaiting release
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Check whether no template is awaiting release
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimEngine;
    use tether_sdk::{ContextRef, IsolatePtr};

    fn isolate(engine: &SimEngine) -> IsolatePtr {
        engine.new_isolate(ContextRef::from_u32(1))
    }

    #[test]
    fn test_release_all_releases_once() {
        let engine = SimEngine::new();
        let iso = isolate(&engine);
        let reg = TemplateRegistry::new();

        let first = TemplateEntry::new(engine.new_object_template(iso), TemplateKind::Object);
        let second = TemplateEntry::new(
            engine.new_function_template(iso, CallbackRef::from_u32(4)),
            TemplateKind::Function {
                callback: CallbackRef::from_u32(4),
            },
        );
        reg.register(first.clone());
        reg.register(second.clone());
        assert_eq!(reg.len(), 2);

        assert_eq!(reg.release_all(&*engine), 2);
        assert!(first.is_released());
        assert!(second.is_released());
        assert!(reg.is_empty());

        assert_eq!(reg.release_all(&*engine), 0);
        assert_eq!(engine.double_frees(), 0);

        engine.dispose_isolate(iso);
        assert_eq!(engine.leaked_at_dispose(), 0);
    }

    #[test]
    fn test_entry_release_is_idempotent() {
        let engine = SimEngine::new();
        let iso = isolate(&engine);
        let entry = TemplateEntry::new(engine.new_object_template(iso), TemplateKind::Object);

        assert!(entry.release(&*engine));
        assert!(!entry.release(&*engine));
        assert_eq!(engine.double_frees(), 0);
        engine.dispose_isolate(iso);
    }

    #[test]
    #[should_panic(expected = "Isolate has been disposed")]
    fn test_register_after_close_is_fatal() {
        let engine = SimEngine::new();
        let iso = isolate(&engine);
        let reg = TemplateRegistry::new();
        reg.release_all(&*engine);

        reg.register(TemplateEntry::new(
            engine.new_object_template(iso),
            TemplateKind::Object,
        ));
    }
}
