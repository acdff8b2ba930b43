//! Per-isolate callback registry

use dashmap::DashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tether_sdk::CallbackRef;

/// Maps callback references to host closures
///
/// Lookups clone the closure out of the map, so a running callback may
/// register further callbacks without contending with itself.
pub struct CallbackRegistry<F: ?Sized> {
    callbacks: DashMap<CallbackRef, Arc<F>>,
    next: AtomicU32,
}

impl<F: ?Sized> CallbackRegistry<F> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            callbacks: DashMap::new(),
            next: AtomicU32::new(1),
        }
    }

    /// Store a closure and return its reference
    pub fn register(&self, callback: Arc<F>) -> CallbackRef {
        let r = CallbackRef::from_u32(self.next.fetch_add(1, Ordering::Relaxed));
        self.callbacks.insert(r, callback);
        r
    }

    /// Get the closure registered under `r`
    pub fn lookup(&self, r: CallbackRef) -> Option<Arc<F>> {
        self.callbacks.get(&r).map(|entry| Arc::clone(entry.value()))
    }

    /// Drop every closure
    pub fn clear(&self) -> usize {
        let n = self.callbacks.len();
        self.callbacks.clear();
        n
    }

    /// Number of registered closures
    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    /// Check whether no closure is registered
    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }
}

impl<F: ?Sized> Default for CallbackRegistry<F> {
    fn default() -> Self {
        Self::new()
    }
}
