//! Process-wide context directory

use crate::error::ResolutionError;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tether_sdk::ContextRef;

struct Entry<C> {
    context: C,
    refcount: usize,
}

/// Maps context references to live contexts
///
/// Lookups take a read lock and run concurrently with each other.
/// Registration and deregistration are exclusive. The same reference may be
/// registered more than once; it stays resolvable until every registration
/// has been withdrawn.
pub struct ContextDirectory<C> {
    entries: RwLock<FxHashMap<ContextRef, Entry<C>>>,
    next: AtomicU32,
}

impl<C: Clone> ContextDirectory<C> {
    /// Create an empty directory
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(FxHashMap::default()),
            next: AtomicU32::new(1),
        }
    }

    /// Allocate a reference no outstanding registration uses
    ///
    /// Zero is never handed out.
    pub fn next_ref(&self) -> ContextRef {
        loop {
            let n = self.next.fetch_add(1, Ordering::Relaxed);
            if n == 0 {
                continue;
            }
            let r = ContextRef::from_u32(n);
            if !self.entries.read().contains_key(&r) {
                return r;
            }
        }
    }

    /// Register `context` under `r`, or bump the refcount if already present
    ///
    /// An existing entry keeps its original context.
    pub fn register(&self, r: ContextRef, context: C) {
        let mut entries = self.entries.write();
        let entry = entries.entry(r).or_insert(Entry {
            context,
            refcount: 0,
        });
        entry.refcount += 1;
        tracing::debug!(context = %r, refcount = entry.refcount, "context registered");
    }

    /// Withdraw one registration of `r`
    ///
    /// Returns the context when the last registration goes away. Unknown
    /// references are ignored.
    pub fn deregister(&self, r: ContextRef) -> Option<C> {
        let mut entries = self.entries.write();
        let Some(entry) = entries.get_mut(&r) else {
            tracing::warn!(context = %r, "deregister of unknown context reference");
            return None;
        };

        entry.refcount -= 1;
        if entry.refcount > 0 {
            tracing::debug!(context = %r, refcount = entry.refcount, "context deregistered");
            return None;
        }
        tracing::debug!(context = %r, "context removed");
        entries.remove(&r).map(|e| e.context)
    }

    /// Find the context registered under `r`
    pub fn lookup(&self, r: ContextRef) -> Option<C> {
        self.entries.read().get(&r).map(|e| e.context.clone())
    }

    /// Find the context registered under `r`, or report a resolution error
    pub fn resolve(&self, r: ContextRef) -> Result<C, ResolutionError> {
        self.lookup(r).ok_or(ResolutionError::UnknownContext(r))
    }

    /// Current refcount of `r` (0 if absent)
    pub fn refcount(&self, r: ContextRef) -> usize {
        self.entries.read().get(&r).map_or(0, |e| e.refcount)
    }

    /// Number of distinct registered references
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Check whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<C: Clone> Default for ContextDirectory<C> {
    fn default() -> Self {
        Self::new()
    }
}
