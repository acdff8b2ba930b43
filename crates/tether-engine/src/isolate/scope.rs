//! Isolate entry guard
//!
//! Every call from the host into the native engine runs inside a
//! [`NativeScope`]. The scope holds the isolate's re-entrant entry lock, so
//! only one thread is inside an isolate at a time while a callback on that
//! thread may call back into the same isolate.
//!
//! The scope also counts nesting depth. Values handed back to native code by
//! host callbacks are parked until the outermost host-initiated scope exits;
//! native code may still read them until control returns to the host.

use super::IsolateCore;
use parking_lot::ReentrantMutexGuard;
use std::sync::atomic::Ordering;

/// Who opened the scope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ScopeKind {
    /// The host is calling into the engine
    Host,
    /// The engine is calling a host callback
    CallIn,
}

/// RAII guard for one call into an isolate
pub(crate) struct NativeScope<'a> {
    core: &'a IsolateCore,
    kind: ScopeKind,
    _entry: ReentrantMutexGuard<'a, ()>,
}

impl<'a> NativeScope<'a> {
    /// Enter the isolate, blocking while another thread is inside
    ///
    /// Entering an isolate that is not running is fatal.
    #[track_caller]
    pub(crate) fn enter(core: &'a IsolateCore, kind: ScopeKind) -> Self {
        let entry = core.entry.lock();
        core.assert_running();
        core.depth.fetch_add(1, Ordering::AcqRel);
        Self {
            core,
            kind,
            _entry: entry,
        }
    }

    /// Nesting depth including this scope
    pub(crate) fn depth(&self) -> usize {
        self.core.depth.load(Ordering::Acquire)
    }
}

impl Drop for NativeScope<'_> {
    fn drop(&mut self) {
        let remaining = self.core.depth.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.kind == ScopeKind::Host {
            self.core.on_outermost_exit();
        }
    }
}
