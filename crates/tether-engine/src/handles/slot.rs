//! Per-handle lifecycle state

use crate::error::{fatal, MisuseError};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tether_sdk::RawHandle;

/// Lifecycle state of a value handle
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HandleState {
    /// A host wrapper is alive; the native record must not be freed
    Tracked = 0,
    /// The host is done with it; waiting for the next batch free
    Releasable = 1,
    /// Handed back to the engine; terminal
    Freed = 2,
}

impl HandleState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => HandleState::Tracked,
            1 => HandleState::Releasable,
            _ => HandleState::Freed,
        }
    }
}

/// Shared state cell for one native value record
///
/// The slot is shared between the host wrapper and the handle table, so the
/// wrapper can tell when its record is gone without asking the table.
#[derive(Debug)]
pub struct HandleSlot {
    raw: RawHandle,
    state: AtomicU8,
}

impl HandleSlot {
    pub(crate) fn new(raw: RawHandle) -> Arc<Self> {
        Arc::new(Self {
            raw,
            state: AtomicU8::new(HandleState::Tracked as u8),
        })
    }

    /// Get the native record this slot stands for
    #[inline]
    pub fn raw(&self) -> RawHandle {
        self.raw
    }

    /// Get the current state
    #[inline]
    pub fn state(&self) -> HandleState {
        HandleState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Move to `to`, returning the previous state
    ///
    /// Moving to the current state is a no-op. Moving backwards is fatal.
    pub(crate) fn advance(&self, to: HandleState) -> HandleState {
        let prev = HandleState::from_u8(self.state.fetch_max(to as u8, Ordering::AcqRel));
        if prev > to {
            fatal(MisuseError::StateRegression(self.raw));
        }
        prev
    }

    /// Panic unless the record may still be read
    #[track_caller]
    pub fn assert_live(&self) {
        match self.state() {
            HandleState::Tracked => {}
            HandleState::Releasable => fatal(MisuseError::HandleReleased(self.raw)),
            HandleState::Freed => fatal(MisuseError::HandleFreed(self.raw)),
        }
    }
}
