//! Per-isolate handle table

use super::slot::{HandleSlot, HandleState};
use crate::error::{fatal, MisuseError};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tether_sdk::{BatchRelease, RawHandle};

type SlotMap = FxHashMap<RawHandle, Arc<HandleSlot>>;

/// Snapshot of handle table counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleStats {
    /// Handles currently tracked
    pub tracked: usize,
    /// Handles waiting for the next flush
    pub releasable: usize,
    /// Handles tracked over the table's lifetime
    pub total_tracked: u64,
    /// Handles freed over the table's lifetime
    pub total_freed: u64,
    /// Number of non-empty flushes
    pub flushes: u64,
}

/// Tracked and releasable handle sets for one isolate
///
/// Lock order is `stopped` then `tracked` then `releasable`. The batch free
/// is issued after every lock has been released.
pub struct HandleTable {
    stopped: Mutex<bool>,
    tracked: Mutex<SlotMap>,
    releasable: Mutex<SlotMap>,
    total_tracked: AtomicU64,
    total_freed: AtomicU64,
    flushes: AtomicU64,
    trace: bool,
}

impl HandleTable {
    /// Create an empty table
    pub fn new(trace: bool) -> Self {
        Self {
            stopped: Mutex::new(false),
            tracked: Mutex::new(FxHashMap::default()),
            releasable: Mutex::new(FxHashMap::default()),
            total_tracked: AtomicU64::new(0),
            total_freed: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            trace,
        }
    }

    /// Start tracking a native record
    ///
    /// Once the table is stopped nothing new is inserted; the returned slot
    /// is left to the native teardown.
    pub fn track(&self, raw: RawHandle) -> Arc<HandleSlot> {
        let stopped = self.stopped.lock();
        if *stopped {
            tracing::trace!(handle = ?raw, "table stopped, handle not tracked");
            return HandleSlot::new(raw);
        }

        let mut tracked = self.tracked.lock();
        if let Some(existing) = tracked.get(&raw) {
            tracing::warn!(handle = ?raw, "handle tracked twice");
            return Arc::clone(existing);
        }
        let slot = HandleSlot::new(raw);
        tracked.insert(raw, Arc::clone(&slot));
        self.total_tracked.fetch_add(1, Ordering::Relaxed);
        slot
    }

    /// Move handles from tracked to releasable
    ///
    /// Already releasable handles are skipped. A freed handle is fatal. Does
    /// nothing once the table is stopped. Returns the number moved.
    pub fn mark_releasable(&self, slots: &[Arc<HandleSlot>]) -> usize {
        if slots.is_empty() {
            return 0;
        }

        let stopped = self.stopped.lock();
        if *stopped {
            return 0;
        }

        let mut tracked = self.tracked.lock();
        let mut releasable = self.releasable.lock();
        let mut moved = 0;
        for slot in slots {
            match slot.state() {
                HandleState::Freed => fatal(MisuseError::HandleFreed(slot.raw())),
                HandleState::Releasable => continue,
                HandleState::Tracked => {
                    tracked.remove(&slot.raw());
                    releasable.insert(slot.raw(), Arc::clone(slot));
                    slot.advance(HandleState::Releasable);
                    moved += 1;
                }
            }
        }

        if self.trace {
            tracing::debug!(
                moved,
                tracked = tracked.len(),
                releasable = releasable.len(),
                "marked handles releasable"
            );
        }
        moved
    }

    /// Free every releasable handle in one native batch
    ///
    /// The set is swapped out under its lock and the batch is released after
    /// the lock is dropped, so the free may re-enter this table.
    pub fn flush_releasable<E: BatchRelease + ?Sized>(&self, engine: &E) -> usize {
        let batch = std::mem::take(&mut *self.releasable.lock());
        if batch.is_empty() {
            return 0;
        }

        let mut raws = Vec::with_capacity(batch.len());
        for (raw, slot) in batch {
            slot.advance(HandleState::Freed);
            raws.push(raw);
        }

        engine.release_batch(&raws);

        let n = raws.len();
        self.total_freed.fetch_add(n as u64, Ordering::Relaxed);
        self.flushes.fetch_add(1, Ordering::Relaxed);
        if self.trace {
            tracing::debug!(freed = n, "flushed releasable handles");
        }
        n
    }

    /// Free everything the table still holds
    ///
    /// Used during disposal after [`stop`](Self::stop): the releasable set is
    /// flushed, then every tracked handle is moved over and flushed too.
    pub fn drain_all<E: BatchRelease + ?Sized>(&self, engine: &E) -> usize {
        let mut freed = self.flush_releasable(engine);

        {
            let mut tracked = self.tracked.lock();
            let mut releasable = self.releasable.lock();
            for (raw, slot) in tracked.drain() {
                slot.advance(HandleState::Releasable);
                releasable.insert(raw, slot);
            }
        }

        freed += self.flush_releasable(engine);
        tracing::debug!(freed, "drained handle table");
        freed
    }

    /// Stop accepting new handles and releases
    ///
    /// Returns whether the table was already stopped.
    pub fn stop(&self) -> bool {
        let mut stopped = self.stopped.lock();
        std::mem::replace(&mut *stopped, true)
    }

    /// Check whether the table has been stopped
    pub fn is_stopped(&self) -> bool {
        *self.stopped.lock()
    }

    /// Number of tracked handles
    pub fn tracked_count(&self) -> usize {
        self.tracked.lock().len()
    }

    /// Number of releasable handles
    pub fn releasable_count(&self) -> usize {
        self.releasable.lock().len()
    }

    /// Check whether a handle is currently tracked
    pub fn is_tracked(&self, raw: RawHandle) -> bool {
        self.tracked.lock().contains_key(&raw)
    }

    /// Check whether a handle is currently releasable
    pub fn is_releasable(&self, raw: RawHandle) -> bool {
        self.releasable.lock().contains_key(&raw)
    }

    /// Snapshot the counters
    pub fn stats(&self) -> HandleStats {
        let tracked = self.tracked.lock().len();
        let releasable = self.releasable.lock().len();
        HandleStats {
            tracked,
            releasable,
            total_tracked: self.total_tracked.load(Ordering::Relaxed),
            total_freed: self.total_freed.load(Ordering::Relaxed),
            flushes: self.flushes.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandleTable")
            .field("stopped", &self.is_stopped())
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        batches: Mutex<Vec<Vec<RawHandle>>>,
    }

    impl BatchRelease for Recorder {
        fn release_batch(&self, handles: &[RawHandle]) {
            self.batches.lock().push(handles.to_vec());
        }
    }

    fn h(n: u64) -> RawHandle {
        RawHandle::from_raw(n)
    }

    #[test]
    fn test_track_then_release_then_flush() {
        let table = HandleTable::new(false);
        let engine = Recorder::default();

        let a = table.track(h(1));
        let b = table.track(h(2));
        assert_eq!(table.tracked_count(), 2);

        assert_eq!(table.mark_releasable(&[a.clone()]), 1);
        assert!(table.is_releasable(h(1)));
        assert!(table.is_tracked(h(2)));

        assert_eq!(table.flush_releasable(&engine), 1);
        assert_eq!(a.state(), HandleState::Freed);
        assert_eq!(b.state(), HandleState::Tracked);
        assert_eq!(*engine.batches.lock(), vec![vec![h(1)]]);
    }

    #[test]
    fn test_mark_is_idempotent() {
        let table = HandleTable::new(false);
        let a = table.track(h(1));
        assert_eq!(table.mark_releasable(&[a.clone()]), 1);
        assert_eq!(table.mark_releasable(&[a.clone()]), 0);
        assert_eq!(table.releasable_count(), 1);
    }

    #[test]
    fn test_empty_flush_skips_native_call() {
        let table = HandleTable::new(false);
        let engine = Recorder::default();
        assert_eq!(table.flush_releasable(&engine), 0);
        assert!(engine.batches.lock().is_empty());
    }

    #[test]
    #[should_panic(expected = "used after it was freed")]
    fn test_mark_freed_is_fatal() {
        let table = HandleTable::new(false);
        let engine = Recorder::default();
        let a = table.track(h(1));
        table.mark_releasable(&[a.clone()]);
        table.flush_releasable(&engine);
        table.mark_releasable(&[a]);
    }

    #[test]
    fn test_stopped_table_ignores_everything() {
        let table = HandleTable::new(true);
        let a = table.track(h(1));
        assert!(!table.stop());
        assert!(table.stop());

        let b = table.track(h(2));
        assert!(!table.is_tracked(h(2)));
        assert_eq!(table.mark_releasable(&[a, b]), 0);
        assert_eq!(table.tracked_count(), 1);
    }

    #[test]
    fn test_drain_all_frees_both_sets() {
        let table = HandleTable::new(false);
        let engine = Recorder::default();
        let slots: Vec<_> = (1..=4).map(|n| table.track(h(n))).collect();
        table.mark_releasable(&slots[..2]);
        table.stop();

        assert_eq!(table.drain_all(&engine), 4);
        assert!(slots.iter().all(|s| s.state() == HandleState::Freed));
        let stats = table.stats();
        assert_eq!((stats.tracked, stats.releasable), (0, 0));
        assert_eq!(stats.total_freed, 4);
        assert_eq!(stats.flushes, 2);
    }

    #[test]
    fn test_duplicate_track_shares_slot() {
        let table = HandleTable::new(false);
        let a = table.track(h(5));
        let b = table.track(h(5));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.stats().total_tracked, 1);
    }
}
