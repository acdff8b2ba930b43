//! Concurrency tests
//!
//! Tests cover:
//! - Context reference uniqueness across threads
//! - Stop flag enforcement against concurrent tracking
//! - Finalizers racing isolate disposal
//! - Batch frees that re-enter the bridge
//! - The periodic fallback sweep

use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};
use tether_engine::handles::HandleTable;
use tether_engine::{
    BatchRelease, Context, FunctionTemplate, Isolate, IsolateOptions, RawHandle, SimEngine,
    Sweeper, SweeperOptions, Value,
};

// =============================================================================
// HELPER FUNCTIONS
// =============================================================================

struct Discard;

impl BatchRelease for Discard {
    fn release_batch(&self, _handles: &[RawHandle]) {}
}

fn wait_until(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    done()
}

// =============================================================================
// REFERENCE UNIQUENESS
// =============================================================================

#[test]
fn test_contexts_across_isolates_get_unique_refs() {
    let engine = SimEngine::new();
    let workers: Vec<_> = (0..8)
        .map(|_| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let iso = Isolate::new(engine);
                let refs: Vec<_> = (0..100).map(|_| Context::new(&iso).ref_id()).collect();
                iso.dispose();
                refs
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for worker in workers {
        for r in worker.join().unwrap() {
            assert!(seen.insert(r));
        }
    }
    assert_eq!(seen.len(), 800);
    assert_eq!(engine.live_allocations(), 0);
}

// =============================================================================
// STOP FLAG
// =============================================================================

#[test]
fn test_stop_flag_blocks_concurrent_tracking() {
    let table = Arc::new(HandleTable::new(false));
    let running = Arc::new(AtomicBool::new(true));

    let workers: Vec<_> = (0..4u64)
        .map(|t| {
            let table = Arc::clone(&table);
            let running = Arc::clone(&running);
            thread::spawn(move || {
                let mut n = 0u64;
                while running.load(Ordering::Relaxed) {
                    table.track(RawHandle::from_raw((t << 32) | (n + 1)));
                    n += 1;
                }
            })
        })
        .collect();

    thread::sleep(Duration::from_millis(20));
    table.stop();
    let tracked_at_stop = table.tracked_count();
    thread::sleep(Duration::from_millis(20));
    running.store(false, Ordering::Relaxed);
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(table.tracked_count(), tracked_at_stop);
    assert_eq!(table.drain_all(&Discard), tracked_at_stop);
}

// =============================================================================
// FINALIZERS RACING DISPOSAL
// =============================================================================

#[test]
fn test_drops_racing_dispose_free_each_handle_once() {
    const THREADS: usize = 8;

    for _ in 0..20 {
        let engine = SimEngine::new();
        let iso = Isolate::with_options(engine.clone(), IsolateOptions::with_release_batch(8));
        let ctx = Context::new(&iso);

        let batches: Vec<Vec<Value>> = (0..THREADS)
            .map(|t| (0..64).map(|i| ctx.new_value((t * 64 + i) as f64)).collect())
            .collect();

        let barrier = Arc::new(Barrier::new(THREADS + 1));
        let workers: Vec<_> = batches
            .into_iter()
            .map(|values| {
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    for value in values {
                        drop(value);
                    }
                })
            })
            .collect();

        barrier.wait();
        iso.dispose();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(engine.double_frees(), 0);
        assert_eq!(engine.live_allocations(), 0);
        assert_eq!(engine.leaked_at_dispose(), 0);
    }
}

#[test]
fn test_parallel_isolates() {
    let engine = SimEngine::new();
    let workers: Vec<_> = (0..4)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                let iso = Isolate::with_options(engine, IsolateOptions::eager_release());
                let ctx = Context::new(&iso);
                let inc = FunctionTemplate::new(&iso, |info| {
                    let n = info.arg(0)?.as_number()?;
                    Some(info.context().new_value(n + 1.0))
                });
                ctx.global()
                    .set("inc", &inc.get_function(&ctx).unwrap())
                    .unwrap();

                for i in 0..200 {
                    let v = ctx.run_script(&format!("inc({})", t * 1000 + i), "inc.js").unwrap();
                    assert_eq!(v.as_number(), Some((t * 1000 + i + 1) as f64));
                }
                iso.dispose();
            })
        })
        .collect();

    for worker in workers {
        worker.join().unwrap();
    }
    assert_eq!(engine.live_allocations(), 0);
    assert_eq!(engine.double_frees(), 0);
}

// =============================================================================
// RE-ENTRANT BATCH FREE
// =============================================================================

#[test]
fn test_release_hook_may_reenter() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());

    let pending: Arc<Mutex<Vec<Value>>> = Arc::new(Mutex::new(Vec::new()));
    let finalized = Arc::clone(&pending);
    engine.set_release_hook(move |_| {
        let values = std::mem::take(&mut *finalized.lock());
        drop(values);
    });

    let first: Vec<_> = (0..10).map(|i| iso.new_value(i)).collect();
    pending
        .lock()
        .extend((10..20).map(|i| iso.new_value(i)));
    drop(first);

    assert_eq!(iso.flush_releasable(), 10);
    // the hook released the second group while the first was being freed
    assert_eq!(iso.handle_stats().releasable, 10);
    assert_eq!(iso.flush_releasable(), 10);
    assert_eq!(iso.handle_stats().releasable, 0);

    pending.lock().extend((0..5).map(|i| iso.new_value(i)));
    iso.dispose();
    assert_eq!(engine.double_frees(), 0);
    assert_eq!(engine.live_allocations(), 0);
}

// =============================================================================
// FALLBACK SWEEP
// =============================================================================

#[test]
fn test_sweeper_flushes_idle_isolates() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let mut sweeper = Sweeper::start(&SweeperOptions { interval_ms: 5 }).unwrap();
    sweeper.watch(&iso);

    let values: Vec<_> = (0..50).map(|i| iso.new_value(i)).collect();
    drop(values);

    assert!(wait_until(Duration::from_secs(5), || {
        iso.handle_stats().releasable == 0
    }));
    assert_eq!(engine.live_records(), 2);

    iso.dispose();
    sweeper.sweep_now();
    assert_eq!(sweeper.watched_count(), 0);
    sweeper.shutdown();
}

#[test]
fn test_sweeper_skips_busy_isolates() {
    let engine = SimEngine::new();
    let iso = Isolate::new(engine.clone());
    let ctx = Context::new(&iso);
    let sweeper = Sweeper::start(&SweeperOptions { interval_ms: 1_000 }).unwrap();
    sweeper.watch(&iso);

    let (entered_tx, entered_rx) = crossbeam::channel::bounded::<()>(0);
    let (resume_tx, resume_rx) = crossbeam::channel::bounded::<()>(0);
    let block = FunctionTemplate::new(&iso, move |_| {
        entered_tx.send(()).ok()?;
        resume_rx.recv().ok()?;
        None
    });
    ctx.global()
        .set("block", &block.get_function(&ctx).unwrap())
        .unwrap();
    drop(iso.new_value(1));

    let runner = {
        let ctx = ctx.clone();
        thread::spawn(move || ctx.run_script("block()", "block.js").map(|_| ()))
    };

    entered_rx.recv().unwrap();
    // another thread is inside the isolate
    assert_eq!(sweeper.sweep_now(), 0);
    resume_tx.send(()).unwrap();
    runner.join().unwrap().unwrap();

    assert!(sweeper.sweep_now() > 0);
    iso.dispose();
}
