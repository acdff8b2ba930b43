//! Periodic fallback sweep
//!
//! Dropping a [`Value`](crate::Value) only marks its handle releasable. The
//! sweeper flushes watched isolates on a fixed interval so releasable
//! handles are freed even when the host never calls back into the isolate.
//! An isolate is skipped while another thread is inside it, and forgotten
//! once it is dropped.

use crate::config::SweeperOptions;
use crate::error::Result;
use crate::isolate::{IsolateCore, IsolateHandle, IsolateState};
use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

type Watched = Arc<Mutex<Vec<Weak<IsolateCore>>>>;

/// Background thread flushing releasable handles
pub struct Sweeper {
    watched: Watched,
    stop_tx: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Sweeper {
    /// Start the sweep thread
    pub fn start(options: &SweeperOptions) -> Result<Self> {
        let watched: Watched = Arc::new(Mutex::new(Vec::new()));
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let ticker = channel::tick(options.interval());

        let list = Arc::clone(&watched);
        let thread = thread::Builder::new()
            .name("tether-sweeper".to_string())
            .spawn(move || loop {
                crossbeam::channel::select! {
                    recv(ticker) -> _ => {
                        Self::sweep(&list);
                    },
                    recv(stop_rx) -> _ => break,
                }
            })?;

        tracing::debug!(interval_ms = options.interval_ms, "sweeper started");
        Ok(Self {
            watched,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
        })
    }

    /// Flush `iso` on every tick until it is disposed
    pub fn watch(&self, iso: &IsolateHandle) {
        self.watched.lock().push(Arc::downgrade(iso.core()));
    }

    /// Number of isolates still watched
    pub fn watched_count(&self) -> usize {
        self.watched.lock().len()
    }

    /// Run one sweep on the calling thread
    pub fn sweep_now(&self) -> usize {
        Self::sweep(&self.watched)
    }

    fn sweep(watched: &Watched) -> usize {
        // upgrade outside the list lock so a flush never runs under it
        let live: Vec<Arc<IsolateCore>> = {
            let mut list = watched.lock();
            list.retain(|w| {
                w.upgrade()
                    .is_some_and(|core| core.state() != IsolateState::Disposed)
            });
            list.iter().filter_map(Weak::upgrade).collect()
        };

        let mut freed = 0;
        for core in live {
            if let Some(n) = core.try_flush() {
                freed += n;
            }
        }
        if freed > 0 {
            tracing::trace!(freed, "sweep freed handles");
        }
        freed
    }

    /// Stop the thread and wait for it
    pub fn shutdown(&mut self) {
        drop(self.stop_tx.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::error!("sweeper thread panicked");
            }
            tracing::debug!("sweeper stopped");
        }
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.shutdown();
    }
}
