//! Background thread that periodically persists state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use halcyon_primitives::Synced;

use crate::state::State;

/// Upper bound on how long `stop` waits for the thread to notice.
const POLL_STEP: Duration = Duration::from_millis(20);

pub struct DumpWorker {
    state: Arc<State>,
    interval: Duration,
    shutdown: Arc<AtomicBool>,
    handle: Synced<Option<JoinHandle<()>>>,
}

impl DumpWorker {
    pub fn new(state: Arc<State>, interval: Duration) -> Self {
        Self {
            state,
            interval,
            shutdown: Arc::new(AtomicBool::new(false)),
            handle: Synced::new(None),
        }
    }

    /// Spawn the thread. Does nothing if it is already running.
    pub fn start(&self) {
        let mut handle = self.handle.write();
        if handle.is_some() {
            return;
        }
        self.shutdown.store(false, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.interval;

        *handle = Some(thread::spawn(move || {
            tracing::info!(interval_ms = interval.as_millis() as u64, "Dump worker started");
            let mut last = Instant::now();
            loop {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if last.elapsed() >= interval {
                    if let Err(e) = state.save_to_store() {
                        tracing::error!(error = %e, "State dump failed");
                    }
                    last = Instant::now();
                }
                thread::sleep(POLL_STEP.min(interval));
            }
            tracing::info!("Dump worker stopped");
        }));
    }

    /// Signal the thread and join it.
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let handle = self.handle.write().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                tracing::error!("Dump worker panicked");
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.read().is_some()
    }
}

impl Drop for DumpWorker {
    fn drop(&mut self) {
        self.stop();
    }
}
