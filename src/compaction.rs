//! Compaction coordination
//!
//! A small shared thread pool running store compactions in the background.
//! Requests coalesce per store: asking for a compaction that is already
//! queued or running is a no-op, so every flush can cheaply request one.
//! Stopping cancels the in-flight passes cooperatively and waits a bounded
//! time for the pool to drain.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, error};

use crate::error::{Result, VirtaError};
use crate::files::{CancelToken, StoreCompactor};

struct Job {
    name: String,
    compactor: Arc<StoreCompactor>,
}

struct Shared {
    enabled: AtomicBool,
    /// Token handed to every pass started from now on; replaced on stop
    cancel: Mutex<CancelToken>,
    /// Store names queued or running
    in_flight: Mutex<HashSet<String>>,
    exited_threads: Mutex<usize>,
    cond: Condvar,
}

pub struct CompactionCoordinator {
    sender: Option<Sender<Job>>,
    shared: Arc<Shared>,
    thread_count: usize,
}

impl CompactionCoordinator {
    /// Spawn a coordinator with `threads` pool threads. Background
    /// compaction starts disabled; call `enable` once the stores are open.
    pub fn new(threads: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Job>();
        let shared = Arc::new(Shared {
            enabled: AtomicBool::new(false),
            cancel: Mutex::new(CancelToken::new()),
            in_flight: Mutex::new(HashSet::new()),
            exited_threads: Mutex::new(0),
            cond: Condvar::new(),
        });

        for i in 0..threads {
            let receiver = receiver.clone();
            let shared = shared.clone();
            thread::Builder::new()
                .name(format!("compaction-{}", i))
                .spawn(move || {
                    for job in receiver {
                        let cancel = shared.cancel.lock().clone();
                        if shared.enabled.load(Ordering::Acquire) {
                            if let Err(e) = job.compactor.compact(&cancel) {
                                error!(store = %job.name, error = %e, "compaction pass failed");
                            }
                        }
                        shared.in_flight.lock().remove(&job.name);
                    }
                    *shared.exited_threads.lock() += 1;
                    shared.cond.notify_all();
                })?;
        }

        Ok(Self {
            sender: Some(sender),
            shared,
            thread_count: threads,
        })
    }

    pub fn enable(&self) {
        self.shared.enabled.store(true, Ordering::Release);
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Acquire)
    }

    /// Queue a compaction pass for this store unless one is already queued
    /// or running
    pub fn compact_if_not_running(&self, compactor: &Arc<StoreCompactor>) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let name = compactor.name().to_string();
        if !self.shared.in_flight.lock().insert(name.clone()) {
            debug!(store = %name, "compaction already in flight, coalescing");
            return Ok(());
        }
        let sender = self.sender.as_ref().ok_or_else(|| {
            VirtaError::InvalidState("compaction coordinator stopped".to_string())
        })?;
        if sender
            .send(Job {
                name: name.clone(),
                compactor: compactor.clone(),
            })
            .is_err()
        {
            self.shared.in_flight.lock().remove(&name);
            return Err(VirtaError::InvalidState(
                "compaction coordinator stopped".to_string(),
            ));
        }
        Ok(())
    }

    /// True while a pass for this store is queued or running
    pub fn is_compaction_in_flight(&self, store_name: &str) -> bool {
        self.shared.in_flight.lock().contains(store_name)
    }

    /// Disable background compaction, cancel in-flight passes, and wait up
    /// to `timeout` for the pool to drain
    pub fn stop(&mut self, timeout: Duration) -> Result<()> {
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.cancel.lock().cancel();
        self.sender.take();

        let deadline = Instant::now() + timeout;
        let mut exited = self.shared.exited_threads.lock();
        while *exited < self.thread_count {
            let now = Instant::now();
            if now >= deadline {
                return Err(VirtaError::ShutdownTimeout(
                    "compaction coordinator".to_string(),
                ));
            }
            if self
                .shared
                .cond
                .wait_for(&mut exited, deadline - now)
                .timed_out()
            {
                break;
            }
        }
        if *exited < self.thread_count {
            return Err(VirtaError::ShutdownTimeout(
                "compaction coordinator".to_string(),
            ));
        }
        Ok(())
    }
}

impl Drop for CompactionCoordinator {
    fn drop(&mut self) {
        // Detach; a clean close goes through stop() first
        self.shared.enabled.store(false, Ordering::Release);
        self.shared.cancel.lock().cancel();
        self.sender.take();
    }
}
