//! Background workers
//!
//! A `Worker` is one named thread draining an unbounded task queue in FIFO
//! order. Write batches fan their hash and leaf store updates out to two
//! such workers and wait for both to finish, so the two stores are written
//! concurrently while each store sees its updates strictly in order.

use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, Sender};
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use tracing::debug;

use crate::error::{Result, VirtaError};

type Task = Box<dyn FnOnce() + Send + 'static>;

struct DoneFlag {
    done: Mutex<bool>,
    cond: Condvar,
}

pub struct Worker {
    name: String,
    sender: Option<Sender<Task>>,
    handle: Option<JoinHandle<()>>,
    done: Arc<DoneFlag>,
}

impl Worker {
    /// Spawn a worker thread with the given name
    pub fn spawn(name: &str) -> Result<Self> {
        let (sender, receiver) = channel::unbounded::<Task>();
        let done = Arc::new(DoneFlag {
            done: Mutex::new(false),
            cond: Condvar::new(),
        });
        let thread_done = done.clone();
        let thread_name = name.to_string();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in receiver {
                    task();
                }
                debug!(worker = %thread_name, "worker thread exiting");
                *thread_done.done.lock() = true;
                thread_done.cond.notify_all();
            })?;
        Ok(Self {
            name: name.to_string(),
            sender: Some(sender),
            handle: Some(handle),
            done,
        })
    }

    /// Queue a task; tasks run in submission order
    pub fn execute(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| VirtaError::InvalidState(format!("{}: worker shut down", self.name)))?;
        sender
            .send(Box::new(task))
            .map_err(|_| VirtaError::InvalidState(format!("{}: worker shut down", self.name)))
    }

    /// Stop accepting tasks, drain the queue, and wait up to `timeout` for
    /// the thread to exit
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.sender.take();
        let timed_out = {
            let mut done = self.done.done.lock();
            while !*done {
                if self.done.cond.wait_for(&mut done, timeout).timed_out() {
                    break;
                }
            }
            !*done
        };
        if timed_out {
            return Err(VirtaError::ShutdownTimeout(self.name.clone()));
        }
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                return Err(VirtaError::InvalidState(format!(
                    "{}: worker thread panicked",
                    self.name
                )));
            }
        }
        Ok(())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        // Detach; a clean close goes through shutdown() first
        self.sender.take();
        self.handle.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_tasks_in_order() {
        let worker = Worker::spawn("test-worker").unwrap();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let log = log.clone();
            worker.execute(move || log.lock().push(i)).unwrap();
        }
        let mut worker = worker;
        worker.shutdown(Duration::from_secs(5)).unwrap();
        assert_eq!(*log.lock(), (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn shutdown_drains_queued_tasks() {
        let mut worker = Worker::spawn("drain-worker").unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..100 {
            let counter = counter.clone();
            worker
                .execute(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
        }
        worker.shutdown(Duration::from_secs(5)).unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn execute_after_shutdown_fails() {
        let mut worker = Worker::spawn("closed-worker").unwrap();
        worker.shutdown(Duration::from_secs(5)).unwrap();
        assert!(worker.execute(|| {}).is_err());
    }

    #[test]
    fn stuck_task_times_the_shutdown_out() {
        let mut worker = Worker::spawn("stuck-worker").unwrap();
        let (unblock_tx, unblock_rx) = channel::bounded::<()>(1);
        worker
            .execute(move || {
                let _ = unblock_rx.recv();
            })
            .unwrap();
        assert!(matches!(
            worker.shutdown(Duration::from_millis(100)),
            Err(VirtaError::ShutdownTimeout(_))
        ));
        unblock_tx.send(()).unwrap();
    }
}
