//! Shared single-threaded executors
//!
//! Every export source runs its state machine on exactly one executor thread.
//! A fixed pool of OS threads, each driving a current-thread tokio runtime,
//! is shared by all sources; [`ExecutorPool::acquire`] hands out the
//! least-loaded thread and the returned lease keeps the assignment counted
//! until it is dropped.

use crate::{Error, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

struct Worker {
    handle: Handle,
    assigned: Arc<AtomicUsize>,
    shutdown: Mutex<Option<oneshot::Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

/// Fixed pool of single-threaded runtimes
pub struct ExecutorPool {
    name: String,
    workers: Vec<Worker>,
    next: AtomicUsize,
}

impl std::fmt::Debug for ExecutorPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorPool")
            .field("name", &self.name)
            .field("threads", &self.workers.len())
            .field("assignments", &self.assignments())
            .finish()
    }
}

impl ExecutorPool {
    /// Start `threads` executor threads named `<name>-<index>`
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        let name = name.into();
        if threads == 0 {
            return Err(Error::InvalidConfig(
                "executor pool needs at least one thread".into(),
            ));
        }

        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let runtime = Builder::new_current_thread().enable_all().build()?;
            let handle = runtime.handle().clone();
            let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

            let thread = std::thread::Builder::new()
                .name(format!("{}-{}", name, index))
                .spawn(move || {
                    runtime.block_on(async {
                        let _ = shutdown_rx.await;
                    });
                    // Dropping the runtime cancels whatever is still parked on it
                })?;

            workers.push(Worker {
                handle,
                assigned: Arc::new(AtomicUsize::new(0)),
                shutdown: Mutex::new(Some(shutdown_tx)),
                thread: Mutex::new(Some(thread)),
            });
        }

        info!(pool = %name, threads, "Started executor pool");
        Ok(Self {
            name,
            workers,
            next: AtomicUsize::new(0),
        })
    }

    pub fn threads(&self) -> usize {
        self.workers.len()
    }

    /// Current number of leases held against each thread
    pub fn assignments(&self) -> Vec<usize> {
        self.workers
            .iter()
            .map(|w| w.assigned.load(Ordering::Acquire))
            .collect()
    }

    /// Lease the thread with the fewest assignments.
    ///
    /// Ties rotate so that consecutive acquisitions on an idle pool spread
    /// across threads.
    pub fn acquire(&self) -> ExecutorLease {
        let count = self.workers.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % count;

        let mut best = start;
        let mut best_load = usize::MAX;
        for offset in 0..count {
            let index = (start + offset) % count;
            let load = self.workers[index].assigned.load(Ordering::Acquire);
            if load < best_load {
                best = index;
                best_load = load;
            }
        }

        let worker = &self.workers[best];
        worker.assigned.fetch_add(1, Ordering::AcqRel);
        debug!(pool = %self.name, thread = best, load = best_load + 1, "Leased executor");

        ExecutorLease {
            index: best,
            handle: worker.handle.clone(),
            assigned: worker.assigned.clone(),
        }
    }

    /// Stop every executor thread and wait for it to exit
    pub fn shutdown(&self) {
        for (index, worker) in self.workers.iter().enumerate() {
            if let Some(tx) = worker.shutdown.lock().take() {
                let _ = tx.send(());
            }
            if let Some(thread) = worker.thread.lock().take() {
                if thread.join().is_err() {
                    warn!(pool = %self.name, thread = index, "Executor thread panicked");
                }
            }
        }
        debug!(pool = %self.name, "Executor pool stopped");
    }
}

impl Drop for ExecutorPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Assignment of one executor thread; released on drop
#[derive(Debug)]
pub struct ExecutorLease {
    index: usize,
    handle: Handle,
    assigned: Arc<AtomicUsize>,
}

impl ExecutorLease {
    /// Index of the leased thread within its pool
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `future` on the leased thread
    pub fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Drop for ExecutorLease {
    fn drop(&mut self) {
        self.assigned.fetch_sub(1, Ordering::AcqRel);
    }
}
