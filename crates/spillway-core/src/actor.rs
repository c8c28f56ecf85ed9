//! Single-writer mailboxes
//!
//! State owned by a mailbox is only ever touched by the task draining it.
//! Callers on any thread enqueue closures; the owning task runs them one at a
//! time in arrival order, so the state needs no locking.

use crate::executor::ExecutorLease;
use crate::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::trace;

/// Work item run against the owned state
pub type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum Envelope<S> {
    Job(Job<S>),
    /// Run, then stop draining
    Stop(Job<S>),
}

/// Sending half of a mailbox
pub struct Mailbox<S> {
    tx: mpsc::UnboundedSender<Envelope<S>>,
    closed: Arc<AtomicBool>,
}

impl<S> Clone for Mailbox<S> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            closed: self.closed.clone(),
        }
    }
}

impl<S> Mailbox<S> {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }
}

impl<S> std::fmt::Debug for Mailbox<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Draining half of a mailbox, consumed when the owning task starts
pub struct MailboxReceiver<S> {
    rx: mpsc::UnboundedReceiver<Envelope<S>>,
}

/// Create a mailbox before its state exists, so the state can hold a sender
/// to itself.
pub fn mailbox<S>() -> (Mailbox<S>, MailboxReceiver<S>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        Mailbox {
            tx,
            closed: Arc::new(AtomicBool::new(false)),
        },
        MailboxReceiver { rx },
    )
}

impl<S: Send + 'static> MailboxReceiver<S> {
    /// Start draining on the leased executor thread, taking ownership of
    /// `state`. The lease is held until the task exits.
    pub fn run_on(self, lease: ExecutorLease, state: S) -> JoinHandle<()> {
        let handle = lease.handle().clone();
        handle.spawn(async move {
            let _lease = lease;
            self.drain(state).await;
        })
    }

    async fn drain(mut self, mut state: S) {
        while let Some(envelope) = self.rx.recv().await {
            match envelope {
                Envelope::Job(job) => job(&mut state),
                Envelope::Stop(job) => {
                    job(&mut state);
                    break;
                }
            }
        }
        trace!("Mailbox drained");
    }
}

impl<S: Send + 'static> Mailbox<S> {
    /// Enqueue `f` without waiting for it to run
    pub fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if self.is_closed() {
            return Err(Error::ShuttingDown);
        }
        self.tx
            .send(Envelope::Job(Box::new(f)))
            .map_err(|_| Error::ShuttingDown)
    }

    /// Run `f` on the owning task and wait for its result
    pub async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.submit(move |state| {
            let _ = tx.send(f(state));
        })?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }

    /// Close the mailbox: `f` is the last job to run. Work already queued
    /// ahead of it still runs; later submissions are rejected.
    pub async fn stop<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut S) -> R + Send + 'static,
        R: Send + 'static,
    {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Err(Error::ShuttingDown);
        }
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Envelope::Stop(Box::new(move |state| {
                let _ = tx.send(f(state));
            })))
            .map_err(|_| Error::ShuttingDown)?;
        rx.await.map_err(|_| Error::ShuttingDown)
    }
}
