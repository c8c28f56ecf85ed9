//! # Spillway Core
//!
//! Building blocks of the export pipeline: sequence trackers, export blocks
//! and their buffers, and the single-writer executors every source runs on.

pub mod actor;
pub mod block;
pub mod error;
pub mod executor;
pub mod fatal;
pub mod metrics;
pub mod storage;
pub mod tracker;

pub use actor::{mailbox, Job, Mailbox, MailboxReceiver};
pub use block::{make_unique_id, unique_id_timestamp, Block};
pub use error::{Error, Result};
pub use executor::{ExecutorLease, ExecutorPool};
pub use metrics::{ExportMetrics, Timer};
pub use storage::{BlockBuffer, FileBlockBuffer, MemoryBlockBuffer};
pub use tracker::{SequenceTracker, INFINITE_SEQNO, MIN_SEQNO};
