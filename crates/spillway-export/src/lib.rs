//! # spillway-export - Export pipeline for Spillway
//!
//! Buffers committed rows per table-partition, hands them to a sink one block
//! at a time on the replica that holds export mastership, and releases them
//! once acknowledged.
//!
//! ## Architecture
//!
//! ```text
//!   engine push            sink ack              RELEASE_BUFFER
//!       │                     │                  from replicas
//!       ▼                     ▼                        │
//! ┌──────────────────────────────────────────────────────────┐
//! │                    ExportGeneration                      │
//! │      (partition, signature) → SourceHandle, replicas     │
//! └──────────────────────────────────────────────────────────┘
//!       │ closures, one mailbox per source
//!       ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │ ExportSource (single executor thread)                    │
//! │   SequenceTracker · BlockBuffer · MastershipCoordinator  │
//! └──────────────────────────────────────────────────────────┘
//!       │ poll                                  │ ack
//!       ▼                                       ▼
//!   SinkDriver ──► ExportSink             AckTransport ──► replicas
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! # async fn example() -> spillway_export::Result<()> {
//! use spillway_core::ExecutorPool;
//! use spillway_export::{ExportConfig, ExportGeneration, PollResult};
//! use std::sync::Arc;
//!
//! let config = ExportConfig::new().with_host_id(1);
//! spillway_export::try_init_logging(&config.log_level)?;
//! let pool = Arc::new(ExecutorPool::new("export", config.executor_threads)?);
//! let generation = ExportGeneration::new(1, config, pool, None, None)?;
//!
//! generation.create_source(0, "orders", true).await?;
//! generation
//!     .push(0, "orders", 1, 10, 10, 0, bytes::Bytes::from_static(b"rows"))
//!     .await?;
//! if let PollResult::Block(block) = generation.poll(0, "orders").await? {
//!     generation.ack(0, "orders", block.committed_seq(), block.last_seq())?;
//! }
//! generation.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod control;
pub mod error;
pub mod generation;
pub mod logging;
pub mod sink;
pub mod source;

pub use config::ExportConfig;
pub use control::ControlOperation;
pub use error::{ErrorCategory, ExportError, Result};
pub use generation::ExportGeneration;
pub use logging::try_init_logging;
pub use sink::{DriverSummary, ExportSink, SinkDriver};
pub use source::{ExportBlock, PollResult, SourceDescriptor, SourceHandle, SourceStats};
