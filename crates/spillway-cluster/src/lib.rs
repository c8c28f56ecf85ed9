//! # Spillway Cluster
//!
//! Export mastership across the replicas of a table-partition:
//! - **Coordination contract**: group lock, leader proposals and correlated
//!   broadcast/gather tasks, with an in-process [`CoordinationHub`]
//! - **Mastership**: leader election plus tracker collection deciding which
//!   replica exports each sequence range
//! - **Ack forwarding**: the `RELEASE_BUFFER` message and its transport
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                   Export source (one executor)               │
//! ├──────────────────────────────┬───────────────────────────────┤
//! │   MastershipCoordinator      │   AckTransport                │
//! │ • leader proposal            │ • RELEASE_BUFFER to replicas  │
//! │ • tracker rounds             │                               │
//! │ • gap takeover / blocking    │                               │
//! ├──────────────────────────────┴───────────────────────────────┤
//! │          CoordinationService (lock, proposals, tasks)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

pub mod coordinator;
pub mod error;
pub mod hub;
pub mod node;
pub mod observability;
pub mod protocol;
pub mod service;
pub mod transport;

pub use coordinator::{
    CoordinatorEvent, CoordinatorState, EventDispatcher, EventOutcome, Lifecycle,
    MastershipCoordinator, MastershipDecision, ReplicaProgress,
};
pub use error::{ClusterError, Result};
pub use hub::CoordinationHub;
pub use node::{export_group, HostId, PartitionId, ReplicaSet};
pub use protocol::{CoordinatorMessage, ReleaseBufferMessage, MSG_RELEASE_BUFFER};
pub use service::{CoordinationListener, CoordinationProvider, CoordinationService, TaskId};
pub use transport::{AckHandler, AckTransport, LocalAckRouter};
