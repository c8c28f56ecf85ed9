//! Distributed coordination contract
//!
//! Export mastership is negotiated through a group service offering a
//! cluster-wide lock, broadcast proposals with unconditional acceptance, and
//! correlated broadcast/gather tasks. The consensus behind those primitives
//! belongs to the service; the coordinator only relies on the guarantees
//! below.
//!
//! - At most one member of a group holds the lock at a time. Grants arrive
//!   through [`CoordinationListener::lock_granted`].
//! - A proposal is delivered to every member, including the proposer, and
//!   resolves once every current member has answered.
//! - A coordinated task is delivered to every member and completes once every
//!   current member has replied; a member that leaves mid-round contributes
//!   an empty reply.
//! - Callbacks are invoked from the service's own threads, in the order the
//!   service produced them, and must not call back into the service
//!   synchronously.

use crate::error::Result;
use crate::node::HostId;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Identifier of a coordinated task round
pub type TaskId = u64;

/// Member-side handle on a coordination group
pub trait CoordinationService: Send + Sync {
    /// Local member id
    fn host_id(&self) -> HostId;

    /// Publish participation. `initial` seeds the group state if no state has
    /// been resolved yet; the current state is then delivered through
    /// [`CoordinationListener::initial_state`].
    fn register_state(&self, initial: Bytes) -> Result<()>;

    /// Ask for the group lock. Only one request may be outstanding.
    fn request_lock(&self) -> Result<()>;

    /// Withdraw a request that has not been granted yet
    fn cancel_lock_request(&self);

    /// Hand the lock to the next waiter
    fn release_lock(&self) -> Result<()>;

    /// Broadcast a proposed state. Requires the lock.
    fn propose_state_change(&self, proposal: Bytes) -> Result<()>;

    /// Answer the proposal currently in flight
    fn accept_proposal(&self, accept: bool) -> Result<()>;

    /// Broadcast a task and gather one reply per member. Requires the lock.
    fn initiate_coordinated_task(&self, task: Bytes) -> Result<TaskId>;

    /// Reply to a task announced through
    /// [`CoordinationListener::task_requested`]
    fn complete_task(&self, task_id: TaskId, result: Bytes) -> Result<()>;

    /// Last resolved group state
    fn current_state(&self) -> Option<Bytes>;

    /// Current members, ascending
    fn members(&self) -> Vec<HostId>;

    /// Leave the group. Pending replies from this member count as missing.
    fn leave(&self);
}

/// Callbacks from the coordination service
pub trait CoordinationListener: Send + Sync {
    fn initial_state(&self, state: Option<Bytes>);

    fn lock_granted(&self);

    fn state_change_proposed(&self, proposer: HostId, proposal: Bytes);

    /// `ours` is true on the member that made the proposal
    fn proposed_state_resolved(&self, ours: bool, proposal: Bytes, success: bool);

    fn task_requested(&self, initiator: HostId, task_id: TaskId, task: Bytes);

    /// `ours` is true on the member that initiated the task
    fn correlated_task_completed(&self, ours: bool, task: Bytes, results: BTreeMap<HostId, Bytes>);

    fn membership_changed(&self, added: Vec<HostId>, removed: Vec<HostId>);
}

/// Factory for group membership
pub trait CoordinationProvider: Send + Sync {
    fn join(
        &self,
        group: &str,
        host: HostId,
        listener: Arc<dyn CoordinationListener>,
    ) -> Result<Arc<dyn CoordinationService>>;
}
