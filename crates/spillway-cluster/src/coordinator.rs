//! Export mastership coordinator
//!
//! One coordinator exists per exported table-partition on every replica. It
//! decides whether the local replica is the one delivering rows at a given
//! sequence number. The decision combines:
//! - the recorded export leader, elected through the coordination group
//! - the sequence trackers of every replica, collected by the leader
//!
//! The leader exports everything it holds. Where the leader's tracker has a
//! gap, the lowest host id holding those rows takes over until the leader can
//! continue. If nobody holds them the leader stays master and its source
//! blocks until an operator releases the gap or the missing replica rejoins.
//!
//! The coordinator is owned by the source state and only touched on the
//! source's executor. Callbacks from the coordination service are turned into
//! [`CoordinatorEvent`]s and handed to an [`EventDispatcher`], which re-queues
//! them onto that executor.

use crate::error::Result;
use crate::node::{export_group, HostId, PartitionId};
use crate::observability::CoordinatorMetrics;
use crate::protocol::CoordinatorMessage;
use crate::service::{CoordinationListener, CoordinationProvider, CoordinationService, TaskId};
use bytes::Bytes;
use spillway_core::{SequenceTracker, INFINITE_SEQNO};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Coordinator lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Created,
    /// Every replica exports everything; no coordination
    Replicated,
    /// Joined the group, waiting for the recorded leader
    Initializing,
    Initialized,
}

/// Outcome of a mastership evaluation for one sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MastershipDecision {
    /// The local replica exports
    Master,
    /// Another replica exports
    Replica(HostId),
    /// The local replica leads, but no replica holds the rows at `gap`
    Blocked { gap: (u64, u64) },
    /// No leader or no trackers yet
    Undecided,
}

impl MastershipDecision {
    /// Blocked counts as master: the leader still owns the range and is the
    /// one that must resolve it.
    pub fn is_master(&self) -> bool {
        matches!(self, MastershipDecision::Master | MastershipDecision::Blocked { .. })
    }
}

/// Per-partition coordinator state
#[derive(Debug, Clone)]
pub struct CoordinatorState {
    pub leader: Option<HostId>,
    pub is_master: bool,
    /// Cached decision is valid up to here; 0 means nothing is cached
    pub safe_point: u64,
    pub decision: MastershipDecision,
    /// Populated between a complete tracker round and the next leadership or
    /// membership change
    pub trackers: BTreeMap<HostId, SequenceTracker>,
    pub lifecycle: Lifecycle,
}

impl CoordinatorState {
    fn new() -> Self {
        Self {
            leader: None,
            is_master: false,
            safe_point: 0,
            decision: MastershipDecision::Undecided,
            trackers: BTreeMap::new(),
            lifecycle: Lifecycle::Created,
        }
    }

    fn invalidate(&mut self) {
        self.safe_point = 0;
        self.decision = MastershipDecision::Undecided;
    }
}

/// Pipeline values the coordinator may read, captured on the owning executor
#[derive(Debug, Clone, Copy)]
pub struct ReplicaProgress<'a> {
    pub last_released: u64,
    pub tracker: &'a SequenceTracker,
}

/// Coordination callbacks re-dispatched onto the owning executor
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    InitialState(Option<Bytes>),
    LockGranted,
    StateChangeProposed {
        proposer: HostId,
        proposal: Bytes,
    },
    ProposedStateResolved {
        ours: bool,
        proposal: Bytes,
        success: bool,
    },
    TaskRequested {
        initiator: HostId,
        task_id: TaskId,
        task: Bytes,
    },
    TaskCompleted {
        ours: bool,
        task: Bytes,
        results: BTreeMap<HostId, Bytes>,
    },
    MembershipChanged {
        added: Vec<HostId>,
        removed: Vec<HostId>,
    },
}

/// Queues an event for the owning executor. Returns false if the owner no
/// longer accepts work.
pub type EventDispatcher = Arc<dyn Fn(CoordinatorEvent) -> bool + Send + Sync>;

/// Whether an event may have changed who is master
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventOutcome {
    Unchanged,
    Reevaluate,
}

/// Operations that need the group lock
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Invocation {
    BecomeLeader,
    RequestTrackers,
}

struct DispatchingListener {
    closed: Arc<AtomicBool>,
    dispatch: EventDispatcher,
}

impl DispatchingListener {
    fn forward(&self, event: CoordinatorEvent) {
        if self.closed.load(Ordering::Acquire) {
            trace!(?event, "Coordinator closed, dropping callback");
            return;
        }
        if !(self.dispatch)(event) {
            debug!("Coordinator executor gone, dropping callback");
        }
    }
}

impl CoordinationListener for DispatchingListener {
    fn initial_state(&self, state: Option<Bytes>) {
        self.forward(CoordinatorEvent::InitialState(state));
    }

    fn lock_granted(&self) {
        self.forward(CoordinatorEvent::LockGranted);
    }

    fn state_change_proposed(&self, proposer: HostId, proposal: Bytes) {
        self.forward(CoordinatorEvent::StateChangeProposed { proposer, proposal });
    }

    fn proposed_state_resolved(&self, ours: bool, proposal: Bytes, success: bool) {
        self.forward(CoordinatorEvent::ProposedStateResolved {
            ours,
            proposal,
            success,
        });
    }

    fn task_requested(&self, initiator: HostId, task_id: TaskId, task: Bytes) {
        self.forward(CoordinatorEvent::TaskRequested {
            initiator,
            task_id,
            task,
        });
    }

    fn correlated_task_completed(&self, ours: bool, task: Bytes, results: BTreeMap<HostId, Bytes>) {
        self.forward(CoordinatorEvent::TaskCompleted {
            ours,
            task,
            results,
        });
    }

    fn membership_changed(&self, added: Vec<HostId>, removed: Vec<HostId>) {
        self.forward(CoordinatorEvent::MembershipChanged { added, removed });
    }
}

/// Decides export mastership for one table-partition
pub struct MastershipCoordinator {
    host: HostId,
    partition: PartitionId,
    signature: String,
    state: CoordinatorState,
    invocations: VecDeque<Invocation>,
    in_flight: Option<(Invocation, Instant)>,
    lock_requested: bool,
    lock_held: bool,
    service: Option<Arc<dyn CoordinationService>>,
    closed: Arc<AtomicBool>,
}

impl std::fmt::Debug for MastershipCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MastershipCoordinator")
            .field("host", &self.host)
            .field("partition", &self.partition)
            .field("signature", &self.signature)
            .field("state", &self.state)
            .field("queued", &self.invocations.len())
            .finish()
    }
}

impl MastershipCoordinator {
    pub fn new(host: HostId, partition: PartitionId, signature: impl Into<String>) -> Self {
        Self {
            host,
            partition,
            signature: signature.into(),
            state: CoordinatorState::new(),
            invocations: VecDeque::new(),
            in_flight: None,
            lock_requested: false,
            lock_held: false,
            service: None,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Coordinator for a replicated table: always master, never coordinates
    pub fn replicated(host: HostId, partition: PartitionId, signature: impl Into<String>) -> Self {
        let mut coordinator = Self::new(host, partition, signature);
        coordinator.state.lifecycle = Lifecycle::Replicated;
        coordinator.state.is_master = true;
        coordinator.state.decision = MastershipDecision::Master;
        coordinator.state.safe_point = INFINITE_SEQNO;
        coordinator
    }

    pub fn host_id(&self) -> HostId {
        self.host
    }

    pub fn state(&self) -> &CoordinatorState {
        &self.state
    }

    pub fn leader(&self) -> Option<HostId> {
        self.state.leader
    }

    pub fn is_leader(&self) -> bool {
        self.state.leader == Some(self.host)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Join the partition's coordination group and publish participation.
    ///
    /// The recorded leader arrives later as [`CoordinatorEvent::InitialState`].
    pub fn initialize(
        &mut self,
        provider: &dyn CoordinationProvider,
        dispatch: EventDispatcher,
    ) -> Result<()> {
        if self.state.lifecycle != Lifecycle::Created || self.is_closed() {
            return Ok(());
        }
        let listener = Arc::new(DispatchingListener {
            closed: self.closed.clone(),
            dispatch,
        });
        let group = export_group(self.partition, &self.signature);
        let service = provider.join(&group, self.host, listener)?;
        self.service = Some(service.clone());
        self.state.lifecycle = Lifecycle::Initializing;

        service.register_state(CoordinatorMessage::LeaderState { leader: None }.encode()?)?;
        debug!(
            partition = self.partition,
            signature = %self.signature,
            host = self.host,
            "Joined export coordination group"
        );
        Ok(())
    }

    /// Propose the local host as export leader
    pub fn become_leader(&mut self) {
        if self.state.lifecycle == Lifecycle::Replicated || self.is_closed() {
            return;
        }
        info!(
            partition = self.partition,
            signature = %self.signature,
            host = self.host,
            "Accepting export mastership"
        );
        self.queue(Invocation::BecomeLeader);
    }

    /// Collect fresh trackers from every replica.
    ///
    /// The local source calls this when it stalls on a gap the cached
    /// trackers do not show. Only the leader runs rounds.
    pub fn refresh_trackers(&mut self) {
        if self.state.lifecycle == Lifecycle::Initialized && self.is_leader() && !self.is_closed() {
            self.queue(Invocation::RequestTrackers);
        }
    }

    /// Boolean projection of [`evaluate_mastership`](Self::evaluate_mastership)
    pub fn is_export_master(&mut self, seq: u64) -> bool {
        self.evaluate_mastership(seq).is_master()
    }

    /// Decide who exports `seq`, reusing the cached decision up to the safe
    /// point.
    pub fn evaluate_mastership(&mut self, seq: u64) -> MastershipDecision {
        match self.state.lifecycle {
            Lifecycle::Replicated => return MastershipDecision::Master,
            Lifecycle::Initialized => {}
            Lifecycle::Created | Lifecycle::Initializing => return MastershipDecision::Undecided,
        }
        let leader = match self.state.leader {
            Some(leader) => leader,
            None => return MastershipDecision::Undecided,
        };
        if self.state.safe_point > 0 && seq <= self.state.safe_point {
            return self.state.decision;
        }
        let leader_tracker = match self.state.trackers.get(&leader) {
            Some(tracker) => tracker,
            None => return MastershipDecision::Undecided,
        };

        CoordinatorMetrics::increment_recomputations();
        let local = self.host;
        let as_seen_locally = |host: HostId| {
            if host == local {
                MastershipDecision::Master
            } else {
                MastershipDecision::Replica(host)
            }
        };

        let (decision, safe_point) = match leader_tracker.first_gap(seq) {
            // Leader holds `seq`; it stays master until its next gap
            None => (as_seen_locally(leader), INFINITE_SEQNO),
            Some((start, _)) if start > seq => (as_seen_locally(leader), start - 1),
            Some((start, end)) => {
                let covering = self
                    .state
                    .trackers
                    .iter()
                    .filter(|(host, tracker)| **host != leader && tracker.contains(seq, seq))
                    .map(|(host, tracker)| {
                        let own_end = match tracker.first_gap(seq) {
                            Some((gap_start, _)) => gap_start - 1,
                            None => INFINITE_SEQNO,
                        };
                        (*host, own_end)
                    })
                    .next();
                match covering {
                    Some((host, own_end)) => (as_seen_locally(host), end.min(own_end)),
                    None if leader == local => {
                        (MastershipDecision::Blocked { gap: (start, end) }, end)
                    }
                    None => (MastershipDecision::Replica(leader), end),
                }
            }
        };

        trace!(
            partition = self.partition,
            signature = %self.signature,
            seq,
            ?decision,
            safe_point,
            "Mastership recomputed"
        );
        self.state.decision = decision;
        self.state.safe_point = safe_point;
        self.state.is_master = decision.is_master();
        decision
    }

    /// Apply a coordination callback on the owning executor
    pub fn handle_event(
        &mut self,
        event: CoordinatorEvent,
        progress: ReplicaProgress<'_>,
    ) -> EventOutcome {
        if self.is_closed() {
            trace!(?event, "Coordinator closed, ignoring event");
            return EventOutcome::Unchanged;
        }
        let service = match &self.service {
            Some(service) => service.clone(),
            None => return EventOutcome::Unchanged,
        };

        match event {
            CoordinatorEvent::InitialState(state) => self.on_initial_state(state),
            CoordinatorEvent::LockGranted => {
                self.on_lock_granted(service.as_ref(), progress);
                EventOutcome::Unchanged
            }
            CoordinatorEvent::StateChangeProposed { proposer, .. } => {
                trace!(partition = self.partition, proposer, "Accepting leader proposal");
                if let Err(e) = service.accept_proposal(true) {
                    warn!(partition = self.partition, error = %e, "Failed to accept proposal");
                }
                EventOutcome::Unchanged
            }
            CoordinatorEvent::ProposedStateResolved {
                ours,
                proposal,
                success,
            } => self.on_proposal_resolved(service.as_ref(), ours, &proposal, success),
            CoordinatorEvent::TaskRequested { task_id, task, .. } => {
                self.on_task_requested(service.as_ref(), task_id, &task, progress);
                EventOutcome::Unchanged
            }
            CoordinatorEvent::TaskCompleted { ours, results, .. } => {
                self.on_task_completed(service.as_ref(), ours, results)
            }
            CoordinatorEvent::MembershipChanged { added, removed } => {
                self.on_membership_changed(added, removed)
            }
        }
    }

    /// Stop coordinating: queued work is dropped, an outstanding lock request
    /// is cancelled, and the group is left. Returns false if already closed.
    pub fn shutdown(&mut self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.invocations.clear();
        if let Some(service) = self.service.take() {
            if self.lock_requested {
                service.cancel_lock_request();
            }
            if self.lock_held && self.in_flight.is_none() {
                let _ = service.release_lock();
            }
            // Leaving resolves any round still waiting on us
            service.leave();
        }
        self.lock_requested = false;
        self.lock_held = false;
        self.in_flight = None;
        self.state.invalidate();
        self.state.is_master = false;
        debug!(
            partition = self.partition,
            signature = %self.signature,
            "Export coordinator shut down"
        );
        true
    }

    fn queue(&mut self, invocation: Invocation) {
        if !self.invocations.contains(&invocation) {
            self.invocations.push_back(invocation);
        }
        self.pump();
    }

    /// Ask for the lock if work is queued and nothing is in flight
    fn pump(&mut self) {
        if self.is_closed()
            || self.in_flight.is_some()
            || self.lock_requested
            || self.lock_held
            || self.invocations.is_empty()
        {
            return;
        }
        let service = match &self.service {
            Some(service) => service.clone(),
            None => return,
        };
        match service.request_lock() {
            Ok(()) => self.lock_requested = true,
            Err(e) => warn!(partition = self.partition, error = %e, "Lock request failed"),
        }
    }

    fn release_lock(&mut self, service: &dyn CoordinationService) {
        self.in_flight = None;
        if self.lock_held {
            self.lock_held = false;
            if let Err(e) = service.release_lock() {
                warn!(partition = self.partition, error = %e, "Lock release failed");
            }
        }
        self.pump();
    }

    fn on_initial_state(&mut self, state: Option<Bytes>) -> EventOutcome {
        let leader = match state.as_deref().map(CoordinatorMessage::decode) {
            Some(Ok(CoordinatorMessage::LeaderState { leader })) => leader,
            Some(Ok(other)) => {
                warn!(partition = self.partition, ?other, "Unexpected group state");
                None
            }
            Some(Err(e)) => {
                warn!(partition = self.partition, error = %e, "Undecodable group state");
                None
            }
            None => None,
        };
        self.state.lifecycle = Lifecycle::Initialized;
        self.state.leader = leader;
        self.state.trackers.clear();
        self.state.invalidate();
        info!(
            partition = self.partition,
            signature = %self.signature,
            leader = ?leader,
            "Export coordinator initialized"
        );
        // A restarted leader still needs everyone's trackers
        if self.is_leader() {
            self.queue(Invocation::RequestTrackers);
        }
        EventOutcome::Reevaluate
    }

    fn on_lock_granted(&mut self, service: &dyn CoordinationService, progress: ReplicaProgress<'_>) {
        self.lock_requested = false;
        self.lock_held = true;

        let invocation = match self.invocations.pop_front() {
            Some(invocation) => invocation,
            None => {
                trace!(partition = self.partition, "Lock granted with nothing queued");
                self.release_lock(service);
                return;
            }
        };

        let started = match invocation {
            Invocation::BecomeLeader => CoordinatorMessage::LeaderState {
                leader: Some(self.host),
            }
            .encode()
            .and_then(|proposal| service.propose_state_change(proposal)),
            Invocation::RequestTrackers => CoordinatorMessage::TrackerRequest {
                last_released: progress.last_released,
            }
            .encode()
            .and_then(|task| service.initiate_coordinated_task(task).map(|_| ())),
        };

        match started {
            Ok(()) => {
                debug!(partition = self.partition, ?invocation, "Started coordinated operation");
                self.in_flight = Some((invocation, Instant::now()));
            }
            Err(e) => {
                warn!(partition = self.partition, ?invocation, error = %e, "Coordinated operation failed to start");
                self.release_lock(service);
            }
        }
    }

    fn on_proposal_resolved(
        &mut self,
        service: &dyn CoordinationService,
        ours: bool,
        proposal: &[u8],
        success: bool,
    ) -> EventOutcome {
        let mut outcome = EventOutcome::Unchanged;
        match CoordinatorMessage::decode(proposal) {
            Ok(CoordinatorMessage::LeaderState { leader }) if success => {
                CoordinatorMetrics::increment_leader_changes();
                info!(
                    partition = self.partition,
                    signature = %self.signature,
                    leader = ?leader,
                    "Export leader changed"
                );
                self.state.leader = leader;
                self.state.trackers.clear();
                self.state.invalidate();
                if self.is_leader() {
                    self.queue(Invocation::RequestTrackers);
                }
                outcome = EventOutcome::Reevaluate;
            }
            Ok(_) if !success => {
                warn!(partition = self.partition, ours, "Leader proposal failed");
                if ours {
                    self.invocations.push_back(Invocation::BecomeLeader);
                }
            }
            Ok(other) => warn!(partition = self.partition, ?other, "Unexpected proposal"),
            Err(e) => warn!(partition = self.partition, error = %e, "Undecodable proposal"),
        }
        if ours {
            self.release_lock(service);
        }
        outcome
    }

    fn on_task_requested(
        &mut self,
        service: &dyn CoordinationService,
        task_id: TaskId,
        task: &[u8],
        progress: ReplicaProgress<'_>,
    ) {
        let reply = match CoordinatorMessage::decode(task) {
            Ok(CoordinatorMessage::TrackerRequest { last_released })
                if self.state.lifecycle == Lifecycle::Initialized =>
            {
                let mut tracker = progress.tracker.clone();
                tracker.truncate_before(last_released.saturating_add(1));
                CoordinatorMessage::tracker_reply(&tracker)
                    .encode()
                    .unwrap_or_default()
            }
            Ok(CoordinatorMessage::TrackerRequest { .. }) => Bytes::new(),
            Ok(other) => {
                warn!(partition = self.partition, ?other, "Unexpected task");
                Bytes::new()
            }
            Err(e) => {
                warn!(partition = self.partition, error = %e, "Undecodable task");
                Bytes::new()
            }
        };
        if let Err(e) = service.complete_task(task_id, reply) {
            debug!(partition = self.partition, task_id, error = %e, "Task reply dropped");
        }
    }

    fn on_task_completed(
        &mut self,
        service: &dyn CoordinationService,
        ours: bool,
        results: BTreeMap<HostId, Bytes>,
    ) -> EventOutcome {
        let started = self.in_flight.map(|(_, at)| at);
        if ours {
            self.release_lock(service);
        }

        let mut trackers = BTreeMap::new();
        for (host, reply) in &results {
            match CoordinatorMessage::decode_tracker(reply) {
                Ok(Some(tracker)) => {
                    trackers.insert(*host, tracker);
                }
                Ok(None) => {
                    debug!(partition = self.partition, host, "Replica not ready for tracker round");
                    break;
                }
                Err(e) => {
                    warn!(partition = self.partition, host, error = %e, "Garbled tracker reply");
                    break;
                }
            }
        }

        if trackers.len() != results.len() || trackers.is_empty() {
            CoordinatorMetrics::increment_failed_tracker_rounds();
            if ours && self.is_leader() {
                debug!(partition = self.partition, "Retrying tracker round");
                self.queue(Invocation::RequestTrackers);
            }
            return EventOutcome::Unchanged;
        }

        normalize(&mut trackers);
        CoordinatorMetrics::increment_tracker_rounds();
        if let Some(started) = started.filter(|_| ours) {
            CoordinatorMetrics::record_tracker_round(started.elapsed());
        }
        debug!(
            partition = self.partition,
            signature = %self.signature,
            trackers = %DisplayTrackers(&trackers),
            "Collected replica trackers"
        );
        self.state.trackers = trackers;
        self.state.invalidate();
        EventOutcome::Reevaluate
    }

    fn on_membership_changed(&mut self, added: Vec<HostId>, removed: Vec<HostId>) -> EventOutcome {
        CoordinatorMetrics::increment_membership_changes(added.len(), removed.len());
        for host in &removed {
            self.state.trackers.remove(host);
            if self.state.leader == Some(*host) {
                info!(
                    partition = self.partition,
                    signature = %self.signature,
                    leader = host,
                    "Export leader left the group"
                );
                self.state.leader = None;
                self.state.trackers.clear();
            }
        }
        if !added.is_empty() && self.is_leader() {
            self.queue(Invocation::RequestTrackers);
        }
        self.state.invalidate();
        EventOutcome::Reevaluate
    }

    #[cfg(test)]
    pub(crate) fn install(&mut self, leader: HostId, trackers: BTreeMap<HostId, SequenceTracker>) {
        self.state.lifecycle = Lifecycle::Initialized;
        self.state.leader = Some(leader);
        self.state.trackers = trackers;
        self.state.invalidate();
    }
}

/// Pad every non-empty tracker back to the lowest start across all trackers,
/// so history that simply predates a replica is not read as a gap.
fn normalize(trackers: &mut BTreeMap<HostId, SequenceTracker>) {
    let lowest = trackers.values().filter_map(SequenceTracker::first_seq).min();
    if let Some(lowest) = lowest {
        for tracker in trackers.values_mut() {
            tracker.pad_start(lowest);
        }
    }
}

struct DisplayTrackers<'a>(&'a BTreeMap<HostId, SequenceTracker>);

impl std::fmt::Display for DisplayTrackers<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, (host, tracker)) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}: {}", host, tracker)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::CoordinationHub;
    use parking_lot::Mutex;

    fn tracker(ranges: &[(u64, u64)]) -> SequenceTracker {
        let mut t = SequenceTracker::new();
        for (s, e) in ranges {
            t.add_range(*s, *e);
        }
        t
    }

    #[test]
    fn test_leader_with_gap_and_no_peers() {
        let mut c = MastershipCoordinator::new(1, 0, "orders");
        c.install(1, BTreeMap::from([(1, tracker(&[(1, 9), (21, INFINITE_SEQNO)]))]));

        assert!(c.is_export_master(5));
        assert_eq!(c.state().safe_point, 9);

        assert_eq!(
            c.evaluate_mastership(15),
            MastershipDecision::Blocked { gap: (15, 20) }
        );
        assert_eq!(c.state().safe_point, 20);
        assert!(c.is_export_master(15));

        assert_eq!(c.evaluate_mastership(21), MastershipDecision::Master);
        assert_eq!(c.state().safe_point, INFINITE_SEQNO);
    }

    #[test]
    fn test_lowest_covering_replica_takes_over() {
        let trackers = BTreeMap::from([
            (1, tracker(&[(1, 100), (201, 300)])),
            (2, tracker(&[(1, 150), (181, 300)])),
            (3, tracker(&[(1, 300)])),
        ]);

        let mut on_leader = MastershipCoordinator::new(1, 0, "orders");
        on_leader.install(1, trackers.clone());
        assert_eq!(on_leader.evaluate_mastership(50), MastershipDecision::Master);
        assert_eq!(on_leader.state().safe_point, 100);
        assert_eq!(on_leader.evaluate_mastership(101), MastershipDecision::Replica(2));

        let mut on_two = MastershipCoordinator::new(2, 0, "orders");
        on_two.install(1, trackers.clone());
        assert_eq!(on_two.evaluate_mastership(101), MastershipDecision::Master);
        // host 2 has its own gap at 151, before the leader's gap closes
        assert_eq!(on_two.state().safe_point, 150);
        assert_eq!(on_two.evaluate_mastership(151), MastershipDecision::Replica(3));

        let mut on_three = MastershipCoordinator::new(3, 0, "orders");
        on_three.install(1, trackers);
        assert_eq!(on_three.evaluate_mastership(151), MastershipDecision::Master);
        assert_eq!(on_three.state().safe_point, 200);
        assert_eq!(on_three.evaluate_mastership(201), MastershipDecision::Replica(1));
    }

    #[test]
    fn test_non_leader_sees_leader_blocked_as_replica() {
        let mut c = MastershipCoordinator::new(2, 0, "orders");
        c.install(
            1,
            BTreeMap::from([(1, tracker(&[(1, 9), (21, 30)])), (2, tracker(&[(1, 9)]))]),
        );
        assert_eq!(c.evaluate_mastership(12), MastershipDecision::Replica(1));
        assert!(!c.is_export_master(12));
    }

    #[test]
    fn test_undecided_without_leader_or_trackers() {
        let mut c = MastershipCoordinator::new(1, 0, "orders");
        assert_eq!(c.evaluate_mastership(1), MastershipDecision::Undecided);

        c.install(2, BTreeMap::new());
        assert_eq!(c.evaluate_mastership(1), MastershipDecision::Undecided);
    }

    #[test]
    fn test_replicated_is_always_master() {
        let mut c = MastershipCoordinator::replicated(4, 0, "lookup");
        assert!(c.is_export_master(1));
        assert!(c.is_export_master(INFINITE_SEQNO - 1));
        c.become_leader();
        assert_eq!(c.state().lifecycle, Lifecycle::Replicated);
    }

    #[test]
    fn test_normalize_pads_to_lowest_start() {
        let mut trackers = BTreeMap::from([
            (1, tracker(&[(1, 50)])),
            (2, tracker(&[(30, 60)])),
            (3, SequenceTracker::new()),
        ]);
        normalize(&mut trackers);
        assert_eq!(trackers[&2].first_seq(), Some(1));
        assert!(trackers[&2].first_gap(1).is_none());
        assert!(trackers[&3].is_empty());
    }

    #[test]
    fn test_membership_removal_of_leader_resets() {
        let mut c = MastershipCoordinator::new(2, 0, "orders");
        c.install(1, BTreeMap::from([(1, tracker(&[(1, 10)])), (2, tracker(&[(1, 10)]))]));
        assert_eq!(c.evaluate_mastership(1), MastershipDecision::Replica(1));

        let outcome = c.on_membership_changed(Vec::new(), vec![1]);
        assert_eq!(outcome, EventOutcome::Reevaluate);
        assert_eq!(c.leader(), None);
        assert!(c.state().trackers.is_empty());
        assert_eq!(c.evaluate_mastership(1), MastershipDecision::Undecided);
    }

    /// A coordinator joined to a hub group, with its callbacks queued until
    /// the test hands them over
    struct Member {
        coordinator: MastershipCoordinator,
        events: Arc<Mutex<Vec<CoordinatorEvent>>>,
        tracker: SequenceTracker,
    }

    impl Member {
        fn join(hub: &CoordinationHub, host: HostId, tracker: SequenceTracker) -> Self {
            let events = Arc::new(Mutex::new(Vec::new()));
            let queued = events.clone();
            let dispatch: EventDispatcher = Arc::new(move |event| {
                queued.lock().push(event);
                true
            });
            let mut coordinator = MastershipCoordinator::new(host, 0, "orders");
            coordinator.initialize(hub, dispatch).unwrap();
            Self {
                coordinator,
                events,
                tracker,
            }
        }

        fn handle(&mut self, event: CoordinatorEvent) -> EventOutcome {
            let progress = ReplicaProgress {
                last_released: 0,
                tracker: &self.tracker,
            };
            self.coordinator.handle_event(event, progress)
        }

        /// Handle every queued event; false if there were none
        fn step(&mut self) -> bool {
            let batch = std::mem::take(&mut *self.events.lock());
            let busy = !batch.is_empty();
            for event in batch {
                let _ = self.handle(event);
            }
            busy
        }
    }

    fn settle(members: &mut [Member]) {
        loop {
            let mut busy = false;
            for member in members.iter_mut() {
                busy |= member.step();
            }
            if !busy {
                break;
            }
        }
    }

    fn group() -> String {
        export_group(0, "orders")
    }

    /// Two joined replicas with host 1 elected leader and one round done
    fn elected(hub: &CoordinationHub) -> [Member; 2] {
        let mut members = [
            Member::join(hub, 1, tracker(&[(1, 100)])),
            Member::join(hub, 2, tracker(&[(1, 100)])),
        ];
        settle(&mut members);
        members[0].coordinator.become_leader();
        settle(&mut members);
        assert_eq!(members[0].coordinator.leader(), Some(1));
        assert_eq!(members[1].coordinator.leader(), Some(1));
        assert_eq!(members[0].coordinator.state().trackers.len(), 2);
        assert_eq!(hub.lock_holder(&group()), None);
        members
    }

    #[test]
    fn test_lock_granted_with_nothing_queued_is_released() {
        let hub = CoordinationHub::new();
        let mut members = [
            Member::join(&hub, 1, SequenceTracker::new()),
            Member::join(&hub, 2, SequenceTracker::new()),
        ];
        settle(&mut members);

        members[0]
            .coordinator
            .service
            .as_ref()
            .unwrap()
            .request_lock()
            .unwrap();
        members[0].coordinator.lock_requested = true;

        // Host 2 waits behind the grant that nothing will use
        members[1]
            .coordinator
            .service
            .as_ref()
            .unwrap()
            .request_lock()
            .unwrap();
        members[1].coordinator.lock_requested = true;
        members[1].coordinator.invocations.push_back(Invocation::RequestTrackers);
        assert_eq!(hub.lock_holder(&group()), Some(1));

        assert!(members[0].step());
        assert!(!members[0].coordinator.lock_held);
        assert!(!members[0].coordinator.lock_requested);
        assert_eq!(hub.lock_holder(&group()), Some(2));
    }

    #[test]
    fn test_failed_tracker_round_is_retried_by_initiator() {
        let hub = CoordinationHub::new();
        let mut members = elected(&hub);
        let before = members[0].coordinator.state().trackers.clone();

        let reply = CoordinatorMessage::tracker_reply(&tracker(&[(1, 50)]))
            .encode()
            .unwrap();
        // Host 2 answered before it was initialized
        let results = BTreeMap::from([(1, reply), (2, Bytes::new())]);
        let outcome = members[0].handle(CoordinatorEvent::TaskCompleted {
            ours: true,
            task: Bytes::new(),
            results,
        });

        assert_eq!(outcome, EventOutcome::Unchanged);
        assert_eq!(members[0].coordinator.state().trackers, before);
        assert_eq!(hub.lock_holder(&group()), Some(1));
        assert!(matches!(
            members[0].events.lock().as_slice(),
            [CoordinatorEvent::LockGranted]
        ));

        settle(&mut members);
        assert_eq!(hub.lock_holder(&group()), None);
        assert_eq!(members[0].coordinator.state().trackers, before);
        assert!(members[0].coordinator.invocations.is_empty());
    }

    #[test]
    fn test_failed_tracker_round_on_non_initiator_waits() {
        let hub = CoordinationHub::new();
        let mut members = elected(&hub);
        let before = members[1].coordinator.state().trackers.clone();

        let results = BTreeMap::from([
            (1, Bytes::from_static(&[0xff, 0xff, 0xff])),
            (2, Bytes::new()),
        ]);
        let outcome = members[1].handle(CoordinatorEvent::TaskCompleted {
            ours: false,
            task: Bytes::new(),
            results,
        });

        assert_eq!(outcome, EventOutcome::Unchanged);
        assert_eq!(members[1].coordinator.state().trackers, before);
        assert!(members[1].coordinator.invocations.is_empty());
        assert!(!members[1].coordinator.lock_requested);
        assert!(members[1].events.lock().is_empty());
        assert_eq!(hub.lock_holder(&group()), None);
    }

    #[test]
    fn test_shutdown_is_once() {
        let mut c = MastershipCoordinator::new(1, 0, "orders");
        assert!(c.shutdown());
        assert!(!c.shutdown());
        assert!(c.is_closed());
    }
}
