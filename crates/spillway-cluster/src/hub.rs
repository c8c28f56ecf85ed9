//! In-process coordination service
//!
//! [`CoordinationHub`] implements the coordination contract for any number of
//! hosts living in one process. Every group keeps its members, the lock
//! holder with a FIFO of waiters, the resolved state, and at most one open
//! proposal and one open task round. Group state sits behind a mutex;
//! listener callbacks are collected while it is held and delivered after it
//! is released, under a per-group dispatch lock so each listener observes
//! events in the order they were produced.

use crate::error::{ClusterError, Result};
use crate::node::HostId;
use crate::service::{CoordinationListener, CoordinationProvider, CoordinationService, TaskId};
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, trace};

enum Event {
    InitialState(Option<Bytes>),
    LockGranted,
    StateChangeProposed(HostId, Bytes),
    ProposedStateResolved {
        ours: bool,
        proposal: Bytes,
        success: bool,
    },
    TaskRequested(HostId, TaskId, Bytes),
    CorrelatedTaskCompleted {
        ours: bool,
        task: Bytes,
        results: BTreeMap<HostId, Bytes>,
    },
    MembershipChanged(Vec<HostId>, Vec<HostId>),
}

struct Proposal {
    proposer: HostId,
    payload: Bytes,
    pending: BTreeSet<HostId>,
    rejected: bool,
}

struct TaskRound {
    id: TaskId,
    initiator: HostId,
    payload: Bytes,
    pending: BTreeSet<HostId>,
    results: BTreeMap<HostId, Bytes>,
}

#[derive(Default)]
struct GroupState {
    members: BTreeMap<HostId, Arc<dyn CoordinationListener>>,
    lock_holder: Option<HostId>,
    lock_waiters: VecDeque<HostId>,
    state: Option<Bytes>,
    proposal: Option<Proposal>,
    task: Option<TaskRound>,
    next_task_id: TaskId,
}

type Outbox = Vec<(Arc<dyn CoordinationListener>, Event)>;

impl GroupState {
    fn send(&self, out: &mut Outbox, host: HostId, event: Event) {
        if let Some(listener) = self.members.get(&host) {
            out.push((listener.clone(), event));
        }
    }

    fn grant_next(&mut self, out: &mut Outbox) {
        while let Some(next) = self.lock_waiters.pop_front() {
            if self.members.contains_key(&next) {
                self.lock_holder = Some(next);
                self.send(out, next, Event::LockGranted);
                return;
            }
        }
        self.lock_holder = None;
    }

    fn try_resolve_proposal(&mut self, out: &mut Outbox) {
        let done = matches!(&self.proposal, Some(p) if p.pending.is_empty());
        if !done {
            return;
        }
        let Some(proposal) = self.proposal.take() else {
            return;
        };
        let success = !proposal.rejected;
        if success {
            self.state = Some(proposal.payload.clone());
        }
        for &host in self.members.keys() {
            self.send(
                out,
                host,
                Event::ProposedStateResolved {
                    ours: host == proposal.proposer,
                    proposal: proposal.payload.clone(),
                    success,
                },
            );
        }
    }

    fn try_complete_task(&mut self, out: &mut Outbox) {
        let done = matches!(&self.task, Some(t) if t.pending.is_empty());
        if !done {
            return;
        }
        let Some(round) = self.task.take() else {
            return;
        };
        trace!(task = round.id, replies = round.results.len(), "Task round complete");
        for &host in self.members.keys() {
            self.send(
                out,
                host,
                Event::CorrelatedTaskCompleted {
                    ours: host == round.initiator,
                    task: round.payload.clone(),
                    results: round.results.clone(),
                },
            );
        }
    }
}

struct Group {
    name: String,
    state: Mutex<GroupState>,
    dispatch: Mutex<()>,
}

impl Group {
    /// Run `f` against the group state, then deliver the events it produced
    fn update<R>(&self, f: impl FnOnce(&mut GroupState, &mut Outbox) -> R) -> R {
        let mut out = Outbox::new();
        let mut state = self.state.lock();
        let result = f(&mut state, &mut out);
        let dispatch = self.dispatch.lock();
        drop(state);
        deliver(out);
        drop(dispatch);
        result
    }
}

fn deliver(out: Outbox) {
    for (listener, event) in out {
        match event {
            Event::InitialState(state) => listener.initial_state(state),
            Event::LockGranted => listener.lock_granted(),
            Event::StateChangeProposed(proposer, proposal) => {
                listener.state_change_proposed(proposer, proposal)
            }
            Event::ProposedStateResolved {
                ours,
                proposal,
                success,
            } => listener.proposed_state_resolved(ours, proposal, success),
            Event::TaskRequested(initiator, id, task) => {
                listener.task_requested(initiator, id, task)
            }
            Event::CorrelatedTaskCompleted {
                ours,
                task,
                results,
            } => listener.correlated_task_completed(ours, task, results),
            Event::MembershipChanged(added, removed) => {
                listener.membership_changed(added, removed)
            }
        }
    }
}

/// Coordination service shared by every host in the process
#[derive(Clone, Default)]
pub struct CoordinationHub {
    groups: Arc<DashMap<String, Arc<Group>>>,
}

impl std::fmt::Debug for CoordinationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinationHub")
            .field("groups", &self.groups.len())
            .finish()
    }
}

impl CoordinationHub {
    pub fn new() -> Self {
        Self::default()
    }

    fn group(&self, name: &str) -> Arc<Group> {
        self.groups
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Group {
                    name: name.to_string(),
                    state: Mutex::new(GroupState::default()),
                    dispatch: Mutex::new(()),
                })
            })
            .clone()
    }

    /// Members of `group`, ascending
    pub fn members(&self, group: &str) -> Vec<HostId> {
        self.groups
            .get(group)
            .map(|g| g.state.lock().members.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Current lock holder of `group`
    pub fn lock_holder(&self, group: &str) -> Option<HostId> {
        self.groups
            .get(group)
            .and_then(|g| g.state.lock().lock_holder)
    }
}

impl CoordinationProvider for CoordinationHub {
    fn join(
        &self,
        group: &str,
        host: HostId,
        listener: Arc<dyn CoordinationListener>,
    ) -> Result<Arc<dyn CoordinationService>> {
        let group = self.group(group);
        group.update(|g, out| {
            if g.members.contains_key(&host) {
                return Err(ClusterError::AlreadyJoined(host, group.name.clone()));
            }
            for &peer in g.members.keys() {
                g.send(out, peer, Event::MembershipChanged(vec![host], Vec::new()));
            }
            g.members.insert(host, listener);
            Ok(())
        })?;
        debug!(group = %group.name, host, "Joined coordination group");

        Ok(Arc::new(HubMember { group, host }))
    }
}

/// One host's membership in a hub group
struct HubMember {
    group: Arc<Group>,
    host: HostId,
}

impl HubMember {
    fn check_member(&self, g: &GroupState) -> Result<()> {
        if g.members.contains_key(&self.host) {
            Ok(())
        } else {
            Err(ClusterError::NotMember(self.host, self.group.name.clone()))
        }
    }

    fn check_lock(&self, g: &GroupState) -> Result<()> {
        self.check_member(g)?;
        if g.lock_holder == Some(self.host) {
            Ok(())
        } else {
            Err(ClusterError::LockNotHeld(self.host))
        }
    }
}

impl CoordinationService for HubMember {
    fn host_id(&self) -> HostId {
        self.host
    }

    fn register_state(&self, initial: Bytes) -> Result<()> {
        let host = self.host;
        self.group.update(|g, out| {
            self.check_member(g)?;
            if g.state.is_none() {
                g.state = Some(initial);
            }
            let current = g.state.clone();
            g.send(out, host, Event::InitialState(current));
            Ok(())
        })
    }

    fn request_lock(&self) -> Result<()> {
        let host = self.host;
        self.group.update(|g, out| {
            self.check_member(g)?;
            if g.lock_holder == Some(host) || g.lock_waiters.contains(&host) {
                return Err(ClusterError::LockRequestPending(host));
            }
            if g.lock_holder.is_none() {
                g.lock_holder = Some(host);
                g.send(out, host, Event::LockGranted);
            } else {
                g.lock_waiters.push_back(host);
            }
            Ok(())
        })
    }

    fn cancel_lock_request(&self) {
        let host = self.host;
        self.group.update(|g, _| g.lock_waiters.retain(|h| *h != host));
    }

    fn release_lock(&self) -> Result<()> {
        self.group.update(|g, out| {
            self.check_lock(g)?;
            g.grant_next(out);
            Ok(())
        })
    }

    fn propose_state_change(&self, proposal: Bytes) -> Result<()> {
        let host = self.host;
        self.group.update(|g, out| {
            self.check_lock(g)?;
            if g.proposal.is_some() {
                return Err(ClusterError::InvalidMessage(
                    "proposal already in flight".into(),
                ));
            }
            g.proposal = Some(Proposal {
                proposer: host,
                payload: proposal.clone(),
                pending: g.members.keys().copied().collect(),
                rejected: false,
            });
            for &member in g.members.keys() {
                g.send(out, member, Event::StateChangeProposed(host, proposal.clone()));
            }
            Ok(())
        })
    }

    fn accept_proposal(&self, accept: bool) -> Result<()> {
        let host = self.host;
        self.group.update(|g, out| {
            self.check_member(g)?;
            let proposal = g
                .proposal
                .as_mut()
                .ok_or_else(|| ClusterError::InvalidMessage("no proposal in flight".into()))?;
            if proposal.pending.remove(&host) && !accept {
                proposal.rejected = true;
            }
            g.try_resolve_proposal(out);
            Ok(())
        })
    }

    fn initiate_coordinated_task(&self, task: Bytes) -> Result<TaskId> {
        let host = self.host;
        self.group.update(|g, out| {
            self.check_lock(g)?;
            if g.task.is_some() {
                return Err(ClusterError::InvalidMessage("task already in flight".into()));
            }
            g.next_task_id += 1;
            let id = g.next_task_id;
            g.task = Some(TaskRound {
                id,
                initiator: host,
                payload: task.clone(),
                pending: g.members.keys().copied().collect(),
                results: BTreeMap::new(),
            });
            for &member in g.members.keys() {
                g.send(out, member, Event::TaskRequested(host, id, task.clone()));
            }
            Ok(id)
        })
    }

    fn complete_task(&self, task_id: TaskId, result: Bytes) -> Result<()> {
        let host = self.host;
        self.group.update(|g, out| {
            self.check_member(g)?;
            let round = match g.task.as_mut() {
                Some(round) if round.id == task_id => round,
                _ => return Err(ClusterError::UnknownTask(task_id)),
            };
            if round.pending.remove(&host) {
                round.results.insert(host, result);
            }
            g.try_complete_task(out);
            Ok(())
        })
    }

    fn current_state(&self) -> Option<Bytes> {
        self.group.state.lock().state.clone()
    }

    fn members(&self) -> Vec<HostId> {
        self.group.state.lock().members.keys().copied().collect()
    }

    fn leave(&self) {
        let host = self.host;
        let left = self.group.update(|g, out| {
            if g.members.remove(&host).is_none() {
                return false;
            }
            g.lock_waiters.retain(|h| *h != host);
            if g.lock_holder == Some(host) {
                g.grant_next(out);
            }
            if let Some(proposal) = g.proposal.as_mut() {
                proposal.pending.remove(&host);
            }
            g.try_resolve_proposal(out);
            if let Some(round) = g.task.as_mut() {
                if round.pending.remove(&host) {
                    round.results.insert(host, Bytes::new());
                }
            }
            g.try_complete_task(out);
            for &peer in g.members.keys() {
                g.send(out, peer, Event::MembershipChanged(Vec::new(), vec![host]));
            }
            true
        });
        if left {
            debug!(group = %self.group.name, host, "Left coordination group");
        }
    }
}
