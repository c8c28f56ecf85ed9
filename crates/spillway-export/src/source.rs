//! Export data source
//!
//! One [`ExportSource`] exists per exported table-partition on every replica.
//! It buffers the rows the engine pushes, hands them to the sink one block at
//! a time while the local replica is export master, and releases buffered
//! rows once the sink (or the master on another replica) acknowledges them.
//!
//! The source and its [`MastershipCoordinator`] live inside a mailbox on one
//! executor thread. Everything else talks to them through a [`SourceHandle`],
//! which turns each operation into a closure queued on that mailbox.
//!
//! ## Poll pointer
//!
//! ```text
//!   released        polled, awaiting ack      not yet polled
//! ───────────┤├───────────────────────────┤├─────────────────────►
//!   last_released                    first_unpolled
//! ```
//!
//! A poll starts at `first_unpolled`. When the next buffered block starts
//! after it, the rows in between exist on no local buffer and the source is
//! BLOCKED until another replica covers them, an acknowledgement moves past
//! them, or an operator releases the gap.

use crate::error::{ExportError, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use spillway_cluster::{
    AckTransport, CoordinationProvider, CoordinatorEvent, CoordinatorState, EventDispatcher,
    EventOutcome, HostId, MastershipCoordinator, MastershipDecision, PartitionId,
    ReleaseBufferMessage, ReplicaProgress, ReplicaSet,
};
use spillway_core::fatal::crash_local;
use spillway_core::{
    mailbox, Block, BlockBuffer, ExecutorPool, ExportMetrics, Mailbox, SequenceTracker, Timer,
    INFINITE_SEQNO,
};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

/// A block handed to the sink
#[derive(Debug, Clone)]
pub struct ExportBlock {
    partition: PartitionId,
    signature: Arc<str>,
    block: Block,
}

impl ExportBlock {
    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn start_seq(&self) -> u64 {
        self.block.start_seq()
    }

    pub fn last_seq(&self) -> u64 {
        self.block.last_seq()
    }

    pub fn committed_seq(&self) -> u64 {
        self.block.committed_seq()
    }

    /// First row the sink still has to deliver; rows before it were already
    /// acknowledged
    pub fn first_unreleased_seq(&self) -> u64 {
        self.block.first_unreleased_seq()
    }

    pub fn row_count(&self) -> u32 {
        self.block.row_count()
    }

    pub fn unique_id(&self) -> u64 {
        self.block.unique_id()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.block.timestamp()
    }

    pub fn generation(&self) -> u64 {
        self.block.generation()
    }

    pub fn data(&self) -> &Bytes {
        self.block.data()
    }

    pub fn block(&self) -> &Block {
        &self.block
    }
}

/// Outcome of a poll
#[derive(Debug, Clone)]
pub enum PollResult {
    Block(ExportBlock),
    /// The table left the catalog and every row was delivered, or the source
    /// shut down
    EndOfStream,
}

/// A poll answer in transit. A block dropped before the consumer took it
/// goes back to its source for the next poll.
#[derive(Debug)]
pub(crate) struct Handoff {
    result: Option<PollResult>,
    undelivered: Arc<Mutex<Option<ExportBlock>>>,
}

impl Handoff {
    pub(crate) fn into_result(mut self) -> PollResult {
        self.result.take().unwrap_or(PollResult::EndOfStream)
    }

    fn into_block(mut self) -> Option<ExportBlock> {
        match self.result.take() {
            Some(PollResult::Block(block)) => Some(block),
            _ => None,
        }
    }
}

impl Drop for Handoff {
    fn drop(&mut self) {
        if let Some(PollResult::Block(block)) = self.result.take() {
            *self.undelivered.lock() = Some(block);
        }
    }
}

/// Identity and options of a source
#[derive(Debug, Clone)]
pub struct SourceDescriptor {
    pub partition: PartitionId,
    pub signature: String,
    pub generation: u64,
    pub host: HostId,
    /// Replicated tables export on every host and never coordinate
    pub replicated: bool,
    /// Every replica of the partition, local host included or not
    pub replicas: Vec<HostId>,
    pub auto_release: bool,
}

/// Point-in-time view of a source
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceStats {
    pub partition: PartitionId,
    pub signature: String,
    pub generation: u64,
    pub tuples_pushed: u64,
    pub tuples_pending: u64,
    pub buffered_blocks: usize,
    pub buffered_bytes: u64,
    pub last_released: u64,
    pub last_committed: u64,
    pub first_unpolled: u64,
    pub blocked: bool,
    pub gap_width: u64,
    pub dropped: bool,
    pub leader: Option<HostId>,
    pub is_master: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckOrigin {
    /// The local sink delivered the rows; peers must hear about it
    Sink,
    Replica(HostId),
}

/// Per table-partition export state, owned by its mailbox
pub struct ExportSource {
    partition: PartitionId,
    signature: Arc<str>,
    generation: u64,
    tracker: SequenceTracker,
    buffer: Box<dyn BlockBuffer>,
    coordinator: MastershipCoordinator,
    replicas: ReplicaSet,
    transport: Option<Arc<dyn AckTransport>>,
    auto_release: bool,

    /// End of the highest block ever pushed
    last_pushed: u64,
    tuples_pushed: u64,
    last_released: u64,
    last_committed: u64,
    first_unpolled: u64,

    pending_poll: Option<oneshot::Sender<Handoff>>,
    /// Block a consumer went away before receiving
    pending_delivery: Option<ExportBlock>,
    /// Filled by a handoff dropped unread
    undelivered: Arc<Mutex<Option<ExportBlock>>>,
    /// Last delivered block end, for delivery latency
    in_flight: Option<(u64, Timer)>,

    /// Gap the poll pointer is stuck on
    blocked: Option<(u64, u64)>,
    gap_width: u64,

    in_catalog: bool,
    dropped: bool,
    destroyed: bool,
    closed: bool,
}

impl fmt::Debug for ExportSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportSource")
            .field("partition", &self.partition)
            .field("signature", &self.signature)
            .field("generation", &self.generation)
            .field("tracker", &self.tracker.to_string())
            .field("last_released", &self.last_released)
            .field("first_unpolled", &self.first_unpolled)
            .field("blocked", &self.blocked)
            .finish()
    }
}

impl ExportSource {
    /// Open a source over `buffer`, recovering whatever it already holds.
    ///
    /// Blocks from older generations are deleted; the tracker is rebuilt
    /// from the surviving block headers. Rows before the first surviving
    /// block count as released.
    pub(crate) fn open(
        descriptor: SourceDescriptor,
        mut buffer: Box<dyn BlockBuffer>,
        transport: Option<Arc<dyn AckTransport>>,
    ) -> Result<Self> {
        let SourceDescriptor {
            partition,
            signature,
            generation,
            host,
            replicated,
            replicas,
            auto_release,
        } = descriptor;

        let stale = buffer.delete_stale_blocks(generation)?;
        let tracker = buffer.scan_for_gap()?;
        let last_released = tracker.first_seq().map_or(0, |first| first - 1);
        let last_pushed = tracker.last_seq().unwrap_or(0);

        let coordinator = if replicated {
            MastershipCoordinator::replicated(host, partition, signature.as_str())
        } else {
            MastershipCoordinator::new(host, partition, signature.as_str())
        };
        let mut replica_set = ReplicaSet::new(host);
        replica_set.update(replicas);

        if !tracker.is_empty() || stale > 0 {
            info!(
                partition,
                signature = %signature,
                generation,
                stale_blocks = stale,
                tracker = %tracker,
                "Recovered export buffer"
            );
        }
        ExportMetrics::add_pending_rows(tracker.sequence_count() as i64);

        Ok(Self {
            partition,
            signature: Arc::from(signature),
            generation,
            tracker,
            buffer,
            coordinator,
            replicas: replica_set,
            transport,
            auto_release,
            last_pushed,
            tuples_pushed: 0,
            last_released,
            last_committed: last_released,
            first_unpolled: last_released + 1,
            pending_poll: None,
            pending_delivery: None,
            undelivered: Arc::new(Mutex::new(None)),
            in_flight: None,
            blocked: None,
            gap_width: 0,
            in_catalog: true,
            dropped: false,
            destroyed: false,
            closed: false,
        })
    }

    pub(crate) fn push(
        &mut self,
        start_seq: u64,
        committed_seq: u64,
        row_count: u32,
        unique_id: u64,
        data: Bytes,
    ) {
        if self.closed {
            trace!(partition = self.partition, start_seq, "Source closed, dropping push");
            return;
        }
        if !self.in_catalog {
            debug!(
                partition = self.partition,
                signature = %self.signature,
                start_seq,
                "Discarding push for a table outside the catalog"
            );
            return;
        }
        if row_count == 0 || start_seq == 0 {
            warn!(
                partition = self.partition,
                signature = %self.signature,
                start_seq,
                row_count,
                "Discarding empty push"
            );
            return;
        }

        let last_seq = match start_seq
            .checked_add(row_count as u64 - 1)
            .filter(|last| *last < INFINITE_SEQNO)
        {
            Some(last) => last,
            None => {
                warn!(
                    partition = self.partition,
                    signature = %self.signature,
                    start_seq,
                    row_count,
                    "Discarding push beyond the sequence space"
                );
                return;
            }
        };
        if last_seq <= self.last_pushed {
            crash_local(
                "export push out of order",
                &format_args!(
                    "partition {} of {}: block {}-{} does not extend {}",
                    self.partition, self.signature, start_seq, last_seq, self.last_pushed
                ),
            );
        }
        let previous = self.last_pushed;
        self.last_pushed = last_seq;
        self.tuples_pushed += row_count as u64;

        if last_seq <= self.last_released {
            trace!(
                partition = self.partition,
                start_seq,
                last_seq,
                last_released = self.last_released,
                "Discarding push already released by another replica"
            );
            return;
        }

        // A block reaching back into the previous one only contributes its
        // new tail
        let overlap = start_seq <= previous;
        if overlap {
            debug!(
                partition = self.partition,
                signature = %self.signature,
                start_seq,
                last_seq,
                previous,
                "Push overlaps the previous block"
            );
            self.tracker.add_range(start_seq, last_seq);
        } else if let Err(e) = self.tracker.append(start_seq, last_seq) {
            crash_local("export tracker out of order", &e);
        }
        let mut block = match Block::new(
            start_seq,
            row_count,
            committed_seq,
            unique_id,
            self.generation,
            data,
        ) {
            Ok(block) => block,
            Err(e) => crash_local("invalid export block", &e),
        };
        if start_seq <= self.last_released {
            self.tracker.truncate_before(self.last_released + 1);
            block.release_to(self.last_released);
        }
        if overlap {
            block.release_to(previous);
        }

        let pending = block.unreleased_rows();
        if let Err(e) = self.buffer.offer(block) {
            crash_local("export buffer write failed", &e);
        }
        ExportMetrics::increment_blocks_pushed(row_count as u64);
        ExportMetrics::add_pending_rows(pending as i64);
        trace!(
            partition = self.partition,
            signature = %self.signature,
            start_seq,
            last_seq,
            "Buffered export block"
        );

        self.try_poll();
    }

    /// Register a poll; the receiver resolves when a block is available
    pub(crate) fn poll(&mut self) -> Result<oneshot::Receiver<Handoff>> {
        if self
            .pending_poll
            .as_ref()
            .is_some_and(|pending| !pending.is_closed())
        {
            return Err(ExportError::poll_in_progress(
                self.partition,
                self.signature.as_ref(),
            ));
        }
        let (tx, rx) = oneshot::channel();
        if self.closed {
            let _ = tx.send(self.handoff(PollResult::EndOfStream));
            return Ok(rx);
        }
        self.pending_poll = Some(tx);
        self.try_poll();
        Ok(rx)
    }

    fn handoff(&self, result: PollResult) -> Handoff {
        Handoff {
            result: Some(result),
            undelivered: self.undelivered.clone(),
        }
    }

    /// Take back a block whose handoff was dropped unread
    fn reclaim_undelivered(&mut self) {
        let returned = self.undelivered.lock().take();
        let block = match returned {
            Some(block) => block,
            None => return,
        };
        if block.last_seq() <= self.last_released {
            return;
        }
        // The buffer still holds it; polling resumes from its start
        let rewind = block.start_seq().max(self.last_released + 1);
        if self
            .pending_delivery
            .as_ref()
            .is_some_and(|pending| pending.start_seq() >= rewind)
        {
            self.pending_delivery = None;
        }
        self.first_unpolled = self.first_unpolled.min(rewind);
        debug!(
            partition = self.partition,
            signature = %self.signature,
            start_seq = block.start_seq(),
            "Consumer dropped a delivered block, offering it again"
        );
    }

    /// Answer the outstanding poll if anything can be delivered
    fn try_poll(&mut self) {
        self.reclaim_undelivered();
        let tx = match self.pending_poll.take() {
            Some(tx) if !tx.is_closed() => tx,
            _ => return,
        };

        if let Some(block) = self.pending_delivery.take() {
            debug!(
                partition = self.partition,
                signature = %self.signature,
                start_seq = block.start_seq(),
                "Re-offering block a previous consumer never received"
            );
            self.deliver(tx, block);
            return;
        }

        self.discard_released();
        let seq = self.first_unpolled;
        let next = self.buffer.iter().find(|b| b.last_seq() >= seq).cloned();
        let block = match next {
            Some(block) => block,
            None => {
                if self.dropped && self.buffer.is_empty() {
                    self.end_of_stream(tx);
                } else {
                    self.pending_poll = Some(tx);
                }
                return;
            }
        };

        match self.coordinator.evaluate_mastership(seq) {
            MastershipDecision::Master | MastershipDecision::Blocked { .. } => {}
            decision => {
                if self.blocked.is_some() {
                    info!(
                        partition = self.partition,
                        signature = %self.signature,
                        ?decision,
                        "Export gap covered by another replica"
                    );
                    self.clear_blocked();
                }
                trace!(partition = self.partition, seq, ?decision, "Not export master, deferring poll");
                self.pending_poll = Some(tx);
                return;
            }
        }

        if block.start_seq() > seq {
            self.pending_poll = Some(tx);
            self.enter_blocked(seq, block.start_seq() - 1);
            return;
        }
        self.first_unpolled = block.last_seq() + 1;
        if self.blocked.is_some() {
            self.clear_blocked();
        }
        let export = ExportBlock {
            partition: self.partition,
            signature: self.signature.clone(),
            block,
        };
        self.deliver(tx, export);
    }

    fn deliver(&mut self, tx: oneshot::Sender<Handoff>, block: ExportBlock) {
        let (start_seq, last_seq) = (block.start_seq(), block.last_seq());
        match tx.send(self.handoff(PollResult::Block(block))) {
            Ok(()) => {
                ExportMetrics::increment_blocks_delivered();
                self.in_flight = Some((last_seq, Timer::new()));
                trace!(partition = self.partition, start_seq, last_seq, "Delivered export block");
            }
            Err(handoff) => {
                debug!(
                    partition = self.partition,
                    signature = %self.signature,
                    start_seq,
                    "Consumer went away, keeping block for the next poll"
                );
                self.pending_delivery = handoff.into_block();
            }
        }
    }

    fn end_of_stream(&mut self, tx: oneshot::Sender<Handoff>) {
        if !self.destroyed {
            if let Err(e) = self.buffer.destroy() {
                crash_local("export buffer destroy failed", &e);
            }
            self.destroyed = true;
            info!(
                partition = self.partition,
                signature = %self.signature,
                "Dropped export source drained"
            );
        }
        let _ = tx.send(self.handoff(PollResult::EndOfStream));
    }

    fn enter_blocked(&mut self, start: u64, end: u64) {
        if self.blocked == Some((start, end)) {
            return;
        }
        let width = end - start + 1;
        self.blocked = Some((start, end));
        self.gap_width = width;
        ExportMetrics::increment_blocked();

        if self.auto_release {
            info!(
                partition = self.partition,
                signature = %self.signature,
                gap_start = start,
                gap_end = end,
                gap_width = width,
                "Auto-releasing export gap"
            );
            self.skip_gap();
            self.try_poll();
            return;
        }

        warn!(
            partition = self.partition,
            signature = %self.signature,
            gap_start = start,
            gap_end = end,
            gap_width = width,
            "Export blocked on a sequence gap: rejoin the replica holding these rows or issue RELEASE to skip them"
        );
        // Cached trackers may predate the gap
        self.coordinator.refresh_trackers();
    }

    fn clear_blocked(&mut self) {
        self.blocked = None;
        self.gap_width = 0;
    }

    /// Move the poll pointer past the gap, giving up its rows
    fn skip_gap(&mut self) -> bool {
        let (start, end) = match self.blocked.take() {
            Some(gap) => gap,
            None => return false,
        };
        warn!(
            partition = self.partition,
            signature = %self.signature,
            gap_start = start,
            gap_end = end,
            "Skipping export gap, its rows will not be exported"
        );
        self.first_unpolled = self.first_unpolled.max(end + 1);
        self.gap_width = 0;
        ExportMetrics::increment_gaps_skipped(end - start + 1);
        true
    }

    /// Operator RELEASE: skip the gap if blocked and master here
    pub(crate) fn release(&mut self) -> bool {
        if self.closed || self.blocked.is_none() {
            return false;
        }
        if !self.coordinator.is_export_master(self.first_unpolled) {
            debug!(
                partition = self.partition,
                signature = %self.signature,
                "Ignoring RELEASE on a replica that is not export master"
            );
            return false;
        }
        let applied = self.skip_gap();
        self.try_poll();
        applied
    }

    pub(crate) fn ack(&mut self, committed_seq: u64, release_seq: u64, origin: AckOrigin) {
        if self.closed {
            return;
        }
        if release_seq >= INFINITE_SEQNO {
            warn!(
                partition = self.partition,
                signature = %self.signature,
                release_seq,
                ?origin,
                "Ignoring ack beyond the sequence space"
            );
            return;
        }
        if release_seq <= self.last_released {
            trace!(
                partition = self.partition,
                release_seq,
                last_released = self.last_released,
                "Ack behind release point"
            );
            return;
        }

        if let Some(pending) = self.pending_delivery.as_mut() {
            if pending.last_seq() <= release_seq {
                debug!(
                    partition = self.partition,
                    start_seq = pending.start_seq(),
                    "Pending delivery acknowledged, dropping it"
                );
                self.pending_delivery = None;
            } else {
                pending.block.release_to(release_seq);
            }
        }

        let released = self.release_blocks(release_seq);
        if let Some((_, gap_end)) = self.blocked {
            if release_seq >= gap_end {
                info!(
                    partition = self.partition,
                    signature = %self.signature,
                    release_seq,
                    "Export gap passed by acknowledgement"
                );
                self.clear_blocked();
            }
        }

        self.last_released = release_seq;
        self.last_committed = self.last_committed.max(committed_seq);
        self.tracker.truncate_before(release_seq + 1);
        self.first_unpolled = self.first_unpolled.max(release_seq + 1);

        ExportMetrics::increment_rows_released(released);
        ExportMetrics::add_pending_rows(-(released as i64));
        if let Some((last_seq, timer)) = &self.in_flight {
            if release_seq >= *last_seq {
                ExportMetrics::record_delivery_latency_us(timer.elapsed_us());
                self.in_flight = None;
            }
        }
        trace!(
            partition = self.partition,
            signature = %self.signature,
            release_seq,
            released,
            ?origin,
            "Released export rows"
        );

        if origin == AckOrigin::Sink {
            self.forward_ack(release_seq);
        }
        self.try_poll();
    }

    pub(crate) fn remote_ack(&mut self, from: HostId, message: ReleaseBufferMessage) {
        if message.generation < self.generation {
            ExportMetrics::increment_stale_acks();
            trace!(
                partition = self.partition,
                from,
                generation = message.generation,
                current = self.generation,
                "Ignoring ack from an older generation"
            );
            return;
        }
        self.ack(
            message.committed_seq,
            message.committed_seq,
            AckOrigin::Replica(from),
        );
    }

    fn forward_ack(&self, release_seq: u64) {
        let transport = match &self.transport {
            Some(transport) => transport,
            None => return,
        };
        if self.replicas.is_empty() {
            return;
        }
        let message = ReleaseBufferMessage::new(
            self.partition,
            self.signature.as_ref(),
            release_seq,
            self.generation,
        )
        .encode();
        for peer in self.replicas.peers() {
            if let Err(e) = transport.send(*peer, message.clone()) {
                debug!(partition = self.partition, peer, error = %e, "Ack not forwarded");
            }
        }
    }

    /// Pop covered blocks and partially release the one straddling
    /// `release_seq`. Returns the rows released.
    fn release_blocks(&mut self, release_seq: u64) -> u64 {
        let mut released = 0;
        loop {
            let covered = match self.buffer.peek_mut() {
                None => false,
                Some(block) if block.last_seq() <= release_seq => true,
                Some(block) => {
                    if block.start_seq() <= release_seq {
                        released += block.release_to(release_seq);
                    }
                    false
                }
            };
            if !covered {
                break;
            }
            match self.buffer.pop() {
                Ok(Some(block)) => released += block.unreleased_rows(),
                Ok(None) => break,
                Err(e) => crash_local("export buffer release failed", &e),
            }
        }
        released
    }

    fn discard_released(&mut self) {
        while self.buffer.peek().is_some_and(Block::is_fully_released) {
            if let Err(e) = self.buffer.pop() {
                crash_local("export buffer release failed", &e);
            }
        }
    }

    fn on_coordinator_event(&mut self, event: CoordinatorEvent) {
        if self.closed {
            trace!(partition = self.partition, ?event, "Source closed, dropping coordinator event");
            return;
        }
        let progress = ReplicaProgress {
            last_released: self.last_released,
            tracker: &self.tracker,
        };
        if self.coordinator.handle_event(event, progress) == EventOutcome::Reevaluate {
            self.try_poll();
        }
    }

    pub(crate) fn become_leader(&mut self) {
        if !self.closed {
            self.coordinator.become_leader();
        }
    }

    pub(crate) fn set_in_catalog(&mut self, in_catalog: bool) {
        if in_catalog {
            if self.destroyed {
                warn!(
                    partition = self.partition,
                    signature = %self.signature,
                    "Drained export source cannot rejoin the catalog; recreate it"
                );
                return;
            }
            self.in_catalog = true;
            self.dropped = false;
            return;
        }
        if !self.dropped {
            info!(
                partition = self.partition,
                signature = %self.signature,
                pending = self.pending_rows(),
                "Export table dropped, draining"
            );
        }
        self.in_catalog = false;
        self.dropped = true;
        self.try_poll();
    }

    pub(crate) fn update_replicas(&mut self, hosts: Vec<HostId>) {
        self.replicas.update(hosts);
        debug!(
            partition = self.partition,
            signature = %self.signature,
            replicas = %self.replicas,
            "Updated export replicas"
        );
    }

    /// Drop every buffered row after `seq`, as dictated by a snapshot restore
    pub(crate) fn truncate_to_sequence_number(&mut self, seq: u64) {
        let before = self.pending_rows();
        self.reclaim_undelivered();
        if let Err(e) = self.buffer.truncate_to_sequence_number(seq) {
            crash_local("export buffer truncate failed", &e);
        }
        self.tracker.truncate_after(seq);
        self.last_pushed = self.last_pushed.min(seq);

        let rewind = match &self.pending_delivery {
            Some(pending) if pending.last_seq() > seq => {
                let start = pending.start_seq();
                self.pending_delivery = None;
                start
            }
            _ => seq + 1,
        };
        self.first_unpolled = self
            .first_unpolled
            .min(rewind)
            .max(self.last_released + 1);
        ExportMetrics::add_pending_rows(self.pending_rows() as i64 - before as i64);
        info!(
            partition = self.partition,
            signature = %self.signature,
            seq,
            tracker = %self.tracker,
            "Truncated export buffer"
        );
    }

    fn pending_rows(&self) -> u64 {
        self.buffer.iter().map(Block::unreleased_rows).sum()
    }

    pub(crate) fn stats(&self) -> SourceStats {
        SourceStats {
            partition: self.partition,
            signature: self.signature.to_string(),
            generation: self.generation,
            tuples_pushed: self.tuples_pushed,
            tuples_pending: self.pending_rows(),
            buffered_blocks: self.buffer.len(),
            buffered_bytes: self.buffer.size_in_bytes(),
            last_released: self.last_released,
            last_committed: self.last_committed,
            first_unpolled: self.first_unpolled,
            blocked: self.blocked.is_some(),
            gap_width: self.gap_width,
            dropped: self.dropped,
            leader: self.coordinator.leader(),
            is_master: self.coordinator.state().is_master,
        }
    }

    /// Close the source: an outstanding poll sees end of stream, the
    /// coordinator leaves its group, the buffer is synced.
    pub(crate) fn shutdown(&mut self) -> SourceStats {
        if !self.closed {
            self.closed = true;
            if let Some(tx) = self.pending_poll.take() {
                let _ = tx.send(self.handoff(PollResult::EndOfStream));
            }
            self.coordinator.shutdown();
            if !self.destroyed {
                if let Err(e) = self.buffer.sync() {
                    crash_local("export buffer sync failed", &e);
                }
            }
            ExportMetrics::add_pending_rows(-(self.pending_rows() as i64));
            info!(
                partition = self.partition,
                signature = %self.signature,
                last_released = self.last_released,
                "Export source shut down"
            );
        }
        self.stats()
    }
}

/// Cloneable handle queuing operations onto a source's mailbox
#[derive(Clone)]
pub struct SourceHandle {
    partition: PartitionId,
    signature: Arc<str>,
    mailbox: Mailbox<ExportSource>,
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceHandle")
            .field("partition", &self.partition)
            .field("signature", &self.signature)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SourceHandle {
    /// Recover a source over `buffer` and start it on an executor leased
    /// from `pool`.
    ///
    /// Non-replicated sources join their partition's coordination group
    /// through `provider`. Without a provider they never become master.
    pub async fn open(
        pool: &ExecutorPool,
        descriptor: SourceDescriptor,
        buffer: Box<dyn BlockBuffer>,
        provider: Option<Arc<dyn CoordinationProvider>>,
        transport: Option<Arc<dyn AckTransport>>,
    ) -> Result<Self> {
        let partition = descriptor.partition;
        let signature: Arc<str> = Arc::from(descriptor.signature.as_str());
        let replicated = descriptor.replicated;

        let source = ExportSource::open(descriptor, buffer, transport)?;
        let (mailbox, receiver) = mailbox::<ExportSource>();
        receiver.run_on(pool.acquire(), source);
        let handle = Self {
            partition,
            signature,
            mailbox,
        };

        if let Some(provider) = provider.filter(|_| !replicated) {
            let dispatch = handle.dispatcher();
            let joined = handle
                .call(move |s| s.coordinator.initialize(provider.as_ref(), dispatch))
                .await
                .and_then(|r| r.map_err(ExportError::from));
            if let Err(e) = joined {
                warn!(partition, error = %e, "Export source failed to join coordination");
                let _ = handle.shutdown().await;
                return Err(e);
            }
        }
        debug!(partition, signature = %handle.signature, "Export source started");
        Ok(handle)
    }

    /// Coordination callbacks only enqueue work on this source
    fn dispatcher(&self) -> EventDispatcher {
        let mailbox = self.mailbox.clone();
        Arc::new(move |event| {
            mailbox
                .submit(move |s: &mut ExportSource| s.on_coordinator_event(event))
                .is_ok()
        })
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn signature(&self) -> &str {
        &self.signature
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub(crate) fn submit<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut ExportSource) + Send + 'static,
    {
        self.mailbox.submit(f).map_err(|_| ExportError::ShuttingDown)
    }

    async fn call<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&mut ExportSource) -> R + Send + 'static,
        R: Send + 'static,
    {
        self.mailbox.call(f).await.map_err(|_| ExportError::ShuttingDown)
    }

    /// Queue a pushed block. Returns once queued, not once buffered.
    pub fn push(
        &self,
        start_seq: u64,
        committed_seq: u64,
        row_count: u32,
        unique_id: u64,
        data: Bytes,
    ) -> Result<()> {
        self.submit(move |s| s.push(start_seq, committed_seq, row_count, unique_id, data))
    }

    /// Wait for the next block to deliver.
    ///
    /// Only one poll may be outstanding. Dropping the returned future gives
    /// up the poll; a block handed over but never returned from here is
    /// offered again by the next one.
    pub async fn poll(&self) -> Result<PollResult> {
        let rx = self.call(|s| s.poll()).await??;
        rx.await
            .map(Handoff::into_result)
            .map_err(|_| ExportError::ShuttingDown)
    }

    /// Acknowledge delivery up to `release_seq`; forwarded to every replica
    pub fn ack(&self, committed_seq: u64, release_seq: u64) -> Result<()> {
        self.submit(move |s| s.ack(committed_seq, release_seq, AckOrigin::Sink))
    }

    pub(crate) fn remote_ack(&self, from: HostId, message: ReleaseBufferMessage) -> Result<()> {
        self.submit(move |s| s.remote_ack(from, message))
    }

    /// Propose the local host as export leader
    pub fn become_leader(&self) -> Result<()> {
        self.submit(|s| s.become_leader())
    }

    /// Skip the gap the source is blocked on. Returns false if the source is
    /// not blocked or not master.
    pub async fn release(&self) -> Result<bool> {
        self.call(|s| s.release()).await
    }

    pub async fn set_in_catalog(&self, in_catalog: bool) -> Result<()> {
        self.call(move |s| s.set_in_catalog(in_catalog)).await
    }

    pub async fn update_replicas(&self, hosts: Vec<HostId>) -> Result<()> {
        self.call(move |s| s.update_replicas(hosts)).await
    }

    pub async fn truncate_to_sequence_number(&self, seq: u64) -> Result<()> {
        self.call(move |s| s.truncate_to_sequence_number(seq)).await
    }

    pub async fn stats(&self) -> Result<SourceStats> {
        self.call(|s| s.stats()).await
    }

    pub async fn coordinator_state(&self) -> Result<CoordinatorState> {
        self.call(|s| s.coordinator.state().clone()).await
    }

    /// Stop the source. Work queued ahead of the stop still runs.
    pub async fn shutdown(&self) -> Result<SourceStats> {
        self.mailbox
            .stop(|s| s.shutdown())
            .await
            .map_err(|_| ExportError::ShuttingDown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spillway_core::MemoryBlockBuffer;
    use tokio::sync::oneshot::error::TryRecvError;

    fn descriptor(auto_release: bool) -> SourceDescriptor {
        SourceDescriptor {
            partition: 0,
            signature: "orders".to_string(),
            generation: 1,
            host: 1,
            replicated: true,
            replicas: vec![1],
            auto_release,
        }
    }

    fn source(auto_release: bool) -> ExportSource {
        ExportSource::open(descriptor(auto_release), Box::new(MemoryBlockBuffer::new()), None)
            .unwrap()
    }

    fn push(s: &mut ExportSource, start: u64, rows: u32) {
        let last = start + rows as u64 - 1;
        s.push(start, last, rows, 0, Bytes::from(vec![0u8; rows as usize]));
    }

    fn expect_block(rx: &mut oneshot::Receiver<Handoff>) -> ExportBlock {
        match rx.try_recv().map(Handoff::into_result) {
            Ok(PollResult::Block(block)) => block,
            other => panic!("expected a block, got {:?}", other),
        }
    }

    #[test]
    fn test_poll_ack_two_blocks() {
        let mut s = source(false);
        push(&mut s, 1, 100);
        push(&mut s, 101, 100);

        let mut rx = s.poll().unwrap();
        let first = expect_block(&mut rx);
        assert_eq!((first.start_seq(), first.last_seq()), (1, 100));

        s.ack(150, 150, AckOrigin::Sink);
        assert_eq!(s.buffer.len(), 1);
        assert_eq!(s.buffer.peek().unwrap().first_unreleased_seq(), 151);

        let mut rx = s.poll().unwrap();
        let second = expect_block(&mut rx);
        assert_eq!((second.start_seq(), second.last_seq()), (101, 200));
        assert_eq!(second.first_unreleased_seq(), 151);

        s.ack(200, 200, AckOrigin::Sink);
        assert!(s.buffer.is_empty());
        assert!(s.tracker.is_empty());
        assert_eq!(s.first_unpolled, 201);

        push(&mut s, 201, 10);
        assert_eq!(s.tracker.first_seq(), Some(201));
    }

    #[test]
    fn test_gap_blocks_until_release() {
        let mut s = source(false);
        push(&mut s, 1, 50);
        push(&mut s, 101, 50);

        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).last_seq(), 50);

        let mut rx = s.poll().unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        let stats = s.stats();
        assert!(stats.blocked);
        assert_eq!(stats.gap_width, 50);

        assert!(s.release());
        let block = expect_block(&mut rx);
        assert_eq!(block.start_seq(), 101);
        assert!(!s.stats().blocked);
        assert!(!s.release());
    }

    #[test]
    fn test_auto_release_skips_gap() {
        let mut s = source(true);
        push(&mut s, 1, 50);
        push(&mut s, 101, 50);

        let mut rx = s.poll().unwrap();
        expect_block(&mut rx);
        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 101);
        assert!(!s.stats().blocked);
    }

    #[test]
    fn test_ack_past_gap_clears_block() {
        let mut s = source(false);
        push(&mut s, 1, 50);
        push(&mut s, 101, 50);
        let mut rx = s.poll().unwrap();
        expect_block(&mut rx);
        let mut rx = s.poll().unwrap();
        assert!(s.stats().blocked);

        // Another replica delivered the missing rows
        s.remote_ack(2, ReleaseBufferMessage::new(0, "orders", 120, 1));
        assert!(!s.stats().blocked);
        let block = expect_block(&mut rx);
        assert_eq!(block.first_unreleased_seq(), 121);
    }

    #[test]
    fn test_ack_is_idempotent() {
        let mut s = source(false);
        push(&mut s, 1, 100);
        push(&mut s, 101, 100);

        s.ack(150, 150, AckOrigin::Sink);
        let once = s.stats();
        s.ack(150, 150, AckOrigin::Sink);
        assert_eq!(s.stats(), once);
        s.ack(120, 120, AckOrigin::Sink);
        assert_eq!(s.stats(), once);
        assert_eq!(once.last_released, 150);
        assert_eq!(once.tuples_pending, 50);
    }

    #[test]
    fn test_second_poll_rejected() {
        let mut s = source(false);
        let _rx = s.poll().unwrap();
        assert!(matches!(
            s.poll(),
            Err(ExportError::PollInProgress { partition: 0, .. })
        ));
    }

    #[test]
    fn test_abandoned_poll_keeps_block() {
        let mut s = source(false);
        let rx = s.poll().unwrap();
        drop(rx);
        push(&mut s, 1, 10);
        assert_eq!(s.first_unpolled, 1);

        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 1);
    }

    #[test]
    fn test_rejected_handoff_goes_to_pending_delivery() {
        let mut s = source(false);
        push(&mut s, 1, 10);
        push(&mut s, 11, 10);
        let block = ExportBlock {
            partition: 0,
            signature: Arc::from("orders"),
            block: s.buffer.peek().unwrap().clone(),
        };
        let (tx, rx) = oneshot::channel();
        drop(rx);
        s.deliver(tx, block.clone());
        assert!(s.pending_delivery.is_some());

        // A partial ack moves the pending block's release point
        s.ack(5, 5, AckOrigin::Sink);
        let mut rx = s.poll().unwrap();
        let redelivered = expect_block(&mut rx);
        assert_eq!(redelivered.start_seq(), 1);
        assert_eq!(redelivered.first_unreleased_seq(), 6);

        let (tx, rx) = oneshot::channel();
        drop(rx);
        s.deliver(tx, block);
        s.ack(10, 10, AckOrigin::Sink);
        assert!(s.pending_delivery.is_none());
    }

    #[test]
    fn test_handoff_dropped_unread_is_offered_again() {
        let mut s = source(false);
        let rx = s.poll().unwrap();
        push(&mut s, 1, 10);
        assert_eq!(s.first_unpolled, 11);

        // The consumer goes away after the block was sent but before reading it
        drop(rx);
        push(&mut s, 11, 10);

        let mut rx = s.poll().unwrap();
        let block = expect_block(&mut rx);
        assert_eq!((block.start_seq(), block.last_seq()), (1, 10));
        assert_eq!(block.first_unreleased_seq(), 1);

        s.ack(10, 10, AckOrigin::Sink);
        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 11);
    }

    #[test]
    fn test_handoff_taken_is_not_offered_again() {
        let mut s = source(false);
        push(&mut s, 1, 10);
        push(&mut s, 11, 10);

        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 1);
        drop(rx);
        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 11);
    }

    #[test]
    fn test_handoff_dropped_after_ack_is_forgotten() {
        let mut s = source(false);
        push(&mut s, 1, 10);
        push(&mut s, 11, 10);
        let rx = s.poll().unwrap();

        // Another replica released the rows before the consumer went away
        s.remote_ack(2, ReleaseBufferMessage::new(0, "orders", 10, 1));
        drop(rx);

        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 11);
    }

    #[test]
    fn test_push_beyond_sequence_space_discarded() {
        let mut s = source(false);
        s.push(INFINITE_SEQNO - 5, 0, 10, 0, Bytes::from(vec![0u8; 10]));
        s.push(u64::MAX, 0, 2, 0, Bytes::from(vec![0u8; 2]));
        assert!(s.buffer.is_empty());
        assert!(s.tracker.is_empty());
        assert_eq!(s.stats().tuples_pushed, 0);

        push(&mut s, 1, 10);
        assert_eq!(s.buffer.len(), 1);
    }

    #[test]
    fn test_ack_beyond_sequence_space_ignored() {
        let mut s = source(false);
        push(&mut s, 1, 10);
        s.ack(u64::MAX, u64::MAX, AckOrigin::Sink);
        s.ack(INFINITE_SEQNO, INFINITE_SEQNO, AckOrigin::Replica(2));
        assert_eq!(s.stats().last_released, 0);
        assert_eq!(s.buffer.len(), 1);

        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 1);
    }

    #[test]
    fn test_overlapping_push_adds_only_new_tail() {
        let mut s = source(false);
        push(&mut s, 1, 10);
        push(&mut s, 6, 10);
        assert_eq!(s.tracker.to_string(), "[1,15]");
        assert_eq!(s.stats().tuples_pending, 15);

        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).last_seq(), 10);
        s.ack(10, 10, AckOrigin::Sink);

        let mut rx = s.poll().unwrap();
        let tail = expect_block(&mut rx);
        assert_eq!((tail.start_seq(), tail.last_seq()), (6, 15));
        assert_eq!(tail.first_unreleased_seq(), 11);
    }

    #[test]
    fn test_push_below_release_point_discarded() {
        let mut s = source(false);
        s.remote_ack(2, ReleaseBufferMessage::new(0, "orders", 150, 1));

        push(&mut s, 1, 100);
        assert!(s.buffer.is_empty());
        assert_eq!(s.stats().tuples_pushed, 100);

        push(&mut s, 101, 100);
        let block = s.buffer.peek().unwrap();
        assert_eq!(block.first_unreleased_seq(), 151);
        assert_eq!(s.tracker.first_seq(), Some(151));

        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).first_unreleased_seq(), 151);
    }

    #[test]
    fn test_stale_generation_ack_ignored() {
        let mut s = source(false);
        push(&mut s, 1, 10);
        s.remote_ack(2, ReleaseBufferMessage::new(0, "orders", 10, 0));
        assert_eq!(s.stats().last_released, 0);
        assert_eq!(s.buffer.len(), 1);
    }

    #[test]
    fn test_dropped_source_drains_to_end_of_stream() {
        let mut s = source(false);
        push(&mut s, 1, 10);
        s.set_in_catalog(false);

        push(&mut s, 11, 10);
        assert_eq!(s.buffer.len(), 1);

        let mut rx = s.poll().unwrap();
        expect_block(&mut rx);
        let mut rx = s.poll().unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));

        s.ack(10, 10, AckOrigin::Sink);
        assert!(matches!(rx.try_recv().map(Handoff::into_result), Ok(PollResult::EndOfStream)));
        assert!(s.stats().dropped);
    }

    #[test]
    fn test_not_master_defers_poll() {
        let mut d = descriptor(false);
        d.replicated = false;
        let mut s = ExportSource::open(d, Box::new(MemoryBlockBuffer::new()), None).unwrap();
        push(&mut s, 1, 10);

        let mut rx = s.poll().unwrap();
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
        assert!(!s.release());
        assert!(!s.stats().is_master);
    }

    #[test]
    fn test_truncate_rewinds_poll_pointer() {
        let mut s = source(false);
        push(&mut s, 1, 100);
        s.truncate_to_sequence_number(60);
        assert_eq!(s.tracker.last_seq(), Some(60));
        assert_eq!(s.stats().tuples_pending, 60);

        // The engine replays from 61
        push(&mut s, 61, 20);
        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).last_seq(), 60);
        let mut rx = s.poll().unwrap();
        assert_eq!(expect_block(&mut rx).start_seq(), 61);
    }

    #[test]
    fn test_shutdown_ends_outstanding_poll() {
        let mut s = source(false);
        let mut rx = s.poll().unwrap();
        s.shutdown();
        assert!(matches!(rx.try_recv().map(Handoff::into_result), Ok(PollResult::EndOfStream)));

        let mut rx = s.poll().unwrap();
        assert!(matches!(rx.try_recv().map(Handoff::into_result), Ok(PollResult::EndOfStream)));
        push(&mut s, 1, 10);
        assert!(s.buffer.is_empty());
    }
}
