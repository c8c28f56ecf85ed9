//! Multi-host export tests over the in-process coordination hub and ack router

use bytes::Bytes;
use spillway_cluster::{CoordinationHub, CoordinationProvider, HostId, LocalAckRouter};
use spillway_core::ExecutorPool;
use spillway_export::{
    ControlOperation, ExportBlock, ExportConfig, ExportGeneration, PollResult, SourceStats,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TABLE: &str = "orders";
const WAIT: Duration = Duration::from_secs(5);

struct Cluster {
    hub: Arc<CoordinationHub>,
    router: LocalAckRouter,
    pool: Arc<ExecutorPool>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            hub: Arc::new(CoordinationHub::new()),
            router: LocalAckRouter::new(),
            pool: Arc::new(ExecutorPool::new("failover-test", 2).unwrap()),
        }
    }

    async fn host(&self, host: HostId) -> Arc<ExportGeneration> {
        let provider: Arc<dyn CoordinationProvider> = self.hub.clone();
        let generation = Arc::new(
            ExportGeneration::new(
                1,
                ExportConfig::new().with_host_id(host),
                self.pool.clone(),
                Some(provider),
                Some(self.router.endpoint(host)),
            )
            .unwrap(),
        );
        self.router.register(host, generation.ack_handler());
        generation.update_replicas(0, vec![1, 2]).await.unwrap();
        generation.create_source(0, TABLE, false).await.unwrap();
        generation
    }
}

async fn push(g: &ExportGeneration, start: u64, last: u64) {
    let rows = (last - start + 1) as u32;
    g.push(0, TABLE, start, last, rows, 0, Bytes::from(vec![1u8; rows as usize]))
        .await
        .unwrap();
}

async fn poll_block(g: &ExportGeneration) -> ExportBlock {
    match timeout(WAIT, g.poll(0, TABLE)).await.expect("poll timed out") {
        Ok(PollResult::Block(block)) => block,
        other => panic!("expected a block, got {:?}", other),
    }
}

async fn stats(g: &ExportGeneration) -> SourceStats {
    g.source(0, TABLE).unwrap().stats().await.unwrap()
}

async fn eventually(g: &ExportGeneration, what: &str, check: impl Fn(&SourceStats) -> bool) {
    for _ in 0..500 {
        if check(&stats(g).await) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test]
async fn test_leader_exports_and_replica_releases() {
    let cluster = Cluster::new();
    let one = cluster.host(1).await;
    let two = cluster.host(2).await;
    push(&one, 1, 100).await;
    push(&two, 1, 100).await;

    assert_eq!(one.accept_mastership(0).unwrap(), 1);
    let block = poll_block(&one).await;
    assert_eq!((block.start_seq(), block.last_seq()), (1, 100));
    assert!(stats(&one).await.is_master);
    assert!(!stats(&two).await.is_master);
    assert_eq!(stats(&two).await.leader, Some(1));

    one.ack(0, TABLE, 100, 100).unwrap();
    eventually(&two, "replica release", |s| {
        s.last_released == 100 && s.buffered_blocks == 0
    })
    .await;

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test]
async fn test_replica_takes_over_after_leader_leaves() {
    let cluster = Cluster::new();
    let one = cluster.host(1).await;
    let two = cluster.host(2).await;
    for g in [&one, &two] {
        push(g, 1, 100).await;
        push(g, 101, 200).await;
    }

    one.accept_mastership(0).unwrap();
    assert_eq!(poll_block(&one).await.last_seq(), 100);
    one.ack(0, TABLE, 100, 100).unwrap();
    eventually(&two, "replica release", |s| s.last_released == 100).await;

    cluster.router.unregister(1);
    one.shutdown().await;
    eventually(&two, "leader departure", |s| s.leader.is_none()).await;

    two.accept_mastership(0).unwrap();
    let block = poll_block(&two).await;
    assert_eq!((block.start_seq(), block.last_seq()), (101, 200));
    assert_eq!(block.first_unreleased_seq(), 101);
    assert_eq!(stats(&two).await.leader, Some(2));

    two.ack(0, TABLE, 200, 200).unwrap();
    eventually(&two, "final release", |s| s.tuples_pending == 0).await;
    two.shutdown().await;
}

#[tokio::test]
async fn test_replica_covers_leader_gap() {
    let cluster = Cluster::new();
    let one = cluster.host(1).await;
    let two = cluster.host(2).await;
    push(&one, 1, 50).await;
    push(&one, 101, 150).await;
    push(&two, 1, 50).await;
    push(&two, 51, 100).await;
    push(&two, 101, 150).await;

    let replica_poll = {
        let source = two.source(0, TABLE).unwrap();
        tokio::spawn(async move { source.poll().await })
    };
    one.accept_mastership(0).unwrap();

    assert_eq!(poll_block(&one).await.last_seq(), 50);
    let leader_poll = {
        let source = one.source(0, TABLE).unwrap();
        tokio::spawn(async move { source.poll().await })
    };
    one.ack(0, TABLE, 50, 50).unwrap();

    let covered = match timeout(WAIT, replica_poll).await.unwrap().unwrap().unwrap() {
        PollResult::Block(block) => block,
        other => panic!("expected the gap rows from the replica, got {:?}", other),
    };
    assert_eq!((covered.start_seq(), covered.last_seq()), (51, 100));
    assert!(!stats(&one).await.blocked);
    assert!(!leader_poll.is_finished());

    two.ack(0, TABLE, 100, 100).unwrap();
    match timeout(WAIT, leader_poll).await.unwrap().unwrap().unwrap() {
        PollResult::Block(block) => assert_eq!((block.start_seq(), block.last_seq()), (101, 150)),
        other => panic!("expected the leader to resume, got {:?}", other),
    }
    assert_eq!(stats(&one).await.last_released, 100);

    one.shutdown().await;
    two.shutdown().await;
}

#[tokio::test]
async fn test_uncovered_gap_blocks_leader_until_release() {
    let cluster = Cluster::new();
    let one = cluster.host(1).await;
    let two = cluster.host(2).await;
    push(&one, 1, 50).await;
    push(&one, 101, 150).await;
    push(&two, 1, 50).await;

    one.accept_mastership(0).unwrap();
    assert_eq!(poll_block(&one).await.last_seq(), 50);
    one.ack(0, TABLE, 50, 50).unwrap();

    let replica_poll = {
        let source = two.source(0, TABLE).unwrap();
        tokio::spawn(async move { source.poll().await })
    };
    let leader_poll = {
        let source = one.source(0, TABLE).unwrap();
        tokio::spawn(async move { source.poll().await })
    };
    eventually(&one, "leader blocked", |s| s.blocked && s.gap_width == 50).await;
    assert!(stats(&one).await.is_master);

    // Only the leader may skip the gap
    assert!(!two.control(0, TABLE, ControlOperation::Release).await.unwrap());
    assert!(one.control(0, TABLE, ControlOperation::Release).await.unwrap());

    match timeout(WAIT, leader_poll).await.unwrap().unwrap().unwrap() {
        PollResult::Block(block) => assert_eq!(block.start_seq(), 101),
        other => panic!("expected the leader to resume, got {:?}", other),
    }
    one.ack(0, TABLE, 150, 150).unwrap();
    eventually(&two, "replica release", |s| s.last_released == 150).await;
    assert!(!replica_poll.is_finished());

    one.shutdown().await;
    two.shutdown().await;
    assert!(matches!(
        timeout(WAIT, replica_poll).await.unwrap().unwrap(),
        Ok(PollResult::EndOfStream)
    ));
}
