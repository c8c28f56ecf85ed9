//! Multi-host mastership tests over the in-process coordination hub
//!
//! Each simulated host owns a coordinator and a tracker inside a mailbox on a
//! shared executor pool, exactly as an export source does.

use spillway_cluster::{
    CoordinationHub, EventDispatcher, EventOutcome, Lifecycle, MastershipCoordinator,
    MastershipDecision, ReplicaProgress,
};
use spillway_core::{mailbox, ExecutorPool, Mailbox, SequenceTracker};
use std::sync::Arc;
use std::time::Duration;

struct Replica {
    coordinator: MastershipCoordinator,
    tracker: SequenceTracker,
    last_released: u64,
    reevaluations: u32,
}

type Host = Mailbox<Replica>;

fn tracker(ranges: &[(u64, u64)]) -> SequenceTracker {
    let mut t = SequenceTracker::new();
    for (s, e) in ranges {
        t.add_range(*s, *e);
    }
    t
}

async fn spawn_host(
    pool: &ExecutorPool,
    hub: &CoordinationHub,
    host: u32,
    ranges: &[(u64, u64)],
) -> Result<Host, Box<dyn std::error::Error>> {
    let (mb, rx) = mailbox::<Replica>();
    rx.run_on(
        pool.acquire(),
        Replica {
            coordinator: MastershipCoordinator::new(host, 0, "orders"),
            tracker: tracker(ranges),
            last_released: 0,
            reevaluations: 0,
        },
    );

    let events = mb.clone();
    let dispatch: EventDispatcher = Arc::new(move |event| {
        events
            .submit(move |r: &mut Replica| {
                let progress = ReplicaProgress {
                    last_released: r.last_released,
                    tracker: &r.tracker,
                };
                if r.coordinator.handle_event(event, progress) == EventOutcome::Reevaluate {
                    r.reevaluations += 1;
                }
            })
            .is_ok()
    });

    let hub = hub.clone();
    mb.call(move |r| r.coordinator.initialize(&hub, dispatch))
        .await??;
    Ok(mb)
}

/// Wait until `check` holds on the host's state
async fn eventually<F>(host: &Host, check: F) -> bool
where
    F: Fn(&mut Replica) -> bool + Send + Sync + Clone + 'static,
{
    for _ in 0..200 {
        let check = check.clone();
        if host.call(move |r| check(r)).await.unwrap_or(false) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn decision(host: &Host, seq: u64) -> MastershipDecision {
    host.call(move |r| r.coordinator.evaluate_mastership(seq))
        .await
        .unwrap()
}

async fn initialized(host: &Host) -> bool {
    eventually(host, |r| r.coordinator.state().lifecycle == Lifecycle::Initialized).await
}

#[tokio::test]
async fn test_gap_on_leader_is_covered_by_lowest_replica() -> Result<(), Box<dyn std::error::Error>> {
    let pool = ExecutorPool::new("mastership", 2)?;
    let hub = CoordinationHub::new();

    let h1 = spawn_host(&pool, &hub, 1, &[(1, 100), (201, 300)]).await?;
    let h2 = spawn_host(&pool, &hub, 2, &[(1, 300)]).await?;
    let h3 = spawn_host(&pool, &hub, 3, &[(1, 300)]).await?;
    for h in [&h1, &h2, &h3] {
        assert!(initialized(h).await);
    }

    h1.call(|r| r.coordinator.become_leader()).await?;
    for h in [&h1, &h2, &h3] {
        assert!(eventually(h, |r| r.coordinator.state().trackers.len() == 3).await);
        assert_eq!(h.call(|r| r.coordinator.leader()).await?, Some(1));
    }

    assert_eq!(decision(&h1, 50).await, MastershipDecision::Master);
    assert_eq!(decision(&h2, 50).await, MastershipDecision::Replica(1));

    assert_eq!(decision(&h1, 150).await, MastershipDecision::Replica(2));
    assert_eq!(decision(&h2, 150).await, MastershipDecision::Master);
    assert_eq!(decision(&h3, 150).await, MastershipDecision::Replica(2));
    assert_eq!(
        h2.call(|r| r.coordinator.state().safe_point).await?,
        200
    );

    assert_eq!(decision(&h1, 201).await, MastershipDecision::Master);
    assert_eq!(decision(&h2, 201).await, MastershipDecision::Replica(1));
    Ok(())
}

#[tokio::test]
async fn test_leader_departure_and_takeover() -> Result<(), Box<dyn std::error::Error>> {
    let pool = ExecutorPool::new("failover", 2)?;
    let hub = CoordinationHub::new();

    let h1 = spawn_host(&pool, &hub, 1, &[(1, 100)]).await?;
    let h2 = spawn_host(&pool, &hub, 2, &[(1, 100)]).await?;
    assert!(initialized(&h1).await && initialized(&h2).await);

    h1.call(|r| r.coordinator.become_leader()).await?;
    assert!(eventually(&h2, |r| r.coordinator.state().trackers.len() == 2).await);
    assert_eq!(decision(&h2, 10).await, MastershipDecision::Replica(1));

    // host 1 goes away
    assert!(h1.stop(|r| r.coordinator.shutdown()).await?);
    assert!(eventually(&h2, |r| r.coordinator.leader().is_none()).await);
    assert_eq!(decision(&h2, 10).await, MastershipDecision::Undecided);

    h2.call(|r| r.coordinator.become_leader()).await?;
    assert!(eventually(&h2, |r| r.coordinator.state().trackers.len() == 1).await);
    assert_eq!(decision(&h2, 10).await, MastershipDecision::Master);
    assert_eq!(hub.members("export/orders/0"), vec![2]);
    Ok(())
}

#[tokio::test]
async fn test_uncovered_gap_blocks_leader() -> Result<(), Box<dyn std::error::Error>> {
    let pool = ExecutorPool::new("blocked", 1)?;
    let hub = CoordinationHub::new();

    let h1 = spawn_host(&pool, &hub, 1, &[(1, 50), (101, 150)]).await?;
    let h2 = spawn_host(&pool, &hub, 2, &[(1, 50), (101, 150)]).await?;
    assert!(initialized(&h1).await && initialized(&h2).await);

    h1.call(|r| r.coordinator.become_leader()).await?;
    for h in [&h1, &h2] {
        assert!(eventually(h, |r| r.coordinator.state().trackers.len() == 2).await);
    }

    assert_eq!(
        decision(&h1, 51).await,
        MastershipDecision::Blocked { gap: (51, 100) }
    );
    assert!(h1.call(|r| r.coordinator.is_export_master(60)).await?);
    assert_eq!(decision(&h2, 51).await, MastershipDecision::Replica(1));
    assert_eq!(decision(&h1, 101).await, MastershipDecision::Master);
    Ok(())
}

#[tokio::test]
async fn test_joining_replica_triggers_new_round() -> Result<(), Box<dyn std::error::Error>> {
    let pool = ExecutorPool::new("join", 2)?;
    let hub = CoordinationHub::new();

    let h1 = spawn_host(&pool, &hub, 1, &[(1, 50), (101, 150)]).await?;
    assert!(initialized(&h1).await);
    h1.call(|r| r.coordinator.become_leader()).await?;
    assert!(eventually(&h1, |r| r.coordinator.state().trackers.len() == 1).await);
    assert!(matches!(
        decision(&h1, 60).await,
        MastershipDecision::Blocked { .. }
    ));

    // a replica holding the missing rows rejoins
    let h2 = spawn_host(&pool, &hub, 2, &[(1, 150)]).await?;
    assert!(initialized(&h2).await);
    for h in [&h1, &h2] {
        assert!(eventually(h, |r| r.coordinator.state().trackers.len() == 2).await);
    }
    assert_eq!(decision(&h1, 60).await, MastershipDecision::Replica(2));
    assert_eq!(decision(&h2, 60).await, MastershipDecision::Master);
    assert!(h1.call(|r| r.reevaluations).await? > 0);
    Ok(())
}
