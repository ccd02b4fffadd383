//! End-to-end coordinator tests against an in-process cluster.
//!
//! Time is paused: tokio advances the clock whenever every task is idle, so
//! deadlines of several seconds elapse instantly and deterministically.

use std::collections::BTreeSet;
use std::time::Duration;

use proptest::prelude::*;
use quorum_kit::coordinator::{
    Deadline, Event, ReadEffect, ReadFsm, ReadRequest, WriteEffect, WriteFsm, WriteRequest,
};
use quorum_kit::prelude::*;
use quorum_kit::replica::{ReadResult, ReplicaReply, ReplySender, RequestId, WriteResult};
use quorum_kit::{ConfigError, WriteFailure};

type Cluster = MemoryCluster<String>;
type TestCoordinator = Coordinator<String, Cluster, Cluster>;

fn setup(nodes: usize, config: CoordinatorConfig) -> (Cluster, TestCoordinator) {
    let cluster = MemoryCluster::new(nodes, config.n_val);
    let coordinator = Coordinator::new(cluster.clone(), cluster.clone(), config).unwrap();
    (cluster, coordinator)
}

fn node(cluster: &Cluster, i: usize) -> Location {
    cluster.locations()[i].clone()
}

fn s(v: &str) -> String {
    v.to_string()
}

// ============================================================================
// Reads
// ============================================================================

#[tokio::test(start_paused = true)]
async fn read_your_quorum_write() {
    let (_, coordinator) = setup(3, CoordinatorConfig::default());

    let reply = coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();
    assert_eq!(reply, WriteReply::Ok);

    match coordinator.get("k").await.unwrap() {
        ReadReply::Ok { values, context } => {
            assert_eq!(values, vec![s("v")]);
            assert!(!context.is_empty());
        }
        other => panic!("expected value, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn missing_key_reads_as_not_found() {
    let (_, coordinator) = setup(3, CoordinatorConfig::default());
    let reply = coordinator.get("nothing").await.unwrap();
    assert_eq!(
        reply,
        ReadReply::NotFound {
            context: VersionVector::new()
        }
    );
}

#[tokio::test(start_paused = true)]
async fn stale_replica_is_repaired_after_quorum_read() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    let lagging = node(&cluster, 2);

    // node-2 misses the write.
    cluster.set_behavior(&lagging, Behavior::Unreachable);
    let reply = coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();
    assert_eq!(reply, WriteReply::Ok);
    assert!(cluster.object_at(&lagging, "k").await.is_none());

    // It comes back and answers not_found; the read still sees the value.
    cluster.set_behavior(&lagging, Behavior::Healthy);
    let mut handle = coordinator.spawn_read("k", ReadOptions::default()).unwrap();
    match handle.reply().await.unwrap() {
        ReadReply::Ok { values, .. } => assert_eq!(values, vec![s("v")]),
        other => panic!("expected value, got {other:?}"),
    }
    handle.finished().await.unwrap();

    let repaired = cluster.object_at(&lagging, "k").await.unwrap();
    assert_eq!(repaired.values(), vec![&s("v")]);
    assert_eq!(repaired.context().get("node-0"), 1);
    assert_eq!(repaired.context().get("node-1"), 1);
}

#[tokio::test(start_paused = true)]
async fn repairs_converge_every_replica() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();

    let handle = coordinator.spawn_read("k", ReadOptions::default()).unwrap();
    handle.finished().await.unwrap();

    let first = cluster.object_at(&node(&cluster, 0), "k").await.unwrap();
    for i in 1..3 {
        let obj = cluster.object_at(&node(&cluster, i), "k").await.unwrap();
        assert_eq!(obj, first);
    }
    assert_eq!(first.values(), vec![&s("v")]);
}

#[tokio::test(start_paused = true)]
async fn repair_can_be_disabled() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    let lagging = node(&cluster, 2);
    cluster.set_behavior(&lagging, Behavior::Unreachable);
    coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();
    cluster.set_behavior(&lagging, Behavior::Healthy);

    let options = ReadOptions {
        read_repair: false,
        ..ReadOptions::default()
    };
    let handle = coordinator.spawn_read("k", options).unwrap();
    handle.finished().await.unwrap();

    assert!(cluster.object_at(&lagging, "k").await.is_none());
}

#[tokio::test(start_paused = true)]
async fn read_times_out_without_quorum() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    cluster.set_behavior(&node(&cluster, 1), Behavior::Unreachable);
    cluster.set_behavior(&node(&cluster, 2), Behavior::Unreachable);

    assert_eq!(coordinator.get("k").await.unwrap(), ReadReply::Timeout);
}

#[tokio::test(start_paused = true)]
async fn late_replies_after_timeout_are_ignored() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    cluster.set_behavior(&node(&cluster, 1), Behavior::Delayed(Duration::from_secs(30)));
    cluster.set_behavior(&node(&cluster, 2), Behavior::Delayed(Duration::from_secs(30)));

    let mut handle = coordinator.spawn_read("k", ReadOptions::default()).unwrap();
    assert_eq!(handle.reply().await.unwrap(), ReadReply::Timeout);

    // The stragglers arrive long after the coordinator is gone.
    tokio::time::sleep(Duration::from_secs(60)).await;
    handle.finished().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_reads_count_toward_quorum() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();

    cluster.set_behavior(&node(&cluster, 0), Behavior::Failing);
    cluster.set_behavior(&node(&cluster, 1), Behavior::Failing);

    let options = ReadOptions {
        r: Quorum::All,
        ..ReadOptions::default()
    };
    match coordinator.get_with("k", options).await.unwrap() {
        ReadReply::Ok { values, .. } => assert_eq!(values, vec![s("v")]),
        other => panic!("expected value, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn acknowledged_read_carries_no_values() {
    let (_, coordinator) = setup(3, CoordinatorConfig::default());
    coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();

    let options = ReadOptions {
        return_value: false,
        ..ReadOptions::default()
    };
    assert_eq!(
        coordinator.get_with("k", options).await.unwrap(),
        ReadReply::Acknowledged
    );
}

#[tokio::test(start_paused = true)]
async fn reply_is_delivered_once() {
    let (_, coordinator) = setup(3, CoordinatorConfig::default());
    let mut handle = coordinator.spawn_read("k", ReadOptions::default()).unwrap();
    let id = handle.request_id();

    handle.reply().await.unwrap();
    assert_eq!(handle.reply().await, Err(CoordinatorError::ReplyTaken(id)));
}

/// Delegates to the cluster but panics when asked to read `key`.
struct PanicsOnRead {
    inner: Cluster,
    key: &'static str,
}

impl ReplicaService<String> for PanicsOnRead {
    fn read(&self, location: &Location, key: &str, reply_to: ReplySender<ReadResult<String>>) {
        if key == self.key {
            panic!("replica service failed reading {key}");
        }
        self.inner.read(location, key, reply_to);
    }

    fn write(
        &self,
        location: &Location,
        key: &str,
        value: Value<String>,
        context: VersionVector,
        reply_to: ReplySender<WriteResult>,
    ) {
        self.inner.write(location, key, value, context, reply_to);
    }

    fn repair(&self, location: &Location, key: &str, object: CausalObject<String>) {
        self.inner.repair(location, key, object);
    }
}

#[tokio::test(start_paused = true)]
async fn crashed_coordinator_fails_only_its_own_request() {
    let cluster = MemoryCluster::new(3, 3);
    let service = PanicsOnRead {
        inner: cluster.clone(),
        key: "boom",
    };
    let coordinator = Coordinator::new(cluster.clone(), service, CoordinatorConfig::default()).unwrap();

    let mut boom = coordinator.spawn_read("boom", ReadOptions::default()).unwrap();
    let mut fine = coordinator.spawn_read("fine", ReadOptions::default()).unwrap();
    let boom_id = boom.request_id();

    assert_eq!(boom.reply().await, Err(CoordinatorError::Crashed(boom_id)));
    assert_eq!(
        fine.reply().await.unwrap(),
        ReadReply::NotFound {
            context: VersionVector::new()
        }
    );
    assert_eq!(boom.finished().await, Err(CoordinatorError::Crashed(boom_id)));
    fine.finished().await.unwrap();

    // The family keeps serving after the crash.
    let reply = coordinator.put("fine", s("v"), VersionVector::new()).await.unwrap();
    assert_eq!(reply, WriteReply::Ok);
}

// ============================================================================
// Writes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn write_fails_early_when_quorum_is_unreachable() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    cluster.set_behavior(&node(&cluster, 0), Behavior::Failing);
    cluster.set_behavior(&node(&cluster, 1), Behavior::Failing);

    let reply = coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();
    assert!(
        matches!(
            reply,
            WriteReply::Error(WriteFailure::TooManyFailures {
                nacks: 2,
                required: 2,
                ..
            })
        ),
        "unexpected {reply:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn write_times_out_without_quorum() {
    let (cluster, coordinator) = setup(3, CoordinatorConfig::default());
    cluster.set_behavior(&node(&cluster, 0), Behavior::Unreachable);
    cluster.set_behavior(&node(&cluster, 1), Behavior::Unreachable);

    let reply = coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();
    assert_eq!(reply, WriteReply::Timeout);
}

#[tokio::test(start_paused = true)]
async fn write_with_w_one_succeeds_with_one_live_replica() {
    let config = CoordinatorConfig::builder()
        .write_quorum(Quorum::One)
        .build()
        .unwrap();
    let (cluster, coordinator) = setup(3, config);
    cluster.set_behavior(&node(&cluster, 0), Behavior::Unreachable);
    cluster.set_behavior(&node(&cluster, 1), Behavior::Failing);

    let reply = coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();
    assert_eq!(reply, WriteReply::Ok);
}

#[tokio::test(start_paused = true)]
async fn concurrent_writes_become_siblings() {
    let (_, coordinator) = setup(3, CoordinatorConfig::default());
    let ctx = VersionVector::new();

    let (a, b) = tokio::join!(
        coordinator.put("k", s("left"), ctx.clone()),
        coordinator.put("k", s("right"), ctx.clone()),
    );
    assert_eq!(a.unwrap(), WriteReply::Ok);
    assert_eq!(b.unwrap(), WriteReply::Ok);

    let options = ReadOptions {
        r: Quorum::All,
        ..ReadOptions::default()
    };
    let context = match coordinator.get_with("k", options).await.unwrap() {
        ReadReply::Ok { values, context } => {
            assert_eq!(values, vec![s("left"), s("right")]);
            context
        }
        other => panic!("expected siblings, got {other:?}"),
    };

    // A write carrying the merged context resolves the conflict.
    coordinator.put("k", s("resolved"), context).await.unwrap();
    let options = ReadOptions {
        r: Quorum::All,
        ..ReadOptions::default()
    };
    match coordinator.get_with("k", options).await.unwrap() {
        ReadReply::Ok { values, .. } => assert_eq!(values, vec![s("resolved")]),
        other => panic!("expected one value, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn delete_leaves_context_behind() {
    let (_, coordinator) = setup(3, CoordinatorConfig::default());
    coordinator.put("k", s("v"), VersionVector::new()).await.unwrap();

    let all = ReadOptions {
        r: Quorum::All,
        ..ReadOptions::default()
    };
    let ReadReply::Ok { context, .. } = coordinator.get_with("k", all.clone()).await.unwrap() else {
        panic!("expected value");
    };
    assert_eq!(coordinator.delete("k", context).await.unwrap(), WriteReply::Ok);

    match coordinator.get_with("k", all).await.unwrap() {
        ReadReply::NotFound { context } => assert!(!context.is_empty()),
        other => panic!("expected not found, got {other:?}"),
    }
}

// ============================================================================
// Request validation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn too_few_replicas_is_rejected_up_front() {
    let (_, coordinator) = setup(1, CoordinatorConfig::default());
    let err = coordinator.get("k").await.unwrap_err();
    assert!(
        matches!(
            err,
            CoordinatorError::InsufficientReplicas {
                available: 1,
                required: 2,
                ..
            }
        ),
        "unexpected {err:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn invalid_quorum_is_rejected() {
    let (_, coordinator) = setup(3, CoordinatorConfig::default());
    let options = ReadOptions {
        r: Quorum::Exactly(4),
        ..ReadOptions::default()
    };
    let err = coordinator.get_with("k", options).await.unwrap_err();
    assert_eq!(
        err,
        CoordinatorError::Config(ConfigError::QuorumOutOfRange { quorum: 4, n_val: 3 })
    );
}

// ============================================================================
// Reply order
// ============================================================================

const ID: RequestId = RequestId::new(7);

fn replica_states() -> Vec<(Location, ReadResult<String>)> {
    let a = CausalObject::with_value("node-0", s("a"));
    let mut b = a.clone();
    b.apply_write("node-1", Value::Live(s("b")), a.context());
    let c = CausalObject::with_value("node-2", s("c"));

    vec![
        (Location::from("node-0"), ReadResult::Found(a)),
        (Location::from("node-1"), ReadResult::Found(b)),
        (Location::from("node-2"), ReadResult::Found(c)),
        (Location::from("node-3"), ReadResult::NotFound),
    ]
}

fn run_read(r: usize, order: &[usize]) -> (Vec<ReadEffect<String>>, Vec<Location>) {
    let states = replica_states();
    let mut fsm = ReadFsm::new(ReadRequest {
        request_id: ID,
        key: "k".into(),
        r,
        read_repair: true,
        return_value: true,
    });
    fsm.execute(states.iter().map(|(loc, _)| loc.clone()).collect())
        .unwrap();

    let mut effects = Vec::new();
    for &i in order {
        let (location, result) = states[i].clone();
        effects.extend(
            fsm.handle(Event::Reply(ReplicaReply {
                request_id: ID,
                location,
                result,
            }))
            .unwrap(),
        );
    }
    assert!(fsm.is_terminated());
    (effects, fsm.repairs().to_vec())
}

fn client_replies(effects: &[ReadEffect<String>]) -> Vec<ReadReply<String>> {
    effects
        .iter()
        .filter_map(|e| match e {
            ReadEffect::Reply(reply) => Some(reply.clone()),
            _ => None,
        })
        .collect()
}

proptest! {
    #[test]
    fn reply_order_does_not_change_the_outcome(
        order in Just((0..4usize).collect::<Vec<_>>()).prop_shuffle()
    ) {
        let (effects, repairs) = run_read(4, &order);
        let (expected, expected_repairs) = run_read(4, &[0, 1, 2, 3]);
        prop_assert_eq!(effects, expected);
        prop_assert_eq!(repairs, expected_repairs);
    }

    #[test]
    fn quorum_answer_depends_only_on_which_replicas_answered_first(
        first in Just(vec![0usize, 2]).prop_shuffle(),
        rest in Just(vec![1usize, 3]).prop_shuffle(),
    ) {
        let order: Vec<usize> = first.iter().chain(&rest).copied().collect();
        let (effects, repairs) = run_read(2, &order);
        let (expected, expected_repairs) = run_read(2, &[0, 2, 1, 3]);

        let replies = client_replies(&effects);
        prop_assert_eq!(replies.len(), 1);
        prop_assert_eq!(&replies, &client_replies(&expected));
        prop_assert_eq!(
            &replies[0],
            &ReadReply::Ok {
                values: vec![s("a"), s("c")],
                context: VersionVector::from_entries([("node-0", 1), ("node-2", 1)]),
            }
        );
        prop_assert_eq!(repairs, expected_repairs);
    }
}

#[test]
fn superseded_and_missing_replicas_are_repaired() {
    let (effects, repairs) = run_read(4, &[0, 1, 2, 3]);

    let Some(ReadEffect::Reply(ReadReply::Ok { values, .. })) = effects.first() else {
        panic!("expected client reply first, got {effects:?}");
    };
    assert_eq!(values, &vec![s("b"), s("c")]);

    // Every replica holds less than the merge.
    assert_eq!(repairs.len(), 4);
}

// ============================================================================
// At most one client reply
// ============================================================================

const OTHER_ID: RequestId = RequestId::new(8);

#[derive(Debug, Clone)]
enum Step {
    Reply { node: usize, foreign: bool, ok: bool },
    Primary,
    Completion,
}

fn arb_steps() -> impl Strategy<Value = Vec<Step>> {
    proptest::collection::vec(
        prop_oneof![
            8 => (0..3usize, proptest::bool::weighted(0.2), any::<bool>())
                .prop_map(|(node, foreign, ok)| Step::Reply { node, foreign, ok }),
            1 => Just(Step::Primary),
            1 => Just(Step::Completion),
        ],
        0..16,
    )
}

fn three_nodes() -> Vec<Location> {
    (0..3).map(|i| Location::new(format!("node-{i}"))).collect()
}

fn has_timer(steps: &[Step]) -> bool {
    steps.iter().any(|step| !matches!(step, Step::Reply { .. }))
}

fn distinct_genuine_nodes(steps: &[Step]) -> usize {
    steps
        .iter()
        .filter_map(|step| match step {
            Step::Reply {
                node,
                foreign: false,
                ..
            } => Some(*node),
            _ => None,
        })
        .collect::<BTreeSet<_>>()
        .len()
}

/// Feed `steps` to a read coordinator with R = 2 until it refuses an event.
fn count_read_replies(steps: &[Step]) -> usize {
    let mut fsm = ReadFsm::new(ReadRequest {
        request_id: ID,
        key: "k".into(),
        r: 2,
        read_repair: true,
        return_value: true,
    });
    fsm.execute(three_nodes()).unwrap();

    let mut replies = 0;
    for step in steps {
        let event = match step {
            Step::Primary => Event::Timeout(Deadline::Primary),
            Step::Completion => Event::Timeout(Deadline::Completion),
            Step::Reply { node, foreign, ok } => {
                let location = Location::new(format!("node-{node}"));
                let result = if *ok {
                    ReadResult::Found(CausalObject::with_value(location.as_str(), s("v")))
                } else {
                    ReadResult::NotFound
                };
                Event::Reply(ReplicaReply {
                    request_id: if *foreign { OTHER_ID } else { ID },
                    location,
                    result,
                })
            }
        };
        match fsm.handle(event) {
            Ok(effects) => {
                replies += effects
                    .iter()
                    .filter(|e| matches!(e, ReadEffect::Reply(_)))
                    .count();
            }
            Err(_) => break,
        }
    }
    replies
}

/// Feed `steps` to a write coordinator with W = 2 until it refuses an event.
fn count_write_replies(steps: &[Step]) -> usize {
    let mut fsm = WriteFsm::new(WriteRequest {
        request_id: ID,
        key: "k".into(),
        value: Value::Live(s("v")),
        context: VersionVector::new(),
        w: 2,
    });
    fsm.execute(three_nodes()).unwrap();

    let mut replies = 0;
    for step in steps {
        let event = match step {
            Step::Primary => Event::Timeout(Deadline::Primary),
            Step::Completion => Event::Timeout(Deadline::Completion),
            Step::Reply { node, foreign, ok } => Event::Reply(ReplicaReply {
                request_id: if *foreign { OTHER_ID } else { ID },
                location: Location::new(format!("node-{node}")),
                result: if *ok {
                    WriteResult::Ack
                } else {
                    WriteResult::Nack("refused".into())
                },
            }),
        };
        match fsm.handle(event) {
            Ok(effects) => {
                replies += effects
                    .iter()
                    .filter(|e| matches!(e, WriteEffect::Reply(_)))
                    .count();
            }
            Err(_) => break,
        }
    }
    replies
}

proptest! {
    #[test]
    fn read_answers_at_most_once(steps in arb_steps()) {
        let replies = count_read_replies(&steps);
        prop_assert!(replies <= 1);
        if !has_timer(&steps) && distinct_genuine_nodes(&steps) >= 2 {
            prop_assert_eq!(replies, 1);
        }
    }

    #[test]
    fn write_answers_at_most_once(steps in arb_steps()) {
        let replies = count_write_replies(&steps);
        prop_assert!(replies <= 1);
        if !has_timer(&steps) && distinct_genuine_nodes(&steps) == 3 {
            prop_assert_eq!(replies, 1);
        }
    }
}
