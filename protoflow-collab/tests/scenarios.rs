//! End-to-end behavior of the registry as seen by a handful of actors.

use std::sync::Arc;

use protoflow_collab::{
    ActorInfo, EngineConfig, EngineError, ErrorKind, ManualClock, SessionRegistry,
};
use protoflow_core::{ElementPath, Node, Operation, ProtocolGraph};
use serde_json::json;

fn registry() -> (SessionRegistry, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(1_000));
    let registry = SessionRegistry::with_clock(EngineConfig::default(), clock.clone());
    (registry, clock)
}

fn join(registry: &SessionRegistry, doc: &str, actor: &str, channel: &str) {
    registry
        .join_session(doc, actor, ActorInfo::new(actor.to_uppercase()), channel.into())
        .unwrap();
}

fn three_steps() -> ProtocolGraph {
    ProtocolGraph::with_steps((0..3).map(|i| Node::with_id(format!("s{i}"), "step")))
}

#[test]
fn test_first_edit_commits_unchanged() {
    let (registry, _) = registry();
    join(&registry, "doc1", "A", "a");

    let op = Operation::set_text("1", 0, [2], "Step 1");
    let applied = registry.apply_operation("doc1", op.clone(), "A").unwrap();

    assert!(!applied.transformed);
    assert_eq!(applied.operation.applied_version, Some(1));
    assert_eq!(applied.operation.element_path, op.element_path);
    assert_eq!(applied.operation.payload, op.payload);
    assert_eq!(registry.get_session_info("doc1").unwrap().unwrap().version, 1);
}

#[test]
fn test_concurrent_writes_to_same_field_converge_on_later_commit() {
    let (registry, _) = registry();
    join(&registry, "doc1", "A", "a");
    join(&registry, "doc1", "B", "b");

    let first = registry
        .apply_operation("doc1", Operation::set_text("1", 0, [2], "Step 1"), "A")
        .unwrap();
    let second = registry
        .apply_operation("doc1", Operation::set_text("2", 0, [2], "Step 1 revised"), "B")
        .unwrap();

    assert!(second.transformed);
    assert_eq!(second.operation.applied_version, Some(2));
    assert_eq!(second.operation.element_path, ElementPath::from([2]));

    // Every client applies the committed stream in version order.
    let mut graph = three_steps();
    for op in registry.operations_since("doc1", 0).unwrap() {
        graph.apply(&op).unwrap();
    }
    assert_eq!(graph.node(&ElementPath::from([2])).unwrap().text(), Some("Step 1 revised"));
    assert_eq!(first.operation.id, "1");
}

#[test]
fn test_lock_handover_after_full_disconnect() {
    let (registry, _) = registry();
    join(&registry, "doc1", "A", "a-1");
    join(&registry, "doc1", "A", "a-2");
    join(&registry, "doc1", "B", "b");

    let granted = registry.lock_element("doc1", "e5", "A").unwrap();
    assert!(granted.success);

    let denied = registry.lock_element("doc1", "e5", "B").unwrap();
    assert!(!denied.success);
    assert_eq!(denied.locked_by.as_deref(), Some("A"));

    // Dropping one of two channels keeps the lock.
    registry.leave_session("doc1", "A", &"a-1".into()).unwrap();
    assert!(!registry.lock_element("doc1", "e5", "B").unwrap().success);

    let outcome = registry.disconnect_actor("doc1", "A").unwrap();
    assert!(outcome.removed);
    assert_eq!(outcome.released_locks, ["e5"]);

    let info = registry.get_session_info("doc1").unwrap().unwrap();
    assert_eq!(info.lock_owner("e5"), None);
    assert!(registry.lock_element("doc1", "e5", "B").unwrap().success);
}

#[test]
fn test_version_counts_applied_operations() {
    let (registry, _) = registry();
    join(&registry, "doc1", "A", "a");

    for n in 0..25u64 {
        let op = Operation::set_field(format!("op-{n}"), n, [0], "volume", json!(n));
        registry.apply_operation("doc1", op, "A").unwrap();
    }
    // A rejected operation does not move the version.
    let bad = Operation::set_text("ahead", 99, [0], "x");
    assert!(registry.apply_operation("doc1", bad, "A").is_err());

    assert_eq!(registry.get_session_info("doc1").unwrap().unwrap().version, 25);
    assert_eq!(registry.stats().operations_applied, 25);
    assert_eq!(registry.stats().operations_rejected, 1);
}

#[test]
fn test_edit_of_deleted_step_is_a_conflict() {
    let (registry, _) = registry();
    join(&registry, "doc1", "A", "a");
    join(&registry, "doc1", "B", "b");

    registry.apply_operation("doc1", Operation::delete("1", 0, [1]), "A").unwrap();
    let err = registry
        .apply_operation("doc1", Operation::set_text("2", 0, [1], "gone"), "B")
        .unwrap_err();

    assert!(matches!(err, EngineError::TargetDeleted { ref operation_id } if operation_id == "2"));
    assert_eq!(err.kind(), ErrorKind::Conflict);
    assert_eq!(registry.get_session_info("doc1").unwrap().unwrap().version, 1);
}

#[test]
fn test_rejoin_on_second_channel_is_one_participant() {
    let (registry, _) = registry();
    join(&registry, "doc1", "A", "a-1");
    join(&registry, "doc1", "A", "a-2");
    join(&registry, "doc1", "A", "a-2");

    let info = registry.get_session_info("doc1").unwrap().unwrap();
    assert_eq!(info.participants.len(), 1);
    assert_eq!(info.participant("A").unwrap().channel_count, 2);
}

#[test]
fn test_reaper_honors_inactivity_threshold() {
    let (registry, clock) = registry();
    join(&registry, "stale", "A", "a");
    join(&registry, "fresh", "B", "b");
    join(&registry, "busy", "C", "c");

    registry.leave_session("stale", "A", &"a".into()).unwrap();
    clock.advance_minutes(21);
    registry.leave_session("fresh", "B", &"b".into()).unwrap();
    clock.advance_minutes(10);

    // "stale" has been empty for 31 minutes, "fresh" for 10, "busy" never.
    let report = registry.cleanup_inactive_sessions(30);
    assert_eq!(report.removed, ["stale"]);
    assert_eq!(report.remaining, 2);
    assert_eq!(registry.document_ids(), ["busy", "fresh"]);
    assert_eq!(registry.stats().sessions_reaped, 1);
}

#[test]
fn test_reaped_document_starts_over() {
    let (registry, clock) = registry();
    join(&registry, "doc1", "A", "a");
    registry
        .apply_operation("doc1", Operation::set_text("1", 0, [0], "x"), "A")
        .unwrap();
    registry.leave_session("doc1", "A", &"a".into()).unwrap();

    clock.advance_minutes(45);
    registry.cleanup_inactive_sessions(30);
    assert!(registry.get_session_info("doc1").unwrap().is_none());

    join(&registry, "doc1", "A", "a");
    assert_eq!(registry.get_session_info("doc1").unwrap().unwrap().version, 0);
}

#[test]
fn test_registries_are_isolated() {
    let (one, _) = registry();
    let (two, _) = registry();
    join(&one, "doc1", "A", "a");

    assert_eq!(one.session_count(), 1);
    assert_eq!(two.session_count(), 0);
    assert!(two.get_session_info("doc1").unwrap().is_none());
}

#[test]
fn test_parallel_writers_get_distinct_versions() {
    let registry = Arc::new(SessionRegistry::with_defaults());
    join(&registry, "doc1", "seed", "s");

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let registry = registry.clone();
            std::thread::spawn(move || {
                let actor = format!("w{t}");
                (0..50)
                    .map(|n| {
                        let op = Operation::set_field(format!("{actor}-{n}"), 0, [0], actor.clone(), json!(n));
                        registry
                            .apply_operation("doc1", op, &actor)
                            .unwrap()
                            .operation
                            .applied_version
                            .unwrap()
                    })
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut versions: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    versions.sort_unstable();
    assert_eq!(versions, (1..=400).collect::<Vec<_>>());
}

#[test]
fn test_racing_lockers_see_one_owner() {
    let registry = Arc::new(SessionRegistry::with_defaults());
    let actors: Vec<String> = (0..8).map(|t| format!("locker-{t}")).collect();
    for (t, actor) in actors.iter().enumerate() {
        join(&registry, "doc1", actor, &format!("ch-{t}"));
    }
    let start = Arc::new(std::sync::Barrier::new(actors.len()));

    let handles: Vec<_> = actors
        .iter()
        .cloned()
        .map(|actor| {
            let registry = registry.clone();
            let start = start.clone();
            std::thread::spawn(move || {
                start.wait();
                let result = registry.lock_element("doc1", "e5", &actor).unwrap();
                (actor, result)
            })
        })
        .collect();
    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    let winners: Vec<_> = results.iter().filter(|(_, r)| r.success).collect();
    assert_eq!(winners.len(), 1);
    let owner = &winners[0].0;
    for (_, result) in &results {
        assert_eq!(result.locked_by.as_ref(), Some(owner));
    }
    assert_eq!(registry.stats().locks_granted, 1);
    assert_eq!(registry.stats().locks_denied, 7);
}

#[test]
fn test_out_of_range_path_does_not_disturb_others() {
    let (registry, _) = registry();
    join(&registry, "doc1", "A", "a");
    join(&registry, "doc1", "B", "b");
    registry
        .apply_operation("doc1", Operation::insert("1", 0, [0], Node::with_id("n1", "step")), "A")
        .unwrap();
    registry.lock_element("doc1", "e1", "A").unwrap();

    let far = Operation::insert("2", 0, [usize::MAX], Node::with_id("n2", "step"));
    let err = registry.apply_operation("doc1", far, "B").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let info = registry.get_session_info("doc1").unwrap().unwrap();
    assert_eq!(info.version, 1);
    assert_eq!(info.participants.len(), 2);
    assert_eq!(registry.lock_element("doc1", "e1", "B").unwrap().locked_by.as_deref(), Some("A"));

    let applied = registry
        .apply_operation("doc1", Operation::set_text("3", 0, [0], "kept"), "B")
        .unwrap();
    assert_eq!(applied.operation.element_path, ElementPath::from([1]));
}
