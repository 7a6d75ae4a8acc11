//! Property-based tests for the core invariants.
//!
//! These exercise the store and state machines with generated inputs:
//!
//! - Event sequence numbers are dense, starting at 1, strictly monotonic
//! - Content addressing: equal bytes ⇔ equal artifact ids
//! - Conflict partitioning never co-schedules intersecting key sets
//! - Todo transition sequences are prefixes of the permitted chain, with
//!   rollbacks only by verifier rejection

use proptest::prelude::*;
use std::sync::Arc;

use crate::session::Session;
use crate::todo::{AcceptanceCriterion, Actor, CriterionKind, EvidenceRef, TodoList, TodoStatus};
use crate::tools::conflict::{conflicts, partition, ResourceKey};
use crate::trace::{ArtifactId, EventKind, TraceStore};

fn key_sets() -> impl Strategy<Value = Vec<Vec<ResourceKey>>> {
    // Small key universe so collisions are common
    let key = (0u8..6).prop_map(|n| ResourceKey::new(format!("fs:file-{}", n)));
    let set = proptest::collection::vec(key, 0..4);
    proptest::collection::vec(set, 0..12)
}

proptest! {
    /// Partitioning never places two conflicting calls in the same wave and
    /// never loses or duplicates a call.
    #[test]
    fn partition_is_conflict_free_and_complete(sets in key_sets()) {
        let waves = partition(&sets);

        let mut seen = vec![false; sets.len()];
        for wave in &waves {
            for (i, &a) in wave.iter().enumerate() {
                prop_assert!(!seen[a], "call {} scheduled twice", a);
                seen[a] = true;
                for &b in wave.iter().skip(i + 1) {
                    prop_assert!(
                        !conflicts(&sets[a], &sets[b]),
                        "calls {} and {} share a key in one wave",
                        a,
                        b
                    );
                }
            }
        }
        prop_assert!(seen.iter().all(|&s| s), "a call was dropped");
    }

    /// Content addressing: identical input ⇒ identical id; and (modulo hash
    /// collisions) different input ⇒ different id.
    #[test]
    fn artifact_ids_are_content_determined(a in proptest::collection::vec(any::<u8>(), 0..256),
                                           b in proptest::collection::vec(any::<u8>(), 0..256)) {
        let id_a = ArtifactId::from_bytes(&a);
        let id_b = ArtifactId::from_bytes(&b);
        if a == b {
            prop_assert_eq!(id_a, id_b);
        } else {
            prop_assert_ne!(id_a, id_b);
        }
    }

    /// Appending N events yields exactly the sequence 1..=N.
    #[test]
    fn event_sequence_is_dense(n in 1usize..24) {
        let trace = TraceStore::in_memory().unwrap();
        let session = Session::new("prop", "/tmp/ws");
        trace.create_session(&session).unwrap();

        for _ in 0..n {
            trace
                .append_event(&session.id, EventKind::HumanInput, serde_json::json!({}), None)
                .unwrap();
        }

        let events = trace.iterate(&session.id, 1, None).unwrap();
        prop_assert_eq!(events.len(), n);
        for (index, event) in events.iter().enumerate() {
            prop_assert_eq!(event.seq, index as u64 + 1);
        }
    }

    /// Any interleaving of attempted transitions leaves the todo's recorded
    /// history a prefix of pending → in_progress → claimed → verified, with
    /// rollbacks only via harness rejection.
    #[test]
    fn todo_history_is_a_legal_prefix(ops in proptest::collection::vec(0u8..5, 1..16)) {
        let trace = Arc::new(TraceStore::in_memory().unwrap());
        let session = Session::new("prop", "/tmp/ws");
        trace.create_session(&session).unwrap();
        let todos = TodoList::new(session.id.clone(), Arc::clone(&trace));

        let id = todos
            .create(
                "p",
                vec![AcceptanceCriterion::new(CriterionKind::FileExists, "x")],
            )
            .unwrap();

        for op in ops {
            let evidence = || {
                let artifact = trace.put_artifact(b"evidence").unwrap();
                let seq = trace.last_seq(&session.id).unwrap().max(1);
                vec![EvidenceRef { criterion: 0, artifact, event_seq: seq }]
            };
            // Outcomes are checked by the state machine itself; here we only
            // assert nothing illegal ever lands in the history
            let _ = match op {
                0 => todos.start(Actor::Agent, &id),
                1 => todos.claim(Actor::Agent, &id, evidence()),
                2 => todos.verify(Actor::Harness, &id),
                3 => todos.reject(Actor::Harness, &id, vec!["no".to_string()]),
                _ => todos.verify(Actor::Agent, &id),
            };
        }

        // Reconstruct the status history from the trace
        let transitions = trace
            .query_by_kind(&session.id, &[EventKind::StateTransition])
            .unwrap();
        let mut status = TodoStatus::Pending;
        for event in transitions {
            let next = match event.payload_str("transition") {
                Some("start") => Some(TodoStatus::InProgress),
                Some("claim") => Some(TodoStatus::Claimed),
                Some("verify") => Some(TodoStatus::Verified),
                Some("verifier_rejection") => Some(TodoStatus::InProgress),
                _ => None,
            };
            if let Some(next) = next {
                let legal = matches!(
                    (status, next),
                    (TodoStatus::Pending, TodoStatus::InProgress)
                        | (TodoStatus::InProgress, TodoStatus::Claimed)
                        | (TodoStatus::Claimed, TodoStatus::Verified)
                        | (TodoStatus::Claimed, TodoStatus::InProgress)
                );
                prop_assert!(legal, "illegal recorded transition {:?} -> {:?}", status, next);
                status = next;
            }
        }
    }
}
