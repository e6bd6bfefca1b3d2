//! Property-based tests using proptest.
//!
//! Covers the status state machine, the wire encodings of statuses, failures
//! and timestamps, and the disjointness of the storage key schema. Decoders
//! are also fed arbitrary bytes to check they never panic.

use std::collections::HashSet;

use proptest::prelude::*;

use remote_futures::protocol::{decode_timestamp, encode_timestamp};
use remote_futures::{
    Application, FailureKind, OperationNamespace, StreamMessage, TaskFailure, TaskStatus,
};

// ─── Arbitrary Strategies ───────────────────────────────────────────────────

fn arb_status() -> impl Strategy<Value = TaskStatus> {
    prop::sample::select(TaskStatus::ALL.to_vec())
}

fn arb_failure_kind() -> impl Strategy<Value = FailureKind> {
    prop::sample::select(vec![
        FailureKind::Execution,
        FailureKind::PresumedDead,
        FailureKind::DispatchTimeout,
        FailureKind::Interrupted,
        FailureKind::Cancelled,
        FailureKind::UnknownFunction,
    ])
}

fn arb_component() -> impl Strategy<Value = String> {
    "[a-zA-Z0-9_.-]{1,24}"
}

// ─── State Machine Properties ───────────────────────────────────────────────

proptest! {
    #[test]
    fn terminal_statuses_never_transition(from in arb_status(), to in arb_status()) {
        if from.is_terminal() {
            prop_assert!(!from.can_transition_to(to));
        }
    }

    #[test]
    fn transitions_never_go_backwards(from in arb_status(), to in arb_status()) {
        if from.can_transition_to(to) {
            prop_assert!(to >= from);
        }
    }

    #[test]
    fn walks_end_in_at_most_one_terminal(steps in prop::collection::vec(arb_status(), 0..16)) {
        let mut current = TaskStatus::NotStarted;
        let mut terminals = 0;
        for next in steps {
            if current.can_transition_to(next) {
                current = next;
                if current.is_terminal() {
                    terminals += 1;
                }
            }
        }
        prop_assert!(terminals <= 1);
    }

    #[test]
    fn status_code_round_trips(status in arb_status()) {
        prop_assert_eq!(TaskStatus::decode(&status.encode()), Some(status));
        prop_assert_eq!(TaskStatus::from_code(status.code()), Some(status));
    }
}

// ─── Encoding Properties ────────────────────────────────────────────────────

proptest! {
    #[test]
    fn failure_encoding_preserves_kind_and_message(
        kind in arb_failure_kind(),
        message in ".{0,200}",
    ) {
        let failure = TaskFailure::new(kind, message);
        prop_assert_eq!(TaskFailure::decode(&failure.encode()), failure);
    }

    #[test]
    fn timestamps_survive_encoding(ts in 0.0f64..4_000_000_000.0) {
        let decoded = decode_timestamp(&encode_timestamp(ts)).unwrap();
        prop_assert!((decoded - ts).abs() < 1e-5);
    }
}

// ─── Fuzz Decoding ──────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn status_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..8)) {
        let _ = TaskStatus::decode(&raw);
    }

    #[test]
    fn failure_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..256)) {
        let failure = TaskFailure::decode(&raw);
        if serde_json::from_slice::<serde_json::Value>(&raw).is_err() {
            prop_assert_eq!(failure.kind, FailureKind::Execution);
        }
    }

    #[test]
    fn message_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..256)) {
        let _ = StreamMessage::decode(&raw);
    }

    #[test]
    fn timestamp_decode_never_panics(raw in prop::collection::vec(any::<u8>(), 0..32)) {
        if let Some(ts) = decode_timestamp(&raw) {
            prop_assert!(ts.is_finite());
        }
    }
}

// ─── Key Schema Properties ──────────────────────────────────────────────────

proptest! {
    #[test]
    fn operation_keys_are_disjoint(
        app in arb_component(),
        first in arb_component(),
        second in arb_component(),
    ) {
        let a = OperationNamespace::new(app.clone(), first.clone()).unwrap();
        let b = OperationNamespace::new(app.clone(), second.clone()).unwrap();
        let application = Application::new(app).unwrap();
        let shared = [
            application.stream(),
            application.group(),
            application.listeners_key(),
        ];

        let keys_a: HashSet<String> = a.operation_keys().into_iter().collect();
        let keys_b: HashSet<String> = b.operation_keys().into_iter().collect();
        prop_assert_eq!(keys_a.len(), 4);
        for key in &shared {
            prop_assert!(!keys_a.contains(key));
        }
        if first != second {
            prop_assert!(keys_a.is_disjoint(&keys_b));
        } else {
            prop_assert_eq!(keys_a, keys_b);
        }
    }

    #[test]
    fn separator_is_rejected(
        prefix in "[a-z]{0,8}",
        suffix in "[a-z]{0,8}",
    ) {
        let name = format!("{prefix}:{suffix}");
        prop_assert!(Application::new(name.clone()).is_err());
        prop_assert!(OperationNamespace::new("app", name).is_err());
    }
}
