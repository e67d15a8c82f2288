//! Property-based tests for the processing pipeline
//!
//! The pipeline status decides what a document may do next, so an edge that
//! should not exist (leaving a terminal, going back to UPLOADED) silently breaks
//! every caller. These tests drive the transition table with arbitrary event
//! sequences instead of hand-picked paths.

use proptest::prelude::*;
use ledger_intake::pipeline::{
    FailureKind, FailureTerminal, PipelineEvent, PipelineStatus, RetryPolicy,
};

// These property tests cover:
//
// 1. Terminal stability - no event moves a document out of a terminal
// 2. No way back - nothing ever returns to UPLOADED
// 3. Rejections are INVALID_STATE and leave the status where it was
// 4. Retry budget - the number of automatic retries is bounded by the policy
// 5. Permanent failures never retry
//
// Database-backed behaviour (lock versions, idempotency) lives in scenarios.rs
// and revision_property_tests.rs.

/// Strategy to generate any pipeline event
fn event_strategy() -> impl Strategy<Value = PipelineEvent> {
    prop_oneof![
        Just(PipelineEvent::Enqueue),
        Just(PipelineEvent::Start),
        Just(PipelineEvent::BundleDetected),
        Just(PipelineEvent::ExtractionSucceeded),
        Just(PipelineEvent::SplitCompleted),
        Just(PipelineEvent::TransientFailure),
        Just(PipelineEvent::Retry),
        Just(PipelineEvent::Exhausted(FailureTerminal::Permanent)),
        Just(PipelineEvent::Exhausted(FailureTerminal::DeadLetter)),
    ]
}

fn status_strategy() -> impl Strategy<Value = PipelineStatus> {
    proptest::sample::select(PipelineStatus::ALL.to_vec())
}

fn failure_kind_strategy() -> impl Strategy<Value = FailureKind> {
    prop_oneof![Just(FailureKind::Transient), Just(FailureKind::Permanent)]
}

/// Walks `events` from UPLOADED, skipping rejected ones, and returns every status visited.
fn walk(events: &[PipelineEvent]) -> Vec<PipelineStatus> {
    let mut visited = vec![PipelineStatus::Uploaded];
    let mut current = PipelineStatus::Uploaded;
    for event in events {
        if let Ok(next) = current.apply(*event) {
            current = next;
            visited.push(current);
        }
    }
    visited
}

proptest! {
    #[test]
    fn terminal_statuses_accept_no_event(
        status in status_strategy(),
        event in event_strategy(),
    ) {
        prop_assume!(status.is_terminal());
        prop_assert!(status.apply(event).is_err());
    }

    #[test]
    fn once_terminal_always_terminal(events in prop::collection::vec(event_strategy(), 0..40)) {
        let visited = walk(&events);
        if let Some(first) = visited.iter().position(|s| s.is_terminal()) {
            let settled = visited[first];
            prop_assert!(visited[first..].iter().all(|s| *s == settled));
        }
    }

    #[test]
    fn nothing_returns_to_uploaded(events in prop::collection::vec(event_strategy(), 0..40)) {
        let visited = walk(&events);
        prop_assert!(visited[1..].iter().all(|s| *s != PipelineStatus::Uploaded));
    }

    #[test]
    fn rejections_are_invalid_state(
        status in status_strategy(),
        event in event_strategy(),
    ) {
        match status.apply(event) {
            Ok(next) => prop_assert!(!status.is_terminal(), "{status} moved to {next}"),
            Err(e) => prop_assert_eq!(e.code().as_str(), "INVALID_STATE"),
        }
    }

    #[test]
    fn retries_are_bounded_by_the_policy(max_attempts in 1u32..8) {
        let policy = RetryPolicy { max_attempts, ..RetryPolicy::default() };
        let retries = (1..=max_attempts + 2)
            .take_while(|attempt| policy.next_event(*attempt, FailureKind::Transient) == PipelineEvent::Retry)
            .count() as u32;
        prop_assert_eq!(retries, max_attempts - 1);
        prop_assert_eq!(
            policy.next_event(max_attempts, FailureKind::Transient),
            PipelineEvent::Exhausted(FailureTerminal::DeadLetter)
        );
    }

    #[test]
    fn policy_events_are_legal_after_a_failure(
        attempts in 1u32..10,
        kind in failure_kind_strategy(),
    ) {
        let failed = PipelineStatus::Processing
            .apply(PipelineEvent::TransientFailure)
            .unwrap();
        let next = failed.apply(RetryPolicy::default().next_event(attempts, kind));
        prop_assert!(next.is_ok());
        let next = next.unwrap();
        match kind {
            FailureKind::Permanent => prop_assert_eq!(next, PipelineStatus::FailedPermanent),
            FailureKind::Transient => prop_assert!(
                next == PipelineStatus::Queued || next == PipelineStatus::DeadLetter
            ),
        }
    }
}
