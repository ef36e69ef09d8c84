//! Property-based tests for the pure building blocks: retry policy, status
//! lifecycle and history id sequencing.

use durafunc::runtime::status::StatusEvent;
use durafunc::{Event, HistoryLog, RetryDecision, RetryOptions, RuntimeStatus};
use proptest::prelude::*;
use std::time::Duration;

fn arb_status_event() -> impl Strategy<Value = StatusEvent> {
    prop_oneof![
        Just(StatusEvent::PassStarted),
        Just(StatusEvent::PassSuspended),
        Just(StatusEvent::Succeeded),
        Just(StatusEvent::Failed),
        Just(StatusEvent::Terminated),
        Just(StatusEvent::Canceled),
        Just(StatusEvent::ContinuedAsNew),
        Just(StatusEvent::Rewound),
    ]
}

/// Events that may follow `ExecutionStarted`, with id 0 so the log assigns one.
fn arb_body_event() -> impl Strategy<Value = Event> {
    prop_oneof![
        any::<u64>().prop_map(|t| Event::OrchestratorStarted {
            event_id: 0,
            timestamp_ms: t,
        }),
        "[A-Za-z]{1,8}".prop_map(|name| Event::TaskScheduled {
            event_id: 0,
            name,
            input: String::new(),
        }),
        (1u64..50).prop_map(|src| Event::TaskCompleted {
            event_id: 0,
            source_event_id: src,
            result: "ok".into(),
        }),
        any::<u64>().prop_map(|fire_at_ms| Event::TimerCreated { event_id: 0, fire_at_ms }),
        ("[a-z]{1,6}", "[a-z]{0,6}").prop_map(|(name, input)| Event::EventRaised { event_id: 0, name, input }),
    ]
}

fn started() -> Event {
    Event::ExecutionStarted {
        event_id: 0,
        name: "Prop".into(),
        input: String::new(),
        parent: None,
        timestamp_ms: 0,
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Retry delays never shrink from one attempt to the next and never exceed the cap.
    #[test]
    fn prop_retry_intervals_monotone_and_capped(
        first_ms in 1u64..10_000,
        coefficient in 1.0f64..4.0,
        cap_ms in 1u64..120_000,
        attempts in 2u32..30,
    ) {
        let opts = RetryOptions::new(Duration::from_millis(first_ms), attempts)
            .with_backoff_coefficient(coefficient)
            .with_max_retry_interval(Duration::from_millis(cap_ms));
        let mut previous = Duration::ZERO;
        for attempt in 1..attempts {
            let interval = opts.interval_for_attempt(attempt);
            prop_assert!(interval >= previous, "attempt {} shrank: {:?} < {:?}", attempt, interval, previous);
            prop_assert!(interval <= Duration::from_millis(cap_ms.max(first_ms)));
            previous = interval;
        }
    }

    /// The attempt budget is exact: `max - 1` retries, then give up.
    #[test]
    fn prop_retry_gives_up_after_max_attempts(max in 1u32..20) {
        let opts = RetryOptions::new(Duration::from_millis(10), max);
        for attempt in 1..max {
            let retry = matches!(opts.should_retry(attempt, Duration::ZERO, "e"), RetryDecision::RetryAfter(_));
            prop_assert!(retry);
        }
        prop_assert_eq!(opts.should_retry(max, Duration::ZERO, "e"), RetryDecision::GiveUp);
    }

    /// Once a terminal status is reached, only a rewind of a failure can leave it,
    /// and Pending is never re-entered.
    #[test]
    fn prop_status_never_leaves_terminal_except_rewind(
        events in prop::collection::vec(arb_status_event(), 0..24),
    ) {
        let mut status = RuntimeStatus::Pending;
        for event in events {
            match status.transition(event) {
                Ok(next) => {
                    if status.is_terminal() {
                        prop_assert_eq!(status, RuntimeStatus::Failed);
                        prop_assert_eq!(event, StatusEvent::Rewound);
                    }
                    if status != RuntimeStatus::Pending {
                        prop_assert_ne!(next, RuntimeStatus::Pending);
                    }
                    status = next;
                }
                Err(e) => prop_assert_eq!(e.from, status),
            }
        }
    }

    /// `apply_all` agrees with folding `transition` by hand.
    #[test]
    fn prop_apply_all_matches_stepwise(
        events in prop::collection::vec(arb_status_event(), 0..16),
    ) {
        let stepwise = events
            .iter()
            .try_fold(RuntimeStatus::Pending, |s, e| s.transition(*e));
        prop_assert_eq!(RuntimeStatus::Pending.apply_all(&events), stepwise);
    }

    /// Appended events get contiguous ids starting at 1.
    #[test]
    fn prop_history_ids_contiguous(
        body in prop::collection::vec(arb_body_event(), 0..40),
    ) {
        let mut log = HistoryLog::new();
        prop_assert_eq!(log.append(started()).unwrap(), 1);
        for (i, event) in body.into_iter().enumerate() {
            let id = log.append(event).unwrap();
            prop_assert_eq!(id, i as u64 + 2);
        }
        for (i, event) in log.events().iter().enumerate() {
            prop_assert_eq!(event.event_id(), i as u64 + 1);
        }
        let rebuilt = HistoryLog::from_events(log.events().to_vec()).unwrap();
        prop_assert_eq!(rebuilt, log);
    }

    /// An explicit id that skips ahead is rejected and leaves the log unchanged.
    #[test]
    fn prop_history_rejects_gaps(gap in 1u64..100) {
        let mut log = HistoryLog::new();
        log.append(started()).unwrap();
        let bad = Event::TimerCreated { event_id: 2 + gap, fire_at_ms: 0 };
        prop_assert!(log.append(bad).is_err());
        prop_assert_eq!(log.len(), 1);
    }
}
