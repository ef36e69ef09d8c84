use crate::futures::TimerOutcome;
use crate::history::HistoryLog;
use crate::providers::WorkItem;
use crate::retry::RetryOptions;
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::{FnOrchestration, OrchestrationHandler};
use crate::{Decision, EntityId, ErrorDetails, Event, OrchestrationContext};
use futures::future::{select, Either};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const INSTANCE: &str = "inst";
const T0: u64 = 1_000;

fn handler<F, Fut>(f: F) -> Arc<dyn OrchestrationHandler>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<String, String>> + Send + 'static,
{
    Arc::new(FnOrchestration(f))
}

fn first_pass(h: &Arc<dyn OrchestrationHandler>, input: &str) -> (TurnResult, ReplayEngine) {
    let mut engine = ReplayEngine::new(INSTANCE, 1, HistoryLog::new());
    engine.start_execution("Orch", input, None, T0);
    engine.begin_pass(T0);
    engine.prep_completions(Vec::new());
    let turn = engine.execute_orchestration(h.clone());
    (turn, engine)
}

fn next_pass(
    h: &Arc<dyn OrchestrationHandler>,
    history: &HistoryLog,
    messages: Vec<WorkItem>,
    now: u64,
) -> (TurnResult, ReplayEngine) {
    let mut engine = ReplayEngine::new(INSTANCE, 1, history.clone());
    engine.begin_pass(now);
    engine.prep_completions(messages);
    let turn = engine.execute_orchestration(h.clone());
    (turn, engine)
}

/// Run passes until the orchestration stops suspending, answering every
/// decision with `respond`.
fn run_to_end<R>(h: &Arc<dyn OrchestrationHandler>, input: &str, mut respond: R) -> (TurnResult, HistoryLog)
where
    R: FnMut(&Decision) -> Option<WorkItem>,
{
    let (mut turn, mut engine) = first_pass(h, input);
    let mut now = T0;
    for _ in 0..100 {
        if turn != TurnResult::Continue {
            break;
        }
        let messages: Vec<WorkItem> = engine.decisions().iter().filter_map(&mut respond).collect();
        now += 1;
        let history = engine.history().clone();
        (turn, engine) = next_pass(h, &history, messages, now);
    }
    (turn, engine.history().clone())
}

fn completed(id: u64, result: &str) -> WorkItem {
    WorkItem::ActivityCompleted {
        instance: INSTANCE.into(),
        execution_id: 1,
        id,
        result: result.into(),
    }
}

fn failed(id: u64, message: &str) -> WorkItem {
    WorkItem::ActivityFailed {
        instance: INSTANCE.into(),
        execution_id: 1,
        id,
        details: ErrorDetails::application(message),
    }
}

fn fired(id: u64, fire_at_ms: u64) -> WorkItem {
    WorkItem::TimerFired {
        instance: INSTANCE.into(),
        execution_id: 1,
        id,
        fire_at_ms,
    }
}

fn count(history: &HistoryLog, kind: &str) -> usize {
    history.events().iter().filter(|e| e.kind() == kind).count()
}

fn hello() -> Arc<dyn OrchestrationHandler> {
    handler(|ctx: OrchestrationContext, input: String| async move { ctx.schedule_activity("Hello", input).await })
}

#[test]
fn new_engine_has_made_progress() {
    let engine = ReplayEngine::new(INSTANCE, 1, HistoryLog::new());
    assert!(engine.is_new_execution());
    assert!(engine.made_progress());
    assert!(engine.history_delta().is_empty());
    assert!(engine.decisions().is_empty());
}

#[test]
fn hello_world_schedules_then_completes() {
    let h = hello();
    let (turn, engine) = first_pass(&h, "World");
    assert_eq!(turn, TurnResult::Continue);
    assert_eq!(
        engine.decisions(),
        &[Decision::ScheduleTask {
            scheduling_event_id: 3,
            name: "Hello".into(),
            input: "World".into(),
        }]
    );

    let (turn, engine) = next_pass(&h, engine.history(), vec![completed(3, "Hello, World!")], T0 + 1);
    assert_eq!(turn, TurnResult::Completed("Hello, World!".into()));
    assert!(engine.decisions().is_empty(), "recorded call must not be scheduled again");
    let kinds: Vec<&str> = engine.history_delta().iter().map(Event::kind).collect();
    assert_eq!(kinds, vec!["OrchestratorStarted", "TaskCompleted", "ExecutionCompleted"]);
}

#[test]
fn replay_of_a_prefix_is_repeatable() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let a = ctx.schedule_activity("A", "1").await?;
        let _ = ctx.schedule_timer(Duration::from_secs(5)).await;
        let b = ctx.schedule_activity("B", a).await?;
        Ok(b)
    });
    let (_, engine) = first_pass(&h, "");
    let (_, engine) = next_pass(&h, engine.history(), vec![completed(3, "x")], T0 + 1);
    let prefix = engine.history().clone();

    let runs: Vec<(Vec<Decision>, Vec<Event>)> = (0..5)
        .map(|_| {
            let (_, e) = next_pass(&h, &prefix, Vec::new(), T0 + 2);
            (e.decisions().to_vec(), e.history_delta().to_vec())
        })
        .collect();
    assert!(runs.windows(2).all(|w| w[0] == w[1]));
}

#[test]
fn duplicate_completion_is_dropped() {
    let h = hello();
    let (_, engine) = first_pass(&h, "World");
    let (_, mut engine) = {
        let mut e = ReplayEngine::new(INSTANCE, 1, engine.history().clone());
        e.begin_pass(T0 + 1);
        e.prep_completions(vec![completed(3, "first"), completed(3, "second")]);
        let turn = e.execute_orchestration(h.clone());
        (turn, e)
    };
    assert_eq!(count(engine.history(), "TaskCompleted"), 1);
    assert_eq!(engine.execute_orchestration(h.clone()), TurnResult::Completed("first".into()));
}

#[test]
fn completion_for_unknown_event_is_nondeterministic() {
    let h = hello();
    let (_, engine) = first_pass(&h, "World");
    let (turn, _) = next_pass(&h, engine.history(), vec![completed(42, "?")], T0 + 1);
    match turn {
        TurnResult::Failed(details) => assert!(details.is_nondeterminism(), "{details:?}"),
        other => panic!("expected failure, got {other:?}"),
    }
}

#[test]
fn completion_from_another_execution_is_ignored() {
    let h = hello();
    let (_, engine) = first_pass(&h, "World");
    let stale = WorkItem::ActivityCompleted {
        instance: INSTANCE.into(),
        execution_id: 7,
        id: 3,
        result: "old".into(),
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![stale], T0 + 1);
    assert_eq!(turn, TurnResult::Continue);
    assert_eq!(count(engine.history(), "TaskCompleted"), 0);
}

#[test]
fn changed_code_is_detected_on_replay() {
    let (_, engine) = first_pass(&hello(), "World");
    let changed = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Goodbye", "x").await
    });
    let (turn, _) = next_pass(&changed, engine.history(), Vec::new(), T0 + 1);
    match turn {
        TurnResult::Failed(ErrorDetails::NonDeterminism { expected, actual, .. }) => {
            assert!(expected.contains("Hello"), "{expected}");
            assert!(actual.contains("Goodbye"), "{actual}");
        }
        other => panic!("expected nondeterminism, got {other:?}"),
    }
}

#[test]
fn dropping_a_recorded_call_is_detected() {
    let (_, engine) = first_pass(&hello(), "World");
    let shorter = handler(|_ctx: OrchestrationContext, _input: String| async move { Ok("done".to_string()) });
    let (turn, _) = next_pass(&shorter, engine.history(), Vec::new(), T0 + 1);
    assert!(matches!(turn, TurnResult::Failed(d) if d.is_nondeterminism()));
}

#[test]
fn failed_activity_is_catchable() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        match ctx.schedule_activity("Flaky", "").await {
            Ok(v) => Ok(v),
            Err(e) => Ok(format!("recovered: {e}")),
        }
    });
    let (turn, _) = run_to_end(&h, "", |d| match d {
        Decision::ScheduleTask {
            scheduling_event_id, ..
        } => Some(failed(*scheduling_event_id, "boom")),
        _ => None,
    });
    assert_eq!(turn, TurnResult::Completed("recovered: boom".into()));
}

#[test]
fn retry_records_one_pair_per_attempt() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let options = RetryOptions::new(Duration::from_secs(1), 3);
        ctx.schedule_activity_with_retry("AlwaysFails", "", options).await
    });
    let (turn, history) = run_to_end(&h, "", |d| match d {
        Decision::ScheduleTask {
            scheduling_event_id, ..
        } => Some(failed(*scheduling_event_id, "nope")),
        Decision::CreateTimer {
            scheduling_event_id,
            fire_at_ms,
        } => Some(fired(*scheduling_event_id, *fire_at_ms)),
        _ => None,
    });
    assert!(matches!(turn, TurnResult::Failed(ErrorDetails::Application { .. })), "{turn:?}");
    assert_eq!(count(&history, "TaskScheduled"), 3);
    assert_eq!(count(&history, "TaskFailed"), 3);
    assert_eq!(count(&history, "TimerCreated"), 2);
}

#[test]
fn timer_fires_at_deterministic_time() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let outcome = ctx.schedule_timer(Duration::from_secs(10)).await;
        Ok(format!("{outcome:?}@{}", ctx.current_time_ms()))
    });
    let (turn, engine) = first_pass(&h, "");
    assert_eq!(turn, TurnResult::Continue);
    assert_eq!(
        engine.decisions(),
        &[Decision::CreateTimer {
            scheduling_event_id: 3,
            fire_at_ms: T0 + 10_000,
        }]
    );
    let (turn, _) = next_pass(&h, engine.history(), vec![fired(3, T0 + 10_000)], T0 + 10_005);
    assert_eq!(turn, TurnResult::Completed(format!("{:?}@{}", TimerOutcome::Fired, T0 + 10_005)));
}

#[test]
fn race_resolves_in_history_order() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let timer = ctx.schedule_timer(Duration::from_secs(60));
        let approval = ctx.wait_for_event("Approval");
        match select(timer, approval).await {
            Either::Left(_) => Ok("timeout".to_string()),
            Either::Right((data, _)) => Ok(format!("approved:{data}")),
        }
    });
    let (_, engine) = first_pass(&h, "");
    let raised = WorkItem::ExternalRaised {
        instance: INSTANCE.into(),
        name: "Approval".into(),
        data: "yes".into(),
    };
    // Both arrive in the same pass; the one recorded first wins every time.
    let (turn, done) = next_pass(&h, engine.history(), vec![raised, fired(3, T0 + 60_000)], T0 + 1);
    assert_eq!(turn, TurnResult::Completed("approved:yes".into()));
    let (again, _) = next_pass(&h, &prefix_without_terminal(done.history()), Vec::new(), T0 + 2);
    assert_eq!(again, TurnResult::Completed("approved:yes".into()));
}

fn prefix_without_terminal(history: &HistoryLog) -> HistoryLog {
    let events: Vec<Event> = history.events().iter().filter(|e| !e.is_terminal()).cloned().collect();
    HistoryLog::from_events(events).unwrap()
}

#[test]
fn event_raised_before_waiting_is_buffered() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Prepare", "").await?;
        let first = ctx.wait_for_event("Go").await;
        let second = ctx.wait_for_event("Go").await;
        Ok(format!("{first},{second}"))
    });
    let (_, engine) = first_pass(&h, "");
    let go = |data: &str| WorkItem::ExternalRaised {
        instance: INSTANCE.into(),
        name: "Go".into(),
        data: data.into(),
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![go("a")], T0 + 1);
    assert_eq!(turn, TurnResult::Continue);
    let (turn, _) = next_pass(&h, engine.history(), vec![go("b"), completed(3, "ok")], T0 + 2);
    assert_eq!(turn, TurnResult::Completed("a,b".into()));
}

#[test]
fn critical_section_spans_passes_and_releases_once() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let ids = [EntityId::new("Account", "b"), EntityId::new("Account", "a")];
        let section = ctx.lock_entities(&ids).await?;
        let held = ctx.is_locked();
        let balance = ctx.call_entity(&ids[1], "get", None).await?;
        section.release();
        Ok(format!("{held}:{balance}:{}", ctx.is_locked()))
    });
    let (turn, engine) = first_pass(&h, "");
    assert_eq!(turn, TurnResult::Continue);
    let (lock_id, lock_set) = match engine.decisions() {
        [Decision::LockEntities {
            scheduling_event_id,
            lock_set,
            ..
        }] => (*scheduling_event_id, lock_set.clone()),
        other => panic!("expected a lock request, got {other:?}"),
    };
    let order: Vec<String> = lock_set.iter().map(ToString::to_string).collect();
    assert_eq!(order, vec!["@account@a", "@account@b"]);

    let granted = WorkItem::EntityLockGranted {
        instance: INSTANCE.into(),
        execution_id: 1,
        id: lock_id,
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![granted], T0 + 1);
    assert_eq!(turn, TurnResult::Continue);
    assert_eq!(count(engine.history(), "EntityLockReleased"), 0, "suspending inside the section keeps the locks");
    let call_id = match engine.decisions() {
        [Decision::CallEntity { scheduling_event_id, .. }] => *scheduling_event_id,
        other => panic!("expected an entity call, got {other:?}"),
    };

    let response = WorkItem::EntityResponse {
        instance: INSTANCE.into(),
        execution_id: 1,
        id: call_id,
        outcome: Ok("5".into()),
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![response], T0 + 2);
    assert_eq!(turn, TurnResult::Completed("true:5:false".into()));
    assert_eq!(count(engine.history(), "EntityLockReleased"), 1);
    assert!(matches!(
        engine.decisions(),
        [Decision::UnlockEntities { lock_set, .. }] if lock_set.len() == 2
    ));
}

#[test]
fn code_after_a_persisted_completion_runs_live_once() {
    let live = Arc::new(AtomicUsize::new(0));
    let seen = live.clone();
    let h = handler(move |ctx: OrchestrationContext, _input: String| {
        let seen = seen.clone();
        async move {
            let a = ctx.schedule_activity("A", "").await?;
            if !ctx.is_replaying() {
                seen.fetch_add(1, Ordering::SeqCst);
            }
            let go = ctx.wait_for_event("Go").await;
            Ok(format!("{a}{go}"))
        }
    });
    let (_, engine) = first_pass(&h, "");
    assert_eq!(live.load(Ordering::SeqCst), 0);

    let (turn, engine) = next_pass(&h, engine.history(), vec![completed(3, "a")], T0 + 1);
    assert_eq!(turn, TurnResult::Continue);
    assert_eq!(live.load(Ordering::SeqCst), 1);
    assert_eq!(engine.decisions(), &[Decision::WaitForEvent { name: "Go".into() }]);

    let go = WorkItem::ExternalRaised {
        instance: INSTANCE.into(),
        name: "Go".into(),
        data: "!".into(),
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![go], T0 + 2);
    assert_eq!(turn, TurnResult::Completed("a!".into()));
    assert_eq!(live.load(Ordering::SeqCst), 1, "replayed code must not run live again");
    assert!(engine.decisions().is_empty(), "a replayed wait is not a new decision");
}

#[test]
fn wait_with_timeout_gives_up() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        Ok(match ctx.wait_for_event_with_timeout("Reply", Duration::from_secs(1)).await {
            Some(v) => v,
            None => "timed out".to_string(),
        })
    });
    let (turn, history) = run_to_end(&h, "", |d| match d {
        Decision::CreateTimer {
            scheduling_event_id,
            fire_at_ms,
        } => Some(fired(*scheduling_event_id, *fire_at_ms)),
        _ => None,
    });
    assert_eq!(turn, TurnResult::Completed("timed out".into()));
    assert_eq!(count(&history, "TimerFired"), 1);
}

#[test]
fn terminate_short_circuits_user_code() {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let h = handler(move |ctx: OrchestrationContext, _input: String| {
        let seen = seen.clone();
        async move {
            seen.fetch_add(1, Ordering::SeqCst);
            ctx.wait_for_event("never").await;
            Ok(String::new())
        }
    });
    let (_, engine) = first_pass(&h, "");
    let before = calls.load(Ordering::SeqCst);
    let terminate = WorkItem::TerminateInstance {
        instance: INSTANCE.into(),
        reason: "operator".into(),
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![terminate], T0 + 1);
    assert_eq!(turn, TurnResult::Terminated("operator".into()));
    assert_eq!(calls.load(Ordering::SeqCst), before);
    assert!(matches!(engine.history().terminal(), Some(Event::ExecutionTerminated { .. })));
}

#[test]
fn cancel_waits_for_the_first_pass() {
    let h = hello();
    let mut engine = ReplayEngine::new(INSTANCE, 1, HistoryLog::new());
    engine.start_execution("Orch", "World", None, T0);
    engine.begin_pass(T0);
    engine.prep_completions(vec![WorkItem::CancelInstance {
        instance: INSTANCE.into(),
        reason: "early".into(),
    }]);
    assert_eq!(engine.deferred.len(), 1);
    assert_eq!(engine.execute_orchestration(h.clone()), TurnResult::Continue);

    let cancel = engine.deferred.remove(0);
    let (turn, _) = next_pass(&h, engine.history(), vec![cancel], T0 + 1);
    assert_eq!(turn, TurnResult::Canceled("early".into()));
}

#[test]
fn panic_fails_the_execution() {
    let h = handler(|_ctx: OrchestrationContext, input: String| async move {
        if input.is_empty() {
            panic!("bad input");
        }
        Ok(input)
    });
    let (turn, engine) = first_pass(&h, "");
    match turn {
        TurnResult::Failed(details) => {
            assert_eq!(details.category(), "panic");
            assert!(details.to_string().contains("bad input"), "{details}");
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert!(matches!(engine.history().terminal(), Some(Event::ExecutionFailed { .. })));
}

#[test]
fn continue_as_new_closes_the_execution() {
    let h = handler(|ctx: OrchestrationContext, input: String| async move {
        let n: u32 = input.parse().map_err(|e| format!("{e}"))?;
        if n < 3 {
            return ctx.continue_as_new((n + 1).to_string()).await;
        }
        Ok(input)
    });
    let (turn, engine) = first_pass(&h, "1");
    assert_eq!(turn, TurnResult::ContinueAsNew { input: "2".into() });
    assert!(matches!(
        engine.history().terminal(),
        Some(Event::ExecutionContinuedAsNew { input, .. }) if input == "2"
    ));
    let (turn, _) = first_pass(&h, "3");
    assert_eq!(turn, TurnResult::Completed("3".into()));
}

#[test]
fn custom_status_and_guids_are_deterministic() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        let id = ctx.new_guid();
        ctx.set_custom_status(format!("working:{id}"));
        ctx.schedule_activity("A", id).await
    });
    let (_, a) = first_pass(&h, "");
    let (_, b) = next_pass(&h, a.history(), Vec::new(), T0 + 1);
    let (_, c) = next_pass(&h, a.history(), Vec::new(), T0 + 2);
    assert!(a.custom_status.as_deref().is_some_and(|s| s.starts_with("working:")));
    assert_eq!(a.custom_status, b.custom_status);
    assert_eq!(b.custom_status, c.custom_status);
}

#[test]
fn rewind_reschedules_failed_work() {
    let h = handler(|ctx: OrchestrationContext, _input: String| async move {
        ctx.schedule_activity("Flaky", "x").await
    });
    let (_, engine) = first_pass(&h, "");
    let (turn, engine) = next_pass(&h, engine.history(), vec![failed(3, "down")], T0 + 1);
    assert!(matches!(turn, TurnResult::Failed(_)));

    let rewind = WorkItem::RewindInstance {
        instance: INSTANCE.into(),
        reason: "fixed".into(),
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![rewind], T0 + 2);
    assert_eq!(turn, TurnResult::Continue);
    assert!(!engine.is_stale());
    let redo = engine.rewound_work();
    assert_eq!(redo.len(), 1);
    assert!(matches!(&redo[0], Event::TaskScheduled { event_id: 3, name, .. } if name == "Flaky"));
    assert!(engine.decisions().is_empty());

    let (turn, _) = next_pass(&h, engine.history(), vec![completed(3, "ok")], T0 + 3);
    assert_eq!(turn, TurnResult::Completed("ok".into()));
}

#[test]
fn rewind_of_a_running_instance_is_ignored() {
    let h = hello();
    let (_, engine) = first_pass(&h, "World");
    let rewind = WorkItem::RewindInstance {
        instance: INSTANCE.into(),
        reason: "nothing to do".into(),
    };
    let (turn, engine) = next_pass(&h, engine.history(), vec![rewind], T0 + 1);
    assert_eq!(turn, TurnResult::Continue);
    assert!(!engine.made_progress());
    assert!(engine.rewound_work().is_empty());
}
