use durafunc::entity::EntityRegistry;
use durafunc::{
    ActivityContext, ActivityRegistry, Client, OrchestrationClient, OrchestrationContext, OrchestrationRegistry,
    RetryOptions, RuntimeStatus,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

mod common;

const WAIT: Duration = Duration::from_secs(10);

#[tokio::test]
async fn always_failing_activity_is_tried_max_attempts_times() {
    let store = common::in_memory_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("AlwaysFails", move |_ctx: ActivityContext, _input: String| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Err("service unavailable".to_string())
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("WithRetry", |ctx: OrchestrationContext, _input: String| async move {
            let options = RetryOptions::new(Duration::from_millis(10), 3).with_backoff_coefficient(2.0);
            ctx.schedule_activity_with_retry("AlwaysFails", "", options).await
        })
        .build();
    let rt = common::start_runtime(store.clone(), activities, orchestrations, EntityRegistry::default()).await;

    let client = Client::new(store.clone());
    client.start_orchestration("retry-1", "WithRetry", "").await.unwrap();
    let state = client.wait_for_completion("retry-1", WAIT).await.unwrap();
    assert_eq!(state.runtime_status, RuntimeStatus::Failed);
    assert_eq!(state.output.as_deref(), Some("service unavailable"));

    let hist = client.get_history("retry-1").await.unwrap();
    assert_eq!(common::count_kind(&hist, "TaskScheduled"), 3);
    assert_eq!(common::count_kind(&hist, "TaskFailed"), 3);
    assert_eq!(common::count_kind(&hist, "TimerCreated"), 2);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    rt.shutdown().await;
}

#[tokio::test]
async fn retry_stops_once_the_call_succeeds() {
    let store = common::in_memory_store();
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let activities = ActivityRegistry::builder()
        .register("SecondTime", move |_ctx: ActivityContext, input: String| {
            let seen = seen.clone();
            async move {
                if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err("cold start".to_string())
                } else {
                    Ok(input)
                }
            }
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("WithRetry", |ctx: OrchestrationContext, input: String| async move {
            let options = RetryOptions::new(Duration::from_millis(10), 5);
            ctx.schedule_activity_with_retry("SecondTime", input, options).await
        })
        .build();
    let rt = common::start_runtime(store.clone(), activities, orchestrations, EntityRegistry::default()).await;

    let client = Client::new(store);
    client.start_orchestration("retry-2", "WithRetry", "payload").await.unwrap();
    let state = client.wait_for_completion("retry-2", WAIT).await.unwrap();
    assert_eq!(state.runtime_status, RuntimeStatus::Completed);
    assert_eq!(state.output.as_deref(), Some("payload"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    rt.shutdown().await;
}

#[tokio::test]
async fn handle_predicate_can_refuse_a_retry() {
    let store = common::in_memory_store();
    let activities = ActivityRegistry::builder()
        .register("Validate", |_ctx: ActivityContext, _input: String| async move {
            Err("invalid: missing field".to_string())
        })
        .build();
    let orchestrations = OrchestrationRegistry::builder()
        .register("WithRetry", |ctx: OrchestrationContext, _input: String| async move {
            let options =
                RetryOptions::new(Duration::from_millis(10), 5).with_handle(|err: &str| !err.starts_with("invalid"));
            ctx.schedule_activity_with_retry("Validate", "", options).await
        })
        .build();
    let rt = common::start_runtime(store.clone(), activities, orchestrations, EntityRegistry::default()).await;

    let client = Client::new(store);
    client.start_orchestration("retry-3", "WithRetry", "").await.unwrap();
    let state = client.wait_for_completion("retry-3", WAIT).await.unwrap();
    assert_eq!(state.runtime_status, RuntimeStatus::Failed);
    let hist = client.get_history("retry-3").await.unwrap();
    assert_eq!(common::count_kind(&hist, "TaskScheduled"), 1);
    rt.shutdown().await;
}

#[tokio::test]
async fn sub_orchestration_retry() {
    let store = common::in_memory_store();
    let orchestrations = OrchestrationRegistry::builder()
        .register("Child", |_ctx: OrchestrationContext, _input: String| async move {
            Err::<String, _>("child broke".to_string())
        })
        .register("Parent", |ctx: OrchestrationContext, _input: String| async move {
            let options = RetryOptions::new(Duration::from_millis(10), 2);
            match ctx.schedule_sub_orchestration_with_retry("Child", "", options).await {
                Ok(v) => Ok(v),
                Err(e) => Ok(format!("gave up: {e}")),
            }
        })
        .build();
    let rt = common::start_runtime(
        store.clone(),
        ActivityRegistry::builder().build(),
        orchestrations,
        EntityRegistry::default(),
    )
    .await;

    let client = Client::new(store);
    client.start_orchestration("retry-4", "Parent", "").await.unwrap();
    let state = client.wait_for_completion("retry-4", WAIT).await.unwrap();
    assert_eq!(state.output.as_deref(), Some("gave up: child broke"));
    let hist = client.get_history("retry-4").await.unwrap();
    assert_eq!(common::count_kind(&hist, "SubOrchestrationScheduled"), 2);
    rt.shutdown().await;
}
