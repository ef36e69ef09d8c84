#![allow(dead_code)]

use durafunc::entity::EntityRegistry;
use durafunc::providers::in_memory::InMemoryProvider;
use durafunc::providers::{
    ExecutionMetadata, InstanceFilter, OrchestrationItem, Provider, ProviderError, WorkItem,
};
use durafunc::{ActivityRegistry, Event, OrchestrationRegistry, OrchestrationState, Runtime, RuntimeOptions};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Options tuned for tests: short idle sleeps so passes follow each other quickly.
pub fn fast_options() -> RuntimeOptions {
    RuntimeOptions {
        dispatcher_idle_sleep: Duration::from_millis(2),
        ..RuntimeOptions::default()
    }
}

pub fn in_memory_store() -> Arc<dyn Provider> {
    Arc::new(InMemoryProvider::new("test-hub"))
}

pub async fn start_runtime(
    store: Arc<dyn Provider>,
    activities: ActivityRegistry,
    orchestrations: OrchestrationRegistry,
    entities: EntityRegistry,
) -> Arc<Runtime> {
    Runtime::start_with_options(store, Arc::new(activities), orchestrations, entities, fast_options()).await
}

pub async fn wait_for_history<F>(store: &Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> bool
where
    F: Fn(&[Event]) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        let hist = store.read(instance).await.unwrap_or_default();
        if predicate(&hist) {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status<F>(store: &Arc<dyn Provider>, instance: &str, predicate: F, timeout_ms: u64) -> Option<OrchestrationState>
where
    F: Fn(&OrchestrationState) -> bool,
{
    let deadline = Instant::now() + Duration::from_millis(timeout_ms);
    loop {
        if let Ok(Some(state)) = store.get_instance_info(instance).await {
            if predicate(&state) {
                return Some(state);
            }
        }
        if Instant::now() > deadline {
            return None;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub fn count_kind(history: &[Event], kind: &str) -> usize {
    history.iter().filter(|e| e.kind() == kind).count()
}

/// Provider wrapper that fails selected calls a given number of times before
/// passing them through.
pub struct FaultyProvider {
    inner: Arc<dyn Provider>,
    ack_conflicts: AtomicU32,
    ack_retryable: AtomicU32,
    work_ack_retryable: AtomicU32,
    fetch_retryable: AtomicU32,
    pub injected: AtomicU32,
}

impl FaultyProvider {
    pub fn new(inner: Arc<dyn Provider>) -> Self {
        Self {
            inner,
            ack_conflicts: AtomicU32::new(0),
            ack_retryable: AtomicU32::new(0),
            work_ack_retryable: AtomicU32::new(0),
            fetch_retryable: AtomicU32::new(0),
            injected: AtomicU32::new(0),
        }
    }

    pub fn conflict_next_acks(&self, n: u32) {
        self.ack_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_acks(&self, n: u32) {
        self.ack_retryable.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_work_acks(&self, n: u32) {
        self.work_ack_retryable.store(n, Ordering::SeqCst);
    }

    pub fn fail_next_fetches(&self, n: u32) {
        self.fetch_retryable.store(n, Ordering::SeqCst);
    }

    fn take(&self, counter: &AtomicU32) -> bool {
        let took = counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if took {
            self.injected.fetch_add(1, Ordering::SeqCst);
        }
        took
    }
}

#[async_trait::async_trait]
impl Provider for FaultyProvider {
    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        if self.take(&self.fetch_retryable) {
            return Err(ProviderError::retryable("fetch_orchestration_item", "injected: store busy"));
        }
        self.inner.fetch_orchestration_item().await
    }

    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        expected_version: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError> {
        if self.take(&self.ack_conflicts) {
            return Err(ProviderError::conflict("ack_orchestration_item", "injected: version moved"));
        }
        if self.take(&self.ack_retryable) {
            return Err(ProviderError::retryable("ack_orchestration_item", "injected: timeout"));
        }
        self.inner
            .ack_orchestration_item(
                lock_token,
                expected_version,
                history_delta,
                worker_items,
                timer_items,
                orchestrator_items,
                metadata,
            )
            .await
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay_ms: Option<u64>) -> Result<(), ProviderError> {
        self.inner.abandon_orchestration_item(lock_token, delay_ms).await
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay_ms: Option<u64>) -> Result<(), ProviderError> {
        self.inner.enqueue_orchestrator_work(item, delay_ms).await
    }

    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        self.inner.fetch_work_item().await
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        if self.take(&self.work_ack_retryable) {
            return Err(ProviderError::retryable("ack_work_item", "injected: timeout"));
        }
        self.inner.ack_work_item(token, completion).await
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        self.inner.read(instance).await
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        self.inner.read_execution(instance, execution_id).await
    }

    async fn append_events(&self, instance: &str, expected_version: u64, events: Vec<Event>) -> Result<u64, ProviderError> {
        self.inner.append_events(instance, expected_version, events).await
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<OrchestrationState>, ProviderError> {
        self.inner.get_instance_info(instance).await
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<OrchestrationState>, ProviderError> {
        self.inner.list_instances(filter).await
    }

    async fn purge_instance(&self, instance: &str) -> Result<bool, ProviderError> {
        self.inner.purge_instance(instance).await
    }

    async fn read_entity_state(&self, instance: &str) -> Result<Option<String>, ProviderError> {
        self.inner.read_entity_state(instance).await
    }
}
