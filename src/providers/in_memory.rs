use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::debug;

use super::{ExecutionMetadata, InstanceFilter, OrchestrationItem, Provider, ProviderError, WorkItem};
use crate::entity::EntitySchedulerState;
use crate::runtime::status::{OrchestrationState, RuntimeStatus};
use crate::Event;

/// How long a fetched instance or work item stays locked before its
/// messages become visible again.
const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Default)]
struct InstanceRecord {
    /// Execution histories; execution `n` lives at index `n - 1`.
    executions: Vec<Vec<Event>>,
    status: Option<RuntimeStatus>,
    function_name: String,
    input: Option<String>,
    output: Option<String>,
    custom_status: Option<String>,
    entity_state: Option<String>,
    created_ms: u64,
    updated_ms: u64,
    version: u64,
}

impl InstanceRecord {
    fn current_execution_id(&self) -> u64 {
        (self.executions.len() as u64).max(crate::INITIAL_EXECUTION_ID)
    }

    fn latest_history(&self) -> Vec<Event> {
        self.executions.last().cloned().unwrap_or_default()
    }

    fn to_state(&self, instance: &str, task_hub: &str) -> OrchestrationState {
        OrchestrationState {
            instance_id: instance.to_string(),
            task_hub: task_hub.to_string(),
            function_name: self.function_name.clone(),
            runtime_status: self.status.unwrap_or(RuntimeStatus::Pending),
            created_time_ms: self.created_ms,
            last_updated_time_ms: self.updated_ms,
            input: self.input.clone(),
            output: self.output.clone(),
            custom_status: self.custom_status.clone(),
            execution_id: self.current_execution_id(),
        }
    }
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    seq: u64,
    visible_at_ms: u64,
    item: WorkItem,
}

#[derive(Debug)]
struct InstanceLock {
    instance: String,
    messages: Vec<QueuedMessage>,
    expires_at_ms: u64,
}

#[derive(Debug)]
struct QueuedWork {
    seq: u64,
    item: WorkItem,
    lock: Option<(String, u64)>,
}

#[derive(Debug, Default)]
struct State {
    instances: HashMap<String, InstanceRecord>,
    orchestrator_queue: Vec<QueuedMessage>,
    worker_queue: Vec<QueuedWork>,
    /// lock token -> locked instance
    locks: HashMap<String, InstanceLock>,
    next_seq: u64,
}

impl State {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn push_orchestrator(&mut self, item: WorkItem, visible_at_ms: u64) {
        let seq = self.next_seq();
        self.orchestrator_queue.push(QueuedMessage {
            seq,
            visible_at_ms,
            item,
        });
    }

    fn push_worker(&mut self, item: WorkItem) {
        let seq = self.next_seq();
        self.worker_queue.push(QueuedWork { seq, item, lock: None });
    }

    fn is_locked(&self, instance: &str) -> bool {
        self.locks.values().any(|l| l.instance == instance)
    }

    /// Put the messages of locks that timed out back on the queue.
    fn expire_locks(&mut self, now: u64) {
        let expired: Vec<String> = self
            .locks
            .iter()
            .filter(|(_, l)| l.expires_at_ms <= now)
            .map(|(t, _)| t.clone())
            .collect();
        for token in expired {
            if let Some(lock) = self.locks.remove(&token) {
                debug!(instance = %lock.instance, "instance lock expired");
                self.orchestrator_queue.extend(lock.messages);
            }
        }
        for work in &mut self.worker_queue {
            if work.lock.as_ref().is_some_and(|(_, until)| *until <= now) {
                work.lock = None;
            }
        }
    }
}

/// Provider that keeps everything in process memory.
///
/// Instances are locked one at a time: a fetch takes every visible message
/// of the oldest ready instance, and nothing else can fetch that instance
/// until the lock is acked, abandoned or expires.
///
/// ```rust
/// use durafunc::providers::in_memory::InMemoryProvider;
/// use durafunc::providers::{Provider, WorkItem};
///
/// # tokio_test_block(async {
/// let store = InMemoryProvider::new("hub");
/// store
///     .enqueue_orchestrator_work(
///         WorkItem::StartOrchestration {
///             instance: "i1".into(),
///             orchestration: "Hello".into(),
///             input: "\"World\"".into(),
///             parent: None,
///         },
///         None,
///     )
///     .await
///     .unwrap();
/// let item = store.fetch_orchestration_item().await.unwrap().unwrap();
/// assert_eq!(item.instance, "i1");
/// assert!(item.history.is_empty());
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(f);
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryProvider {
    task_hub: String,
    lock_timeout: Duration,
    state: Mutex<State>,
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new("default")
    }
}

impl InMemoryProvider {
    pub fn new(task_hub: impl Into<String>) -> Self {
        Self {
            task_hub: task_hub.into(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn task_hub(&self) -> &str {
        &self.task_hub
    }

    fn lock_until(&self, now: u64) -> u64 {
        now.saturating_add(self.lock_timeout.as_millis() as u64)
    }

    /// Number of messages waiting on the orchestrator and worker queues.
    pub async fn queue_depths(&self) -> (usize, usize) {
        let g = self.state.lock().await;
        let locked: usize = g.locks.values().map(|l| l.messages.len()).sum();
        (g.orchestrator_queue.len() + locked, g.worker_queue.len())
    }
}

#[async_trait::async_trait]
impl Provider for InMemoryProvider {
    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError> {
        let now = crate::now_ms();
        let mut g = self.state.lock().await;
        g.expire_locks(now);

        let mut ready: Vec<&QueuedMessage> = g.orchestrator_queue.iter().filter(|m| m.visible_at_ms <= now).collect();
        ready.sort_by_key(|m| m.seq);
        let Some(instance) = ready
            .iter()
            .map(|m| m.item.instance())
            .find(|i| !g.is_locked(i))
            .map(str::to_string)
        else {
            return Ok(None);
        };

        let (mut messages, rest): (Vec<_>, Vec<_>) = std::mem::take(&mut g.orchestrator_queue)
            .into_iter()
            .partition(|m| m.visible_at_ms <= now && m.item.instance() == instance);
        g.orchestrator_queue = rest;
        messages.sort_by_key(|m| m.seq);

        let seq = g.next_seq();
        let lock_token = format!("{instance}#{seq}");
        let (execution_id, history, version, status, entity_state) = match g.instances.get(&instance) {
            Some(rec) => (
                rec.current_execution_id(),
                rec.latest_history(),
                rec.version,
                rec.status,
                rec.entity_state.clone(),
            ),
            None => (crate::INITIAL_EXECUTION_ID, Vec::new(), 0, None, None),
        };
        let item = OrchestrationItem {
            instance: instance.clone(),
            execution_id,
            history,
            version,
            messages: messages.iter().map(|m| m.item.clone()).collect(),
            status,
            entity_state,
            lock_token: lock_token.clone(),
        };
        let expires_at_ms = self.lock_until(now);
        g.locks.insert(
            lock_token,
            InstanceLock {
                instance,
                messages,
                expires_at_ms,
            },
        );
        Ok(Some(item))
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
        const OP: &str = "ack_orchestration_item";
        let now = crate::now_ms();
        let mut g = self.state.lock().await;
        let instance = match g.locks.get(lock_token) {
            Some(lock) => lock.instance.clone(),
            None => return Err(ProviderError::permanent(OP, format!("unknown lock token {lock_token}"))),
        };
        let current_version = g.instances.get(&instance).map(|r| r.version).unwrap_or(0);
        if current_version != expected_version {
            // The lock stays in place; the caller decides whether to abandon.
            return Err(ProviderError::conflict(
                OP,
                format!("instance {instance}: expected version {expected_version}, found {current_version}"),
            ));
        }
        g.locks.remove(lock_token);

        let touches_instance = !history_delta.is_empty() || metadata.status.is_some() || metadata.entity_state.is_some();
        if touches_instance {
            let rec = g.instances.entry(instance.clone()).or_insert_with(|| InstanceRecord {
                created_ms: now,
                ..InstanceRecord::default()
            });
            if metadata.start_new_execution || rec.executions.is_empty() {
                rec.executions.push(history_delta);
            } else if let Some(current) = rec.executions.last_mut() {
                current.extend(history_delta);
            }
            if let Some(status) = metadata.status {
                rec.status = Some(status);
            }
            if let Some(name) = metadata.function_name {
                rec.function_name = name;
            }
            if metadata.input.is_some() {
                rec.input = metadata.input;
            }
            rec.output = metadata.output;
            if metadata.custom_status.is_some() {
                rec.custom_status = metadata.custom_status;
            }
            if metadata.entity_state.is_some() {
                rec.entity_state = metadata.entity_state;
            }
            rec.updated_ms = now;
            rec.version += 1;
        }

        for item in worker_items {
            g.push_worker(item);
        }
        for item in timer_items {
            let visible_at_ms = match &item {
                WorkItem::TimerFired { fire_at_ms, .. } => *fire_at_ms,
                _ => now,
            };
            g.push_orchestrator(item, visible_at_ms);
        }
        for item in orchestrator_items {
            g.push_orchestrator(item, now);
        }

        if metadata.remove_instance {
            debug!(instance = %instance, "removing instance");
            g.instances.remove(&instance);
        }
        Ok(())
    }

    async fn abandon_orchestration_item(&self, lock_token: &str, delay_ms: Option<u64>) -> Result<(), ProviderError> {
        let now = crate::now_ms();
        let mut g = self.state.lock().await;
        let Some(lock) = g.locks.remove(lock_token) else {
            return Err(ProviderError::permanent(
                "abandon_orchestration_item",
                format!("unknown lock token {lock_token}"),
            ));
        };
        let visible_at_ms = now.saturating_add(delay_ms.unwrap_or(0));
        for mut m in lock.messages {
            m.visible_at_ms = m.visible_at_ms.max(visible_at_ms);
            g.orchestrator_queue.push(m);
        }
        Ok(())
    }

    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay_ms: Option<u64>) -> Result<(), ProviderError> {
        let now = crate::now_ms();
        let mut g = self.state.lock().await;
        if let WorkItem::StartOrchestration {
            instance,
            orchestration,
            input,
            ..
        } = &item
        {
            // checked under the same lock that creates the record
            if g.instances.contains_key(instance) {
                return Err(ProviderError::conflict(
                    "enqueue_orchestrator_work",
                    format!("instance '{instance}' already exists"),
                ));
            }
            g.instances.insert(
                instance.clone(),
                InstanceRecord {
                    status: Some(RuntimeStatus::Pending),
                    function_name: orchestration.clone(),
                    input: Some(input.clone()),
                    created_ms: now,
                    updated_ms: now,
                    ..InstanceRecord::default()
                },
            );
        }
        g.push_orchestrator(item, now.saturating_add(delay_ms.unwrap_or(0)));
        Ok(())
    }

    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError> {
        let now = crate::now_ms();
        let mut g = self.state.lock().await;
        g.expire_locks(now);
        let token_seq = g.next_seq();
        let until = self.lock_until(now);
        let Some(work) = g.worker_queue.iter_mut().filter(|w| w.lock.is_none()).min_by_key(|w| w.seq) else {
            return Ok(None);
        };
        let token = format!("work#{token_seq}");
        work.lock = Some((token.clone(), until));
        Ok(Some((work.item.clone(), token)))
    }

    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError> {
        let now = crate::now_ms();
        let mut g = self.state.lock().await;
        let Some(pos) = g
            .worker_queue
            .iter()
            .position(|w| w.lock.as_ref().is_some_and(|(t, _)| t == token))
        else {
            return Err(ProviderError::permanent("ack_work_item", format!("unknown work token {token}")));
        };
        g.worker_queue.remove(pos);
        g.push_orchestrator(completion, now);
        Ok(())
    }

    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances.get(instance).map(InstanceRecord::latest_history).unwrap_or_default())
    }

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError> {
        let g = self.state.lock().await;
        let Some(rec) = g.instances.get(instance) else {
            return Ok(Vec::new());
        };
        let idx = execution_id.checked_sub(1).map(|i| i as usize);
        Ok(idx.and_then(|i| rec.executions.get(i)).cloned().unwrap_or_default())
    }

    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError> {
        let now = crate::now_ms();
        let mut g = self.state.lock().await;
        let rec = g.instances.entry(instance.to_string()).or_insert_with(|| InstanceRecord {
            created_ms: now,
            ..InstanceRecord::default()
        });
        if rec.version != expected_version {
            return Err(ProviderError::conflict(
                "append_events",
                format!("instance {instance}: expected version {expected_version}, found {}", rec.version),
            ));
        }
        match rec.executions.last_mut() {
            Some(current) => current.extend(events),
            None => rec.executions.push(events),
        }
        rec.updated_ms = now;
        rec.version += 1;
        Ok(rec.version)
    }

    async fn get_instance_info(&self, instance: &str) -> Result<Option<OrchestrationState>, ProviderError> {
        let g = self.state.lock().await;
        Ok(g.instances.get(instance).map(|rec| rec.to_state(instance, &self.task_hub)))
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<OrchestrationState>, ProviderError> {
        let g = self.state.lock().await;
        let mut out: Vec<OrchestrationState> = g
            .instances
            .iter()
            .map(|(id, rec)| rec.to_state(id, &self.task_hub))
            .filter(|s| filter.matches(s))
            .collect();
        out.sort_by(|a, b| {
            a.created_time_ms
                .cmp(&b.created_time_ms)
                .then_with(|| a.instance_id.cmp(&b.instance_id))
        });
        Ok(out)
    }

    async fn purge_instance(&self, instance: &str) -> Result<bool, ProviderError> {
        let mut g = self.state.lock().await;
        let Some(rec) = g.instances.get(instance) else {
            return Ok(false);
        };
        if !rec.status.is_some_and(RuntimeStatus::is_terminal) {
            return Err(ProviderError::permanent(
                "purge_instance",
                format!("instance {instance} is not in a terminal state"),
            ));
        }
        if g.is_locked(instance) {
            return Err(ProviderError::retryable(
                "purge_instance",
                format!("instance {instance} is locked"),
            ));
        }
        g.instances.remove(instance);
        g.orchestrator_queue.retain(|m| m.item.instance() != instance);
        let gone: HashSet<u64> = g
            .worker_queue
            .iter()
            .filter(|w| w.item.instance() == instance)
            .map(|w| w.seq)
            .collect();
        g.worker_queue.retain(|w| !gone.contains(&w.seq));
        Ok(true)
    }

    async fn read_entity_state(&self, instance: &str) -> Result<Option<String>, ProviderError> {
        let g = self.state.lock().await;
        let raw = g.instances.get(instance).and_then(|r| r.entity_state.as_deref());
        let scheduler = EntitySchedulerState::decode(raw)
            .map_err(|e| ProviderError::permanent("read_entity_state", e.to_string()))?;
        Ok(if scheduler.exists { scheduler.state } else { None })
    }
}
