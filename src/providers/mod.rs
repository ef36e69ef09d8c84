use crate::entity::OperationRequest;
use crate::runtime::status::{OrchestrationState, RuntimeStatus};
use crate::{ErrorDetails, Event, ParentLink};
use serde::{Deserialize, Serialize};

pub mod error;
pub use error::{ProviderError, ProviderErrorKind};

/// In-memory provider for tests and embedded use.
pub mod in_memory;

/// Messages exchanged between the client, the dispatchers and the store.
///
/// Everything except `ActivityExecute` travels on the orchestrator queue and
/// is keyed by the instance it targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkItem {
    StartOrchestration {
        instance: String,
        orchestration: String,
        input: String,
        parent: Option<ParentLink>,
    },
    ContinueAsNew {
        instance: String,
        orchestration: String,
        input: String,
    },
    ActivityExecute {
        instance: String,
        execution_id: u64,
        id: u64,
        name: String,
        input: String,
    },
    ActivityCompleted {
        instance: String,
        execution_id: u64,
        id: u64,
        result: String,
    },
    ActivityFailed {
        instance: String,
        execution_id: u64,
        id: u64,
        details: ErrorDetails,
    },
    TimerFired {
        instance: String,
        execution_id: u64,
        id: u64,
        fire_at_ms: u64,
    },
    ExternalRaised {
        instance: String,
        name: String,
        data: String,
    },
    SubOrchCompleted {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        result: String,
    },
    SubOrchFailed {
        parent_instance: String,
        parent_execution_id: u64,
        parent_id: u64,
        details: ErrorDetails,
    },
    /// One operation for an entity; the dispatcher batches them.
    EntityOperation {
        instance: String,
        request: OperationRequest,
    },
    /// Result of an entity call, routed back to the calling orchestration.
    EntityResponse {
        instance: String,
        execution_id: u64,
        id: u64,
        outcome: Result<String, ErrorDetails>,
    },
    /// The last entity of a lock set granted its lock; routed back to the
    /// orchestration that asked.
    EntityLockGranted {
        instance: String,
        execution_id: u64,
        id: u64,
    },
    /// Give up the lock `owner` holds on the entity.
    EntityUnlock {
        instance: String,
        owner: String,
        request_id: String,
    },
    /// Nudge an entity with queued operations to run its next batch.
    EntityContinue {
        instance: String,
    },
    TerminateInstance {
        instance: String,
        reason: String,
    },
    CancelInstance {
        instance: String,
        reason: String,
    },
    RewindInstance {
        instance: String,
        reason: String,
    },
}

impl WorkItem {
    /// Instance the item is addressed to.
    pub fn instance(&self) -> &str {
        match self {
            WorkItem::StartOrchestration { instance, .. }
            | WorkItem::ContinueAsNew { instance, .. }
            | WorkItem::ActivityExecute { instance, .. }
            | WorkItem::ActivityCompleted { instance, .. }
            | WorkItem::ActivityFailed { instance, .. }
            | WorkItem::TimerFired { instance, .. }
            | WorkItem::ExternalRaised { instance, .. }
            | WorkItem::EntityOperation { instance, .. }
            | WorkItem::EntityResponse { instance, .. }
            | WorkItem::EntityLockGranted { instance, .. }
            | WorkItem::EntityUnlock { instance, .. }
            | WorkItem::EntityContinue { instance }
            | WorkItem::TerminateInstance { instance, .. }
            | WorkItem::CancelInstance { instance, .. }
            | WorkItem::RewindInstance { instance, .. } => instance,
            WorkItem::SubOrchCompleted { parent_instance, .. } | WorkItem::SubOrchFailed { parent_instance, .. } => {
                parent_instance
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            WorkItem::StartOrchestration { .. } => "StartOrchestration",
            WorkItem::ContinueAsNew { .. } => "ContinueAsNew",
            WorkItem::ActivityExecute { .. } => "ActivityExecute",
            WorkItem::ActivityCompleted { .. } => "ActivityCompleted",
            WorkItem::ActivityFailed { .. } => "ActivityFailed",
            WorkItem::TimerFired { .. } => "TimerFired",
            WorkItem::ExternalRaised { .. } => "ExternalRaised",
            WorkItem::SubOrchCompleted { .. } => "SubOrchCompleted",
            WorkItem::SubOrchFailed { .. } => "SubOrchFailed",
            WorkItem::EntityOperation { .. } => "EntityOperation",
            WorkItem::EntityResponse { .. } => "EntityResponse",
            WorkItem::EntityLockGranted { .. } => "EntityLockGranted",
            WorkItem::EntityUnlock { .. } => "EntityUnlock",
            WorkItem::EntityContinue { .. } => "EntityContinue",
            WorkItem::TerminateInstance { .. } => "TerminateInstance",
            WorkItem::CancelInstance { .. } => "CancelInstance",
            WorkItem::RewindInstance { .. } => "RewindInstance",
        }
    }
}

/// Everything the orchestration dispatcher needs for one pass over an
/// instance. The instance stays locked until the item is acked or abandoned.
#[derive(Debug, Clone)]
pub struct OrchestrationItem {
    pub instance: String,
    pub execution_id: u64,
    /// History of the current execution.
    pub history: Vec<Event>,
    /// Optimistic concurrency token; changes on every successful write.
    pub version: u64,
    pub messages: Vec<WorkItem>,
    pub status: Option<RuntimeStatus>,
    /// Serialized entity scheduler state, for entity instances.
    pub entity_state: Option<String>,
    pub lock_token: String,
}

/// Instance-level facts computed by the runtime and stored with an ack.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionMetadata {
    pub status: Option<RuntimeStatus>,
    pub function_name: Option<String>,
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    /// Replaces the stored entity scheduler state when set.
    pub entity_state: Option<String>,
    /// Close the current execution and start the next one (continue-as-new,
    /// or a completed entity batch). The delta then belongs to the new execution.
    pub start_new_execution: bool,
    /// Drop the instance entirely (entity destructed with nothing queued).
    pub remove_instance: bool,
}

/// Filter for [`Provider::list_instances`].
#[derive(Debug, Clone, Default)]
pub struct InstanceFilter {
    pub statuses: Option<Vec<RuntimeStatus>>,
    pub created_from_ms: Option<u64>,
    pub created_to_ms: Option<u64>,
    /// Include entity instances (ids starting with `@`).
    pub include_entities: bool,
}

impl InstanceFilter {
    pub fn matches(&self, state: &OrchestrationState) -> bool {
        if !self.include_entities && state.instance_id.starts_with('@') {
            return false;
        }
        if let Some(statuses) = &self.statuses {
            if !statuses.contains(&state.runtime_status) {
                return false;
            }
        }
        if self.created_from_ms.is_some_and(|from| state.created_time_ms < from) {
            return false;
        }
        if self.created_to_ms.is_some_and(|to| state.created_time_ms > to) {
            return false;
        }
        true
    }
}

/// Durable store plus message transport.
///
/// Delivery is at-least-once: a fetched item that is not acked becomes
/// visible again. The runtime makes processing idempotent by correlating
/// completions with the history it already holds.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    /// Lock the next instance with visible messages and return its state.
    async fn fetch_orchestration_item(&self) -> Result<Option<OrchestrationItem>, ProviderError>;

    /// Commit one pass atomically: append `history_delta`, enqueue the new
    /// messages, store metadata, delete the fetched messages and release the
    /// lock. Fails with a conflict if the instance version moved.
    #[allow(clippy::too_many_arguments)]
    async fn ack_orchestration_item(
        &self,
        lock_token: &str,
        expected_version: u64,
        history_delta: Vec<Event>,
        worker_items: Vec<WorkItem>,
        timer_items: Vec<WorkItem>,
        orchestrator_items: Vec<WorkItem>,
        metadata: ExecutionMetadata,
    ) -> Result<(), ProviderError>;

    /// Release the lock and make the fetched messages visible again after `delay_ms`.
    async fn abandon_orchestration_item(&self, lock_token: &str, delay_ms: Option<u64>) -> Result<(), ProviderError>;

    /// Queue a message for an instance. A `StartOrchestration` for an instance
    /// that already exists must fail with a conflict error, atomically with
    /// creating the pending record.
    async fn enqueue_orchestrator_work(&self, item: WorkItem, delay_ms: Option<u64>) -> Result<(), ProviderError>;

    async fn fetch_work_item(&self) -> Result<Option<(WorkItem, String)>, ProviderError>;

    /// Delete a worker item and enqueue its completion in one step.
    async fn ack_work_item(&self, token: &str, completion: WorkItem) -> Result<(), ProviderError>;

    /// History of the latest execution.
    async fn read(&self, instance: &str) -> Result<Vec<Event>, ProviderError>;

    async fn read_execution(&self, instance: &str, execution_id: u64) -> Result<Vec<Event>, ProviderError>;

    /// Append events outside a dispatcher pass. Conflicts when the instance
    /// version is not `expected_version`.
    async fn append_events(
        &self,
        instance: &str,
        expected_version: u64,
        events: Vec<Event>,
    ) -> Result<u64, ProviderError>;

    async fn get_instance_info(&self, instance: &str) -> Result<Option<OrchestrationState>, ProviderError>;

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<OrchestrationState>, ProviderError>;

    /// Delete a terminal instance and its history. Returns false if it did not exist.
    async fn purge_instance(&self, instance: &str) -> Result<bool, ProviderError>;

    async fn read_entity_state(&self, instance: &str) -> Result<Option<String>, ProviderError>;
}
