//! Durable orchestrations and entities driven by deterministic replay.
//!
//! Every orchestration instance owns an append-only history. Each time new
//! input arrives (an activity result, a timer firing, an external event) the
//! runtime replays the orchestration function against that history: awaits
//! whose outcome is already recorded resolve immediately, and the first
//! await that has no recorded outcome becomes a new [`Decision`] that the
//! host persists and acts on. Entities are keyed single-writer actors whose
//! operations run in batches under the same replay discipline.
//!
//! ```rust,no_run
//! use durafunc::runtime::{self, registry::ActivityRegistry};
//! use durafunc::{ActivityContext, Client, OrchestrationClient, OrchestrationContext, OrchestrationRegistry};
//! use durafunc::entity::EntityRegistry;
//! use durafunc::providers::in_memory::InMemoryProvider;
//! use std::sync::Arc;
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(InMemoryProvider::new("hub"));
//! let activities = ActivityRegistry::builder()
//!     .register("Hello", |_ctx: ActivityContext, name: String| async move { Ok(format!("Hello, {name}!")) })
//!     .build();
//! let orchestrations = OrchestrationRegistry::builder()
//!     .register("HelloSequence", |ctx: OrchestrationContext, input: String| async move {
//!         ctx.schedule_activity("Hello", input).await
//!     })
//!     .build();
//! let rt = runtime::Runtime::start_with_store(
//!     store.clone(),
//!     Arc::new(activities),
//!     orchestrations,
//!     EntityRegistry::default(),
//! )
//! .await;
//! let client = Client::new(store);
//! client.start_orchestration("inst-1", "HelloSequence", "World").await?;
//! rt.shutdown().await;
//! # Ok(())
//! # }
//! ```

use serde::{Deserialize, Serialize};

pub mod client;
pub mod codec;
pub mod context;
pub mod entity;
pub mod errors;
pub mod futures;
pub mod history;
pub mod logging;
pub mod providers;
pub mod retry;
pub mod runtime;

pub use client::{Client, ClientError, OrchestrationClient};
pub use context::{CancellationToken, CriticalSection, OrchestrationContext};
pub use entity::{EntityContext, EntityId, EntityRegistry, OperationRequest};
pub use errors::ErrorDetails;
pub use crate::futures::{DurableFuture, EventFuture, TaskFuture, TimerFuture, TimerOutcome};
pub use history::HistoryLog;
pub use retry::{RetryDecision, RetryOptions};
pub use runtime::registry::{ActivityRegistry, OrchestrationRegistry};
pub use runtime::status::{OrchestrationState, RuntimeStatus};
pub use runtime::{ActivityContext, Runtime, RuntimeOptions};

#[allow(deprecated)]
pub use entity::{ActorContext, ActorId};

/// Identifies the orchestration (and the scheduling event inside it) that
/// started a sub-orchestration or called an entity operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance: String,
    pub execution_id: u64,
    pub source_event_id: u64,
}

/// One immutable entry of an instance's history.
///
/// `event_id` is the 1-based position of the event within its execution.
/// Completion events point back at the scheduling event they resolve via
/// `source_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    ExecutionStarted {
        event_id: u64,
        name: String,
        input: String,
        parent: Option<ParentLink>,
        timestamp_ms: u64,
    },
    /// Marks the start of a replay pass and fixes the deterministic clock.
    OrchestratorStarted {
        event_id: u64,
        timestamp_ms: u64,
    },
    TaskScheduled {
        event_id: u64,
        name: String,
        input: String,
    },
    TaskCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    TaskFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    SubOrchestrationScheduled {
        event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    SubOrchestrationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    SubOrchestrationFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    TimerCreated {
        event_id: u64,
        fire_at_ms: u64,
    },
    TimerFired {
        event_id: u64,
        source_event_id: u64,
        fire_at_ms: u64,
    },
    EventRaised {
        event_id: u64,
        name: String,
        input: String,
    },
    EntityOperationCalled {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: Option<String>,
        request_id: String,
    },
    EntityOperationSignaled {
        event_id: u64,
        entity: EntityId,
        operation: String,
        input: Option<String>,
        request_id: String,
    },
    EntityOperationCompleted {
        event_id: u64,
        source_event_id: u64,
        result: String,
    },
    EntityOperationFailed {
        event_id: u64,
        source_event_id: u64,
        details: ErrorDetails,
    },
    /// Asks the entities in `lock_set` (sorted, distinct) for their locks.
    EntityLockRequested {
        event_id: u64,
        lock_set: Vec<EntityId>,
        request_id: String,
    },
    EntityLockGranted {
        event_id: u64,
        source_event_id: u64,
    },
    /// Hands the locks of a critical section back to their entities.
    EntityLockReleased {
        event_id: u64,
        lock_set: Vec<EntityId>,
        request_id: String,
    },
    /// Fixes the operations of an entity batch so that a suspended batch
    /// replays exactly the same operations when it resumes.
    EntityBatchStarted {
        event_id: u64,
        operations: Vec<OperationRequest>,
    },
    EntityBatchCompleted {
        event_id: u64,
    },
    ExecutionRewound {
        event_id: u64,
        reason: String,
    },
    ExecutionContinuedAsNew {
        event_id: u64,
        input: String,
    },
    ExecutionTerminated {
        event_id: u64,
        reason: String,
    },
    ExecutionCanceled {
        event_id: u64,
        reason: String,
    },
    ExecutionCompleted {
        event_id: u64,
        output: String,
    },
    ExecutionFailed {
        event_id: u64,
        details: ErrorDetails,
    },
}

/// Category of a scheduling event, used for ordinal correlation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleKind {
    Task,
    Timer,
    SubOrchestration,
    EntityCall,
    EntitySignal,
    EntityLock,
    EntityUnlock,
}

impl std::fmt::Display for ScheduleKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScheduleKind::Task => "TaskScheduled",
            ScheduleKind::Timer => "TimerCreated",
            ScheduleKind::SubOrchestration => "SubOrchestrationScheduled",
            ScheduleKind::EntityCall => "EntityOperationCalled",
            ScheduleKind::EntitySignal => "EntityOperationSignaled",
            ScheduleKind::EntityLock => "EntityLockRequested",
            ScheduleKind::EntityUnlock => "EntityLockReleased",
        };
        f.write_str(s)
    }
}

impl Event {
    pub fn event_id(&self) -> u64 {
        match self {
            Event::ExecutionStarted { event_id, .. }
            | Event::OrchestratorStarted { event_id, .. }
            | Event::TaskScheduled { event_id, .. }
            | Event::TaskCompleted { event_id, .. }
            | Event::TaskFailed { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::EventRaised { event_id, .. }
            | Event::EntityOperationCalled { event_id, .. }
            | Event::EntityOperationSignaled { event_id, .. }
            | Event::EntityOperationCompleted { event_id, .. }
            | Event::EntityOperationFailed { event_id, .. }
            | Event::EntityLockRequested { event_id, .. }
            | Event::EntityLockGranted { event_id, .. }
            | Event::EntityLockReleased { event_id, .. }
            | Event::EntityBatchStarted { event_id, .. }
            | Event::EntityBatchCompleted { event_id }
            | Event::ExecutionRewound { event_id, .. }
            | Event::ExecutionContinuedAsNew { event_id, .. }
            | Event::ExecutionTerminated { event_id, .. }
            | Event::ExecutionCanceled { event_id, .. }
            | Event::ExecutionCompleted { event_id, .. }
            | Event::ExecutionFailed { event_id, .. } => *event_id,
        }
    }

    pub(crate) fn set_event_id(&mut self, id: u64) {
        match self {
            Event::ExecutionStarted { event_id, .. }
            | Event::OrchestratorStarted { event_id, .. }
            | Event::TaskScheduled { event_id, .. }
            | Event::TaskCompleted { event_id, .. }
            | Event::TaskFailed { event_id, .. }
            | Event::SubOrchestrationScheduled { event_id, .. }
            | Event::SubOrchestrationCompleted { event_id, .. }
            | Event::SubOrchestrationFailed { event_id, .. }
            | Event::TimerCreated { event_id, .. }
            | Event::TimerFired { event_id, .. }
            | Event::EventRaised { event_id, .. }
            | Event::EntityOperationCalled { event_id, .. }
            | Event::EntityOperationSignaled { event_id, .. }
            | Event::EntityOperationCompleted { event_id, .. }
            | Event::EntityOperationFailed { event_id, .. }
            | Event::EntityLockRequested { event_id, .. }
            | Event::EntityLockGranted { event_id, .. }
            | Event::EntityLockReleased { event_id, .. }
            | Event::EntityBatchStarted { event_id, .. }
            | Event::EntityBatchCompleted { event_id }
            | Event::ExecutionRewound { event_id, .. }
            | Event::ExecutionContinuedAsNew { event_id, .. }
            | Event::ExecutionTerminated { event_id, .. }
            | Event::ExecutionCanceled { event_id, .. }
            | Event::ExecutionCompleted { event_id, .. }
            | Event::ExecutionFailed { event_id, .. } => *event_id = id,
        }
    }

    /// The scheduling event this completion resolves, if it is a completion.
    pub fn source_event_id(&self) -> Option<u64> {
        match self {
            Event::TaskCompleted { source_event_id, .. }
            | Event::TaskFailed { source_event_id, .. }
            | Event::SubOrchestrationCompleted { source_event_id, .. }
            | Event::SubOrchestrationFailed { source_event_id, .. }
            | Event::TimerFired { source_event_id, .. }
            | Event::EntityOperationCompleted { source_event_id, .. }
            | Event::EntityOperationFailed { source_event_id, .. }
            | Event::EntityLockGranted { source_event_id, .. } => Some(*source_event_id),
            _ => None,
        }
    }

    /// Category and name of a scheduling event. `None` for every other event.
    pub fn schedule_kind(&self) -> Option<(ScheduleKind, &str)> {
        match self {
            Event::TaskScheduled { name, .. } => Some((ScheduleKind::Task, name.as_str())),
            Event::TimerCreated { .. } => Some((ScheduleKind::Timer, "")),
            Event::SubOrchestrationScheduled { name, .. } => Some((ScheduleKind::SubOrchestration, name.as_str())),
            Event::EntityOperationCalled { operation, .. } => Some((ScheduleKind::EntityCall, operation.as_str())),
            Event::EntityOperationSignaled { operation, .. } => Some((ScheduleKind::EntitySignal, operation.as_str())),
            Event::EntityLockRequested { .. } => Some((ScheduleKind::EntityLock, "")),
            Event::EntityLockReleased { .. } => Some((ScheduleKind::EntityUnlock, "")),
            _ => None,
        }
    }

    /// The kind of scheduling event a completion must point at.
    pub(crate) fn completes_kind(&self) -> Option<ScheduleKind> {
        match self {
            Event::TaskCompleted { .. } | Event::TaskFailed { .. } => Some(ScheduleKind::Task),
            Event::TimerFired { .. } => Some(ScheduleKind::Timer),
            Event::SubOrchestrationCompleted { .. } | Event::SubOrchestrationFailed { .. } => {
                Some(ScheduleKind::SubOrchestration)
            }
            Event::EntityOperationCompleted { .. } | Event::EntityOperationFailed { .. } => {
                Some(ScheduleKind::EntityCall)
            }
            Event::EntityLockGranted { .. } => Some(ScheduleKind::EntityLock),
            _ => None,
        }
    }

    /// Failures that a rewind voids. Entity operation failures are final
    /// because the entity already applied (and rolled back) the operation.
    pub fn is_rewindable_failure(&self) -> bool {
        matches!(
            self,
            Event::TaskFailed { .. } | Event::SubOrchestrationFailed { .. } | Event::ExecutionFailed { .. }
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Event::ExecutionCompleted { .. }
                | Event::ExecutionFailed { .. }
                | Event::ExecutionTerminated { .. }
                | Event::ExecutionCanceled { .. }
                | Event::ExecutionContinuedAsNew { .. }
        )
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Event::ExecutionStarted { .. } => "ExecutionStarted",
            Event::OrchestratorStarted { .. } => "OrchestratorStarted",
            Event::TaskScheduled { .. } => "TaskScheduled",
            Event::TaskCompleted { .. } => "TaskCompleted",
            Event::TaskFailed { .. } => "TaskFailed",
            Event::SubOrchestrationScheduled { .. } => "SubOrchestrationScheduled",
            Event::SubOrchestrationCompleted { .. } => "SubOrchestrationCompleted",
            Event::SubOrchestrationFailed { .. } => "SubOrchestrationFailed",
            Event::TimerCreated { .. } => "TimerCreated",
            Event::TimerFired { .. } => "TimerFired",
            Event::EventRaised { .. } => "EventRaised",
            Event::EntityOperationCalled { .. } => "EntityOperationCalled",
            Event::EntityOperationSignaled { .. } => "EntityOperationSignaled",
            Event::EntityOperationCompleted { .. } => "EntityOperationCompleted",
            Event::EntityOperationFailed { .. } => "EntityOperationFailed",
            Event::EntityLockRequested { .. } => "EntityLockRequested",
            Event::EntityLockGranted { .. } => "EntityLockGranted",
            Event::EntityLockReleased { .. } => "EntityLockReleased",
            Event::EntityBatchStarted { .. } => "EntityBatchStarted",
            Event::EntityBatchCompleted { .. } => "EntityBatchCompleted",
            Event::ExecutionRewound { .. } => "ExecutionRewound",
            Event::ExecutionContinuedAsNew { .. } => "ExecutionContinuedAsNew",
            Event::ExecutionTerminated { .. } => "ExecutionTerminated",
            Event::ExecutionCanceled { .. } => "ExecutionCanceled",
            Event::ExecutionCompleted { .. } => "ExecutionCompleted",
            Event::ExecutionFailed { .. } => "ExecutionFailed",
        }
    }
}

/// An intent emitted by user code during a replay pass.
///
/// Every decision except `WaitForEvent` is backed by a scheduling event that
/// was appended to the history in the same pass, identified by
/// `scheduling_event_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    ScheduleTask {
        scheduling_event_id: u64,
        name: String,
        input: String,
    },
    CreateTimer {
        scheduling_event_id: u64,
        fire_at_ms: u64,
    },
    StartSubOrchestration {
        scheduling_event_id: u64,
        name: String,
        instance: String,
        input: String,
    },
    CallEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: Option<String>,
        request_id: String,
    },
    SignalEntity {
        scheduling_event_id: u64,
        entity: EntityId,
        operation: String,
        input: Option<String>,
        request_id: String,
    },
    LockEntities {
        scheduling_event_id: u64,
        lock_set: Vec<EntityId>,
        request_id: String,
    },
    UnlockEntities {
        scheduling_event_id: u64,
        lock_set: Vec<EntityId>,
        request_id: String,
    },
    WaitForEvent {
        name: String,
    },
}

/// Execution ids start at 1 and grow with every continue-as-new (and, for
/// entities, with every completed batch).
pub const INITIAL_EXECUTION_ID: u64 = 1;
pub const INITIAL_EVENT_ID: u64 = 1;

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
