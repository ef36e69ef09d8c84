//! Batch execution for entities.
//!
//! A batch runs its operations one after another against the state loaded
//! when the batch started. Each operation is checkpointed: if it fails, its
//! state changes, outgoing signals and return value are discarded and the
//! next operation sees the state as it was before. Operations may call
//! activities; the whole batch then suspends and is replayed from the start
//! once results arrive, exactly like an orchestration.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, warn};

use super::{EntityContext, EntityError, EntityId, EntityRegistry, OperationRequest};
use crate::context::ReplayCore;
use crate::history::HistoryLog;
use crate::providers::{ProviderError, WorkItem};
use crate::runtime::replay_engine::{PassOutcome, ReplayEngine, RootFuture};
use crate::runtime::{ActivityContext, ActivityRegistry};
use crate::{Decision, ErrorDetails, Event};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub request_id: String,
    pub operation: String,
    pub outcome: Result<String, ErrorDetails>,
}

/// What a committed batch produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchResult {
    /// One entry per operation, in execution order.
    pub results: Vec<OperationResult>,
    /// State after the batch; `None` if it was deleted or destructed.
    pub state: Option<String>,
    /// Signals to deliver to other entities.
    pub signals: Vec<(EntityId, OperationRequest)>,
}

pub(crate) enum BatchStep {
    Done(BatchResult),
    Suspended(Vec<Decision>),
    Failed(ErrorDetails),
}

type BatchSlot = Arc<Mutex<Option<Result<BatchResult, EntityError>>>>;

async fn run_operations(
    registry: EntityRegistry,
    entity: EntityId,
    initial: Option<String>,
    operations: Vec<OperationRequest>,
    core: ReplayCore,
) -> Result<BatchResult, EntityError> {
    let entity_type = registry.get(&entity.name);
    let mut state = initial;
    let mut results = Vec::with_capacity(operations.len());
    let mut signals = Vec::new();
    let mut destruct = false;

    for request in operations {
        let ctx = EntityContext::new(entity.clone(), state.clone(), &request, core.clone());
        let handler = match &entity_type {
            None => Err(EntityError::UnknownEntity(entity.name.clone())),
            Some(t) => t.handler(&request.operation).ok_or_else(|| EntityError::UnknownOperation {
                entity: entity.name.clone(),
                operation: request.operation.clone(),
            }),
        };
        let outcome = match handler {
            Err(e) => Err(e),
            Ok(h) => match AssertUnwindSafe(h.invoke(ctx.clone(), request.input.clone()))
                .catch_unwind()
                .await
            {
                Ok(r) => r,
                Err(payload) => Err(EntityError::Panicked(match ErrorDetails::from_panic(payload) {
                    ErrorDetails::Panic { message } => message,
                    other => other.to_string(),
                })),
            },
        };

        let effects = ctx.take_effects();
        if let Some(message) = effects.corrupted {
            return Err(EntityError::StateCorrupted(message));
        }
        let outcome = match outcome {
            Ok(_) if effects.multiple_returns => Err(EntityError::MultipleReturns),
            other => other,
        };
        match outcome {
            Ok(handler_value) => {
                state = effects.state;
                signals.extend(effects.signals);
                destruct |= effects.destruct;
                results.push(OperationResult {
                    request_id: request.id,
                    operation: request.operation,
                    outcome: Ok(effects.return_value.unwrap_or(handler_value)),
                });
            }
            Err(e) => {
                debug!(entity = %entity, operation = %request.operation, error = %e, "operation failed; rolled back");
                results.push(OperationResult {
                    request_id: request.id,
                    operation: request.operation,
                    outcome: Err(e.to_details()),
                });
            }
        }
    }

    if destruct {
        state = None;
    }
    Ok(BatchResult {
        results,
        state,
        signals,
    })
}

/// Run one pass of a batch on `engine`, whose history must contain the
/// `EntityBatchStarted` event for `operations`.
pub(crate) fn execute_batch(
    engine: &mut ReplayEngine,
    registry: &EntityRegistry,
    entity: &EntityId,
    initial: Option<String>,
    operations: Vec<OperationRequest>,
) -> BatchStep {
    if let Some(err) = engine.abort_error.clone() {
        return BatchStep::Failed(err);
    }
    let core = engine.new_core();
    let slot: BatchSlot = Arc::new(Mutex::new(None));
    let root: RootFuture = {
        let slot = slot.clone();
        let fut = run_operations(registry.clone(), entity.clone(), initial, operations, core.clone());
        Box::pin(async move {
            let result = fut.await;
            *slot.lock().unwrap_or_else(|e| e.into_inner()) = Some(result);
            Ok(String::new())
        })
    };

    match engine.run_root(&core, root) {
        PassOutcome::Suspended => BatchStep::Suspended(engine.decisions().to_vec()),
        PassOutcome::Aborted(details) => BatchStep::Failed(details),
        PassOutcome::ContinueAsNew(_) => BatchStep::Failed(ErrorDetails::application(
            "entity operations cannot continue as new",
        )),
        PassOutcome::Ready(_) => match slot.lock().unwrap_or_else(|e| e.into_inner()).take() {
            Some(Ok(result)) => BatchStep::Done(result),
            Some(Err(e)) => BatchStep::Failed(e.to_details()),
            None => BatchStep::Failed(ErrorDetails::application("batch finished without a result")),
        },
    }
}

/// Where standalone dispatch loads and saves entity state.
#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn load(&self, id: &EntityId) -> Result<Option<String>, ProviderError>;
    /// `None` removes the entity.
    async fn save(&self, id: &EntityId, state: Option<String>) -> Result<(), ProviderError>;
}

#[derive(Debug, Default)]
pub struct InMemoryEntityStore {
    states: tokio::sync::Mutex<HashMap<EntityId, String>>,
}

impl InMemoryEntityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl EntityStore for InMemoryEntityStore {
    async fn load(&self, id: &EntityId) -> Result<Option<String>, ProviderError> {
        Ok(self.states.lock().await.get(id).cloned())
    }

    async fn save(&self, id: &EntityId, state: Option<String>) -> Result<(), ProviderError> {
        let mut states = self.states.lock().await;
        match state {
            Some(s) => {
                states.insert(id.clone(), s);
            }
            None => {
                states.remove(id);
            }
        }
        Ok(())
    }
}

/// Runs entity batches outside the runtime, one batch per key at a time.
///
/// Activities called by operations run inline when an activity registry is
/// attached; without one such a batch fails with [`EntityError::Suspended`].
pub struct EntityDispatcher {
    registry: EntityRegistry,
    activities: Option<Arc<ActivityRegistry>>,
    locks: Mutex<HashMap<EntityId, Arc<tokio::sync::Mutex<()>>>>,
}

impl EntityDispatcher {
    pub fn new(registry: EntityRegistry) -> Self {
        Self {
            registry,
            activities: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_activities(mut self, activities: Arc<ActivityRegistry>) -> Self {
        self.activities = Some(activities);
        self
    }

    fn key_lock(&self, id: &EntityId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(id.clone()).or_default().clone()
    }

    /// Execute `batch` against the entity and persist the resulting state.
    /// Nothing is saved if the batch fails as a whole.
    pub async fn dispatch(
        &self,
        store: &dyn EntityStore,
        id: &EntityId,
        batch: Vec<OperationRequest>,
    ) -> Result<BatchResult, EntityError> {
        let lock = self.key_lock(id);
        let _guard = lock.lock().await;

        let initial = store.load(id).await?;
        let instance = id.instance_id();
        let now = crate::now_ms();
        let mut engine = ReplayEngine::new(instance.clone(), crate::INITIAL_EXECUTION_ID, HistoryLog::new());
        engine.start_execution(&id.name, "", None, now);
        engine.begin_pass(now);
        engine.append(Event::EntityBatchStarted {
            event_id: 0,
            operations: batch.clone(),
        });

        loop {
            match execute_batch(&mut engine, &self.registry, id, initial.clone(), batch.clone()) {
                BatchStep::Done(result) => {
                    store.save(id, result.state.clone()).await?;
                    return Ok(result);
                }
                BatchStep::Failed(details) => {
                    warn!(entity = %id, error = %details, "entity batch failed");
                    return Err(EntityError::BatchFailed(details));
                }
                BatchStep::Suspended(decisions) => {
                    let completions = self.run_activities(&instance, engine.execution_id, decisions).await?;
                    let history = engine.history().clone();
                    engine = ReplayEngine::new(instance.clone(), crate::INITIAL_EXECUTION_ID, history);
                    engine.begin_pass(crate::now_ms());
                    engine.prep_completions(completions);
                }
            }
        }
    }

    async fn run_activities(
        &self,
        instance: &str,
        execution_id: u64,
        decisions: Vec<Decision>,
    ) -> Result<Vec<WorkItem>, EntityError> {
        let Some(activities) = &self.activities else {
            return Err(EntityError::Suspended);
        };
        let mut completions = Vec::new();
        for decision in decisions {
            let Decision::ScheduleTask {
                scheduling_event_id: id,
                name,
                input,
            } = decision
            else {
                continue;
            };
            let ctx = ActivityContext::new(instance, execution_id, name, id, "entity-dispatcher");
            completions.push(match activities.execute(ctx, input).await {
                Ok(result) => WorkItem::ActivityCompleted {
                    instance: instance.to_string(),
                    execution_id,
                    id,
                    result,
                },
                Err(details) => WorkItem::ActivityFailed {
                    instance: instance.to_string(),
                    execution_id,
                    id,
                    details,
                },
            });
        }
        if completions.is_empty() {
            return Err(EntityError::Suspended);
        }
        Ok(completions)
    }
}
