//! Entity path of the orchestration dispatcher.
//!
//! Entity instances keep their queue and state in the scheduler record the
//! provider stores next to the instance. A batch is one execution: it starts
//! with `EntityBatchStarted`, may suspend on activity calls and ends with
//! `EntityBatchCompleted`, after which the next batch begins a new execution.
//!
//! Lock requests are granted between batches. A granted lock is passed on to
//! the next entity of its set; the last entity answers the orchestration.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, error, warn};

use crate::entity::dispatcher::{execute_batch, BatchStep};
use crate::entity::{EntityId, EntitySchedulerState, OperationRequest};
use crate::history::HistoryLog;
use crate::providers::{OrchestrationItem, WorkItem};
use crate::runtime::replay_engine::ReplayEngine;
use crate::runtime::status::RuntimeStatus;
use crate::{Decision, Event};

use super::super::Runtime;
use super::PassCommit;

impl Runtime {
    pub(in crate::runtime) async fn process_entity_item(self: &Arc<Self>, item: OrchestrationItem) {
        let OrchestrationItem {
            instance,
            execution_id,
            history,
            version,
            messages,
            entity_state,
            lock_token,
            ..
        } = item;

        let entity: EntityId = match instance.parse() {
            Ok(id) => id,
            Err(e) => {
                warn!(instance = %instance, error = %e, "dropping messages for malformed entity id");
                self.commit_pass(&instance, &lock_token, version, PassCommit::default()).await;
                return;
            }
        };
        let mut scheduler = match EntitySchedulerState::decode(entity_state.as_deref()) {
            Ok(s) => s,
            Err(e) => {
                error!(entity = %entity, error = %e, "entity scheduler state is unreadable");
                self.abandon(&instance, &lock_token, Some(1000)).await;
                return;
            }
        };
        let baseline = match HistoryLog::from_events(history) {
            Ok(log) => log,
            Err(e) => {
                error!(entity = %entity, error = %e, "stored entity history is invalid");
                self.abandon(&instance, &lock_token, Some(1000)).await;
                return;
            }
        };

        let mut completions = Vec::new();
        for msg in messages {
            match msg {
                WorkItem::EntityOperation { request, .. } => {
                    let request_id = request.id.clone();
                    if !scheduler.enqueue(request) {
                        debug!(entity = %entity, request_id = %request_id, "dropping duplicate operation");
                    }
                }
                WorkItem::EntityUnlock { owner, request_id, .. } => {
                    if scheduler.release(&owner) {
                        debug!(entity = %entity, owner = %owner, request_id = %request_id, "lock released");
                    } else {
                        debug!(entity = %entity, owner = %owner, request_id = %request_id, "ignoring release of a lock not held");
                    }
                }
                WorkItem::EntityContinue { .. } => {}
                m @ (WorkItem::ActivityCompleted { .. } | WorkItem::ActivityFailed { .. }) => completions.push(m),
                other => warn!(entity = %entity, kind = other.kind(), "ignoring message not meant for an entity"),
            }
        }

        let now = crate::now_ms();
        let open_batch = baseline.open_entity_batch().map(<[_]>::to_vec);
        let mut new_execution = false;
        let mut handoffs = Vec::new();
        let (mut engine, operations) = if let Some(ops) = open_batch {
            let mut engine = ReplayEngine::new(instance.clone(), execution_id, baseline);
            engine.begin_pass(now);
            engine.prep_completions(completions);
            (engine, ops)
        } else {
            if let Some(request) = scheduler.grant_next_lock() {
                debug!(entity = %entity, owner = ?request.caller(), request_id = %request.id, "lock granted");
                handoffs.extend(lock_handoff(&request));
            }
            let ops = scheduler.take_batch(self.options.max_entity_batch_size);
            if ops.is_empty() {
                if !completions.is_empty() {
                    debug!(entity = %entity, dropped = completions.len(), "completions without an open batch");
                }
                let mut commit = PassCommit {
                    orchestrator_items: handoffs,
                    ..PassCommit::default()
                };
                commit.metadata.entity_state = scheduler.encode().ok();
                commit.metadata.remove_instance = scheduler.is_idle();
                self.commit_pass(&instance, &lock_token, version, commit).await;
                return;
            }
            new_execution = !baseline.is_empty();
            let exec = if new_execution { execution_id + 1 } else { execution_id };
            let mut engine = ReplayEngine::new(instance.clone(), exec, HistoryLog::new());
            engine.start_execution(&entity.name, "", None, now);
            engine.begin_pass(now);
            engine.append(Event::EntityBatchStarted {
                event_id: 0,
                operations: ops.clone(),
            });
            (engine, ops)
        };

        debug!(entity = %entity, execution_id = engine.execution_id, operations = operations.len(), "running entity batch");
        let step = execute_batch(
            &mut engine,
            &self.entity_registry,
            &entity,
            scheduler.state.clone(),
            operations.clone(),
        );

        let mut commit = PassCommit {
            orchestrator_items: handoffs,
            ..PassCommit::default()
        };
        let mut batch_done = true;
        match step {
            BatchStep::Suspended(decisions) => {
                batch_done = false;
                for decision in decisions {
                    if let Decision::ScheduleTask {
                        scheduling_event_id,
                        name,
                        input,
                    } = decision
                    {
                        commit.worker_items.push(WorkItem::ActivityExecute {
                            instance: instance.clone(),
                            execution_id: engine.execution_id,
                            id: scheduling_event_id,
                            name,
                            input,
                        });
                    }
                }
            }
            BatchStep::Done(result) => {
                let callers: HashMap<&str, &OperationRequest> =
                    operations.iter().map(|op| (op.id.as_str(), op)).collect();
                for r in result.results {
                    let Some(parent) = callers.get(r.request_id.as_str()).and_then(|op| op.parent.as_ref()) else {
                        continue;
                    };
                    commit.orchestrator_items.push(WorkItem::EntityResponse {
                        instance: parent.instance.clone(),
                        execution_id: parent.execution_id,
                        id: parent.source_event_id,
                        outcome: r.outcome,
                    });
                }
                for (target, request) in result.signals {
                    commit.orchestrator_items.push(WorkItem::EntityOperation {
                        instance: target.instance_id(),
                        request,
                    });
                }
                scheduler.apply(result.state);
            }
            BatchStep::Failed(details) => {
                warn!(entity = %entity, error = %details, "entity batch failed; state unchanged");
                for parent in operations.iter().filter_map(|op| op.parent.as_ref()) {
                    commit.orchestrator_items.push(WorkItem::EntityResponse {
                        instance: parent.instance.clone(),
                        execution_id: parent.execution_id,
                        id: parent.source_event_id,
                        outcome: Err(details.clone()),
                    });
                }
            }
        }

        if batch_done {
            engine.append(Event::EntityBatchCompleted { event_id: 0 });
            if scheduler.has_runnable() {
                commit.orchestrator_items.push(WorkItem::EntityContinue {
                    instance: instance.clone(),
                });
            }
        }
        commit.history_delta = engine.history_delta().to_vec();

        let metadata = &mut commit.metadata;
        metadata.status = Some(RuntimeStatus::Running);
        metadata.function_name = Some(entity.name.clone());
        metadata.start_new_execution = new_execution;
        metadata.remove_instance = batch_done && scheduler.is_idle();
        metadata.entity_state = match scheduler.encode() {
            Ok(s) => Some(s),
            Err(e) => {
                error!(entity = %entity, error = %e, "cannot encode entity scheduler state");
                self.abandon(&instance, &lock_token, Some(1000)).await;
                return;
            }
        };
        if metadata.remove_instance {
            debug!(entity = %entity, "entity has no state and no queued operations; removing");
        }

        self.commit_pass(&instance, &lock_token, version, commit).await;
    }
}

/// Pass a granted lock on to the next entity of its set, or tell the
/// orchestration once the last lock is held.
fn lock_handoff(request: &OperationRequest) -> Option<WorkItem> {
    let lock_set = request.lock_set.as_ref()?;
    let parent = request.parent.as_ref()?;
    let next = request.position + 1;
    Some(match lock_set.get(next) {
        Some(target) => WorkItem::EntityOperation {
            instance: target.instance_id(),
            request: OperationRequest {
                position: next,
                ..request.clone()
            },
        },
        None => WorkItem::EntityLockGranted {
            instance: parent.instance.clone(),
            execution_id: parent.execution_id,
            id: parent.source_event_id,
        },
    })
}
