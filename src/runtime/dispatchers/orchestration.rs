//! Orchestration dispatcher implementation for Runtime
//!
//! Each worker loop:
//! - fetches a locked instance with its history and pending messages
//! - starts a new execution when the messages ask for one
//! - replays the orchestration once and turns its decisions into messages
//! - commits history, messages and status in one ack

use crate::entity::{EntityId, OperationRequest};
use crate::history::HistoryLog;
use crate::providers::{OrchestrationItem, WorkItem};
use crate::runtime::replay_engine::{ReplayEngine, TurnResult};
use crate::runtime::status::{RuntimeStatus, StatusEvent};
use crate::{Decision, ErrorDetails, Event, ParentLink};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::super::Runtime;
use super::PassCommit;

struct StartRequest {
    orchestration: String,
    input: String,
    parent: Option<ParentLink>,
}

impl Runtime {
    /// Start the orchestration dispatcher with N concurrent workers. Entity
    /// instances arrive on the same queue and are routed to the entity path.
    pub(in crate::runtime) fn start_orchestration_dispatcher(self: Arc<Self>) -> JoinHandle<()> {
        let concurrency = self.options.orchestration_concurrency.max(1);
        tokio::spawn(async move {
            let mut worker_handles = Vec::new();
            for worker_idx in 0..concurrency {
                let rt = Arc::clone(&self);
                let worker_id = format!("orch-{worker_idx}-{}", rt.runtime_id);
                worker_handles.push(tokio::spawn(async move {
                    debug!(worker_id = %worker_id, "orchestration worker started");
                    while !rt.is_shutting_down() {
                        match rt.history_store.fetch_orchestration_item().await {
                            Ok(Some(item)) => {
                                if EntityId::is_entity_instance(&item.instance) {
                                    rt.process_entity_item(item).await;
                                } else {
                                    rt.process_orchestration_item(item).await;
                                }
                            }
                            Ok(None) => rt.idle().await,
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "fetch_orchestration_item failed");
                                rt.idle().await;
                            }
                        }
                    }
                    debug!(worker_id = %worker_id, "orchestration worker exiting");
                }));
            }
            for h in worker_handles {
                let _ = h.await;
            }
        })
    }

    pub(in crate::runtime) async fn process_orchestration_item(self: &Arc<Self>, item: OrchestrationItem) {
        let OrchestrationItem {
            instance,
            execution_id,
            history,
            version,
            messages,
            status,
            lock_token,
            ..
        } = item;

        let baseline = match HistoryLog::from_events(history) {
            Ok(log) => log,
            Err(e) => {
                error!(instance = %instance, error = %e, "stored history is invalid");
                self.abandon(&instance, &lock_token, Some(1000)).await;
                return;
            }
        };

        let mut start: Option<StartRequest> = None;
        let mut continue_as_new: Option<StartRequest> = None;
        let mut completions = Vec::with_capacity(messages.len());
        for msg in messages {
            match msg {
                WorkItem::StartOrchestration {
                    orchestration,
                    input,
                    parent,
                    ..
                } => {
                    if baseline.is_empty() && start.is_none() {
                        start = Some(StartRequest {
                            orchestration,
                            input,
                            parent,
                        });
                    } else {
                        warn!(instance = %instance, "ignoring start for an instance that already exists");
                    }
                }
                WorkItem::ContinueAsNew {
                    orchestration, input, ..
                } => {
                    continue_as_new = Some(StartRequest {
                        orchestration,
                        input,
                        parent: None,
                    });
                }
                other => completions.push(other),
            }
        }

        let now = crate::now_ms();
        let continued = matches!(baseline.terminal(), Some(Event::ExecutionContinuedAsNew { .. }));
        let mut new_execution = false;
        let mut engine = if let Some(req) = start {
            let mut engine = ReplayEngine::new(instance.clone(), execution_id, HistoryLog::new());
            engine.start_execution(&req.orchestration, &req.input, req.parent, now);
            engine
        } else if let Some(req) = continue_as_new.filter(|_| continued) {
            let parent = baseline.started().and_then(|s| s.parent);
            info!(instance = %instance, execution_id = execution_id + 1, "starting continued execution");
            let mut engine = ReplayEngine::new(instance.clone(), execution_id + 1, HistoryLog::new());
            engine.start_execution(&req.orchestration, &req.input, parent, now);
            new_execution = true;
            engine
        } else if baseline.is_empty() {
            warn!(instance = %instance, dropped = completions.len(), "messages for an instance that was never started");
            self.commit_pass(&instance, &lock_token, version, PassCommit::default()).await;
            return;
        } else {
            ReplayEngine::new(instance.clone(), execution_id, baseline)
        };

        engine.begin_pass(now);
        engine.prep_completions(completions);

        if engine.is_stale() {
            debug!(instance = %instance, "execution already ended; dropping messages");
            self.commit_pass(&instance, &lock_token, version, PassCommit::default()).await;
            return;
        }
        if !engine.made_progress() {
            debug!(instance = %instance, "nothing new to replay");
            let commit = PassCommit {
                orchestrator_items: std::mem::take(&mut engine.deferred),
                ..PassCommit::default()
            };
            self.commit_pass(&instance, &lock_token, version, commit).await;
            return;
        }

        let Some(started) = engine.history().started() else {
            error!(instance = %instance, "history has no start event");
            self.abandon(&instance, &lock_token, Some(1000)).await;
            return;
        };

        let turn = match self.orchestration_registry.get(&started.name) {
            Some(handler) => engine.execute_orchestration(handler),
            None => {
                warn!(instance = %instance, orchestration = %started.name, "orchestration is not registered");
                engine.fail_unregistered(&started.name)
            }
        };
        debug!(instance = %instance, execution_id = engine.execution_id, ?turn, "turn finished");

        let mut commit = PassCommit {
            history_delta: engine.history_delta().to_vec(),
            ..PassCommit::default()
        };
        self.collect_decisions(&engine, &mut commit);
        commit.orchestrator_items.append(&mut engine.deferred);

        if let TurnResult::ContinueAsNew { input } = &turn {
            commit.orchestrator_items.push(WorkItem::ContinueAsNew {
                instance: instance.clone(),
                orchestration: started.name.clone(),
                input: input.clone(),
            });
        }
        if let Some(link) = &started.parent {
            if let Some(notice) = parent_notification(link, &turn) {
                commit.orchestrator_items.push(notice);
            }
        }

        let rewound = engine
            .history_delta()
            .iter()
            .any(|e| matches!(e, Event::ExecutionRewound { .. }));
        let previous = if new_execution {
            RuntimeStatus::Running
        } else {
            status.unwrap_or(RuntimeStatus::Pending)
        };
        let mut events = Vec::with_capacity(3);
        if rewound {
            events.push(StatusEvent::Rewound);
        }
        events.extend(status_events(&turn));
        let next = previous.apply_all(&events).unwrap_or_else(|e| {
            warn!(instance = %instance, error = %e, "unexpected status transition");
            fallback_status(&turn)
        });

        let metadata = &mut commit.metadata;
        metadata.status = Some(next);
        metadata.function_name = Some(started.name.clone());
        metadata.input = Some(started.input.clone());
        metadata.custom_status = engine.custom_status.clone();
        metadata.start_new_execution = new_execution;
        metadata.output = match &turn {
            TurnResult::Completed(output) => Some(output.clone()),
            TurnResult::Failed(details) => Some(details.display_message()),
            TurnResult::Terminated(reason) | TurnResult::Canceled(reason) => Some(reason.clone()),
            TurnResult::Continue | TurnResult::ContinueAsNew { .. } => None,
        };
        if let TurnResult::Failed(details) = &turn {
            warn!(instance = %instance, category = details.category(), error = %details, "orchestration failed");
        }

        self.commit_pass(&instance, &lock_token, version, commit).await;
    }

    /// Turn the decisions of a pass (and work to redo after a rewind) into messages.
    fn collect_decisions(&self, engine: &ReplayEngine, commit: &mut PassCommit) {
        let instance = &engine.instance;
        let execution_id = engine.execution_id;
        let link = |id: u64| ParentLink {
            instance: instance.clone(),
            execution_id,
            source_event_id: id,
        };

        for decision in engine.decisions() {
            match decision.clone() {
                Decision::ScheduleTask {
                    scheduling_event_id,
                    name,
                    input,
                } => commit.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.clone(),
                    execution_id,
                    id: scheduling_event_id,
                    name,
                    input,
                }),
                Decision::CreateTimer {
                    scheduling_event_id,
                    fire_at_ms,
                } => commit.timer_items.push(WorkItem::TimerFired {
                    instance: instance.clone(),
                    execution_id,
                    id: scheduling_event_id,
                    fire_at_ms,
                }),
                Decision::StartSubOrchestration {
                    scheduling_event_id,
                    name,
                    instance: child,
                    input,
                } => commit.orchestrator_items.push(WorkItem::StartOrchestration {
                    instance: child,
                    orchestration: name,
                    input,
                    parent: Some(link(scheduling_event_id)),
                }),
                Decision::CallEntity {
                    scheduling_event_id,
                    entity,
                    operation,
                    input,
                    request_id,
                } => commit.orchestrator_items.push(WorkItem::EntityOperation {
                    instance: entity.instance_id(),
                    request: OperationRequest::call(request_id, operation, input, link(scheduling_event_id)),
                }),
                Decision::SignalEntity {
                    entity,
                    operation,
                    input,
                    request_id,
                    ..
                } => commit.orchestrator_items.push(WorkItem::EntityOperation {
                    instance: entity.instance_id(),
                    request: OperationRequest::signal(request_id, operation, input),
                }),
                Decision::LockEntities {
                    scheduling_event_id,
                    lock_set,
                    request_id,
                } => {
                    if let Some(first) = lock_set.first() {
                        commit.orchestrator_items.push(WorkItem::EntityOperation {
                            instance: first.instance_id(),
                            request: OperationRequest::lock(request_id, lock_set.clone(), link(scheduling_event_id)),
                        });
                    }
                }
                Decision::UnlockEntities { lock_set, request_id, .. } => {
                    for entity in lock_set {
                        commit.orchestrator_items.push(WorkItem::EntityUnlock {
                            instance: entity.instance_id(),
                            owner: instance.clone(),
                            request_id: request_id.clone(),
                        });
                    }
                }
                Decision::WaitForEvent { .. } => {}
            }
        }

        for event in engine.rewound_work() {
            match event {
                Event::TaskScheduled {
                    event_id, name, input, ..
                } => commit.worker_items.push(WorkItem::ActivityExecute {
                    instance: instance.clone(),
                    execution_id,
                    id: event_id,
                    name,
                    input,
                }),
                Event::SubOrchestrationScheduled { instance: child, .. } => {
                    commit.orchestrator_items.push(WorkItem::RewindInstance {
                        instance: child,
                        reason: format!("parent {instance} rewound"),
                    })
                }
                _ => {}
            }
        }
    }
}

fn status_events(turn: &TurnResult) -> Vec<StatusEvent> {
    match turn {
        TurnResult::Continue => vec![StatusEvent::PassStarted, StatusEvent::PassSuspended],
        TurnResult::Completed(_) => vec![StatusEvent::PassStarted, StatusEvent::Succeeded],
        TurnResult::Failed(_) => vec![StatusEvent::PassStarted, StatusEvent::Failed],
        TurnResult::ContinueAsNew { .. } => vec![StatusEvent::PassStarted, StatusEvent::ContinuedAsNew],
        TurnResult::Terminated(_) => vec![StatusEvent::Terminated],
        TurnResult::Canceled(_) => vec![StatusEvent::Canceled],
    }
}

fn fallback_status(turn: &TurnResult) -> RuntimeStatus {
    match turn {
        TurnResult::Continue | TurnResult::ContinueAsNew { .. } => RuntimeStatus::Running,
        TurnResult::Completed(_) => RuntimeStatus::Completed,
        TurnResult::Failed(_) => RuntimeStatus::Failed,
        TurnResult::Terminated(_) => RuntimeStatus::Terminated,
        TurnResult::Canceled(_) => RuntimeStatus::Canceled,
    }
}

/// Outcome message for the parent of a sub-orchestration that just ended.
/// Child failures reach the parent as application errors it can handle.
fn parent_notification(link: &ParentLink, turn: &TurnResult) -> Option<WorkItem> {
    let failed = |message: String| WorkItem::SubOrchFailed {
        parent_instance: link.instance.clone(),
        parent_execution_id: link.execution_id,
        parent_id: link.source_event_id,
        details: ErrorDetails::application(message),
    };
    match turn {
        TurnResult::Completed(result) => Some(WorkItem::SubOrchCompleted {
            parent_instance: link.instance.clone(),
            parent_execution_id: link.execution_id,
            parent_id: link.source_event_id,
            result: result.clone(),
        }),
        TurnResult::Failed(details) => Some(failed(details.display_message())),
        TurnResult::Terminated(reason) => Some(failed(format!("terminated: {reason}"))),
        TurnResult::Canceled(reason) => Some(failed(format!("canceled: {reason}"))),
        TurnResult::Continue | TurnResult::ContinueAsNew { .. } => None,
    }
}
