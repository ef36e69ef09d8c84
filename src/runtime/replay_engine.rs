use crate::context::{describe_event, Completion, OrchestrationContext, ReplayCore};
use crate::history::{HistoryError, HistoryLog};
use crate::{providers::WorkItem, runtime::OrchestrationHandler};
use crate::{Decision, ErrorDetails, Event, ParentLink};
use futures::task::noop_waker_ref;
use std::future::Future;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

pub(crate) type RootFuture = Pin<Box<dyn Future<Output = Result<String, String>> + Send>>;

/// Result of executing an orchestration turn
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnResult {
    /// Suspended awaiting more input
    Continue,
    Completed(String),
    Failed(ErrorDetails),
    Terminated(String),
    Canceled(String),
    ContinueAsNew { input: String },
}

/// How a single pass over the user future ended.
#[derive(Debug)]
pub(crate) enum PassOutcome {
    Ready(Result<String, String>),
    Suspended,
    Aborted(ErrorDetails),
    ContinueAsNew(String),
}

/// Replays history and executes one deterministic evaluation of an instance.
pub struct ReplayEngine {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    /// Baseline history followed by the events appended during this pass.
    working: HistoryLog,
    baseline_len: usize,
    closed_at_start: bool,
    /// Timestamp for the pass marker when the log was closed at `begin_pass`.
    pending_pass_ms: Option<u64>,
    pub(crate) pending_decisions: Vec<Decision>,
    /// First system-level failure found while preparing completions.
    pub(crate) abort_error: Option<ErrorDetails>,
    /// Messages to re-enqueue instead of applying in this pass.
    pub(crate) deferred: Vec<WorkItem>,
    pub(crate) custom_status: Option<String>,
}

impl ReplayEngine {
    pub fn new(instance: impl Into<String>, execution_id: u64, baseline: HistoryLog) -> Self {
        let baseline_len = baseline.len();
        let closed_at_start = baseline.terminal().is_some();
        Self {
            instance: instance.into(),
            execution_id,
            working: baseline,
            baseline_len,
            closed_at_start,
            pending_pass_ms: None,
            pending_decisions: Vec::new(),
            abort_error: None,
            deferred: Vec::new(),
            custom_status: None,
        }
    }

    pub fn history(&self) -> &HistoryLog {
        &self.working
    }

    /// Events appended during this pass.
    pub fn history_delta(&self) -> &[Event] {
        &self.working.events()[self.baseline_len..]
    }

    pub fn decisions(&self) -> &[Decision] {
        &self.pending_decisions
    }

    pub fn is_new_execution(&self) -> bool {
        self.baseline_len == 0
    }

    /// The execution had already ended and nothing in this pass reopened it.
    pub fn is_stale(&self) -> bool {
        self.closed_at_start && self.working.terminal().is_some()
    }

    /// True when the pass added something besides its own start marker.
    pub fn made_progress(&self) -> bool {
        self.is_new_execution()
            || self
                .history_delta()
                .iter()
                .any(|e| !matches!(e, Event::OrchestratorStarted { .. }))
    }

    pub(crate) fn append(&mut self, event: Event) -> Option<u64> {
        match self.working.append(event) {
            Ok(id) => Some(id),
            Err(HistoryError::Closed(end)) => {
                debug!(instance = %self.instance, ended_with = end, "dropping event for closed execution");
                None
            }
            Err(e) => {
                warn!(instance = %self.instance, error = %e, "failed to append event");
                None
            }
        }
    }

    pub fn start_execution(&mut self, name: &str, input: &str, parent: Option<ParentLink>, now_ms: u64) {
        self.append(Event::ExecutionStarted {
            event_id: 0,
            name: name.to_string(),
            input: input.to_string(),
            parent,
            timestamp_ms: now_ms,
        });
    }

    /// Mark the start of a pass and fix the deterministic clock for it.
    pub fn begin_pass(&mut self, now_ms: u64) {
        if self.working.terminal().is_some() {
            self.pending_pass_ms = Some(now_ms);
            return;
        }
        self.append(Event::OrchestratorStarted {
            event_id: 0,
            timestamp_ms: now_ms,
        });
    }

    /// Convert completion messages to history events.
    ///
    /// Messages from other executions and duplicates of completions already in
    /// history are dropped. A completion that points at an unknown scheduling
    /// event, or at one of a different kind, aborts the pass as nondeterministic.
    pub fn prep_completions(&mut self, messages: Vec<WorkItem>) {
        debug!(
            instance = %self.instance,
            message_count = messages.len(),
            "converting messages to events"
        );

        for msg in messages {
            if let Some(exec) = completion_execution_id(&msg) {
                if exec != self.execution_id {
                    warn!(instance = %self.instance, message_execution = exec, current_execution = self.execution_id, "ignoring completion from a different execution");
                    continue;
                }
            }

            let event = match msg {
                WorkItem::ActivityCompleted { id, result, .. } => Event::TaskCompleted {
                    event_id: 0,
                    source_event_id: id,
                    result,
                },
                WorkItem::ActivityFailed { id, details, .. } => Event::TaskFailed {
                    event_id: 0,
                    source_event_id: id,
                    details,
                },
                WorkItem::TimerFired { id, fire_at_ms, .. } => Event::TimerFired {
                    event_id: 0,
                    source_event_id: id,
                    fire_at_ms,
                },
                WorkItem::SubOrchCompleted { parent_id, result, .. } => Event::SubOrchestrationCompleted {
                    event_id: 0,
                    source_event_id: parent_id,
                    result,
                },
                WorkItem::SubOrchFailed { parent_id, details, .. } => Event::SubOrchestrationFailed {
                    event_id: 0,
                    source_event_id: parent_id,
                    details,
                },
                WorkItem::EntityResponse { id, outcome, .. } => match outcome {
                    Ok(result) => Event::EntityOperationCompleted {
                        event_id: 0,
                        source_event_id: id,
                        result,
                    },
                    Err(details) => Event::EntityOperationFailed {
                        event_id: 0,
                        source_event_id: id,
                        details,
                    },
                },
                WorkItem::EntityLockGranted { id, .. } => Event::EntityLockGranted {
                    event_id: 0,
                    source_event_id: id,
                },
                WorkItem::ExternalRaised { name, data, .. } => Event::EventRaised {
                    event_id: 0,
                    name,
                    input: data,
                },
                WorkItem::TerminateInstance { reason, .. } => Event::ExecutionTerminated { event_id: 0, reason },
                WorkItem::CancelInstance { instance, reason } => {
                    if self.is_new_execution() {
                        // Let the first pass run so the instance is observed Running first.
                        self.deferred.push(WorkItem::CancelInstance { instance, reason });
                        continue;
                    }
                    Event::ExecutionCanceled { event_id: 0, reason }
                }
                WorkItem::RewindInstance { reason, .. } => {
                    if !matches!(self.working.terminal(), Some(Event::ExecutionFailed { .. })) {
                        warn!(instance = %self.instance, "rewind ignored: execution has not failed");
                        continue;
                    }
                    self.append(Event::ExecutionRewound { event_id: 0, reason });
                    if let Some(now) = self.pending_pass_ms.take() {
                        self.append(Event::OrchestratorStarted {
                            event_id: 0,
                            timestamp_ms: now,
                        });
                    }
                    continue;
                }
                _ => continue,
            };

            if let Some(source) = event.source_event_id() {
                if self.working.has_completion_for(source) {
                    warn!(instance = %self.instance, source_event_id = source, "ignoring duplicate completion");
                    continue;
                }
                let expected = event.completes_kind();
                match self.working.schedule_kind_of(source) {
                    Some(kind) if Some(kind) == expected => {}
                    found => {
                        let found = found.map(|k| k.to_string()).unwrap_or_else(|| "no scheduling event".to_string());
                        let details = ErrorDetails::non_determinism(
                            format!("{found} at event {source}"),
                            format!("{} for event {source}", event.kind()),
                        );
                        warn!(instance = %self.instance, source_event_id = source, error = %details, "completion does not match history");
                        if self.abort_error.is_none() {
                            self.abort_error = Some(details);
                        }
                        continue;
                    }
                }
                if let Event::TaskFailed { details, .. } | Event::SubOrchestrationFailed { details, .. } = &event {
                    if !details.is_catchable() {
                        warn!(instance = %self.instance, source_event_id = source, ?details, "system error aborts turn");
                        if self.abort_error.is_none() {
                            self.abort_error = Some(details.clone());
                        }
                    }
                }
            }

            self.append(event);
        }

        debug!(
            instance = %self.instance,
            event_count = self.history_delta().len(),
            "completion events created"
        );
    }

    /// Run the orchestration function against the working history.
    pub fn execute_orchestration(&mut self, handler: Arc<dyn OrchestrationHandler>) -> TurnResult {
        if let Some(end) = self.working.terminal() {
            return turn_from_terminal(end);
        }
        if let Some(err) = self.abort_error.clone() {
            return self.fail(err);
        }
        let Some(started) = self.working.started() else {
            return TurnResult::Failed(ErrorDetails::Configuration {
                resource: self.instance.clone(),
                message: "history has no ExecutionStarted event".to_string(),
            });
        };

        debug!(instance = %self.instance, execution_id = self.execution_id, "executing orchestration turn");

        let core = self.new_core();
        let ctx = OrchestrationContext::new(core.clone());
        let input = started.input;
        let root: RootFuture = Box::pin(async move { handler.invoke(ctx, input).await });

        match self.run_root(&core, root) {
            PassOutcome::Suspended => TurnResult::Continue,
            PassOutcome::Ready(Ok(output)) => {
                self.append(Event::ExecutionCompleted {
                    event_id: 0,
                    output: output.clone(),
                });
                TurnResult::Completed(output)
            }
            PassOutcome::Ready(Err(message)) => self.fail(ErrorDetails::application(message)),
            PassOutcome::Aborted(details) => self.fail(details),
            PassOutcome::ContinueAsNew(input) => {
                self.append(Event::ExecutionContinuedAsNew {
                    event_id: 0,
                    input: input.clone(),
                });
                TurnResult::ContinueAsNew { input }
            }
        }
    }

    /// Close an open execution whose orchestration has no registered handler.
    pub(crate) fn fail_unregistered(&mut self, name: &str) -> TurnResult {
        if let Some(end) = self.working.terminal() {
            return turn_from_terminal(end);
        }
        self.fail(ErrorDetails::unregistered(name))
    }

    fn fail(&mut self, details: ErrorDetails) -> TurnResult {
        self.append(Event::ExecutionFailed {
            event_id: 0,
            details: details.clone(),
        });
        TurnResult::Failed(details)
    }

    pub(crate) fn new_core(&self) -> ReplayCore {
        ReplayCore::new(
            self.instance.clone(),
            self.execution_id,
            self.working.events(),
            self.working.next_event_id(),
        )
    }

    /// Deliver the working history to `root` one event at a time and poll
    /// after each delivery, then harvest what the pass produced.
    pub(crate) fn run_root(&mut self, core: &ReplayCore, mut root: RootFuture) -> PassOutcome {
        let mut started = false;
        let mut outcome = None;
        for (idx, event) in self.working.events().iter().enumerate() {
            {
                let mut st = core.lock();
                // code resumed by a persisted event already ran in an earlier pass
                st.replaying = idx < self.baseline_len;
                match event {
                    Event::OrchestratorStarted { timestamp_ms, .. } => {
                        st.current_time_ms = *timestamp_ms;
                        started = true;
                        st.woken = true;
                    }
                    Event::EventRaised { name, input, .. } => {
                        st.raised.entry(name.clone()).or_default().push_back(input.clone());
                        st.woken = true;
                    }
                    e if self.working.is_voided(e) => {}
                    e => {
                        if let Some((id, completion)) = Completion::from_event(e) {
                            st.completions.insert(id, completion);
                            st.woken = true;
                        }
                    }
                }
            }
            if started {
                if let Some(o) = drive(core, &mut root) {
                    outcome = Some(o);
                    break;
                }
            }
        }

        let outcome = outcome.unwrap_or_else(|| {
            let st = core.lock();
            match st.unclaimed() {
                Some(next) if started => PassOutcome::Aborted(ErrorDetails::non_determinism(
                    describe_event(next),
                    "no further scheduling call",
                )),
                _ => PassOutcome::Suspended,
            }
        });

        let (new_events, decisions, custom_status) = {
            let mut st = core.lock();
            // dropping the suspended root must not record anything
            st.closed = true;
            (
                std::mem::take(&mut st.new_events),
                std::mem::take(&mut st.decisions),
                st.custom_status.clone(),
            )
        };
        self.custom_status = custom_status;
        if matches!(outcome, PassOutcome::Aborted(_)) {
            return outcome;
        }
        for event in new_events {
            self.append(event);
        }
        self.pending_decisions = decisions;
        outcome
    }

    /// Scheduling events to dispatch again because this pass rewound the execution.
    pub fn rewound_work(&self) -> Vec<Event> {
        let rewound_now = self
            .history_delta()
            .iter()
            .any(|e| matches!(e, Event::ExecutionRewound { .. }));
        if !rewound_now {
            return Vec::new();
        }
        self.working.rewound_schedulings().into_iter().cloned().collect()
    }
}

/// Poll the root future until nothing new has been delivered.
fn drive(core: &ReplayCore, root: &mut RootFuture) -> Option<PassOutcome> {
    let mut cx = Context::from_waker(noop_waker_ref());
    loop {
        {
            let mut st = core.lock();
            if !st.woken {
                return None;
            }
            st.woken = false;
        }
        let polled = catch_unwind(AssertUnwindSafe(|| root.as_mut().poll(&mut cx)));
        let st = core.lock();
        if let Some(err) = st.nondeterminism.clone() {
            return Some(PassOutcome::Aborted(err));
        }
        match polled {
            Err(payload) => return Some(PassOutcome::Aborted(ErrorDetails::from_panic(payload))),
            Ok(_) if st.continue_as_new.is_some() => {
                return st.continue_as_new.clone().map(PassOutcome::ContinueAsNew);
            }
            Ok(Poll::Ready(result)) => {
                if let Some(next) = st.unclaimed() {
                    return Some(PassOutcome::Aborted(ErrorDetails::non_determinism(
                        describe_event(next),
                        "completion of the function",
                    )));
                }
                return Some(PassOutcome::Ready(result));
            }
            Ok(Poll::Pending) => {}
        }
    }
}

fn completion_execution_id(msg: &WorkItem) -> Option<u64> {
    match msg {
        WorkItem::ActivityCompleted { execution_id, .. }
        | WorkItem::ActivityFailed { execution_id, .. }
        | WorkItem::TimerFired { execution_id, .. }
        | WorkItem::EntityResponse { execution_id, .. }
        | WorkItem::EntityLockGranted { execution_id, .. } => Some(*execution_id),
        WorkItem::SubOrchCompleted {
            parent_execution_id, ..
        }
        | WorkItem::SubOrchFailed {
            parent_execution_id, ..
        } => Some(*parent_execution_id),
        _ => None,
    }
}

fn turn_from_terminal(end: &Event) -> TurnResult {
    match end {
        Event::ExecutionCompleted { output, .. } => TurnResult::Completed(output.clone()),
        Event::ExecutionFailed { details, .. } => TurnResult::Failed(details.clone()),
        Event::ExecutionTerminated { reason, .. } => TurnResult::Terminated(reason.clone()),
        Event::ExecutionCanceled { reason, .. } => TurnResult::Canceled(reason.clone()),
        Event::ExecutionContinuedAsNew { input, .. } => TurnResult::ContinueAsNew { input: input.clone() },
        _ => TurnResult::Continue,
    }
}
