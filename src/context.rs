//! Replay core and the orchestration-facing context.
//!
//! [`ReplayCore`] holds everything one replay pass knows: the scheduling
//! events already recorded (in ordinal order), the completions delivered so
//! far, buffered external events and the decisions produced by new calls.
//! Orchestrations reach it through [`OrchestrationContext`]; entity batches
//! reach the same core through their own context so that activity calls made
//! by entity operations follow the same ordinal discipline.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::{select, Either};
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::codec::{Codec, Json};
use crate::entity::EntityId;
use crate::futures::{DurableFuture, EventFuture, TaskFuture, TimerFuture};
use crate::retry::{RetryDecision, RetryOptions};
use crate::{Decision, ErrorDetails, Event, ScheduleKind};

/// A delivered outcome for one scheduling event.
#[derive(Debug, Clone)]
pub(crate) enum Completion {
    Ok(String),
    Err(ErrorDetails),
    TimerFired,
}

impl Completion {
    pub(crate) fn from_event(event: &Event) -> Option<(u64, Completion)> {
        let c = match event {
            Event::TaskCompleted { result, .. }
            | Event::SubOrchestrationCompleted { result, .. }
            | Event::EntityOperationCompleted { result, .. } => Completion::Ok(result.clone()),
            Event::EntityLockGranted { .. } => Completion::Ok(String::new()),
            Event::TaskFailed { details, .. }
            | Event::SubOrchestrationFailed { details, .. }
            | Event::EntityOperationFailed { details, .. } => Completion::Err(details.clone()),
            Event::TimerFired { .. } => Completion::TimerFired,
            _ => return None,
        };
        event.source_event_id().map(|id| (id, c))
    }
}

pub(crate) struct CoreState {
    pub(crate) instance: String,
    pub(crate) execution_id: u64,
    recorded: Vec<Event>,
    next_ordinal: usize,
    pub(crate) next_event_id: u64,
    pub(crate) new_events: Vec<Event>,
    pub(crate) decisions: Vec<Decision>,
    pub(crate) completions: HashMap<u64, Completion>,
    pub(crate) raised: HashMap<String, VecDeque<String>>,
    pub(crate) current_time_ms: u64,
    pub(crate) replaying: bool,
    pub(crate) nondeterminism: Option<ErrorDetails>,
    pub(crate) custom_status: Option<String>,
    pub(crate) continue_as_new: Option<String>,
    pub(crate) woken: bool,
    /// Set once the pass is harvested; later drops must not record anything.
    pub(crate) closed: bool,
    locks: Option<HeldLocks>,
    guid_counter: u64,
    next_token: u64,
    cancelled_tokens: HashSet<u64>,
}

impl CoreState {
    /// Claim the next scheduling ordinal.
    ///
    /// During replay the claim must match the recorded event at that ordinal
    /// by kind and name; a mismatch records a nondeterminism failure and
    /// returns `None`. Past the recorded prefix a new event and decision are
    /// created by `make`.
    pub(crate) fn claim<F>(&mut self, kind: ScheduleKind, name: &str, make: F) -> Option<u64>
    where
        F: FnOnce(u64) -> (Event, Option<Decision>),
    {
        if self.nondeterminism.is_some() {
            return None;
        }
        if let Some(recorded) = self.recorded.get(self.next_ordinal) {
            let id = recorded.event_id();
            return match recorded.schedule_kind() {
                Some((k, n)) if k == kind && n == name => {
                    self.next_ordinal += 1;
                    Some(id)
                }
                Some((k, n)) => {
                    self.nondeterminism = Some(ErrorDetails::non_determinism(describe(k, n), describe(kind, name)));
                    None
                }
                None => None,
            };
        }
        let id = self.next_event_id;
        self.next_event_id += 1;
        let (event, decision) = make(id);
        self.recorded.push(event.clone());
        self.new_events.push(event);
        if let Some(d) = decision {
            self.decisions.push(d);
        }
        self.next_ordinal += 1;
        Some(id)
    }

    /// Scheduling events from history that the code has not asked for.
    pub(crate) fn unclaimed(&self) -> Option<&Event> {
        self.recorded.get(self.next_ordinal)
    }

    pub(crate) fn is_cancelled(&self, token: u64) -> bool {
        self.cancelled_tokens.contains(&token)
    }

    pub(crate) fn pop_raised(&mut self, name: &str) -> Option<String> {
        self.raised.get_mut(name).and_then(VecDeque::pop_front)
    }
}

struct HeldLocks {
    lock_set: Vec<EntityId>,
    request_id: String,
    granted: bool,
}

pub(crate) fn describe(kind: ScheduleKind, name: &str) -> String {
    if name.is_empty() {
        kind.to_string()
    } else {
        format!("{kind} '{name}'")
    }
}

pub(crate) fn describe_event(event: &Event) -> String {
    match event.schedule_kind() {
        Some((kind, name)) => describe(kind, name),
        None => event.kind().to_string(),
    }
}

/// Shared handle to the state of one replay pass.
#[derive(Clone)]
pub(crate) struct ReplayCore(Arc<Mutex<CoreState>>);

impl ReplayCore {
    pub(crate) fn new(instance: impl Into<String>, execution_id: u64, history: &[Event], next_event_id: u64) -> Self {
        let recorded = history.iter().filter(|e| e.schedule_kind().is_some()).cloned().collect();
        ReplayCore(Arc::new(Mutex::new(CoreState {
            instance: instance.into(),
            execution_id,
            recorded,
            next_ordinal: 0,
            next_event_id,
            new_events: Vec::new(),
            decisions: Vec::new(),
            completions: HashMap::new(),
            raised: HashMap::new(),
            current_time_ms: 0,
            replaying: true,
            nondeterminism: None,
            custom_status: None,
            continue_as_new: None,
            woken: false,
            closed: false,
            locks: None,
            guid_counter: 0,
            next_token: 0,
            cancelled_tokens: HashSet::new(),
        })))
    }

    /// Poisoning only means user code panicked while a future held the lock;
    /// the state itself stays consistent because every mutation is a single step.
    pub(crate) fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn is_replaying(&self) -> bool {
        self.lock().replaying
    }

    pub(crate) fn schedule_activity(&self, name: &str, input: String) -> TaskFuture {
        let claimed = self.lock().claim(ScheduleKind::Task, name, |id| {
            (
                Event::TaskScheduled {
                    event_id: id,
                    name: name.to_string(),
                    input: input.clone(),
                },
                Some(Decision::ScheduleTask {
                    scheduling_event_id: id,
                    name: name.to_string(),
                    input,
                }),
            )
        });
        DurableFuture::task(self.clone(), claimed)
    }

    pub(crate) fn create_timer(&self, fire_at_ms: u64, token: Option<&CancellationToken>) -> TimerFuture {
        let claimed = self.lock().claim(ScheduleKind::Timer, "", |id| {
            (
                Event::TimerCreated {
                    event_id: id,
                    fire_at_ms,
                },
                Some(Decision::CreateTimer {
                    scheduling_event_id: id,
                    fire_at_ms,
                }),
            )
        });
        DurableFuture::timer(self.clone(), claimed, token.map(|t| t.id))
    }

    pub(crate) fn signal_entity(&self, entity: &EntityId, operation: &str, input: Option<String>) {
        let mut st = self.lock();
        let (instance, execution_id) = (st.instance.clone(), st.execution_id);
        st.claim(ScheduleKind::EntitySignal, operation, |id| {
            let request_id = request_id_for(&instance, execution_id, id);
            (
                Event::EntityOperationSignaled {
                    event_id: id,
                    entity: entity.clone(),
                    operation: operation.to_string(),
                    input: input.clone(),
                    request_id: request_id.clone(),
                },
                Some(Decision::SignalEntity {
                    scheduling_event_id: id,
                    entity: entity.clone(),
                    operation: operation.to_string(),
                    input,
                    request_id,
                }),
            )
        });
    }

    pub(crate) fn call_entity(&self, entity: &EntityId, operation: &str, input: Option<String>) -> TaskFuture {
        let mut st = self.lock();
        if st.held_locks().is_some_and(|held| !held.contains(entity)) {
            drop(st);
            return DurableFuture::rejected(
                self.clone(),
                format!("while holding locks, cannot call {entity} whose lock is not held"),
            );
        }
        let (instance, execution_id) = (st.instance.clone(), st.execution_id);
        let claimed = st.claim(ScheduleKind::EntityCall, operation, |id| {
            let request_id = request_id_for(&instance, execution_id, id);
            (
                Event::EntityOperationCalled {
                    event_id: id,
                    entity: entity.clone(),
                    operation: operation.to_string(),
                    input: input.clone(),
                    request_id: request_id.clone(),
                },
                Some(Decision::CallEntity {
                    scheduling_event_id: id,
                    entity: entity.clone(),
                    operation: operation.to_string(),
                    input,
                    request_id,
                }),
            )
        });
        drop(st);
        DurableFuture::task(self.clone(), claimed)
    }

    /// Send a lock request for the sorted, distinct `entities` and return the
    /// future that resolves when the last of them grants its lock.
    pub(crate) fn request_locks(&self, entities: &[EntityId]) -> Result<(TaskFuture, Vec<EntityId>, String), String> {
        let mut lock_set = entities.to_vec();
        lock_set.sort();
        lock_set.dedup();
        if lock_set.is_empty() {
            return Err("the set of entities to lock must not be empty".to_string());
        }
        let mut st = self.lock();
        if st.locks.is_some() {
            return Err("cannot acquire more locks when already holding some".to_string());
        }
        let (instance, execution_id) = (st.instance.clone(), st.execution_id);
        let claimed = st.claim(ScheduleKind::EntityLock, "", |id| {
            let request_id = request_id_for(&instance, execution_id, id);
            (
                Event::EntityLockRequested {
                    event_id: id,
                    lock_set: lock_set.clone(),
                    request_id: request_id.clone(),
                },
                Some(Decision::LockEntities {
                    scheduling_event_id: id,
                    lock_set: lock_set.clone(),
                    request_id,
                }),
            )
        });
        let request_id = claimed
            .map(|id| request_id_for(&instance, execution_id, id))
            .unwrap_or_default();
        if claimed.is_some() {
            st.locks = Some(HeldLocks {
                lock_set: lock_set.clone(),
                request_id: request_id.clone(),
                granted: false,
            });
        }
        drop(st);
        Ok((DurableFuture::task(self.clone(), claimed), lock_set, request_id))
    }

    pub(crate) fn mark_locked(&self, request_id: &str) {
        if let Some(held) = self.lock().locks.as_mut().filter(|l| l.request_id == request_id) {
            held.granted = true;
        }
    }

    /// Record the release of the locks taken by `request_id`.
    pub(crate) fn release_locks(&self, request_id: &str) {
        let mut st = self.lock();
        if st.closed || !st.locks.as_ref().is_some_and(|l| l.request_id == request_id) {
            return;
        }
        let Some(held) = st.locks.take() else {
            return;
        };
        st.claim(ScheduleKind::EntityUnlock, "", |id| {
            (
                Event::EntityLockReleased {
                    event_id: id,
                    lock_set: held.lock_set.clone(),
                    request_id: held.request_id.clone(),
                },
                Some(Decision::UnlockEntities {
                    scheduling_event_id: id,
                    lock_set: held.lock_set,
                    request_id: held.request_id,
                }),
            )
        });
    }
}

impl CoreState {
    /// Entities locked by this orchestration, once the locks are granted.
    pub(crate) fn held_locks(&self) -> Option<&[EntityId]> {
        self.locks.as_ref().filter(|l| l.granted).map(|l| l.lock_set.as_slice())
    }
}

/// Entity request ids are name-based so a replayed send carries the same id
/// and the receiving entity can drop the duplicate.
pub(crate) fn request_id_for(instance: &str, execution_id: u64, event_id: u64) -> String {
    let name = format!("{instance}:{execution_id}:{event_id}");
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Orchestration-local cancellation source for durable timers.
///
/// Cancelling resolves the associated timer with [`TimerOutcome::Cancelled`]
/// at the next poll. The `TimerCreated` event stays in history and a later
/// `TimerFired` is ignored.
#[derive(Clone)]
pub struct CancellationToken {
    core: ReplayCore,
    id: u64,
}

impl CancellationToken {
    pub fn cancel(&self) {
        let mut st = self.core.lock();
        if st.cancelled_tokens.insert(self.id) {
            st.woken = true;
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.lock().is_cancelled(self.id)
    }
}

/// Locks an orchestration holds on a set of entities.
///
/// While the section is held the locked entities only run operations called
/// by its owner; signals and calls from anyone else stay queued until the
/// locks are released, explicitly or by dropping the section.
pub struct CriticalSection {
    core: ReplayCore,
    lock_set: Vec<EntityId>,
    request_id: String,
}

impl CriticalSection {
    /// Locked entities, sorted.
    pub fn entities(&self) -> &[EntityId] {
        &self.lock_set
    }

    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CriticalSection {
    fn drop(&mut self) {
        self.core.release_locks(&self.request_id);
    }
}

impl std::fmt::Debug for CriticalSection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CriticalSection")
            .field("entities", &self.lock_set)
            .field("request_id", &self.request_id)
            .finish()
    }
}

/// Handle given to orchestration functions.
///
/// Every method that schedules work is a replay point: calling it either
/// picks up the outcome recorded in history or records a new decision.
#[derive(Clone)]
pub struct OrchestrationContext {
    pub(crate) core: ReplayCore,
}

impl OrchestrationContext {
    pub(crate) fn new(core: ReplayCore) -> Self {
        Self { core }
    }

    pub fn instance_id(&self) -> String {
        self.core.lock().instance.clone()
    }

    pub fn execution_id(&self) -> u64 {
        self.core.lock().execution_id
    }

    /// True while the code is re-executing against recorded history.
    pub fn is_replaying(&self) -> bool {
        self.core.is_replaying()
    }

    /// Used by the `durable_*` logging macros.
    pub fn is_logging_enabled(&self) -> bool {
        !self.is_replaying()
    }

    /// Deterministic clock: the timestamp of the latest pass delivered so far.
    pub fn current_time_ms(&self) -> u64 {
        self.core.lock().current_time_ms
    }

    /// Deterministic GUID, identical on every replay of this point.
    pub fn new_guid(&self) -> String {
        let mut st = self.core.lock();
        st.guid_counter += 1;
        let name = format!("{}_{}_{}", st.instance, st.current_time_ms, st.guid_counter);
        Uuid::new_v5(&Uuid::NAMESPACE_DNS, name.as_bytes()).to_string()
    }

    pub fn set_custom_status(&self, status: impl Into<String>) {
        self.core.lock().custom_status = Some(status.into());
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            tracing::info!(instance_id = %self.instance_id(), execution_id = self.execution_id(), "{}", message.as_ref());
        }
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            tracing::warn!(instance_id = %self.instance_id(), execution_id = self.execution_id(), "{}", message.as_ref());
        }
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            tracing::error!(instance_id = %self.instance_id(), execution_id = self.execution_id(), "{}", message.as_ref());
        }
    }

    pub fn trace_debug(&self, message: impl AsRef<str>) {
        if self.is_logging_enabled() {
            tracing::debug!(instance_id = %self.instance_id(), execution_id = self.execution_id(), "{}", message.as_ref());
        }
    }

    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> TaskFuture {
        self.core.schedule_activity(&name.into(), input.into())
    }

    pub fn schedule_activity_typed<In, Out>(
        &self,
        name: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + Send
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let scheduled = Json::encode(input).map(|payload| self.schedule_activity(name, payload));
        async move {
            let raw = scheduled?.await?;
            Json::decode(&raw)
        }
    }

    /// Schedule an activity and retry failures according to `options`.
    ///
    /// Each retry is a new `TaskScheduled` preceded by a durable timer.
    pub fn schedule_activity_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: RetryOptions,
    ) -> impl Future<Output = Result<String, String>> + Send {
        let name = name.into();
        let input = input.into();
        let ctx = self.clone();
        with_retry(self.clone(), options, move || ctx.schedule_activity(name.clone(), input.clone()))
    }

    pub fn schedule_timer(&self, delay: Duration) -> TimerFuture {
        let fire_at = self.current_time_ms().saturating_add(delay.as_millis() as u64);
        self.core.create_timer(fire_at, None)
    }

    /// Durable timer firing at an absolute time, optionally cancellable.
    pub fn create_timer(&self, fire_at_ms: u64, token: Option<&CancellationToken>) -> TimerFuture {
        self.core.create_timer(fire_at_ms, token)
    }

    pub fn new_cancellation_token(&self) -> CancellationToken {
        let mut st = self.core.lock();
        st.next_token += 1;
        CancellationToken {
            core: self.core.clone(),
            id: st.next_token,
        }
    }

    /// Wait for the next external event named `name`. Events raised before
    /// anyone waits are buffered and handed out first-in first-out.
    pub fn wait_for_event(&self, name: impl Into<String>) -> EventFuture {
        let name = name.into();
        let mut st = self.core.lock();
        if !st.replaying {
            st.decisions.push(Decision::WaitForEvent { name: name.clone() });
        }
        drop(st);
        DurableFuture::event(self.core.clone(), name)
    }

    /// Alias kept for parity with the scheduling API naming.
    pub fn schedule_wait(&self, name: impl Into<String>) -> EventFuture {
        self.wait_for_event(name)
    }

    /// Wait for an event, giving up after `timeout`. Returns `None` on timeout;
    /// the event, if it arrives later, stays buffered for the next waiter.
    pub fn wait_for_event_with_timeout(
        &self,
        name: impl Into<String>,
        timeout: Duration,
    ) -> impl Future<Output = Option<String>> + Send {
        let token = self.new_cancellation_token();
        let fire_at = self.current_time_ms().saturating_add(timeout.as_millis() as u64);
        let timer = self.create_timer(fire_at, Some(&token));
        let event = self.wait_for_event(name);
        async move {
            match select(event, timer).await {
                Either::Left((data, _)) => {
                    token.cancel();
                    Some(data)
                }
                Either::Right((_, _)) => None,
            }
        }
    }

    /// Start a child orchestration. When `instance` is `None` the child id is
    /// derived from the parent id and the scheduling event id.
    pub fn schedule_sub_orchestration(
        &self,
        name: impl Into<String>,
        instance: Option<String>,
        input: impl Into<String>,
    ) -> TaskFuture {
        let name = name.into();
        let input = input.into();
        let mut st = self.core.lock();
        if st.held_locks().is_some() {
            drop(st);
            return DurableFuture::rejected(
                self.core.clone(),
                "while holding locks, cannot call sub-orchestrations".to_string(),
            );
        }
        let parent = st.instance.clone();
        let claimed = st.claim(ScheduleKind::SubOrchestration, &name, |id| {
            let child = instance.unwrap_or_else(|| format!("{parent}::sub::{id}"));
            (
                Event::SubOrchestrationScheduled {
                    event_id: id,
                    name: name.clone(),
                    instance: child.clone(),
                    input: input.clone(),
                },
                Some(Decision::StartSubOrchestration {
                    scheduling_event_id: id,
                    name: name.clone(),
                    instance: child,
                    input,
                }),
            )
        });
        drop(st);
        DurableFuture::task(self.core.clone(), claimed)
    }

    pub fn schedule_sub_orchestration_with_retry(
        &self,
        name: impl Into<String>,
        input: impl Into<String>,
        options: RetryOptions,
    ) -> impl Future<Output = Result<String, String>> + Send {
        let name = name.into();
        let input = input.into();
        let ctx = self.clone();
        with_retry(self.clone(), options, move || {
            ctx.schedule_sub_orchestration(name.clone(), None, input.clone())
        })
    }

    /// Call an entity operation and wait for its result.
    pub fn call_entity(&self, entity: &EntityId, operation: impl Into<String>, input: Option<String>) -> TaskFuture {
        self.core.call_entity(entity, &operation.into(), input)
    }

    pub fn call_entity_typed<In, Out>(
        &self,
        entity: &EntityId,
        operation: impl Into<String>,
        input: &In,
    ) -> impl Future<Output = Result<Out, String>> + Send
    where
        In: Serialize,
        Out: DeserializeOwned,
    {
        let call = Json::encode(input).map(|payload| self.call_entity(entity, operation, Some(payload)));
        async move {
            let raw = call?.await?;
            Json::decode(&raw)
        }
    }

    /// Lock `entities` for a critical section.
    ///
    /// Locks are acquired one entity at a time in a fixed global order, so
    /// orchestrations locking overlapping sets cannot deadlock. While the
    /// section is held, calls to entities outside it and sub-orchestrations
    /// fail immediately.
    pub fn lock_entities(&self, entities: &[EntityId]) -> impl Future<Output = Result<CriticalSection, String>> + Send {
        let requested = self.core.request_locks(entities);
        let core = self.core.clone();
        async move {
            let (granted, lock_set, request_id) = requested?;
            granted.await?;
            core.mark_locked(&request_id);
            Ok(CriticalSection {
                core,
                lock_set,
                request_id,
            })
        }
    }

    /// True while this orchestration holds entity locks.
    pub fn is_locked(&self) -> bool {
        self.core.lock().held_locks().is_some()
    }

    /// Entities this orchestration holds locks on; empty when it holds none.
    pub fn locked_entities(&self) -> Vec<EntityId> {
        self.core.lock().held_locks().map(<[_]>::to_vec).unwrap_or_default()
    }

    /// Send a one-way operation to an entity.
    pub fn signal_entity(&self, entity: &EntityId, operation: impl Into<String>, input: Option<String>) {
        self.core.signal_entity(entity, &operation.into(), input)
    }

    /// End this execution and restart the instance with `input` and a fresh
    /// history. The returned future never resolves; return it from the
    /// orchestration or await it.
    pub fn continue_as_new(&self, input: impl Into<String>) -> impl Future<Output = Result<String, String>> + Send {
        let mut st = self.core.lock();
        if st.continue_as_new.is_none() {
            st.continue_as_new = Some(input.into());
            st.woken = true;
        }
        futures::future::pending()
    }
}

async fn with_retry<F>(ctx: OrchestrationContext, options: RetryOptions, mut call: F) -> Result<String, String>
where
    F: FnMut() -> TaskFuture,
{
    let first_attempt_ms = ctx.current_time_ms();
    let mut attempt = 1u32;
    loop {
        let err = match call().await {
            Ok(v) => return Ok(v),
            Err(e) => e,
        };
        let elapsed = Duration::from_millis(ctx.current_time_ms().saturating_sub(first_attempt_ms));
        match options.should_retry(attempt, elapsed, &err) {
            RetryDecision::GiveUp => return Err(err),
            RetryDecision::RetryAfter(delay) => {
                if ctx.is_logging_enabled() {
                    tracing::debug!(
                        instance_id = %ctx.instance_id(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after failure"
                    );
                }
                let _ = ctx.schedule_timer(delay).await;
                attempt += 1;
            }
        }
    }
}

impl std::fmt::Debug for OrchestrationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let st = self.core.lock();
        f.debug_struct("OrchestrationContext")
            .field("instance", &st.instance)
            .field("execution_id", &st.execution_id)
            .field("replaying", &st.replaying)
            .finish()
    }
}
