//! Suspension points of a replay pass.
//!
//! A `DurableFuture` never registers a waker. The replay engine polls the
//! root future after every delivered history event, so a future only has to
//! look at what the core has been given so far.

use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::context::{Completion, ReplayCore};

/// How a durable timer ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerOutcome {
    Fired,
    Cancelled,
}

enum Slot {
    /// Claimed the scheduling event with this id.
    Claimed(u64),
    Timer { id: u64, token: Option<u64> },
    Event { name: String },
    /// The claim was rejected as nondeterministic; the pass is aborting.
    Never,
    /// Refused before anything was scheduled; resolves to this error.
    Rejected(String),
    Done,
}

pub struct DurableFuture<T> {
    core: ReplayCore,
    slot: Slot,
    _output: PhantomData<fn() -> T>,
}

/// Activity, sub-orchestration and entity call.
pub type TaskFuture = DurableFuture<Result<String, String>>;
pub type TimerFuture = DurableFuture<TimerOutcome>;
pub type EventFuture = DurableFuture<String>;

impl<T> DurableFuture<T> {
    fn with_slot(core: ReplayCore, slot: Slot) -> Self {
        Self {
            core,
            slot,
            _output: PhantomData,
        }
    }

    /// Id of the scheduling event this future claimed.
    pub fn scheduling_event_id(&self) -> Option<u64> {
        match self.slot {
            Slot::Claimed(id) | Slot::Timer { id, .. } => Some(id),
            _ => None,
        }
    }
}

impl TaskFuture {
    pub(crate) fn task(core: ReplayCore, claimed: Option<u64>) -> Self {
        Self::with_slot(core, claimed.map(Slot::Claimed).unwrap_or(Slot::Never))
    }

    pub(crate) fn rejected(core: ReplayCore, message: String) -> Self {
        Self::with_slot(core, Slot::Rejected(message))
    }
}

impl TimerFuture {
    pub(crate) fn timer(core: ReplayCore, claimed: Option<u64>, token: Option<u64>) -> Self {
        let slot = match claimed {
            Some(id) => Slot::Timer { id, token },
            None => Slot::Never,
        };
        Self::with_slot(core, slot)
    }
}

impl EventFuture {
    pub(crate) fn event(core: ReplayCore, name: String) -> Self {
        Self::with_slot(core, Slot::Event { name })
    }
}

impl Future for TaskFuture {
    type Output = Result<String, String>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Slot::Rejected(message) = &mut this.slot {
            let message = std::mem::take(message);
            this.slot = Slot::Done;
            return Poll::Ready(Err(message));
        }
        let Slot::Claimed(id) = this.slot else {
            return Poll::Pending;
        };
        let ready = match this.core.lock().completions.get(&id) {
            Some(Completion::Ok(result)) => Ok(result.clone()),
            Some(Completion::Err(details)) => Err(details.display_message()),
            _ => return Poll::Pending,
        };
        this.slot = Slot::Done;
        Poll::Ready(ready)
    }
}

impl Future for TimerFuture {
    type Output = TimerOutcome;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Slot::Timer { id, token } = this.slot else {
            return Poll::Pending;
        };
        let outcome = {
            let st = this.core.lock();
            if matches!(st.completions.get(&id), Some(Completion::TimerFired)) {
                TimerOutcome::Fired
            } else if token.is_some_and(|t| st.is_cancelled(t)) {
                TimerOutcome::Cancelled
            } else {
                return Poll::Pending;
            }
        };
        this.slot = Slot::Done;
        Poll::Ready(outcome)
    }
}

impl Future for EventFuture {
    type Output = String;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Slot::Event { name } = &this.slot else {
            return Poll::Pending;
        };
        let Some(data) = this.core.lock().pop_raised(name) else {
            return Poll::Pending;
        };
        this.slot = Slot::Done;
        Poll::Ready(data)
    }
}
