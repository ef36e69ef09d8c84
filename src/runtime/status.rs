//! Instance lifecycle.
//!
//! ```text
//! Pending --pass started--> Running --success--> Completed
//!    |                        |  ^  --error----> Failed --rewind--> Running
//!    |                        |  |  --cancel---> Canceled
//!    +------terminate---------+--+--terminate--> Terminated
//! ```
//!
//! `Running` loops on itself for every suspended pass and for continue-as-new.
//! Terminal states accept nothing further, except that a rewind reopens `Failed`.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RuntimeStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Terminated,
    Canceled,
}

/// Something that happened to an instance that may move its status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusEvent {
    PassStarted,
    PassSuspended,
    Succeeded,
    Failed,
    Terminated,
    Canceled,
    ContinuedAsNew,
    Rewound,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid status transition: {from} on {event:?}")]
pub struct StatusTransitionError {
    pub from: RuntimeStatus,
    pub event: StatusEvent,
}

impl RuntimeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RuntimeStatus::Completed | RuntimeStatus::Failed | RuntimeStatus::Terminated | RuntimeStatus::Canceled
        )
    }

    pub fn transition(self, event: StatusEvent) -> Result<RuntimeStatus, StatusTransitionError> {
        use RuntimeStatus as S;
        use StatusEvent as E;
        let next = match (self, event) {
            (S::Pending, E::PassStarted) => S::Running,
            (S::Pending, E::Terminated) => S::Terminated,
            (S::Running, E::PassStarted | E::PassSuspended | E::ContinuedAsNew) => S::Running,
            (S::Running, E::Succeeded) => S::Completed,
            (S::Running, E::Failed) => S::Failed,
            (S::Running, E::Terminated) => S::Terminated,
            (S::Running, E::Canceled) => S::Canceled,
            (S::Failed, E::Rewound) => S::Running,
            (from, event) => return Err(StatusTransitionError { from, event }),
        };
        Ok(next)
    }

    pub fn can_transition_to(self, event: StatusEvent) -> bool {
        self.transition(event).is_ok()
    }

    /// Apply events in order, stopping at the first invalid one.
    pub fn apply_all(self, events: &[StatusEvent]) -> Result<RuntimeStatus, StatusTransitionError> {
        events.iter().try_fold(self, |status, e| status.transition(*e))
    }
}

impl fmt::Display for RuntimeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RuntimeStatus::Pending => "Pending",
            RuntimeStatus::Running => "Running",
            RuntimeStatus::Completed => "Completed",
            RuntimeStatus::Failed => "Failed",
            RuntimeStatus::Terminated => "Terminated",
            RuntimeStatus::Canceled => "Canceled",
        };
        f.write_str(s)
    }
}

/// Read-only projection of an instance, as served by status queries.
///
/// For `Failed` instances `output` holds the error message; for `Terminated`
/// and `Canceled` instances it holds the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationState {
    pub instance_id: String,
    pub task_hub: String,
    pub function_name: String,
    pub runtime_status: RuntimeStatus,
    pub created_time_ms: u64,
    pub last_updated_time_ms: u64,
    pub input: Option<String>,
    pub output: Option<String>,
    pub custom_status: Option<String>,
    pub execution_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn table_transitions() {
        use RuntimeStatus as S;
        use StatusEvent as E;
        assert_eq!(S::Pending.transition(E::PassStarted), Ok(S::Running));
        assert_eq!(S::Running.transition(E::PassSuspended), Ok(S::Running));
        assert_eq!(S::Running.transition(E::Succeeded), Ok(S::Completed));
        assert_eq!(S::Running.transition(E::Failed), Ok(S::Failed));
        assert_eq!(S::Pending.transition(E::Terminated), Ok(S::Terminated));
        assert_eq!(S::Running.transition(E::Terminated), Ok(S::Terminated));
        assert_eq!(S::Running.transition(E::Canceled), Ok(S::Canceled));
        assert_eq!(S::Failed.transition(E::Rewound), Ok(S::Running));
    }

    #[test]
    fn pending_cannot_be_canceled_or_complete_directly() {
        assert!(!RuntimeStatus::Pending.can_transition_to(StatusEvent::Canceled));
        assert!(!RuntimeStatus::Pending.can_transition_to(StatusEvent::Succeeded));
        let err = RuntimeStatus::Completed.transition(StatusEvent::PassStarted).unwrap_err();
        assert_eq!(err.from, RuntimeStatus::Completed);
        assert!(err.to_string().contains("Completed"));
    }

    fn any_event() -> impl Strategy<Value = StatusEvent> {
        prop_oneof![
            Just(StatusEvent::PassStarted),
            Just(StatusEvent::PassSuspended),
            Just(StatusEvent::Succeeded),
            Just(StatusEvent::Failed),
            Just(StatusEvent::Terminated),
            Just(StatusEvent::Canceled),
            Just(StatusEvent::ContinuedAsNew),
        ]
    }

    proptest! {
        // Without rewinds, once terminal always terminal and never back to Running.
        #[test]
        fn terminal_states_are_absorbing(events in proptest::collection::vec(any_event(), 0..40)) {
            let mut status = RuntimeStatus::Pending;
            let mut seen_terminal: Option<RuntimeStatus> = None;
            for e in events {
                if let Ok(next) = status.transition(e) {
                    if let Some(t) = seen_terminal {
                        prop_assert_eq!(next, t);
                    }
                    status = next;
                    if status.is_terminal() {
                        seen_terminal = Some(status);
                    }
                }
            }
        }

        #[test]
        fn completed_never_reenters_running(events in proptest::collection::vec(any_event(), 0..20)) {
            let mut status = RuntimeStatus::Completed;
            for e in events {
                prop_assert!(status.transition(e).is_err());
                status = status.transition(e).unwrap_or(status);
            }
            prop_assert_eq!(status, RuntimeStatus::Completed);
        }
    }
}
