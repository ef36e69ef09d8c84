//! Failure taxonomy recorded in history and surfaced to user code.

use serde::{Deserialize, Serialize};

/// Structured description of a failure.
///
/// Only `Application` failures are catchable by orchestration code (they come
/// back as `Err(message)` from the awaited call). Every other category aborts
/// the pass and fails the instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "category")]
pub enum ErrorDetails {
    /// User code returned an error: an activity, a sub-orchestration, an
    /// entity operation or the orchestration itself.
    #[error("{message}")]
    Application { message: String },

    /// Replay produced a decision that does not match the recorded history.
    #[error("nondeterministic: {message}")]
    NonDeterminism {
        expected: String,
        actual: String,
        message: String,
    },

    /// A referenced orchestration, activity, entity or operation is not registered.
    #[error("configuration error: {message}")]
    Configuration { resource: String, message: String },

    /// The store or message transport failed.
    #[error("infrastructure error in {operation}: {message}")]
    Infrastructure {
        operation: String,
        message: String,
        retryable: bool,
    },

    /// User code panicked.
    #[error("panicked: {message}")]
    Panic { message: String },
}

impl ErrorDetails {
    pub fn application(message: impl Into<String>) -> Self {
        ErrorDetails::Application {
            message: message.into(),
        }
    }

    /// Mismatch between what the history recorded and what replay asked for.
    pub fn non_determinism(expected: impl Into<String>, actual: impl Into<String>) -> Self {
        let expected = expected.into();
        let actual = actual.into();
        ErrorDetails::NonDeterminism {
            message: format!("schedule order mismatch: history has {expected} but code scheduled {actual}"),
            expected,
            actual,
        }
    }

    pub fn unregistered(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        ErrorDetails::Configuration {
            message: format!("'{resource}' is not registered"),
            resource,
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "user code panicked".to_string()
        };
        ErrorDetails::Panic { message }
    }

    /// Whether orchestration code sees this as an ordinary `Err` value.
    pub fn is_catchable(&self) -> bool {
        matches!(self, ErrorDetails::Application { .. })
    }

    pub fn is_nondeterminism(&self) -> bool {
        matches!(self, ErrorDetails::NonDeterminism { .. })
    }

    pub fn category(&self) -> &'static str {
        match self {
            ErrorDetails::Application { .. } => "application",
            ErrorDetails::NonDeterminism { .. } => "nondeterminism",
            ErrorDetails::Configuration { .. } => "configuration",
            ErrorDetails::Infrastructure { .. } => "infrastructure",
            ErrorDetails::Panic { .. } => "panic",
        }
    }

    /// Text stored as the output of a failed instance.
    pub fn display_message(&self) -> String {
        self.to_string()
    }
}

impl From<crate::providers::ProviderError> for ErrorDetails {
    fn from(err: crate::providers::ProviderError) -> Self {
        ErrorDetails::Infrastructure {
            operation: err.operation.clone(),
            message: err.message.clone(),
            retryable: err.is_retryable(),
        }
    }
}
