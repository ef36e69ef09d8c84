/// How the runtime should react to a failed store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderErrorKind {
    /// Busy, timed out, unavailable. Retry the same call after a backoff.
    Retryable,
    /// Missing instance, invalid token, corrupt data. Retrying will not help.
    Permanent,
    /// Another writer changed the instance. Reload history and rerun the pass.
    Conflict,
}

/// Store error with retry classification.
///
/// ```rust
/// use durafunc::providers::ProviderError;
///
/// let busy = ProviderError::retryable("ack_orchestration_item", "store is busy");
/// assert!(busy.is_retryable());
/// let raced = ProviderError::conflict("append_events", "expected version 3, found 4");
/// assert!(raced.is_conflict());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{operation}: {message}")]
pub struct ProviderError {
    /// Operation that failed, e.g. "fetch_orchestration_item".
    pub operation: String,
    pub message: String,
    pub kind: ProviderErrorKind,
}

impl ProviderError {
    pub fn retryable(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Retryable)
    }

    pub fn permanent(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Permanent)
    }

    pub fn conflict(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(operation, message, ProviderErrorKind::Conflict)
    }

    fn new(operation: impl Into<String>, message: impl Into<String>, kind: ProviderErrorKind) -> Self {
        Self {
            operation: operation.into(),
            message: message.into(),
            kind,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == ProviderErrorKind::Retryable
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ProviderErrorKind::Conflict
    }
}
