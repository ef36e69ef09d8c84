use std::collections::HashMap;

use tokio::sync::Mutex;

use super::{ClientError, OrchestrationClient};
use crate::runtime::status::{OrchestrationState, RuntimeStatus};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RaisedEvent {
    pub instance: String,
    pub name: String,
    pub data: String,
}

#[derive(Debug, Default)]
struct FakeState {
    instances: HashMap<String, OrchestrationState>,
    raised: Vec<RaisedEvent>,
}

/// In-memory [`OrchestrationClient`] for testing code that drives
/// orchestrations without running a runtime.
///
/// Started instances stay `Pending` until a test moves them with
/// [`complete`](Self::complete) or [`fail`](Self::fail).
///
/// ```rust
/// use durafunc::client::{FakeClient, OrchestrationClient};
/// use durafunc::RuntimeStatus;
///
/// # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
/// let client = FakeClient::new();
/// client.start_orchestration("order-1", "Checkout", "{}").await.unwrap();
/// client.complete("order-1", "\"shipped\"").await;
/// let state = client.get_status("order-1").await.unwrap().unwrap();
/// assert_eq!(state.runtime_status, RuntimeStatus::Completed);
/// # });
/// ```
#[derive(Debug, Default)]
pub struct FakeClient {
    state: Mutex<FakeState>,
}

impl FakeClient {
    pub fn new() -> Self {
        Self::default()
    }

    async fn finish(&self, instance: &str, status: RuntimeStatus, output: &str) {
        let mut g = self.state.lock().await;
        if let Some(state) = g.instances.get_mut(instance) {
            state.runtime_status = status;
            state.output = Some(output.to_string());
            state.last_updated_time_ms = crate::now_ms();
        }
    }

    pub async fn complete(&self, instance: &str, output: &str) {
        self.finish(instance, RuntimeStatus::Completed, output).await;
    }

    pub async fn fail(&self, instance: &str, error: &str) {
        self.finish(instance, RuntimeStatus::Failed, error).await;
    }

    /// Events raised so far, in order.
    pub async fn raised_events(&self) -> Vec<RaisedEvent> {
        self.state.lock().await.raised.clone()
    }
}

#[async_trait::async_trait]
impl OrchestrationClient for FakeClient {
    async fn start_orchestration(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ClientError> {
        let mut g = self.state.lock().await;
        if g.instances.contains_key(instance) {
            return Err(ClientError::InstanceExists(instance.to_string()));
        }
        let now = crate::now_ms();
        g.instances.insert(
            instance.to_string(),
            OrchestrationState {
                instance_id: instance.to_string(),
                task_hub: "fake".to_string(),
                function_name: orchestration.to_string(),
                runtime_status: RuntimeStatus::Pending,
                created_time_ms: now,
                last_updated_time_ms: now,
                input: Some(input.to_string()),
                output: None,
                custom_status: None,
                execution_id: crate::INITIAL_EXECUTION_ID,
            },
        );
        Ok(())
    }

    async fn raise_event(&self, instance: &str, event_name: &str, data: &str) -> Result<(), ClientError> {
        let mut g = self.state.lock().await;
        match g.instances.get(instance) {
            None => return Err(ClientError::NotFound(instance.to_string())),
            Some(s) if s.runtime_status.is_terminal() => {
                return Err(ClientError::InvalidState {
                    instance: instance.to_string(),
                    status: s.runtime_status,
                    operation: "raise_event",
                })
            }
            Some(_) => {}
        }
        g.raised.push(RaisedEvent {
            instance: instance.to_string(),
            name: event_name.to_string(),
            data: data.to_string(),
        });
        Ok(())
    }

    async fn get_status(&self, instance: &str) -> Result<Option<OrchestrationState>, ClientError> {
        Ok(self.state.lock().await.instances.get(instance).cloned())
    }

    async fn terminate(&self, instance: &str, reason: &str) -> Result<(), ClientError> {
        let mut g = self.state.lock().await;
        let state = g
            .instances
            .get_mut(instance)
            .ok_or_else(|| ClientError::NotFound(instance.to_string()))?;
        let next = state
            .runtime_status
            .transition(crate::runtime::status::StatusEvent::Terminated)
            .map_err(|e| ClientError::InvalidState {
                instance: instance.to_string(),
                status: e.from,
                operation: "terminate",
            })?;
        state.runtime_status = next;
        state.output = Some(reason.to_string());
        state.last_updated_time_ms = crate::now_ms();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn terminate_follows_status_rules() {
        let c = FakeClient::new();
        c.start_orchestration("i1", "Orch", "").await.unwrap();
        c.terminate("i1", "stop").await.unwrap();
        let state = c.get_status("i1").await.unwrap().unwrap();
        assert_eq!(state.runtime_status, RuntimeStatus::Terminated);
        assert_eq!(state.output.as_deref(), Some("stop"));
        assert!(matches!(
            c.terminate("i1", "again").await,
            Err(ClientError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn records_raised_events() {
        let c = FakeClient::new();
        c.start_orchestration("i1", "Orch", "").await.unwrap();
        c.raise_event("i1", "Approval", "true").await.unwrap();
        assert_eq!(
            c.raised_events().await,
            vec![RaisedEvent {
                instance: "i1".into(),
                name: "Approval".into(),
                data: "true".into(),
            }]
        );
        assert_eq!(c.raise_event("nope", "E", "").await, Err(ClientError::NotFound("nope".into())));
    }

    #[tokio::test]
    async fn wait_for_completion_uses_the_shared_poll_loop() {
        let c = std::sync::Arc::new(FakeClient::new());
        c.start_orchestration("i1", "Orch", "").await.unwrap();
        let finisher = c.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            finisher.fail("i1", "boom").await;
        });
        let state = c.wait_for_completion("i1", Duration::from_secs(5)).await.unwrap();
        assert_eq!(state.runtime_status, RuntimeStatus::Failed);
        assert_eq!(state.output.as_deref(), Some("boom"));
    }
}
