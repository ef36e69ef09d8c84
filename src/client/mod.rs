use std::sync::Arc;
use std::time::Duration;

use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::codec::{Codec, Json};
use crate::entity::{EntityId, OperationRequest};
use crate::providers::{InstanceFilter, Provider, ProviderError, WorkItem};
use crate::runtime::status::{OrchestrationState, RuntimeStatus};
use crate::Event;

mod fake;
pub use fake::{FakeClient, RaisedEvent};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClientError {
    #[error("instance '{0}' already exists")]
    InstanceExists(String),
    #[error("instance '{0}' not found")]
    NotFound(String),
    #[error("instance '{instance}' is {status}; {operation} is not allowed")]
    InvalidState {
        instance: String,
        status: RuntimeStatus,
        operation: &'static str,
    },
    #[error("instance '{instance}' did not finish within {waited_ms}ms")]
    Timeout { instance: String, waited_ms: u64 },
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Codec(String),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

/// The control-plane calls application code depends on. [`Client`] talks to
/// a provider; [`FakeClient`] keeps everything in memory for unit tests.
#[async_trait::async_trait]
pub trait OrchestrationClient: Send + Sync {
    async fn start_orchestration(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ClientError>;

    async fn raise_event(&self, instance: &str, event_name: &str, data: &str) -> Result<(), ClientError>;

    /// Latest persisted snapshot; never runs the orchestration.
    async fn get_status(&self, instance: &str) -> Result<Option<OrchestrationState>, ClientError>;

    async fn terminate(&self, instance: &str, reason: &str) -> Result<(), ClientError>;

    /// Poll [`get_status`](Self::get_status) until the instance is terminal or `timeout` elapses.
    async fn wait_for_completion(&self, instance: &str, timeout: Duration) -> Result<OrchestrationState, ClientError> {
        let started = tokio::time::Instant::now();
        let mut delay = Duration::from_millis(5);
        loop {
            if let Some(state) = self.get_status(instance).await? {
                if state.runtime_status.is_terminal() {
                    return Ok(state);
                }
            }
            let waited = started.elapsed();
            if waited >= timeout {
                return Err(ClientError::Timeout {
                    instance: instance.to_string(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            tokio::time::sleep(delay.min(timeout - waited)).await;
            delay = (delay * 2).min(Duration::from_millis(100));
        }
    }
}

/// Client for control-plane operations.
///
/// Only talks to the shared [`Provider`]; it never runs orchestration code
/// itself, so it works the same whether or not a runtime shares the process.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn Provider>,
}

impl Client {
    pub fn new(store: Arc<dyn Provider>) -> Self {
        Self { store }
    }

    async fn require(&self, instance: &str) -> Result<OrchestrationState, ClientError> {
        self.store
            .get_instance_info(instance)
            .await?
            .ok_or_else(|| ClientError::NotFound(instance.to_string()))
    }

    async fn require_not_terminal(&self, instance: &str, operation: &'static str) -> Result<(), ClientError> {
        let state = self.require(instance).await?;
        if state.runtime_status.is_terminal() {
            return Err(ClientError::InvalidState {
                instance: instance.to_string(),
                status: state.runtime_status,
                operation,
            });
        }
        Ok(())
    }

    /// Start an orchestration with typed input (serialized to JSON).
    pub async fn start_orchestration_typed<In: Serialize>(
        &self,
        instance: &str,
        orchestration: &str,
        input: &In,
    ) -> Result<(), ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.start_orchestration(instance, orchestration, &payload).await
    }

    /// Request cancellation. The instance ends `Canceled` at its next pass.
    pub async fn cancel(&self, instance: &str, reason: &str) -> Result<(), ClientError> {
        self.require_not_terminal(instance, "cancel").await?;
        let item = WorkItem::CancelInstance {
            instance: instance.to_string(),
            reason: reason.to_string(),
        };
        Ok(self.store.enqueue_orchestrator_work(item, None).await?)
    }

    /// Put a `Failed` instance back to work: failed calls are scheduled again.
    pub async fn rewind(&self, instance: &str, reason: &str) -> Result<(), ClientError> {
        let state = self.require(instance).await?;
        if state.runtime_status != RuntimeStatus::Failed {
            return Err(ClientError::InvalidState {
                instance: instance.to_string(),
                status: state.runtime_status,
                operation: "rewind",
            });
        }
        let item = WorkItem::RewindInstance {
            instance: instance.to_string(),
            reason: reason.to_string(),
        };
        Ok(self.store.enqueue_orchestrator_work(item, None).await?)
    }

    /// Delete a terminal instance. Returns false if it did not exist.
    pub async fn purge(&self, instance: &str) -> Result<bool, ClientError> {
        if let Some(state) = self.store.get_instance_info(instance).await? {
            if !state.runtime_status.is_terminal() {
                return Err(ClientError::InvalidState {
                    instance: instance.to_string(),
                    status: state.runtime_status,
                    operation: "purge",
                });
            }
        }
        Ok(self.store.purge_instance(instance).await?)
    }

    pub async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<OrchestrationState>, ClientError> {
        Ok(self.store.list_instances(filter).await?)
    }

    /// History of the latest execution.
    pub async fn get_history(&self, instance: &str) -> Result<Vec<Event>, ClientError> {
        Ok(self.store.read(instance).await?)
    }

    /// Typed output of a completed instance.
    pub async fn get_output<T: DeserializeOwned>(&self, instance: &str) -> Result<Option<T>, ClientError> {
        let state = self.require(instance).await?;
        match (state.runtime_status, state.output) {
            (RuntimeStatus::Completed, Some(output)) => Json::decode(&output).map(Some).map_err(ClientError::Codec),
            _ => Ok(None),
        }
    }

    /// Send a one-way operation to an entity. Returns the request id.
    pub async fn signal_entity(
        &self,
        entity: &EntityId,
        operation: &str,
        input: Option<String>,
    ) -> Result<String, ClientError> {
        let request_id = uuid::Uuid::new_v4().to_string();
        debug!(entity = %entity, operation, request_id = %request_id, "signaling entity");
        let item = WorkItem::EntityOperation {
            instance: entity.instance_id(),
            request: OperationRequest::signal(request_id.clone(), operation, input),
        };
        self.store.enqueue_orchestrator_work(item, None).await?;
        Ok(request_id)
    }

    pub async fn signal_entity_typed<In: Serialize>(
        &self,
        entity: &EntityId,
        operation: &str,
        input: &In,
    ) -> Result<String, ClientError> {
        let payload = Json::encode(input).map_err(ClientError::Codec)?;
        self.signal_entity(entity, operation, Some(payload)).await
    }

    /// Last persisted state of an entity, `None` if it has none.
    pub async fn read_entity_state(&self, entity: &EntityId) -> Result<Option<String>, ClientError> {
        Ok(self.store.read_entity_state(&entity.instance_id()).await?)
    }

    pub async fn read_entity_state_typed<T: DeserializeOwned>(&self, entity: &EntityId) -> Result<Option<T>, ClientError> {
        match self.read_entity_state(entity).await? {
            Some(raw) => Json::decode(&raw).map(Some).map_err(ClientError::Codec),
            None => Ok(None),
        }
    }
}

#[async_trait::async_trait]
impl OrchestrationClient for Client {
    async fn start_orchestration(&self, instance: &str, orchestration: &str, input: &str) -> Result<(), ClientError> {
        if instance.is_empty() || EntityId::is_entity_instance(instance) {
            return Err(ClientError::InvalidArgument(format!(
                "'{instance}' is not a valid orchestration instance id"
            )));
        }
        if self.store.get_instance_info(instance).await?.is_some() {
            return Err(ClientError::InstanceExists(instance.to_string()));
        }
        let item = WorkItem::StartOrchestration {
            instance: instance.to_string(),
            orchestration: orchestration.to_string(),
            input: input.to_string(),
            parent: None,
        };
        match self.store.enqueue_orchestrator_work(item, None).await {
            Err(e) if e.is_conflict() => Err(ClientError::InstanceExists(instance.to_string())),
            other => Ok(other?),
        }
    }

    async fn raise_event(&self, instance: &str, event_name: &str, data: &str) -> Result<(), ClientError> {
        self.require_not_terminal(instance, "raise_event").await?;
        let item = WorkItem::ExternalRaised {
            instance: instance.to_string(),
            name: event_name.to_string(),
            data: data.to_string(),
        };
        Ok(self.store.enqueue_orchestrator_work(item, None).await?)
    }

    async fn get_status(&self, instance: &str) -> Result<Option<OrchestrationState>, ClientError> {
        Ok(self.store.get_instance_info(instance).await?)
    }

    async fn terminate(&self, instance: &str, reason: &str) -> Result<(), ClientError> {
        self.require_not_terminal(instance, "terminate").await?;
        let item = WorkItem::TerminateInstance {
            instance: instance.to_string(),
            reason: reason.to_string(),
        };
        Ok(self.store.enqueue_orchestrator_work(item, None).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::in_memory::InMemoryProvider;

    fn client() -> Client {
        Client::new(Arc::new(InMemoryProvider::new("hub")))
    }

    #[tokio::test]
    async fn start_is_pending_until_a_pass_runs() {
        let c = client();
        c.start_orchestration("i1", "Hello", "\"World\"").await.unwrap();
        let state = c.get_status("i1").await.unwrap().unwrap();
        assert_eq!(state.runtime_status, RuntimeStatus::Pending);
        assert_eq!(state.input.as_deref(), Some("\"World\""));
        assert_eq!(
            c.start_orchestration("i1", "Hello", "x").await,
            Err(ClientError::InstanceExists("i1".into()))
        );
    }

    #[tokio::test]
    async fn concurrent_starts_admit_exactly_one() {
        let c = client();
        let (a, b) = tokio::join!(
            c.start_orchestration("race", "Hello", "1"),
            c.start_orchestration("race", "Hello", "2")
        );
        let results = [a, b];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| *r == Err(ClientError::InstanceExists("race".into()))));
    }

    #[tokio::test]
    async fn entity_ids_are_not_orchestration_ids() {
        let c = client();
        let err = c.start_orchestration("@counter@k", "Hello", "").await.unwrap_err();
        assert!(matches!(err, ClientError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn control_calls_need_an_instance() {
        let c = client();
        assert_eq!(c.terminate("missing", "r").await, Err(ClientError::NotFound("missing".into())));
        assert_eq!(c.raise_event("missing", "E", "").await, Err(ClientError::NotFound("missing".into())));
        assert!(!c.purge("missing").await.unwrap());
    }

    #[tokio::test]
    async fn rewind_and_purge_check_status() {
        let c = client();
        c.start_orchestration("i1", "Hello", "").await.unwrap();
        assert!(matches!(
            c.rewind("i1", "r").await,
            Err(ClientError::InvalidState {
                status: RuntimeStatus::Pending,
                ..
            })
        ));
        assert!(matches!(c.purge("i1").await, Err(ClientError::InvalidState { .. })));
    }

    #[tokio::test]
    async fn wait_times_out_for_unfinished_instances() {
        let c = client();
        c.start_orchestration("i1", "Hello", "").await.unwrap();
        let err = c.wait_for_completion("i1", Duration::from_millis(30)).await.unwrap_err();
        assert!(matches!(err, ClientError::Timeout { .. }));
    }

    #[tokio::test]
    async fn signals_get_fresh_request_ids() {
        let c = client();
        let id = EntityId::new("Counter", "k");
        let a = c.signal_entity(&id, "add", Some("1".into())).await.unwrap();
        let b = c.signal_entity_typed(&id, "add", &2).await.unwrap();
        assert_ne!(a, b);
        assert_eq!(c.read_entity_state(&id).await.unwrap(), None);
    }
}
