use std::sync::{Arc, Mutex, MutexGuard};

use serde::{de::DeserializeOwned, Serialize};

use super::{EntityError, EntityId, OperationRequest};
use crate::context::ReplayCore;
use crate::futures::TaskFuture;

#[derive(Debug, Default)]
pub(crate) struct OperationEffects {
    pub state: Option<String>,
    pub return_value: Option<String>,
    pub multiple_returns: bool,
    pub destruct: bool,
    pub signals: Vec<(EntityId, OperationRequest)>,
    pub corrupted: Option<String>,
}

struct Inner {
    id: EntityId,
    operation: String,
    request_id: String,
    newly_constructed: bool,
    effects: OperationEffects,
    signal_seq: u32,
}

/// Handle passed to an entity operation.
///
/// State is kept serialized; a value that fails to (de)serialize marks the
/// state as corrupted and fails the whole batch.
#[derive(Clone)]
pub struct EntityContext {
    inner: Arc<Mutex<Inner>>,
    core: ReplayCore,
}

impl EntityContext {
    pub(crate) fn new(id: EntityId, state: Option<String>, request: &OperationRequest, core: ReplayCore) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                id,
                operation: request.operation.clone(),
                request_id: request.id.clone(),
                newly_constructed: state.is_none(),
                effects: OperationEffects {
                    state,
                    ..OperationEffects::default()
                },
                signal_seq: 0,
            })),
            core,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn take_effects(&self) -> OperationEffects {
        std::mem::take(&mut self.lock().effects)
    }

    pub fn entity_id(&self) -> EntityId {
        self.lock().id.clone()
    }

    pub fn entity_key(&self) -> String {
        self.lock().id.key.clone()
    }

    pub fn operation_name(&self) -> String {
        self.lock().operation.clone()
    }

    /// True when no state existed as this operation started.
    pub fn is_newly_constructed(&self) -> bool {
        self.lock().newly_constructed
    }

    pub fn has_state(&self) -> bool {
        self.lock().effects.state.is_some()
    }

    pub fn get_state<T: DeserializeOwned>(&self) -> Result<Option<T>, EntityError> {
        let mut inner = self.lock();
        let Some(raw) = inner.effects.state.clone() else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                let err = EntityError::StateCorrupted(e.to_string());
                inner.effects.corrupted = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn state_or_default<T: DeserializeOwned + Default>(&self) -> Result<T, EntityError> {
        Ok(self.get_state()?.unwrap_or_default())
    }

    pub fn set_state<T: Serialize>(&self, value: &T) -> Result<(), EntityError> {
        let mut inner = self.lock();
        match serde_json::to_string(value) {
            Ok(raw) => {
                inner.effects.state = Some(raw);
                Ok(())
            }
            Err(e) => {
                let err = EntityError::StateCorrupted(e.to_string());
                inner.effects.corrupted = Some(err.to_string());
                Err(err)
            }
        }
    }

    pub fn delete_state(&self) {
        self.lock().effects.state = None;
    }

    /// Set the operation result. At most once per operation.
    pub fn return_value<T: Serialize>(&self, value: &T) -> Result<(), EntityError> {
        let mut inner = self.lock();
        if inner.effects.return_value.is_some() {
            inner.effects.multiple_returns = true;
            return Err(EntityError::MultipleReturns);
        }
        let raw = serde_json::to_string(value).map_err(|e| EntityError::Operation(format!("encode result: {e}")))?;
        inner.effects.return_value = Some(raw);
        Ok(())
    }

    /// Drop the entity state once the current batch finishes.
    pub fn destruct_on_exit(&self) {
        self.lock().effects.destruct = true;
    }

    /// Send a one-way operation to another entity once the batch commits.
    pub fn signal_entity(&self, target: &EntityId, operation: impl Into<String>, input: Option<String>) {
        let mut inner = self.lock();
        inner.signal_seq += 1;
        let name = format!("{}:{}:{}", inner.id, inner.request_id, inner.signal_seq);
        let id = uuid::Uuid::new_v5(&uuid::Uuid::NAMESPACE_OID, name.as_bytes()).to_string();
        inner
            .effects
            .signals
            .push((target.clone(), OperationRequest::signal(id, operation, input)));
    }

    /// Call an activity. The whole batch suspends until the result arrives.
    pub fn schedule_activity(&self, name: impl Into<String>, input: impl Into<String>) -> TaskFuture {
        self.core.schedule_activity(&name.into(), input.into())
    }

    /// True while the batch is re-executing recorded history.
    pub fn is_replaying(&self) -> bool {
        self.core.is_replaying()
    }
}

impl std::fmt::Debug for EntityContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("EntityContext")
            .field("id", &inner.id)
            .field("operation", &inner.operation)
            .finish()
    }
}
