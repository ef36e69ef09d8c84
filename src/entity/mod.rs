//! Keyed single-writer entities.
//!
//! An entity is addressed by an [`EntityId`] (type name plus key) and owns
//! one serialized state value. Operations sent to it are queued and executed
//! in batches, strictly one after another, by the [`dispatcher`].

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use crate::{ErrorDetails, ParentLink};

mod context;
pub mod dispatcher;
mod registry;

pub use context::EntityContext;
pub use dispatcher::{BatchResult, EntityDispatcher, EntityStore, InMemoryEntityStore, OperationResult};
pub use registry::{EntityRegistry, EntityRegistryBuilder, EntityType, OperationHandler};

/// Number of processed request ids remembered for duplicate detection.
pub const RECENT_REQUEST_WINDOW: usize = 1024;

/// Ordered by name, then key; lock sets are acquired in this order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    /// Entity type name, stored lowercase.
    pub name: String,
    pub key: String,
}

impl EntityId {
    pub fn new(name: impl AsRef<str>, key: impl Into<String>) -> Self {
        Self {
            name: name.as_ref().to_lowercase(),
            key: key.into(),
        }
    }

    /// Instance id under which the entity is stored: `@name@key`.
    pub fn instance_id(&self) -> String {
        format!("@{}@{}", self.name, self.key)
    }

    pub fn is_entity_instance(instance: &str) -> bool {
        instance.starts_with('@')
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}@{}", self.name, self.key)
    }
}

impl FromStr for EntityId {
    type Err = EntityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| EntityError::InvalidId(s.to_string()))?;
        match rest.split_once('@') {
            Some((name, key)) if !name.is_empty() => Ok(EntityId::new(name, key)),
            _ => Err(EntityError::InvalidId(s.to_string())),
        }
    }
}

/// One message for an entity: an operation, or a lock request when
/// `lock_set` is present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    /// Unique per request; used to drop duplicate deliveries.
    pub id: String,
    pub operation: String,
    pub input: Option<String>,
    /// Where to send the result. `None` for signals.
    pub parent: Option<ParentLink>,
    pub is_signal: bool,
    /// Entities a lock request acquires, sorted and distinct.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock_set: Option<Vec<EntityId>>,
    /// Index in `lock_set` of the entity this lock request is addressed to.
    #[serde(default)]
    pub position: usize,
}

impl OperationRequest {
    pub fn signal(id: impl Into<String>, operation: impl Into<String>, input: Option<String>) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            input,
            parent: None,
            is_signal: true,
            lock_set: None,
            position: 0,
        }
    }

    pub fn call(id: impl Into<String>, operation: impl Into<String>, input: Option<String>, parent: ParentLink) -> Self {
        Self {
            id: id.into(),
            operation: operation.into(),
            input,
            parent: Some(parent),
            is_signal: false,
            lock_set: None,
            position: 0,
        }
    }

    /// Lock request for `lock_set`, addressed to its first entity.
    pub fn lock(id: impl Into<String>, lock_set: Vec<EntityId>, parent: ParentLink) -> Self {
        Self {
            id: id.into(),
            operation: String::new(),
            input: None,
            parent: Some(parent),
            is_signal: false,
            lock_set: Some(lock_set),
            position: 0,
        }
    }

    pub fn is_lock_request(&self) -> bool {
        self.lock_set.is_some()
    }

    fn is_from_holder(&self, owner: &str) -> bool {
        !self.is_lock_request() && self.caller() == Some(owner)
    }

    /// Instance that sent the request, if it expects an answer.
    pub fn caller(&self) -> Option<&str> {
        self.parent.as_ref().map(|p| p.instance.as_str())
    }
}

/// Persisted state of one entity instance between batches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySchedulerState {
    pub exists: bool,
    /// Serialized user state.
    pub state: Option<String>,
    pub queue: VecDeque<OperationRequest>,
    pub recent_request_ids: VecDeque<String>,
    /// Orchestration instance holding this entity's lock.
    #[serde(default)]
    pub locked_by: Option<String>,
}

impl EntitySchedulerState {
    pub fn decode(raw: Option<&str>) -> Result<Self, EntityError> {
        match raw {
            None => Ok(Self::default()),
            Some(s) => serde_json::from_str(s).map_err(|e| EntityError::StateCorrupted(e.to_string())),
        }
    }

    pub fn encode(&self) -> Result<String, EntityError> {
        serde_json::to_string(self).map_err(|e| EntityError::StateCorrupted(e.to_string()))
    }

    /// Queue a request unless it was already queued or processed.
    pub fn enqueue(&mut self, request: OperationRequest) -> bool {
        let seen = self.recent_request_ids.iter().any(|id| *id == request.id)
            || self.queue.iter().any(|r| r.id == request.id);
        if seen {
            return false;
        }
        self.queue.push_back(request);
        true
    }

    /// Take up to `max` queued operations for the next batch and remember their ids.
    ///
    /// A locked entity only runs operations called by the lock holder, in
    /// queue order. An unlocked entity takes operations from the front and
    /// stops at the first lock request.
    pub fn take_batch(&mut self, max: usize) -> Vec<OperationRequest> {
        let max = max.max(1);
        let mut batch = Vec::new();
        match self.locked_by.clone() {
            Some(owner) => {
                let mut waiting = VecDeque::with_capacity(self.queue.len());
                for r in self.queue.drain(..) {
                    if batch.len() < max && r.is_from_holder(&owner) {
                        batch.push(r);
                    } else {
                        waiting.push_back(r);
                    }
                }
                self.queue = waiting;
            }
            None => {
                while batch.len() < max && self.queue.front().is_some_and(|r| !r.is_lock_request()) {
                    batch.extend(self.queue.pop_front());
                }
            }
        }
        for r in &batch {
            self.remember(&r.id);
        }
        batch
    }

    /// Grant the lock request at the head of the queue if nobody holds the lock.
    pub fn grant_next_lock(&mut self) -> Option<OperationRequest> {
        if self.locked_by.is_some() || !self.queue.front().is_some_and(OperationRequest::is_lock_request) {
            return None;
        }
        let request = self.queue.pop_front()?;
        self.locked_by = request.caller().map(str::to_string);
        self.remember(&request.id);
        Some(request)
    }

    /// Release the lock if `owner` holds it. Returns false otherwise.
    pub fn release(&mut self, owner: &str) -> bool {
        if self.locked_by.as_deref() != Some(owner) {
            return false;
        }
        self.locked_by = None;
        true
    }

    /// Something in the queue can make progress in the next pass.
    pub fn has_runnable(&self) -> bool {
        match &self.locked_by {
            Some(owner) => self.queue.iter().any(|r| r.is_from_holder(owner)),
            None => !self.queue.is_empty(),
        }
    }

    /// No state, nothing queued and no lock held.
    pub fn is_idle(&self) -> bool {
        !self.exists && self.queue.is_empty() && self.locked_by.is_none()
    }

    fn remember(&mut self, id: &str) {
        self.recent_request_ids.push_back(id.to_string());
        while self.recent_request_ids.len() > RECENT_REQUEST_WINDOW {
            self.recent_request_ids.pop_front();
        }
    }

    pub fn apply(&mut self, new_state: Option<String>) {
        self.exists = new_state.is_some();
        self.state = new_state;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EntityError {
    #[error("invalid entity id '{0}', expected @name@key")]
    InvalidId(String),
    #[error("entity type '{0}' is not registered")]
    UnknownEntity(String),
    #[error("entity '{entity}' has no operation '{operation}'")]
    UnknownOperation { entity: String, operation: String },
    #[error("cannot decode input for '{operation}': {message}")]
    Input { operation: String, message: String },
    #[error("entity state is corrupted: {0}")]
    StateCorrupted(String),
    #[error("operation set a return value more than once")]
    MultipleReturns,
    #[error("{0}")]
    Operation(String),
    #[error("operation panicked: {0}")]
    Panicked(String),
    #[error("batch is waiting for an activity and no activity host is available")]
    Suspended,
    #[error("batch failed: {0}")]
    BatchFailed(ErrorDetails),
    #[error("{0}")]
    Store(String),
}

impl EntityError {
    pub fn to_details(&self) -> ErrorDetails {
        match self {
            EntityError::UnknownEntity(name) => ErrorDetails::unregistered(name.clone()),
            EntityError::UnknownOperation { entity, operation } => ErrorDetails::Configuration {
                resource: format!("{entity}.{operation}"),
                message: self.to_string(),
            },
            EntityError::BatchFailed(details) => details.clone(),
            other => ErrorDetails::application(other.to_string()),
        }
    }
}

impl From<EntityError> for String {
    fn from(e: EntityError) -> Self {
        e.to_string()
    }
}

impl From<crate::providers::ProviderError> for EntityError {
    fn from(e: crate::providers::ProviderError) -> Self {
        EntityError::Store(e.to_string())
    }
}

#[deprecated(note = "actors are entities; use EntityContext")]
pub type ActorContext = EntityContext;

#[deprecated(note = "actors are entities; use EntityId")]
pub type ActorId = EntityId;
