//! Entity types: an explicit map from operation name to typed handler.

use std::collections::HashMap;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use super::{EntityContext, EntityError};
use crate::codec::{self, Codec, Json};

#[async_trait]
pub trait OperationHandler: Send + Sync {
    /// Returns the serialized result of the operation.
    async fn invoke(&self, ctx: EntityContext, input: Option<String>) -> Result<String, EntityError>;
}

struct TypedOperation<F, In, Out> {
    name: String,
    f: F,
    _types: PhantomData<fn(In) -> Out>,
}

#[async_trait]
impl<F, Fut, In, Out> OperationHandler for TypedOperation<F, In, Out>
where
    F: Fn(EntityContext, In) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Out, String>> + Send + 'static,
    In: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    async fn invoke(&self, ctx: EntityContext, input: Option<String>) -> Result<String, EntityError> {
        let input: In = codec::decode_optional(input.as_deref()).map_err(|message| EntityError::Input {
            operation: self.name.clone(),
            message,
        })?;
        let out = (self.f)(ctx, input).await.map_err(EntityError::Operation)?;
        Json::encode(&out).map_err(EntityError::Operation)
    }
}

/// One entity type and its operations. Names are matched case-insensitively.
#[derive(Clone)]
pub struct EntityType {
    name: String,
    operations: HashMap<String, Arc<dyn OperationHandler>>,
}

impl EntityType {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().to_lowercase(),
            operations: HashMap::new(),
        }
    }

    /// Register an operation whose input is decoded from JSON (absent input
    /// decodes as `null`) and whose output is encoded as JSON.
    pub fn operation<F, Fut, In, Out>(mut self, name: impl AsRef<str>, f: F) -> Self
    where
        F: Fn(EntityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
        In: DeserializeOwned + Send + 'static,
        Out: Serialize + Send + 'static,
    {
        let name = name.as_ref().to_lowercase();
        self.operations.insert(
            name.clone(),
            Arc::new(TypedOperation {
                name,
                f,
                _types: PhantomData,
            }),
        );
        self
    }

    pub fn handler(&self, operation: &str) -> Option<Arc<dyn OperationHandler>> {
        self.operations.get(&operation.to_lowercase()).cloned()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.operations.keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Clone, Default)]
pub struct EntityRegistry {
    types: Arc<HashMap<String, Arc<EntityType>>>,
}

pub struct EntityRegistryBuilder {
    types: HashMap<String, Arc<EntityType>>,
}

impl EntityRegistry {
    pub fn builder() -> EntityRegistryBuilder {
        EntityRegistryBuilder { types: HashMap::new() }
    }

    pub fn get(&self, name: &str) -> Option<Arc<EntityType>> {
        self.types.get(&name.to_lowercase()).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.types.contains_key(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<String> {
        self.types.keys().cloned().collect()
    }
}

impl EntityRegistryBuilder {
    pub fn register(mut self, entity: EntityType) -> Self {
        self.types.insert(entity.name.clone(), Arc::new(entity));
        self
    }

    pub fn build(self) -> EntityRegistry {
        EntityRegistry {
            types: Arc::new(self.types),
        }
    }
}
