//! Name-keyed registries for orchestrations and activities.
//!
//! Both kinds of handler share one `Registry<H>` shape; only the builders
//! differ in what closures they accept. Duplicate names are collected as
//! errors and reported by [`RegistryBuilder::build_result`].

use super::{ActivityContext, ActivityHandler, FnActivity, FnOrchestration, OrchestrationHandler};
use crate::codec::{Codec, Json};
use crate::{ErrorDetails, OrchestrationContext};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

pub struct Registry<H: ?Sized> {
    pub(crate) inner: Arc<HashMap<String, Arc<H>>>,
}

// H: ?Sized rules out the derive
impl<H: ?Sized> Clone for Registry<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ?Sized> Default for Registry<H> {
    fn default() -> Self {
        Self {
            inner: Arc::new(HashMap::new()),
        }
    }
}

pub struct RegistryBuilder<H: ?Sized> {
    map: HashMap<String, Arc<H>>,
    errors: Vec<String>,
}

pub type OrchestrationRegistry = Registry<dyn OrchestrationHandler>;
pub type ActivityRegistry = Registry<dyn ActivityHandler>;
pub type OrchestrationRegistryBuilder = RegistryBuilder<dyn OrchestrationHandler>;
pub type ActivityRegistryBuilder = RegistryBuilder<dyn ActivityHandler>;

impl<H: ?Sized> Registry<H> {
    pub fn builder() -> RegistryBuilder<H> {
        RegistryBuilder {
            map: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn builder_from(reg: &Registry<H>) -> RegistryBuilder<H> {
        RegistryBuilder {
            map: reg.inner.as_ref().clone(),
            errors: Vec::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<H>> {
        let found = self.inner.get(name).cloned();
        if found.is_none() {
            tracing::debug!(
                target: "durafunc::runtime::registry",
                requested_name = %name,
                registered_names = ?self.list_names(),
                "registry lookup miss"
            );
        }
        found
    }

    pub fn list_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn has(&self, name: &str) -> bool {
        self.inner.contains_key(name)
    }

    pub fn count(&self) -> usize {
        self.inner.len()
    }
}

impl<H: ?Sized> RegistryBuilder<H> {
    pub fn build(self) -> Registry<H> {
        Registry {
            inner: Arc::new(self.map),
        }
    }

    /// Build, failing if any name was registered twice.
    pub fn build_result(self) -> Result<Registry<H>, String> {
        if self.errors.is_empty() {
            Ok(self.build())
        } else {
            Err(self.errors.join("; "))
        }
    }

    fn insert(&mut self, name: String, handler: Arc<H>, what: &str) {
        if self.map.contains_key(&name) {
            self.errors.push(format!("duplicate {what} registration: {name}"));
            return;
        }
        self.map.insert(name, handler);
    }

    fn merge_registry(mut self, other: Registry<H>, what: &str) -> Self {
        for (name, handler) in other.inner.iter() {
            self.insert(name.clone(), handler.clone(), what);
        }
        self
    }
}

impl OrchestrationRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnOrchestration(f)), "orchestration");
        self
    }

    /// Register a function taking and returning serde types; input and output
    /// are JSON on the wire.
    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(OrchestrationContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: OrchestrationContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnOrchestration(wrapper)), "orchestration");
        self
    }

    pub fn merge(self, other: OrchestrationRegistry) -> Self {
        self.merge_registry(other, "orchestration")
    }
}

impl ActivityRegistryBuilder {
    pub fn register<F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, String>> + Send + 'static,
    {
        self.insert(name.into(), Arc::new(FnActivity(f)), "activity");
        self
    }

    pub fn register_typed<In, Out, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        In: serde::de::DeserializeOwned + Send + 'static,
        Out: serde::Serialize + Send + 'static,
        F: Fn(ActivityContext, In) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Out, String>> + Send + 'static,
    {
        let f = Arc::new(f);
        let wrapper = move |ctx: ActivityContext, input_s: String| {
            let f = f.clone();
            async move {
                let input: In = Json::decode(&input_s)?;
                let out: Out = f(ctx, input).await?;
                Json::encode(&out)
            }
        };
        self.insert(name.into(), Arc::new(FnActivity(wrapper)), "activity");
        self
    }

    pub fn merge(self, other: ActivityRegistry) -> Self {
        self.merge_registry(other, "activity")
    }
}

impl ActivityRegistry {
    /// Run the activity named by `ctx`. Panics become application failures;
    /// an unknown name is a configuration failure.
    pub(crate) async fn execute(&self, ctx: ActivityContext, input: String) -> Result<String, ErrorDetails> {
        let name = ctx.activity_name().to_string();
        let Some(handler) = self.get(&name) else {
            return Err(ErrorDetails::unregistered(name));
        };
        match AssertUnwindSafe(handler.invoke(ctx, input)).catch_unwind().await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(message)) => Err(ErrorDetails::application(message)),
            Err(payload) => {
                let panic = ErrorDetails::from_panic(payload);
                Err(ErrorDetails::application(format!("activity '{name}' {panic}")))
            }
        }
    }
}
