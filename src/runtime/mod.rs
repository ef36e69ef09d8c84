//! In-process runtime: dispatchers that drain the provider queues and drive
//! orchestrations, activities and entities.

use crate::entity::EntityRegistry;
use crate::logging::LoggingConfig;
use crate::providers::Provider;
use crate::OrchestrationContext;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

mod dispatchers;
pub mod registry;
pub(crate) mod replay_engine;
pub mod status;

#[cfg(test)]
mod replay_engine_tests;

pub use registry::{ActivityRegistry, OrchestrationRegistry};
pub use replay_engine::{ReplayEngine, TurnResult};

/// Configuration options for the Runtime.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Reported in status queries.
    pub task_hub_name: String,
    /// Number of concurrent orchestration/entity dispatch loops.
    pub orchestration_concurrency: usize,
    /// Number of concurrent activity workers.
    pub worker_concurrency: usize,
    /// How long a dispatcher sleeps when its queue is empty.
    pub dispatcher_idle_sleep: Duration,
    /// Upper bound on the operations an entity runs in one batch.
    pub max_entity_batch_size: usize,
    pub logging: LoggingConfig,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            task_hub_name: "default".to_string(),
            orchestration_concurrency: 2,
            worker_concurrency: 2,
            dispatcher_idle_sleep: Duration::from_millis(10),
            max_entity_batch_size: 50,
            logging: LoggingConfig::default(),
        }
    }
}

/// Trait implemented by orchestration handlers that can be invoked by the runtime.
#[async_trait]
pub trait OrchestrationHandler: Send + Sync {
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String>;
}

/// Function wrapper that implements `OrchestrationHandler`.
pub struct FnOrchestration<F, Fut>(pub F)
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> OrchestrationHandler for FnOrchestration<F, Fut>
where
    F: Fn(OrchestrationContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: OrchestrationContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

#[async_trait]
pub trait ActivityHandler: Send + Sync {
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String>;
}

pub struct FnActivity<F, Fut>(pub F)
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static;

#[async_trait]
impl<F, Fut> ActivityHandler for FnActivity<F, Fut>
where
    F: Fn(ActivityContext, String) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<String, String>> + Send + 'static,
{
    async fn invoke(&self, ctx: ActivityContext, input: String) -> Result<String, String> {
        (self.0)(ctx, input).await
    }
}

/// What an activity knows about the call that scheduled it.
///
/// Activities run outside replay and may do real I/O; they are retried on
/// redelivery, so they should be idempotent.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    instance_id: String,
    execution_id: u64,
    activity_name: String,
    activity_id: u64,
    worker_id: String,
}

impl ActivityContext {
    pub(crate) fn new(
        instance_id: impl Into<String>,
        execution_id: u64,
        activity_name: impl Into<String>,
        activity_id: u64,
        worker_id: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            execution_id,
            activity_name: activity_name.into(),
            activity_id,
            worker_id: worker_id.into(),
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(activity_name: impl Into<String>) -> Self {
        Self::new("", crate::INITIAL_EXECUTION_ID, activity_name, 0, "detached")
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn execution_id(&self) -> u64 {
        self.execution_id
    }

    pub fn activity_name(&self) -> &str {
        &self.activity_name
    }

    /// Id of the `TaskScheduled` event this call answers.
    pub fn activity_id(&self) -> u64 {
        self.activity_id
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn trace_info(&self, message: impl AsRef<str>) {
        info!(
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_warn(&self, message: impl AsRef<str>) {
        warn!(
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_error(&self, message: impl AsRef<str>) {
        tracing::error!(
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.as_ref()
        );
    }

    pub fn trace_debug(&self, message: impl AsRef<str>) {
        debug!(
            instance_id = %self.instance_id,
            execution_id = self.execution_id,
            activity_name = %self.activity_name,
            activity_id = self.activity_id,
            "{}",
            message.as_ref()
        );
    }
}

/// In-process runtime that executes orchestrations, activities and entities
/// and persists their progress through a [`Provider`].
pub struct Runtime {
    joins: Mutex<Vec<JoinHandle<()>>>,
    history_store: Arc<dyn Provider>,
    orchestration_registry: OrchestrationRegistry,
    entity_registry: EntityRegistry,
    options: RuntimeOptions,
    shutdown_flag: Arc<AtomicBool>,
    runtime_id: String,
}

impl Runtime {
    /// Start a new runtime with a custom `Provider` implementation.
    pub async fn start_with_store(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: EntityRegistry,
    ) -> Arc<Self> {
        Self::start_with_options(
            history_store,
            activity_registry,
            orchestration_registry,
            entity_registry,
            RuntimeOptions::default(),
        )
        .await
    }

    /// Start a new runtime with custom options.
    pub async fn start_with_options(
        history_store: Arc<dyn Provider>,
        activity_registry: Arc<ActivityRegistry>,
        orchestration_registry: OrchestrationRegistry,
        entity_registry: EntityRegistry,
        options: RuntimeOptions,
    ) -> Arc<Self> {
        if let Err(e) = crate::logging::init_logging(&options.logging) {
            debug!(error = %e, "logging subscriber not installed");
        }

        let runtime_id = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        let runtime = Arc::new(Self {
            joins: Mutex::new(Vec::new()),
            history_store,
            orchestration_registry,
            entity_registry,
            options,
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            runtime_id,
        });

        let orch = runtime.clone().start_orchestration_dispatcher();
        let work = runtime.clone().start_work_dispatcher(activity_registry);
        runtime.joins.lock().await.extend([orch, work]);

        info!(
            runtime_id = %runtime.runtime_id,
            task_hub = %runtime.options.task_hub_name,
            orchestrations = runtime.orchestration_registry.count(),
            entities = runtime.entity_registry.names().len(),
            "runtime started"
        );
        runtime
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    pub fn store(&self) -> Arc<dyn Provider> {
        self.history_store.clone()
    }

    fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(Ordering::Relaxed)
    }

    async fn idle(&self) {
        tokio::time::sleep(self.options.dispatcher_idle_sleep).await;
    }

    /// Stop the dispatchers. In-flight passes get a short grace period;
    /// whatever is not acked by then is redelivered on the next start.
    pub async fn shutdown(self: Arc<Self>) {
        self.shutdown_flag.store(true, Ordering::Relaxed);
        let mut joins = self.joins.lock().await;
        for mut j in joins.drain(..) {
            if tokio::time::timeout(Duration::from_millis(500), &mut j).await.is_err() {
                j.abort();
            }
        }
        info!(runtime_id = %self.runtime_id, "runtime stopped");
    }
}
