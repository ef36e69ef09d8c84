//! Worker (activity) dispatcher implementation for Runtime
//!
//! Spawns concurrent activity workers that fetch `ActivityExecute` items,
//! run the registered activity and ack the item together with its
//! completion message.

use crate::providers::WorkItem;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::super::{registry, ActivityContext, Runtime};
use super::MAX_ACK_ATTEMPTS;

impl Runtime {
    /// Start the worker dispatcher with N concurrent workers for executing activities
    pub(in crate::runtime) fn start_work_dispatcher(
        self: Arc<Self>,
        activities: Arc<registry::ActivityRegistry>,
    ) -> JoinHandle<()> {
        let concurrency = self.options.worker_concurrency.max(1);
        tokio::spawn(async move {
            let mut worker_handles = Vec::new();
            for worker_idx in 0..concurrency {
                let rt = self.clone();
                let activities = activities.clone();
                let worker_id = format!("work-{worker_idx}-{}", rt.runtime_id);
                worker_handles.push(tokio::spawn(async move {
                    while !rt.is_shutting_down() {
                        match rt.history_store.fetch_work_item().await {
                            Ok(Some((item, token))) => rt.execute_work_item(&activities, item, &token, &worker_id).await,
                            Ok(None) => rt.idle().await,
                            Err(e) => {
                                warn!(worker_id = %worker_id, error = %e, "fetch_work_item failed");
                                rt.idle().await;
                            }
                        }
                    }
                }));
            }
            for h in worker_handles {
                let _ = h.await;
            }
        })
    }

    async fn execute_work_item(
        &self,
        activities: &registry::ActivityRegistry,
        item: WorkItem,
        token: &str,
        worker_id: &str,
    ) {
        let WorkItem::ActivityExecute {
            instance,
            execution_id,
            id,
            name,
            input,
        } = item
        else {
            error!(kind = item.kind(), "unexpected WorkItem in worker dispatcher; leaving it unacked");
            return;
        };

        debug!(instance = %instance, execution_id, id, activity = %name, worker_id, "executing activity");
        let ctx = ActivityContext::new(instance.clone(), execution_id, name.clone(), id, worker_id);
        let completion = match activities.execute(ctx, input).await {
            Ok(result) => WorkItem::ActivityCompleted {
                instance,
                execution_id,
                id,
                result,
            },
            Err(details) => {
                debug!(activity = %name, id, category = details.category(), error = %details, "activity failed");
                WorkItem::ActivityFailed {
                    instance,
                    execution_id,
                    id,
                    details,
                }
            }
        };

        // Ack and completion go together; if this never succeeds the item is
        // redelivered and the activity runs again.
        let mut attempts: u32 = 0;
        loop {
            match self.history_store.ack_work_item(token, completion.clone()).await {
                Ok(()) => break,
                Err(e) if e.is_retryable() && attempts < MAX_ACK_ATTEMPTS => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(attempts, backoff_ms, error = %e, "ack_work_item failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(activity = %name, id, error = %e, "failed to ack work item");
                    break;
                }
            }
        }
    }
}
