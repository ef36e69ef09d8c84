//! Dispatcher loops for the runtime.
//!
//! - `orchestration`: locks an instance, replays it and commits the pass
//! - `entity`: the same queue, for `@name@key` instances
//! - `worker`: executes activities and reports their outcome

mod entity;
mod orchestration;
mod worker;

use crate::providers::{ExecutionMetadata, WorkItem};
use crate::Event;
use std::time::Duration;
use tracing::{debug, warn};

use super::Runtime;

/// Everything one pass wants committed.
#[derive(Debug, Default)]
pub(super) struct PassCommit {
    pub history_delta: Vec<Event>,
    pub worker_items: Vec<WorkItem>,
    pub timer_items: Vec<WorkItem>,
    pub orchestrator_items: Vec<WorkItem>,
    pub metadata: ExecutionMetadata,
}

/// Retries left for a retryable ack failure before the item is abandoned.
const MAX_ACK_ATTEMPTS: u32 = 5;

impl Runtime {
    /// Ack a pass. A version conflict abandons the item right away so the
    /// pass re-runs against fresh state; retryable errors back off and try
    /// again; anything else abandons with a delay.
    pub(super) async fn commit_pass(&self, instance: &str, lock_token: &str, expected_version: u64, commit: PassCommit) {
        debug!(
            instance,
            history_delta = commit.history_delta.len(),
            worker = commit.worker_items.len(),
            timer = commit.timer_items.len(),
            orchestrator = commit.orchestrator_items.len(),
            "acking orchestration item"
        );
        let mut attempts: u32 = 0;
        loop {
            let result = self
                .history_store
                .ack_orchestration_item(
                    lock_token,
                    expected_version,
                    commit.history_delta.clone(),
                    commit.worker_items.clone(),
                    commit.timer_items.clone(),
                    commit.orchestrator_items.clone(),
                    commit.metadata.clone(),
                )
                .await;
            match result {
                Ok(()) => return,
                Err(e) if e.is_conflict() => {
                    warn!(instance, error = %e, "instance changed during pass; will re-run");
                    self.abandon(instance, lock_token, None).await;
                    return;
                }
                Err(e) if e.is_retryable() && attempts < MAX_ACK_ATTEMPTS => {
                    let backoff_ms = 10u64.saturating_mul(1 << attempts);
                    warn!(instance, attempts, backoff_ms, error = %e, "ack_orchestration_item failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    attempts += 1;
                }
                Err(e) => {
                    warn!(instance, attempts, error = %e, "failed to ack orchestration item");
                    self.abandon(instance, lock_token, Some(1000)).await;
                    return;
                }
            }
        }
    }

    pub(super) async fn abandon(&self, instance: &str, lock_token: &str, delay_ms: Option<u64>) {
        if let Err(e) = self.history_store.abandon_orchestration_item(lock_token, delay_ms).await {
            warn!(instance, error = %e, "failed to abandon orchestration item");
        }
    }
}
