//! PushWorker capability
//!
//! The external executors that actually run task instances. Implementations
//! are identified by the `push_destination` string on each task definition
//! and registered into a [`PushWorkerSet`] at wiring time.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use taskflow_core::status::TaskInstanceStatus;
use taskflow_storage::TaskInstance;

/// Failure of a whole dispatch or sync call; per-instance problems are
/// reported through [`PushOutcome`] instead.
#[derive(Debug, thiserror::Error)]
#[error("push worker failure: {0}")]
pub struct PushWorkerError(pub String);

/// Per-instance result of a dispatch call.
#[derive(Debug, Clone)]
pub enum PushOutcome {
    /// Worker accepted the instance; the opaque payload lands in
    /// `push_data`.
    Accepted { push_data: Option<Value> },
    /// Worker rejected or errored on this instance only.
    Rejected { error: String },
}

/// Worker-observed state for one in-flight instance.
#[derive(Debug, Clone)]
pub struct RemoteState {
    pub id: i64,
    pub status: TaskInstanceStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// External capability that runs task instances.
///
/// Both operations are idempotent on the worker side: re-submitting an
/// instance the worker already knows must report its current state, not
/// execute it twice.
#[async_trait]
pub trait PushWorker: Send + Sync {
    /// Accept a batch for execution. May be synchronous (the work starts
    /// before returning) or acknowledging (the worker enqueues it); either
    /// way an accepted instance becomes `pushed`.
    async fn push_task_instances(
        &self,
        batch: &[TaskInstance],
    ) -> Result<Vec<(i64, PushOutcome)>, PushWorkerError>;

    /// Report the current states of a batch of in-flight instances.
    async fn sync_task_instance_states(
        &self,
        batch: &[TaskInstance],
    ) -> Result<Vec<RemoteState>, PushWorkerError>;
}

/// Routes task instances to workers by `push_destination`.
#[derive(Default)]
pub struct PushWorkerSet {
    workers: HashMap<String, Arc<dyn PushWorker>>,
}

impl PushWorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, destination: impl Into<String>, worker: Arc<dyn PushWorker>) {
        self.workers.insert(destination.into(), worker);
    }

    pub fn get(&self, destination: &str) -> Option<Arc<dyn PushWorker>> {
        self.workers.get(destination).cloned()
    }

    /// Destinations this process can service; the dispatch claim is limited
    /// to these.
    pub fn destinations(&self) -> Vec<String> {
        let mut destinations: Vec<String> = self.workers.keys().cloned().collect();
        destinations.sort();
        destinations
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}
