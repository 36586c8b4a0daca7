//! TaskflowStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use taskflow_core::dag::RunVerdict;
use taskflow_core::definition::{Task, Workflow};
use taskflow_core::registry::{RegistryError, SchedulableKind, ScheduleFlags, ScheduleSource};
use taskflow_core::status::{StatusParseError, TaskInstanceStatus, WorkflowInstanceStatus};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow instance not found: {0}")]
    WorkflowInstanceNotFound(i64),

    #[error("task instance not found: {0}")]
    TaskInstanceNotFound(i64),

    #[error("unknown status value in store: {0}")]
    UnknownStatus(String),

    /// Connection drops, pool exhaustion, deadlocks, serialization failures.
    /// Retried with backoff inside the current tick.
    #[error("transient database error: {0}")]
    Transient(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<StatusParseError> for StoreError {
    fn from(err: StatusParseError) -> Self {
        Self::UnknownStatus(err.0)
    }
}

/// A persisted workflow run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowInstance {
    pub id: i64,
    pub workflow: String,
    pub scheduled: bool,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: WorkflowInstanceStatus,
    pub params: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A persisted run step (workflow-owned or standalone).
#[derive(Debug, Clone, PartialEq)]
pub struct TaskInstance {
    pub id: i64,
    pub task: String,
    pub workflow_instance: Option<i64>,
    pub scheduled: bool,
    pub push: bool,
    pub status: TaskInstanceStatus,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub attempts: i32,
    pub params: Option<Value>,
    pub push_data: Option<Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Input for creating a workflow instance. Status starts at `queued`.
#[derive(Debug, Clone)]
pub struct NewWorkflowInstance {
    pub workflow: String,
    pub scheduled: bool,
    pub run_at: DateTime<Utc>,
    pub params: Option<Value>,
}

/// Input for creating a task instance. Status starts at `queued`.
///
/// `attempts` is non-zero only for retries of a timed-out standalone
/// instance, which carry the prior attempt count forward.
#[derive(Debug, Clone)]
pub struct NewTaskInstance {
    pub task: String,
    pub workflow_instance: Option<i64>,
    pub scheduled: bool,
    pub push: bool,
    pub priority: i32,
    pub run_at: DateTime<Utc>,
    pub attempts: i32,
    pub params: Option<Value>,
}

/// Audit event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    WorkflowQueued,
    WorkflowStarted,
    WorkflowSuccess,
    WorkflowFailed,
    TaskQueued,
    TaskPushed,
    TaskPushFailed,
    TaskSuccess,
    TaskFailed,
    TaskTimedOut,
    TaskRetryQueued,
    PushWorkerFailure,
    InvariantViolation,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkflowQueued => "workflow_queued",
            Self::WorkflowStarted => "workflow_started",
            Self::WorkflowSuccess => "workflow_success",
            Self::WorkflowFailed => "workflow_failed",
            Self::TaskQueued => "task_queued",
            Self::TaskPushed => "task_pushed",
            Self::TaskPushFailed => "task_push_failed",
            Self::TaskSuccess => "task_success",
            Self::TaskFailed => "task_failed",
            Self::TaskTimedOut => "task_timed_out",
            Self::TaskRetryQueued => "task_retry_queued",
            Self::PushWorkerFailure => "push_worker_failure",
            Self::InvariantViolation => "invariant_violation",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input for one audit event row.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub workflow_instance: Option<i64>,
    pub task_instance: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub kind: EventKind,
    pub message: Option<String>,
}

impl NewEvent {
    pub fn for_workflow(
        kind: EventKind,
        workflow_instance: i64,
        timestamp: DateTime<Utc>,
        message: Option<String>,
    ) -> Self {
        Self {
            workflow_instance: Some(workflow_instance),
            task_instance: None,
            timestamp,
            kind,
            message,
        }
    }

    pub fn for_task(
        kind: EventKind,
        instance: &TaskInstance,
        timestamp: DateTime<Utc>,
        message: Option<String>,
    ) -> Self {
        Self {
            workflow_instance: instance.workflow_instance,
            task_instance: Some(instance.id),
            timestamp,
            kind,
            message,
        }
    }
}

/// A persisted audit event.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskflowEvent {
    pub id: i64,
    pub workflow_instance: Option<i64>,
    pub task_instance: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub event: String,
    pub message: Option<String>,
}

/// Result of one layer-advancement transaction.
#[derive(Debug, Clone)]
pub struct RunAdvance {
    pub verdict: RunVerdict,
    /// Task names newly inserted as `queued` by this advancement.
    pub queued: Vec<String>,
    /// Task names marked `timed_out` by this advancement.
    pub timed_out: Vec<String>,
    /// New workflow instance status, if it changed.
    pub transition: Option<WorkflowInstanceStatus>,
}

/// Worker-observed state for one in-flight task instance.
#[derive(Debug, Clone)]
pub struct RemoteStateUpdate {
    pub status: TaskInstanceStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub message: Option<String>,
}

/// Outcome of applying a worker-observed state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncOutcome {
    Applied { terminal: bool },
    /// Same state re-reported; idempotent no-op.
    Unchanged,
    /// Illegal transition (e.g. terminal reversal); local state untouched,
    /// diagnostic event recorded.
    Rejected { from: TaskInstanceStatus },
}

/// A batch of queued push instances claimed for dispatch.
///
/// The postgres implementation holds the claiming transaction open, so the
/// rows stay locked (`FOR UPDATE SKIP LOCKED`) while the pusher talks to the
/// workers; a parallel pusher skips them. Dropping the batch without
/// committing releases the rows unchanged.
#[async_trait]
pub trait ClaimedPushBatch: Send {
    fn instances(&self) -> &[TaskInstance];

    /// Dispatch succeeded: `queued -> pushed`, store the worker payload,
    /// increment attempts.
    async fn mark_pushed(&mut self, id: i64, push_data: Option<Value>) -> Result<(), StoreError>;

    /// Dispatch failed: requeue at `retry_at`, or fail terminally when
    /// `retry_at` is `None`. Increments attempts either way.
    async fn mark_push_failed(
        &mut self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Store for taskflow definitions, instances, and events.
///
/// Implementations must be safe for concurrent access from multiple loops
/// and multiple processes; every state-changing composite operation locks
/// the parent workflow instance row.
#[async_trait]
pub trait TaskflowStore: Send + Sync + 'static {
    // =========================================================================
    // Definitions
    // =========================================================================

    /// Idempotent definition upsert. `active` is only written on first
    /// insert; afterwards it belongs to the admin surface.
    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError>;

    /// Upsert a task definition (workflow-owned or standalone).
    async fn upsert_task(&self, task: &Task) -> Result<(), StoreError>;

    /// Read back the mutable scheduling flags for one definition.
    async fn definition_flags(
        &self,
        kind: SchedulableKind,
        name: &str,
    ) -> Result<Option<ScheduleFlags>, StoreError>;

    // =========================================================================
    // Workflow instances
    // =========================================================================

    async fn create_workflow_instance(
        &self,
        new: NewWorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError>;

    async fn get_workflow_instance(&self, id: i64)
        -> Result<Option<WorkflowInstance>, StoreError>;

    /// Latest `scheduled=true` instance for a workflow, by `run_at` desc.
    async fn most_recent_scheduled_instance(
        &self,
        workflow: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError>;

    /// Instances the scheduler must advance this tick: `queued` instances
    /// whose `run_at` has arrived, plus every `running` instance.
    async fn advanceable_instances(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, StoreError>;

    /// Delete an instance; task instances and events cascade.
    async fn delete_workflow_instance(&self, id: i64) -> Result<bool, StoreError>;

    /// Advance one workflow run by one resolver pass, in a single
    /// transaction holding an exclusive lock on the instance row:
    /// time out overdue started tasks, insert the next layer's missing task
    /// instances (insert-if-absent on `(workflow_instance, task)`), apply
    /// the verdict to the instance status, and record events. Terminal
    /// instances are left untouched.
    async fn advance_workflow_run(
        &self,
        instance_id: i64,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<RunAdvance, StoreError>;

    // =========================================================================
    // Task instances
    // =========================================================================

    async fn insert_task_instance(
        &self,
        new: NewTaskInstance,
    ) -> Result<TaskInstance, StoreError>;

    async fn get_task_instance(&self, id: i64) -> Result<Option<TaskInstance>, StoreError>;

    async fn task_instances_for_run(
        &self,
        instance_id: i64,
    ) -> Result<Vec<TaskInstance>, StoreError>;

    /// Latest `scheduled=true` standalone instance for a task, by `run_at`
    /// desc.
    async fn most_recent_scheduled_task_instance(
        &self,
        task: &str,
    ) -> Result<Option<TaskInstance>, StoreError>;

    /// Non-terminal standalone instances for a task.
    async fn live_standalone_instances(
        &self,
        task: &str,
    ) -> Result<Vec<TaskInstance>, StoreError>;

    /// Mark a still-non-terminal instance `timed_out`; returns the updated
    /// row, or `None` if it already reached a terminal state.
    async fn mark_task_instance_timed_out(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>, StoreError>;

    // =========================================================================
    // Dispatch and sync
    // =========================================================================

    /// Claim up to `limit` due queued push instances bound for the given
    /// destinations, in `(priority desc, run_at asc, id asc)` order.
    async fn claim_due_push_instances(
        &self,
        now: DateTime<Utc>,
        destinations: &[String],
        limit: i64,
    ) -> Result<Box<dyn ClaimedPushBatch>, StoreError>;

    /// Push instances in `pushed`, `running`, or `retrying`.
    async fn in_flight_push_instances(&self) -> Result<Vec<TaskInstance>, StoreError>;

    /// Apply a worker-observed state change, enforcing the task state
    /// machine. Illegal transitions abort without changing the row and
    /// record an `invariant_violation` event; terminal applications record
    /// their terminal event.
    async fn apply_remote_state(
        &self,
        id: i64,
        update: RemoteStateUpdate,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, StoreError>;

    // =========================================================================
    // Events
    // =========================================================================

    async fn append_event(&self, event: NewEvent) -> Result<(), StoreError>;

    async fn events_for_workflow_instance(
        &self,
        workflow_instance: i64,
    ) -> Result<Vec<TaskflowEvent>, StoreError>;
}

/// Workflow status transition implied by a resolver verdict, if any.
pub(crate) fn workflow_transition(
    current: WorkflowInstanceStatus,
    verdict: RunVerdict,
) -> Option<WorkflowInstanceStatus> {
    let next = match verdict {
        RunVerdict::Success => WorkflowInstanceStatus::Success,
        RunVerdict::Failed => WorkflowInstanceStatus::Failed,
        RunVerdict::Running => WorkflowInstanceStatus::Running,
    };
    (next != current).then_some(next)
}

/// Adapter exposing a [`TaskflowStore`] as the registry's
/// [`ScheduleSource`].
pub struct StoreScheduleSource<'a>(pub &'a dyn TaskflowStore);

#[async_trait]
impl ScheduleSource for StoreScheduleSource<'_> {
    async fn schedule_flags(
        &self,
        kind: SchedulableKind,
        name: &str,
    ) -> Result<Option<ScheduleFlags>, RegistryError> {
        self.0
            .definition_flags(kind, name)
            .await
            .map_err(|error| RegistryError::SourceUnavailable(error.to_string()))
    }
}
