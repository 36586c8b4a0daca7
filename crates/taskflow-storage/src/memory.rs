//! In-memory implementation of TaskflowStore for testing
//!
//! Mirrors the observable semantics of the postgres store, including claim
//! exclusivity and insert-if-absent on `(workflow_instance, task)`, so the
//! engine's scenario tests run without a database.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde_json::Value;

use taskflow_core::dag::RunVerdict;
use taskflow_core::definition::{Task, Workflow};
use taskflow_core::registry::{SchedulableKind, ScheduleFlags};
use taskflow_core::status::{TaskInstanceStatus, WorkflowInstanceStatus};

use crate::store::*;

struct TaskDefRecord {
    flags: ScheduleFlags,
    push_destination: Option<String>,
}

#[derive(Default)]
struct MemoryState {
    workflow_flags: BTreeMap<String, ScheduleFlags>,
    task_defs: BTreeMap<String, TaskDefRecord>,
    workflow_instances: BTreeMap<i64, WorkflowInstance>,
    task_instances: BTreeMap<i64, TaskInstance>,
    events: Vec<TaskflowEvent>,
    claimed: BTreeSet<i64>,
    last_workflow_instance_id: i64,
    last_task_instance_id: i64,
    last_event_id: i64,
}

impl MemoryState {
    fn next_workflow_instance_id(&mut self) -> i64 {
        self.last_workflow_instance_id += 1;
        self.last_workflow_instance_id
    }

    fn next_task_instance_id(&mut self) -> i64 {
        self.last_task_instance_id += 1;
        self.last_task_instance_id
    }

    fn push_event(&mut self, event: NewEvent) {
        self.last_event_id += 1;
        self.events.push(TaskflowEvent {
            id: self.last_event_id,
            workflow_instance: event.workflow_instance,
            task_instance: event.task_instance,
            timestamp: event.timestamp,
            event: event.kind.to_string(),
            message: event.message,
        });
    }
}

/// In-memory implementation of [`TaskflowStore`].
#[derive(Clone)]
pub struct InMemoryTaskflowStore {
    state: Arc<Mutex<MemoryState>>,
}

impl InMemoryTaskflowStore {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState::default())),
        }
    }

    /// Every event recorded so far, in append order (test helper).
    pub fn all_events(&self) -> Vec<TaskflowEvent> {
        self.state.lock().events.clone()
    }

    /// Every task instance, by id (test helper).
    pub fn all_task_instances(&self) -> Vec<TaskInstance> {
        self.state.lock().task_instances.values().cloned().collect()
    }

    /// Every workflow instance, by id (test helper).
    pub fn all_workflow_instances(&self) -> Vec<WorkflowInstance> {
        self.state
            .lock()
            .workflow_instances
            .values()
            .cloned()
            .collect()
    }
}

impl Default for InMemoryTaskflowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskflowStore for InMemoryTaskflowStore {
    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let flags = ScheduleFlags {
            active: workflow.active(),
            schedule: workflow.schedule().map(|s| s.expression().to_string()),
            start_date: workflow.start_date(),
            end_date: workflow.end_date(),
        };
        match state.workflow_flags.entry(workflow.name().to_string()) {
            // `active` belongs to the admin surface after first insert
            Entry::Occupied(mut entry) => {
                let active = entry.get().active;
                *entry.get_mut() = ScheduleFlags { active, ..flags };
            }
            Entry::Vacant(entry) => {
                entry.insert(flags);
            }
        }
        Ok(())
    }

    async fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let flags = ScheduleFlags {
            active: task.active(),
            schedule: task.schedule().map(|s| s.expression().to_string()),
            start_date: task.start_date(),
            end_date: task.end_date(),
        };
        let push_destination = task.push_destination().map(str::to_string);
        match state.task_defs.entry(task.name().to_string()) {
            Entry::Occupied(mut entry) => {
                let record = entry.get_mut();
                let active = record.flags.active;
                record.flags = ScheduleFlags { active, ..flags };
                record.push_destination = push_destination;
            }
            Entry::Vacant(entry) => {
                entry.insert(TaskDefRecord {
                    flags,
                    push_destination,
                });
            }
        }
        Ok(())
    }

    async fn definition_flags(
        &self,
        kind: SchedulableKind,
        name: &str,
    ) -> Result<Option<ScheduleFlags>, StoreError> {
        let state = self.state.lock();
        Ok(match kind {
            SchedulableKind::Workflow => state.workflow_flags.get(name).cloned(),
            SchedulableKind::Task => state.task_defs.get(name).map(|def| def.flags.clone()),
        })
    }

    async fn create_workflow_instance(
        &self,
        new: NewWorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let mut state = self.state.lock();
        let id = state.next_workflow_instance_id();
        let now = Utc::now();
        let instance = WorkflowInstance {
            id,
            workflow: new.workflow,
            scheduled: new.scheduled,
            run_at: new.run_at,
            started_at: None,
            ended_at: None,
            status: WorkflowInstanceStatus::Queued,
            params: new.params,
            created_at: now,
            updated_at: now,
        };
        state.workflow_instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn get_workflow_instance(
        &self,
        id: i64,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        Ok(self.state.lock().workflow_instances.get(&id).cloned())
    }

    async fn most_recent_scheduled_instance(
        &self,
        workflow: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .workflow_instances
            .values()
            .filter(|instance| instance.workflow == workflow && instance.scheduled)
            .max_by_key(|instance| (instance.run_at, instance.id))
            .cloned())
    }

    async fn advanceable_instances(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let state = self.state.lock();
        let mut due: Vec<WorkflowInstance> = state
            .workflow_instances
            .values()
            .filter(|instance| match instance.status {
                WorkflowInstanceStatus::Queued => instance.run_at <= now,
                WorkflowInstanceStatus::Running => true,
                _ => false,
            })
            .cloned()
            .collect();
        due.sort_by_key(|instance| (instance.run_at, instance.id));
        Ok(due)
    }

    async fn delete_workflow_instance(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        if state.workflow_instances.remove(&id).is_none() {
            return Ok(false);
        }
        let removed_tasks: BTreeSet<i64> = state
            .task_instances
            .values()
            .filter(|ti| ti.workflow_instance == Some(id))
            .map(|ti| ti.id)
            .collect();
        state
            .task_instances
            .retain(|_, ti| ti.workflow_instance != Some(id));
        state.events.retain(|event| {
            event.workflow_instance != Some(id)
                && !event
                    .task_instance
                    .is_some_and(|ti| removed_tasks.contains(&ti))
        });
        Ok(true)
    }

    async fn advance_workflow_run(
        &self,
        instance_id: i64,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<RunAdvance, StoreError> {
        let mut state = self.state.lock();
        let instance = state
            .workflow_instances
            .get(&instance_id)
            .cloned()
            .ok_or(StoreError::WorkflowInstanceNotFound(instance_id))?;

        // terminal statuses are monotone
        if instance.status.is_terminal() {
            let verdict = match instance.status {
                WorkflowInstanceStatus::Success => RunVerdict::Success,
                _ => RunVerdict::Failed,
            };
            return Ok(RunAdvance {
                verdict,
                queued: Vec::new(),
                timed_out: Vec::new(),
                transition: None,
            });
        }

        // time out started instances that overran their task's budget
        let mut timed_out = Vec::new();
        let overdue: Vec<i64> = state
            .task_instances
            .values()
            .filter(|ti| {
                ti.workflow_instance == Some(instance_id)
                    && !ti.status.is_terminal()
                    && ti.started_at.zip(workflow.task(&ti.task)).is_some_and(
                        |(started_at, task)| {
                            now > started_at
                                + Duration::seconds(task.timeout().as_secs() as i64)
                        },
                    )
            })
            .map(|ti| ti.id)
            .collect();
        for id in overdue {
            let updated = {
                let ti = state.task_instances.get_mut(&id).expect("instance exists");
                ti.status = TaskInstanceStatus::TimedOut;
                ti.ended_at = Some(now);
                ti.updated_at = now;
                ti.clone()
            };
            timed_out.push(updated.task.clone());
            state.push_event(NewEvent::for_task(EventKind::TaskTimedOut, &updated, now, None));
        }

        let statuses: HashMap<String, TaskInstanceStatus> = state
            .task_instances
            .values()
            .filter(|ti| ti.workflow_instance == Some(instance_id))
            .map(|ti| (ti.task.clone(), ti.status))
            .collect();
        let resolution = workflow.resolver().resolve(&statuses);

        let mut queued = Vec::new();
        for name in &resolution.to_queue {
            let Some(task) = workflow.task(name) else {
                continue;
            };
            let exists = state
                .task_instances
                .values()
                .any(|ti| ti.workflow_instance == Some(instance_id) && ti.task == *name);
            if exists {
                continue;
            }
            let id = state.next_task_instance_id();
            let task_instance = TaskInstance {
                id,
                task: name.clone(),
                workflow_instance: Some(instance_id),
                scheduled: false,
                push: task.is_push(),
                status: TaskInstanceStatus::Queued,
                priority: task.default_priority(),
                run_at: now,
                started_at: None,
                ended_at: None,
                attempts: 0,
                params: task.params().cloned(),
                push_data: None,
                created_at: now,
                updated_at: now,
            };
            state.push_event(NewEvent::for_task(
                EventKind::TaskQueued,
                &task_instance,
                now,
                None,
            ));
            state.task_instances.insert(id, task_instance);
            queued.push(name.clone());
        }

        let transition = workflow_transition(instance.status, resolution.verdict);
        if let Some(new_status) = transition {
            let inst = state
                .workflow_instances
                .get_mut(&instance_id)
                .expect("instance exists");
            inst.status = new_status;
            if inst.started_at.is_none() {
                inst.started_at = Some(now);
            }
            if new_status.is_terminal() && inst.ended_at.is_none() {
                inst.ended_at = Some(now);
            }
            inst.updated_at = now;

            let kind = match new_status {
                WorkflowInstanceStatus::Running => EventKind::WorkflowStarted,
                WorkflowInstanceStatus::Success => EventKind::WorkflowSuccess,
                WorkflowInstanceStatus::Failed => EventKind::WorkflowFailed,
                WorkflowInstanceStatus::Queued => EventKind::WorkflowQueued,
            };
            state.push_event(NewEvent::for_workflow(kind, instance_id, now, None));
        }

        Ok(RunAdvance {
            verdict: resolution.verdict,
            queued,
            timed_out,
            transition,
        })
    }

    async fn insert_task_instance(
        &self,
        new: NewTaskInstance,
    ) -> Result<TaskInstance, StoreError> {
        let mut state = self.state.lock();
        let id = state.next_task_instance_id();
        let now = Utc::now();
        let instance = TaskInstance {
            id,
            task: new.task,
            workflow_instance: new.workflow_instance,
            scheduled: new.scheduled,
            push: new.push,
            status: TaskInstanceStatus::Queued,
            priority: new.priority,
            run_at: new.run_at,
            started_at: None,
            ended_at: None,
            attempts: new.attempts,
            params: new.params,
            push_data: None,
            created_at: now,
            updated_at: now,
        };
        state.task_instances.insert(id, instance.clone());
        Ok(instance)
    }

    async fn get_task_instance(&self, id: i64) -> Result<Option<TaskInstance>, StoreError> {
        Ok(self.state.lock().task_instances.get(&id).cloned())
    }

    async fn task_instances_for_run(
        &self,
        instance_id: i64,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .task_instances
            .values()
            .filter(|ti| ti.workflow_instance == Some(instance_id))
            .cloned()
            .collect())
    }

    async fn most_recent_scheduled_task_instance(
        &self,
        task: &str,
    ) -> Result<Option<TaskInstance>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .task_instances
            .values()
            .filter(|ti| ti.task == task && ti.scheduled && ti.workflow_instance.is_none())
            .max_by_key(|ti| (ti.run_at, ti.id))
            .cloned())
    }

    async fn live_standalone_instances(
        &self,
        task: &str,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .task_instances
            .values()
            .filter(|ti| {
                ti.task == task && ti.workflow_instance.is_none() && !ti.status.is_terminal()
            })
            .cloned()
            .collect())
    }

    async fn mark_task_instance_timed_out(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>, StoreError> {
        let mut state = self.state.lock();
        let Some(instance) = state.task_instances.get_mut(&id) else {
            return Err(StoreError::TaskInstanceNotFound(id));
        };
        if instance.status.is_terminal() {
            return Ok(None);
        }
        instance.status = TaskInstanceStatus::TimedOut;
        instance.ended_at = Some(now);
        instance.updated_at = now;
        Ok(Some(instance.clone()))
    }

    async fn claim_due_push_instances(
        &self,
        now: DateTime<Utc>,
        destinations: &[String],
        limit: i64,
    ) -> Result<Box<dyn ClaimedPushBatch>, StoreError> {
        let mut state = self.state.lock();
        let mut claimable: Vec<TaskInstance> = state
            .task_instances
            .values()
            .filter(|ti| {
                ti.status == TaskInstanceStatus::Queued
                    && ti.push
                    && ti.run_at <= now
                    && !state.claimed.contains(&ti.id)
                    && state
                        .task_defs
                        .get(&ti.task)
                        .and_then(|def| def.push_destination.as_deref())
                        .is_some_and(|dest| destinations.iter().any(|d| d == dest))
            })
            .cloned()
            .collect();

        claimable.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.run_at.cmp(&b.run_at))
                .then(a.id.cmp(&b.id))
        });
        claimable.truncate(limit.max(0) as usize);

        for instance in &claimable {
            state.claimed.insert(instance.id);
        }

        Ok(Box::new(MemoryClaimedBatch {
            state: Arc::clone(&self.state),
            instances: claimable,
            updates: Vec::new(),
            now,
            finished: false,
        }))
    }

    async fn in_flight_push_instances(&self) -> Result<Vec<TaskInstance>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .task_instances
            .values()
            .filter(|ti| {
                ti.push
                    && matches!(
                        ti.status,
                        TaskInstanceStatus::Pushed
                            | TaskInstanceStatus::Running
                            | TaskInstanceStatus::Retrying
                    )
            })
            .cloned()
            .collect())
    }

    async fn apply_remote_state(
        &self,
        id: i64,
        update: RemoteStateUpdate,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, StoreError> {
        let mut state = self.state.lock();
        let instance = state
            .task_instances
            .get(&id)
            .cloned()
            .ok_or(StoreError::TaskInstanceNotFound(id))?;

        if instance.status == update.status {
            return Ok(SyncOutcome::Unchanged);
        }
        if !instance.status.can_transition_to(update.status) {
            state.push_event(NewEvent::for_task(
                EventKind::InvariantViolation,
                &instance,
                now,
                Some(format!(
                    "worker reported illegal transition {} -> {}",
                    instance.status, update.status
                )),
            ));
            return Ok(SyncOutcome::Rejected {
                from: instance.status,
            });
        }

        let terminal = update.status.is_terminal();
        let updated = {
            let row = state.task_instances.get_mut(&id).expect("instance exists");
            row.status = update.status;
            row.started_at = update
                .started_at
                .or((update.status == TaskInstanceStatus::Running).then_some(now))
                .or(row.started_at);
            row.ended_at = update.ended_at.or(terminal.then_some(now)).or(row.ended_at);
            row.updated_at = now;
            row.clone()
        };

        if terminal {
            let kind = match update.status {
                TaskInstanceStatus::Success => EventKind::TaskSuccess,
                TaskInstanceStatus::TimedOut => EventKind::TaskTimedOut,
                _ => EventKind::TaskFailed,
            };
            state.push_event(NewEvent::for_task(kind, &updated, now, update.message));
        }

        Ok(SyncOutcome::Applied { terminal })
    }

    async fn append_event(&self, event: NewEvent) -> Result<(), StoreError> {
        self.state.lock().push_event(event);
        Ok(())
    }

    async fn events_for_workflow_instance(
        &self,
        workflow_instance: i64,
    ) -> Result<Vec<TaskflowEvent>, StoreError> {
        let state = self.state.lock();
        Ok(state
            .events
            .iter()
            .filter(|event| event.workflow_instance == Some(workflow_instance))
            .cloned()
            .collect())
    }
}

enum PendingUpdate {
    Pushed {
        id: i64,
        push_data: Option<Value>,
    },
    Requeued {
        id: i64,
        error: String,
        retry_at: DateTime<Utc>,
    },
    Failed {
        id: i64,
        error: String,
    },
}

/// Claimed batch over the shared state; updates buffer until commit, and an
/// uncommitted drop releases the claim unchanged (mirroring the rollback of
/// the postgres transaction).
struct MemoryClaimedBatch {
    state: Arc<Mutex<MemoryState>>,
    instances: Vec<TaskInstance>,
    updates: Vec<PendingUpdate>,
    now: DateTime<Utc>,
    finished: bool,
}

impl MemoryClaimedBatch {
    fn ensure_claimed(&self, id: i64) -> Result<(), StoreError> {
        if self.instances.iter().any(|instance| instance.id == id) {
            Ok(())
        } else {
            Err(StoreError::TaskInstanceNotFound(id))
        }
    }
}

#[async_trait]
impl ClaimedPushBatch for MemoryClaimedBatch {
    fn instances(&self) -> &[TaskInstance] {
        &self.instances
    }

    async fn mark_pushed(&mut self, id: i64, push_data: Option<Value>) -> Result<(), StoreError> {
        self.ensure_claimed(id)?;
        self.updates.push(PendingUpdate::Pushed { id, push_data });
        Ok(())
    }

    async fn mark_push_failed(
        &mut self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        self.ensure_claimed(id)?;
        self.updates.push(match retry_at {
            Some(retry_at) => PendingUpdate::Requeued {
                id,
                error: error.to_string(),
                retry_at,
            },
            None => PendingUpdate::Failed {
                id,
                error: error.to_string(),
            },
        });
        Ok(())
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        let now = self.now;
        let mut state = self.state.lock();
        for update in self.updates.drain(..) {
            match update {
                PendingUpdate::Pushed { id, push_data } => {
                    let updated = {
                        let Some(row) = state.task_instances.get_mut(&id) else {
                            continue;
                        };
                        row.status = TaskInstanceStatus::Pushed;
                        row.push_data = push_data;
                        row.attempts += 1;
                        row.updated_at = now;
                        row.clone()
                    };
                    state.push_event(NewEvent::for_task(
                        EventKind::TaskPushed,
                        &updated,
                        now,
                        None,
                    ));
                }
                PendingUpdate::Requeued { id, error, retry_at } => {
                    let updated = {
                        let Some(row) = state.task_instances.get_mut(&id) else {
                            continue;
                        };
                        row.status = TaskInstanceStatus::Queued;
                        row.run_at = retry_at;
                        row.attempts += 1;
                        row.updated_at = now;
                        row.clone()
                    };
                    state.push_event(NewEvent::for_task(
                        EventKind::TaskPushFailed,
                        &updated,
                        now,
                        Some(error),
                    ));
                }
                PendingUpdate::Failed { id, error } => {
                    let updated = {
                        let Some(row) = state.task_instances.get_mut(&id) else {
                            continue;
                        };
                        row.status = TaskInstanceStatus::Failed;
                        row.ended_at = Some(now);
                        row.attempts += 1;
                        row.updated_at = now;
                        row.clone()
                    };
                    state.push_event(NewEvent::for_task(
                        EventKind::TaskPushFailed,
                        &updated,
                        now,
                        Some(error),
                    ));
                    state.push_event(NewEvent::for_task(
                        EventKind::TaskFailed,
                        &updated,
                        now,
                        Some("dispatch retries exhausted".to_string()),
                    ));
                }
            }
        }
        for instance in &self.instances {
            state.claimed.remove(&instance.id);
        }
        drop(state);
        self.finished = true;
        Ok(())
    }
}

impl Drop for MemoryClaimedBatch {
    fn drop(&mut self) {
        if !self.finished {
            let mut state = self.state.lock();
            for instance in &self.instances {
                state.claimed.remove(&instance.id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn push_task(name: &str, destination: &str, priority: i32) -> Task {
        Task::builder(name)
            .active(true)
            .push_destination(destination)
            .default_priority(priority)
            .build()
            .unwrap()
    }

    async fn seed_queued_push(
        store: &InMemoryTaskflowStore,
        task: &Task,
        run_at: DateTime<Utc>,
    ) -> TaskInstance {
        store.upsert_task(task).await.unwrap();
        store
            .insert_task_instance(NewTaskInstance {
                task: task.name().to_string(),
                workflow_instance: None,
                scheduled: true,
                push: true,
                priority: task.default_priority(),
                run_at,
                attempts: 0,
                params: None,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_run_at() {
        let store = InMemoryTaskflowStore::new();
        let now = utc(2017, 6, 3, 6, 0, 0);

        let low = push_task("low", "batch", 0);
        let high = push_task("high", "batch", 10);
        let early = seed_queued_push(&store, &low, now - Duration::minutes(10)).await;
        let late_high = seed_queued_push(&store, &high, now - Duration::minutes(1)).await;

        let batch = store
            .claim_due_push_instances(now, &["batch".to_string()], 100)
            .await
            .unwrap();
        let ids: Vec<i64> = batch.instances().iter().map(|ti| ti.id).collect();
        assert_eq!(ids, vec![late_high.id, early.id]);
    }

    #[tokio::test]
    async fn claim_is_exclusive_until_batch_finishes() {
        let store = InMemoryTaskflowStore::new();
        let now = utc(2017, 6, 3, 6, 0, 0);
        let task = push_task("job", "batch", 0);
        seed_queued_push(&store, &task, now).await;

        let first = store
            .claim_due_push_instances(now, &["batch".to_string()], 100)
            .await
            .unwrap();
        assert_eq!(first.instances().len(), 1);

        // a second pusher sees nothing while the first batch is open
        let second = store
            .claim_due_push_instances(now, &["batch".to_string()], 100)
            .await
            .unwrap();
        assert!(second.instances().is_empty());
        drop(second);

        // dropping without commit releases the rows unchanged
        drop(first);
        let third = store
            .claim_due_push_instances(now, &["batch".to_string()], 100)
            .await
            .unwrap();
        assert_eq!(third.instances().len(), 1);
        assert_eq!(
            third.instances()[0].status,
            TaskInstanceStatus::Queued
        );
    }

    #[tokio::test]
    async fn claim_filters_by_destination_and_due_time() {
        let store = InMemoryTaskflowStore::new();
        let now = utc(2017, 6, 3, 6, 0, 0);
        let batch_task = push_task("a", "batch", 0);
        let http_task = push_task("b", "http", 0);
        seed_queued_push(&store, &batch_task, now).await;
        seed_queued_push(&store, &http_task, now).await;
        // not due yet
        seed_queued_push(&store, &push_task("c", "batch", 0), now + Duration::minutes(5)).await;

        let batch = store
            .claim_due_push_instances(now, &["batch".to_string()], 100)
            .await
            .unwrap();
        let tasks: Vec<&str> = batch
            .instances()
            .iter()
            .map(|ti| ti.task.as_str())
            .collect();
        assert_eq!(tasks, vec!["a"]);
    }

    #[tokio::test]
    async fn committed_push_marks_rows_and_records_events() {
        let store = InMemoryTaskflowStore::new();
        let now = utc(2017, 6, 3, 6, 0, 0);
        let task = push_task("job", "batch", 0);
        let instance = seed_queued_push(&store, &task, now).await;

        let mut batch = store
            .claim_due_push_instances(now, &["batch".to_string()], 100)
            .await
            .unwrap();
        batch
            .mark_pushed(instance.id, Some(serde_json::json!({"remote_id": "r-1"})))
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let row = store.get_task_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskInstanceStatus::Pushed);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.push_data, Some(serde_json::json!({"remote_id": "r-1"})));

        let events: Vec<String> = store
            .all_events()
            .into_iter()
            .map(|event| event.event)
            .collect();
        assert_eq!(events, vec!["task_pushed"]);
    }

    #[tokio::test]
    async fn failed_push_requeues_then_fails_terminally() {
        let store = InMemoryTaskflowStore::new();
        let now = utc(2017, 6, 3, 6, 0, 0);
        let task = push_task("job", "batch", 0);
        let instance = seed_queued_push(&store, &task, now).await;

        let mut batch = store
            .claim_due_push_instances(now, &["batch".to_string()], 100)
            .await
            .unwrap();
        batch
            .mark_push_failed(instance.id, "connection refused", Some(now + Duration::seconds(30)))
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let row = store.get_task_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskInstanceStatus::Queued);
        assert_eq!(row.attempts, 1);
        assert_eq!(row.run_at, now + Duration::seconds(30));

        let later = now + Duration::minutes(1);
        let mut batch = store
            .claim_due_push_instances(later, &["batch".to_string()], 100)
            .await
            .unwrap();
        batch
            .mark_push_failed(instance.id, "connection refused", None)
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let row = store.get_task_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskInstanceStatus::Failed);
        assert_eq!(row.attempts, 2);
        assert_eq!(row.ended_at, Some(later));
    }

    #[tokio::test]
    async fn remote_state_rejects_terminal_reversal() {
        let store = InMemoryTaskflowStore::new();
        let now = utc(2017, 6, 3, 6, 0, 0);
        let task = push_task("job", "batch", 0);
        let instance = seed_queued_push(&store, &task, now).await;

        store
            .apply_remote_state(
                instance.id,
                RemoteStateUpdate {
                    status: TaskInstanceStatus::TimedOut,
                    started_at: None,
                    ended_at: None,
                    message: None,
                },
                now,
            )
            .await
            .unwrap();

        let outcome = store
            .apply_remote_state(
                instance.id,
                RemoteStateUpdate {
                    status: TaskInstanceStatus::Running,
                    started_at: None,
                    ended_at: None,
                    message: None,
                },
                now,
            )
            .await
            .unwrap();
        assert_eq!(
            outcome,
            SyncOutcome::Rejected {
                from: TaskInstanceStatus::TimedOut
            }
        );

        let row = store.get_task_instance(instance.id).await.unwrap().unwrap();
        assert_eq!(row.status, TaskInstanceStatus::TimedOut);
        assert!(store
            .all_events()
            .iter()
            .any(|event| event.event == "invariant_violation"));
    }

    #[tokio::test]
    async fn delete_cascades_to_task_instances_and_events() {
        let store = InMemoryTaskflowStore::new();
        let now = utc(2017, 6, 3, 6, 0, 0);
        let instance = store
            .create_workflow_instance(NewWorkflowInstance {
                workflow: "etl".to_string(),
                scheduled: false,
                run_at: now,
                params: None,
            })
            .await
            .unwrap();
        store
            .insert_task_instance(NewTaskInstance {
                task: "task1".to_string(),
                workflow_instance: Some(instance.id),
                scheduled: false,
                push: false,
                priority: 0,
                run_at: now,
                attempts: 0,
                params: None,
            })
            .await
            .unwrap();
        store
            .append_event(NewEvent::for_workflow(
                EventKind::WorkflowQueued,
                instance.id,
                now,
                None,
            ))
            .await
            .unwrap();

        assert!(store.delete_workflow_instance(instance.id).await.unwrap());
        assert!(store.all_task_instances().is_empty());
        assert!(store.all_events().is_empty());
        assert!(!store.delete_workflow_instance(instance.id).await.unwrap());
    }
}
