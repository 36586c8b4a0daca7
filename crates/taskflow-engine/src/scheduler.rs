//! Scheduler loop
//!
//! One tick performs, in order:
//!
//! 1. recurring workflow firing (cron next-fire with catch-up at the most
//!    recent missed slot, bounded by the validity window)
//! 2. advancement of every due queued and every running workflow instance,
//!    scheduled or explicitly created
//! 3. standalone recurring task scheduling, including the timeout/retry
//!    policy
//!
//! Task-layer advancement itself happens store-side in a single transaction
//! holding the instance row lock; the scheduler decides *which* runs to
//! advance and supplies the frozen workflow definition.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskflow_core::clock::Clock;
use taskflow_core::definition::{Task, Workflow};
use taskflow_core::registry::Registry;
use taskflow_core::status::WorkflowInstanceStatus;
use taskflow_storage::{
    EventKind, NewEvent, NewTaskInstance, NewWorkflowInstance, StoreScheduleSource, TaskflowStore,
    WorkflowInstance,
};

use crate::backoff::retry_transient;
use crate::config::SchedulerConfig;
use crate::error::EngineError;

/// Summary of one scheduler tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SchedulerTick {
    pub workflows_fired: usize,
    pub runs_advanced: usize,
    pub standalone_fired: usize,
    pub standalone_retried: usize,
    pub standalone_timed_out: usize,
}

#[derive(Debug, Default)]
struct StandaloneOutcome {
    fired: bool,
    retried: usize,
    timed_out: usize,
}

/// The workflow scheduling worker.
pub struct Scheduler {
    id: String,
    store: Arc<dyn TaskflowStore>,
    registry: Arc<Registry>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn TaskflowStore>,
        registry: Arc<Registry>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            id: format!("scheduler-{}", Uuid::new_v4()),
            store,
            registry,
            clock,
            config,
        }
    }

    /// Tick until the shutdown signal flips; the in-flight tick always
    /// completes first.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            id = %self.id,
            interval_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler loop starting"
        );
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.tick().await {
                Ok(summary) => debug!(?summary, "scheduler tick complete"),
                Err(error) => warn!(%error, "scheduler tick abandoned"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        info!(id = %self.id, "scheduler loop stopped");
    }

    /// One scheduling pass. Per-workflow failures are logged and do not
    /// abort the tick; a propagated error means the whole tick was
    /// abandoned (transient store retries exhausted).
    pub async fn tick(&self) -> Result<SchedulerTick, EngineError> {
        let now = self.clock.now();
        let mut summary = SchedulerTick::default();

        self.registry
            .refresh(&StoreScheduleSource(self.store.as_ref()))
            .await;

        for workflow in self.registry.workflows() {
            if !workflow.active() || workflow.schedule().is_none() {
                continue;
            }
            match self.fire_recurring_workflow(&workflow, now).await {
                Ok(true) => summary.workflows_fired += 1,
                Ok(false) => {}
                Err(error) => {
                    warn!(workflow = %workflow.name(), %error, "recurring pass failed; continuing")
                }
            }
        }

        let advanceable = retry_transient(&self.config.store_retry, || {
            self.store.advanceable_instances(now)
        })
        .await?;
        for instance in advanceable {
            match self.advance_run(&instance, now).await {
                Ok(()) => summary.runs_advanced += 1,
                Err(error) => warn!(
                    workflow = %instance.workflow,
                    instance_id = instance.id,
                    %error,
                    "run advancement failed; continuing"
                ),
            }
        }

        for task in self.registry.standalone_tasks() {
            if !task.active() || task.schedule().is_none() {
                continue;
            }
            match self.fire_standalone_task(&task, now).await {
                Ok(outcome) => {
                    summary.standalone_fired += usize::from(outcome.fired);
                    summary.standalone_retried += outcome.retried;
                    summary.standalone_timed_out += outcome.timed_out;
                }
                Err(error) => {
                    warn!(task = %task.name(), %error, "standalone pass failed; continuing")
                }
            }
        }

        Ok(summary)
    }

    /// Fire one recurring workflow if its cadence says so. Returns whether
    /// a new instance was created; a freshly created instance whose
    /// `run_at` has already arrived is picked up by the due-instance pass
    /// of the same tick.
    async fn fire_recurring_workflow(
        &self,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<bool, EngineError> {
        let Some(schedule) = workflow.schedule() else {
            return Ok(false);
        };

        let most_recent = retry_transient(&self.config.store_retry, || {
            self.store.most_recent_scheduled_instance(workflow.name())
        })
        .await?;

        // a run still in flight is advanced by the due-instance pass; no new
        // fire until it reaches a terminal state
        if let Some(instance) = &most_recent {
            if instance.status == WorkflowInstanceStatus::Running {
                return Ok(false);
            }
        }

        let next_run = match &most_recent {
            None => schedule.next_fire(now),
            Some(instance) => {
                let mut next = schedule.next_fire(instance.run_at);
                // catch-up: after downtime, fire once at the most recent
                // missed slot rather than replaying every missed one
                if let (Some(next_at), Some(prev)) = (next, schedule.prev_fire(now)) {
                    if prev > next_at {
                        next = Some(prev);
                    }
                }
                next
            }
        };
        let Some(run_at) = next_run else {
            return Ok(false);
        };

        if workflow.start_date().is_some_and(|start| run_at < start)
            || workflow.end_date().is_some_and(|end| run_at > end)
        {
            return Ok(false);
        }
        if !most_recent.map_or(true, |instance| instance.status.is_terminal()) {
            return Ok(false);
        }

        let instance = self
            .store
            .create_workflow_instance(NewWorkflowInstance {
                workflow: workflow.name().to_string(),
                scheduled: true,
                run_at,
                params: None,
            })
            .await?;
        self.store
            .append_event(NewEvent::for_workflow(
                EventKind::WorkflowQueued,
                instance.id,
                now,
                None,
            ))
            .await?;

        info!(workflow = %workflow.name(), instance_id = instance.id, run_at = %run_at, "fired recurring workflow");
        Ok(true)
    }

    /// Advance one workflow run by one resolver pass.
    async fn advance_run(
        &self,
        instance: &WorkflowInstance,
        now: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(workflow) = self.registry.get_workflow(&instance.workflow) else {
            return Err(EngineError::UnknownWorkflow(instance.workflow.clone()));
        };

        let advance = retry_transient(&self.config.store_retry, || {
            self.store.advance_workflow_run(instance.id, &workflow, now)
        })
        .await?;

        if !advance.queued.is_empty() {
            debug!(
                workflow = %instance.workflow,
                instance_id = instance.id,
                queued = ?advance.queued,
                "queued next task layer"
            );
        }
        if let Some(status) = advance.transition {
            info!(
                workflow = %instance.workflow,
                instance_id = instance.id,
                status = %status,
                "workflow run transitioned"
            );
        }
        Ok(())
    }

    /// Standalone recurring task pass: time out overdue instances (retrying
    /// them while attempts remain), then fire the schedule if the
    /// concurrency cap allows.
    async fn fire_standalone_task(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> Result<StandaloneOutcome, EngineError> {
        let mut outcome = StandaloneOutcome::default();
        let Some(schedule) = task.schedule() else {
            return Ok(outcome);
        };

        let live = retry_transient(&self.config.store_retry, || {
            self.store.live_standalone_instances(task.name())
        })
        .await?;

        // timeout scan first, so a freed slot is usable in this same tick
        let timeout = Duration::seconds(task.timeout().as_secs() as i64);
        let mut live_count = 0usize;
        for instance in &live {
            let anchor = instance.started_at.unwrap_or(instance.run_at);
            if now <= anchor + timeout {
                live_count += 1;
                continue;
            }
            let Some(marked) = self
                .store
                .mark_task_instance_timed_out(instance.id, now)
                .await?
            else {
                continue;
            };
            outcome.timed_out += 1;
            self.store
                .append_event(NewEvent::for_task(EventKind::TaskTimedOut, &marked, now, None))
                .await?;
            warn!(task = %task.name(), instance_id = marked.id, "standalone instance timed out");

            if marked.attempts < task.max_retries() as i32 + 1 {
                let retry = self
                    .store
                    .insert_task_instance(NewTaskInstance {
                        task: task.name().to_string(),
                        workflow_instance: None,
                        scheduled: false,
                        push: task.is_push(),
                        priority: task.default_priority(),
                        run_at: now,
                        attempts: marked.attempts,
                        params: task.params().cloned(),
                    })
                    .await?;
                self.store
                    .append_event(NewEvent::for_task(
                        EventKind::TaskRetryQueued,
                        &retry,
                        now,
                        None,
                    ))
                    .await?;
                outcome.retried += 1;
                // the retry occupies the slot the timeout just freed
                live_count += 1;
            }
        }

        if live_count >= task.concurrency() as usize {
            return Ok(outcome);
        }

        let most_recent = retry_transient(&self.config.store_retry, || {
            self.store.most_recent_scheduled_task_instance(task.name())
        })
        .await?;

        let next_run = match &most_recent {
            None => schedule.next_fire(now),
            Some(instance) => {
                let mut next = schedule.next_fire(instance.run_at);
                if let (Some(next_at), Some(prev)) = (next, schedule.prev_fire(now)) {
                    if prev > next_at {
                        next = Some(prev);
                    }
                }
                next
            }
        };
        // every fire, including the first, waits for its slot to arrive
        let Some(run_at) = next_run.filter(|at| *at <= now) else {
            return Ok(outcome);
        };

        if task.start_date().is_some_and(|start| run_at < start)
            || task.end_date().is_some_and(|end| run_at > end)
        {
            return Ok(outcome);
        }

        let instance = self
            .store
            .insert_task_instance(NewTaskInstance {
                task: task.name().to_string(),
                workflow_instance: None,
                scheduled: true,
                push: task.is_push(),
                priority: task.default_priority(),
                run_at,
                attempts: 0,
                params: task.params().cloned(),
            })
            .await?;
        self.store
            .append_event(NewEvent::for_task(EventKind::TaskQueued, &instance, now, None))
            .await?;

        info!(task = %task.name(), instance_id = instance.id, run_at = %run_at, "fired standalone task");
        outcome.fired = true;
        Ok(outcome)
    }
}
