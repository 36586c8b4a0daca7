//! PostgreSQL implementation of TaskflowStore
//!
//! Production persistence with:
//! - an exclusive lock on the parent workflow instance row for every layer
//!   advancement (`SELECT ... FOR UPDATE`)
//! - dispatch claiming with `FOR UPDATE SKIP LOCKED` so parallel pushers
//!   partition the queue without contention
//! - insert-if-absent on `(workflow_instance, task)` via `ON CONFLICT`

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};

use taskflow_core::dag::RunVerdict;
use taskflow_core::definition::{Task, Workflow};
use taskflow_core::registry::{SchedulableKind, ScheduleFlags};
use taskflow_core::status::{TaskInstanceStatus, WorkflowInstanceStatus};

use crate::store::*;

const WORKFLOW_INSTANCE_COLUMNS: &str = "id, workflow, scheduled, run_at, started_at, ended_at, status, params, created_at, updated_at";
const TASK_INSTANCE_COLUMNS: &str = "id, task, workflow_instance, scheduled, push, status, priority, run_at, started_at, ended_at, attempts, params, push_data, created_at, updated_at";

/// PostgreSQL implementation of [`TaskflowStore`].
#[derive(Clone)]
pub struct PostgresTaskflowStore {
    pool: PgPool,
}

impl PostgresTaskflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create a store from a connection URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(map_db_err)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskflowStore for PostgresTaskflowStore {
    #[instrument(skip(self, workflow), fields(workflow = %workflow.name()))]
    async fn upsert_workflow(&self, workflow: &Workflow) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflows (name, active, title, description, concurrency, sla_seconds,
                                   schedule, default_priority, start_date, end_date)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (name) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                concurrency = EXCLUDED.concurrency,
                sla_seconds = EXCLUDED.sla_seconds,
                schedule = EXCLUDED.schedule,
                default_priority = EXCLUDED.default_priority,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                updated_at = NOW()
            "#,
        )
        .bind(workflow.name())
        .bind(workflow.active())
        .bind(workflow.title())
        .bind(workflow.description())
        .bind(workflow.concurrency() as i32)
        .bind(workflow.sla().map(|sla| sla.as_secs() as i64))
        .bind(workflow.schedule().map(|s| s.expression()))
        .bind(workflow.default_priority())
        .bind(workflow.start_date())
        .bind(workflow.end_date())
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        debug!("upserted workflow definition");
        Ok(())
    }

    #[instrument(skip(self, task), fields(task = %task.name()))]
    async fn upsert_task(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (name, workflow, active, title, description, concurrency,
                               sla_seconds, schedule, default_priority, start_date, end_date,
                               max_retries, timeout_seconds, params, push_destination, fn_def)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            ON CONFLICT (name) DO UPDATE SET
                workflow = EXCLUDED.workflow,
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                concurrency = EXCLUDED.concurrency,
                sla_seconds = EXCLUDED.sla_seconds,
                schedule = EXCLUDED.schedule,
                default_priority = EXCLUDED.default_priority,
                start_date = EXCLUDED.start_date,
                end_date = EXCLUDED.end_date,
                max_retries = EXCLUDED.max_retries,
                timeout_seconds = EXCLUDED.timeout_seconds,
                params = EXCLUDED.params,
                push_destination = EXCLUDED.push_destination,
                fn_def = EXCLUDED.fn_def,
                updated_at = NOW()
            "#,
        )
        .bind(task.name())
        .bind(task.workflow())
        .bind(task.active())
        .bind(task.title())
        .bind(task.description())
        .bind(task.concurrency() as i32)
        .bind(task.sla().map(|sla| sla.as_secs() as i64))
        .bind(task.schedule().map(|s| s.expression()))
        .bind(task.default_priority())
        .bind(task.start_date())
        .bind(task.end_date())
        .bind(task.max_retries() as i32)
        .bind(task.timeout().as_secs() as i32)
        .bind(task.params())
        .bind(task.push_destination())
        .bind(task.fn_def())
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;

        debug!("upserted task definition");
        Ok(())
    }

    async fn definition_flags(
        &self,
        kind: SchedulableKind,
        name: &str,
    ) -> Result<Option<ScheduleFlags>, StoreError> {
        let query = match kind {
            SchedulableKind::Workflow => {
                "SELECT active, schedule, start_date, end_date FROM workflows WHERE name = $1"
            }
            SchedulableKind::Task => {
                "SELECT active, schedule, start_date, end_date FROM tasks WHERE name = $1"
            }
        };
        let row = sqlx::query(query)
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)?;

        Ok(row.map(|row| ScheduleFlags {
            active: row.get("active"),
            schedule: row.get("schedule"),
            start_date: row.get("start_date"),
            end_date: row.get("end_date"),
        }))
    }

    #[instrument(skip(self, new), fields(workflow = %new.workflow))]
    async fn create_workflow_instance(
        &self,
        new: NewWorkflowInstance,
    ) -> Result<WorkflowInstance, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO workflow_instances (workflow, scheduled, run_at, status, params)
            VALUES ($1, $2, $3, 'queued', $4)
            RETURNING {WORKFLOW_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(&new.workflow)
        .bind(new.scheduled)
        .bind(new.run_at)
        .bind(&new.params)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        let instance = workflow_instance_from_row(&row)?;
        debug!(instance_id = instance.id, run_at = %instance.run_at, "created workflow instance");
        Ok(instance)
    }

    async fn get_workflow_instance(
        &self,
        id: i64,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(workflow_instance_from_row).transpose()
    }

    async fn most_recent_scheduled_instance(
        &self,
        workflow: &str,
    ) -> Result<Option<WorkflowInstance>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {WORKFLOW_INSTANCE_COLUMNS}
            FROM workflow_instances
            WHERE workflow = $1 AND scheduled
            ORDER BY run_at DESC
            LIMIT 1
            "#,
        ))
        .bind(workflow)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(workflow_instance_from_row).transpose()
    }

    async fn advanceable_instances(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WorkflowInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {WORKFLOW_INSTANCE_COLUMNS}
            FROM workflow_instances
            WHERE (status = 'queued' AND run_at <= $1) OR status = 'running'
            ORDER BY run_at, id
            "#,
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.iter().map(workflow_instance_from_row).collect()
    }

    async fn delete_workflow_instance(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM workflow_instances WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(map_db_err)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, workflow), fields(workflow = %workflow.name()))]
    async fn advance_workflow_run(
        &self,
        instance_id: i64,
        workflow: &Workflow,
        now: DateTime<Utc>,
    ) -> Result<RunAdvance, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {WORKFLOW_INSTANCE_COLUMNS} FROM workflow_instances WHERE id = $1 FOR UPDATE"
        ))
        .bind(instance_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?
        .ok_or(StoreError::WorkflowInstanceNotFound(instance_id))?;
        let instance = workflow_instance_from_row(&row)?;

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

        let rows = sqlx::query(&format!(
            "SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE workflow_instance = $1"
        ))
        .bind(instance_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;
        let mut task_instances = rows
            .iter()
            .map(task_instance_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        // time out started instances that overran their task's budget
        let mut timed_out = Vec::new();
        for task_instance in task_instances.iter_mut() {
            if task_instance.status.is_terminal() {
                continue;
            }
            let Some(task) = workflow.task(&task_instance.task) else {
                continue;
            };
            let Some(started_at) = task_instance.started_at else {
                continue;
            };
            if now <= started_at + Duration::seconds(task.timeout().as_secs() as i64) {
                continue;
            }
            sqlx::query(
                "UPDATE task_instances SET status = 'timed_out', ended_at = $2, updated_at = $2 WHERE id = $1",
            )
            .bind(task_instance.id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

            task_instance.status = TaskInstanceStatus::TimedOut;
            task_instance.ended_at = Some(now);
            insert_event(
                &mut tx,
                &NewEvent::for_task(EventKind::TaskTimedOut, task_instance, now, None),
            )
            .await?;
            timed_out.push(task_instance.task.clone());
        }

        let statuses: HashMap<String, TaskInstanceStatus> = task_instances
            .iter()
            .map(|ti| (ti.task.clone(), ti.status))
            .collect();
        let resolution = workflow.resolver().resolve(&statuses);

        let mut queued = Vec::new();
        for name in &resolution.to_queue {
            let Some(task) = workflow.task(name) else {
                continue;
            };
            let inserted = sqlx::query(
                r#"
                INSERT INTO task_instances (task, workflow_instance, scheduled, push, status,
                                            priority, run_at, attempts, params)
                VALUES ($1, $2, FALSE, $3, 'queued', $4, $5, 0, $6)
                ON CONFLICT (workflow_instance, task) DO NOTHING
                RETURNING id
                "#,
            )
            .bind(name)
            .bind(instance_id)
            .bind(task.is_push())
            .bind(task.default_priority())
            .bind(now)
            .bind(task.params())
            .fetch_optional(&mut *tx)
            .await
            .map_err(map_db_err)?;

            if let Some(row) = inserted {
                let task_instance_id: i64 = row.get("id");
                insert_event(
                    &mut tx,
                    &NewEvent {
                        workflow_instance: Some(instance_id),
                        task_instance: Some(task_instance_id),
                        timestamp: now,
                        kind: EventKind::TaskQueued,
                        message: None,
                    },
                )
                .await?;
                queued.push(name.clone());
            }
        }

        let transition = workflow_transition(instance.status, resolution.verdict);
        if let Some(new_status) = transition {
            sqlx::query(
                r#"
                UPDATE workflow_instances
                SET status = $2,
                    started_at = COALESCE(started_at, $3),
                    ended_at = COALESCE(ended_at, $4),
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(instance_id)
            .bind(new_status.as_str())
            .bind(now)
            .bind(new_status.is_terminal().then_some(now))
            .execute(&mut *tx)
            .await
            .map_err(map_db_err)?;

            let kind = match new_status {
                WorkflowInstanceStatus::Running => EventKind::WorkflowStarted,
                WorkflowInstanceStatus::Success => EventKind::WorkflowSuccess,
                WorkflowInstanceStatus::Failed => EventKind::WorkflowFailed,
                WorkflowInstanceStatus::Queued => EventKind::WorkflowQueued,
            };
            insert_event(
                &mut tx,
                &NewEvent::for_workflow(kind, instance_id, now, None),
            )
            .await?;
        }

        tx.commit().await.map_err(map_db_err)?;

        debug!(
            instance_id,
            verdict = ?resolution.verdict,
            queued = queued.len(),
            "advanced workflow run"
        );
        Ok(RunAdvance {
            verdict: resolution.verdict,
            queued,
            timed_out,
            transition,
        })
    }

    #[instrument(skip(self, new), fields(task = %new.task))]
    async fn insert_task_instance(
        &self,
        new: NewTaskInstance,
    ) -> Result<TaskInstance, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO task_instances (task, workflow_instance, scheduled, push, status,
                                        priority, run_at, attempts, params)
            VALUES ($1, $2, $3, $4, 'queued', $5, $6, $7, $8)
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(&new.task)
        .bind(new.workflow_instance)
        .bind(new.scheduled)
        .bind(new.push)
        .bind(new.priority)
        .bind(new.run_at)
        .bind(new.attempts)
        .bind(&new.params)
        .fetch_one(&self.pool)
        .await
        .map_err(map_db_err)?;

        task_instance_from_row(&row)
    }

    async fn get_task_instance(&self, id: i64) -> Result<Option<TaskInstance>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(task_instance_from_row).transpose()
    }

    async fn task_instances_for_run(
        &self,
        instance_id: i64,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE workflow_instance = $1 ORDER BY id"
        ))
        .bind(instance_id)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.iter().map(task_instance_from_row).collect()
    }

    async fn most_recent_scheduled_task_instance(
        &self,
        task: &str,
    ) -> Result<Option<TaskInstance>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {TASK_INSTANCE_COLUMNS}
            FROM task_instances
            WHERE task = $1 AND scheduled AND workflow_instance IS NULL
            ORDER BY run_at DESC
            LIMIT 1
            "#,
        ))
        .bind(task)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(task_instance_from_row).transpose()
    }

    async fn live_standalone_instances(
        &self,
        task: &str,
    ) -> Result<Vec<TaskInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_INSTANCE_COLUMNS}
            FROM task_instances
            WHERE task = $1
              AND workflow_instance IS NULL
              AND status IN ('queued', 'pushed', 'running', 'retrying')
            ORDER BY id
            "#,
        ))
        .bind(task)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.iter().map(task_instance_from_row).collect()
    }

    async fn mark_task_instance_timed_out(
        &self,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE task_instances
            SET status = 'timed_out', ended_at = $2, updated_at = $2
            WHERE id = $1 AND status IN ('queued', 'pushed', 'running', 'retrying')
            RETURNING {TASK_INSTANCE_COLUMNS}
            "#,
        ))
        .bind(id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        row.as_ref().map(task_instance_from_row).transpose()
    }

    #[instrument(skip(self, destinations))]
    async fn claim_due_push_instances(
        &self,
        now: DateTime<Utc>,
        destinations: &[String],
        limit: i64,
    ) -> Result<Box<dyn ClaimedPushBatch>, StoreError> {
        if destinations.is_empty() {
            return Ok(Box::new(PostgresClaimedBatch {
                tx: None,
                instances: Vec::new(),
                now,
            }));
        }

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        // The transaction stays open while the pusher talks to the workers;
        // SKIP LOCKED lets a parallel pusher claim disjoint rows.
        let rows = sqlx::query(&format!(
            r#"
            SELECT {prefixed}
            FROM task_instances ti
            JOIN tasks t ON t.name = ti.task
            WHERE ti.status = 'queued'
              AND ti.push
              AND ti.run_at <= $1
              AND t.push_destination = ANY($2)
            ORDER BY ti.priority DESC, ti.run_at ASC, ti.id ASC
            LIMIT $3
            FOR UPDATE OF ti SKIP LOCKED
            "#,
            prefixed = prefixed_task_instance_columns("ti"),
        ))
        .bind(now)
        .bind(destinations)
        .bind(limit)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let instances = rows
            .iter()
            .map(task_instance_from_row)
            .collect::<Result<Vec<_>, _>>()?;

        if !instances.is_empty() {
            debug!(count = instances.len(), "claimed push instances");
        }
        Ok(Box::new(PostgresClaimedBatch {
            tx: Some(tx),
            instances,
            now,
        }))
    }

    async fn in_flight_push_instances(&self) -> Result<Vec<TaskInstance>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {TASK_INSTANCE_COLUMNS}
            FROM task_instances
            WHERE push AND status IN ('pushed', 'running', 'retrying')
            ORDER BY id
            "#,
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.iter().map(task_instance_from_row).collect()
    }

    #[instrument(skip(self, update))]
    async fn apply_remote_state(
        &self,
        id: i64,
        update: RemoteStateUpdate,
        now: DateTime<Utc>,
    ) -> Result<SyncOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;

        let row = sqlx::query(&format!(
            "SELECT {TASK_INSTANCE_COLUMNS} FROM task_instances WHERE id = $1 FOR UPDATE"
        ))
        .bind(id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?
        .ok_or(StoreError::TaskInstanceNotFound(id))?;
        let instance = task_instance_from_row(&row)?;

        if instance.status == update.status {
            return Ok(SyncOutcome::Unchanged);
        }
        if !instance.status.can_transition_to(update.status) {
            // abort the transaction, then record the diagnostic outside it
            drop(tx);
            self.append_event(NewEvent::for_task(
                EventKind::InvariantViolation,
                &instance,
                now,
                Some(format!(
                    "worker reported illegal transition {} -> {}",
                    instance.status, update.status
                )),
            ))
            .await?;
            return Ok(SyncOutcome::Rejected {
                from: instance.status,
            });
        }

        let terminal = update.status.is_terminal();
        let started_at = update
            .started_at
            .or((update.status == TaskInstanceStatus::Running).then_some(now));
        let ended_at = update.ended_at.or(terminal.then_some(now));

        sqlx::query(
            r#"
            UPDATE task_instances
            SET status = $2,
                started_at = COALESCE($3, started_at),
                ended_at = COALESCE($4, ended_at),
                updated_at = $5
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(update.status.as_str())
        .bind(started_at)
        .bind(ended_at)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(map_db_err)?;

        if terminal {
            let kind = match update.status {
                TaskInstanceStatus::Success => EventKind::TaskSuccess,
                TaskInstanceStatus::TimedOut => EventKind::TaskTimedOut,
                _ => EventKind::TaskFailed,
            };
            insert_event(
                &mut tx,
                &NewEvent::for_task(kind, &instance, now, update.message.clone()),
            )
            .await?;
        }

        tx.commit().await.map_err(map_db_err)?;
        debug!(task_instance = id, status = %update.status, "applied remote state");
        Ok(SyncOutcome::Applied { terminal })
    }

    async fn append_event(&self, event: NewEvent) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO taskflow_events (workflow_instance, task_instance, timestamp, event, message)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.workflow_instance)
        .bind(event.task_instance)
        .bind(event.timestamp)
        .bind(event.kind.as_str())
        .bind(&event.message)
        .execute(&self.pool)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    async fn events_for_workflow_instance(
        &self,
        workflow_instance: i64,
    ) -> Result<Vec<TaskflowEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, workflow_instance, task_instance, timestamp, event, message
            FROM taskflow_events
            WHERE workflow_instance = $1
            ORDER BY id
            "#,
        )
        .bind(workflow_instance)
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        Ok(rows
            .iter()
            .map(|row| TaskflowEvent {
                id: row.get("id"),
                workflow_instance: row.get("workflow_instance"),
                task_instance: row.get("task_instance"),
                timestamp: row.get("timestamp"),
                event: row.get("event"),
                message: row.get("message"),
            })
            .collect())
    }
}

/// Claimed dispatch batch backed by an open postgres transaction.
struct PostgresClaimedBatch {
    tx: Option<sqlx::Transaction<'static, sqlx::Postgres>>,
    instances: Vec<TaskInstance>,
    now: DateTime<Utc>,
}

impl PostgresClaimedBatch {
    fn find(&self, id: i64) -> Result<&TaskInstance, StoreError> {
        self.instances
            .iter()
            .find(|instance| instance.id == id)
            .ok_or(StoreError::TaskInstanceNotFound(id))
    }

    fn tx_mut(
        &mut self,
    ) -> Result<&mut sqlx::Transaction<'static, sqlx::Postgres>, StoreError> {
        self.tx
            .as_mut()
            .ok_or_else(|| StoreError::Database("claimed batch already committed".to_string()))
    }
}

#[async_trait]
impl ClaimedPushBatch for PostgresClaimedBatch {
    fn instances(&self) -> &[TaskInstance] {
        &self.instances
    }

    async fn mark_pushed(&mut self, id: i64, push_data: Option<Value>) -> Result<(), StoreError> {
        let event = NewEvent::for_task(EventKind::TaskPushed, self.find(id)?, self.now, None);
        let now = self.now;
        let tx = self.tx_mut()?;

        sqlx::query(
            "UPDATE task_instances SET status = 'pushed', push_data = $2, attempts = attempts + 1, updated_at = $3 WHERE id = $1",
        )
        .bind(id)
        .bind(&push_data)
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(map_db_err)?;

        insert_event(tx, &event).await
    }

    async fn mark_push_failed(
        &mut self,
        id: i64,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), StoreError> {
        let instance = self.find(id)?.clone();
        let now = self.now;
        let tx = self.tx_mut()?;

        match retry_at {
            Some(retry_at) => {
                sqlx::query(
                    "UPDATE task_instances SET status = 'queued', run_at = $2, attempts = attempts + 1, updated_at = $3 WHERE id = $1",
                )
                .bind(id)
                .bind(retry_at)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;

                insert_event(
                    tx,
                    &NewEvent::for_task(
                        EventKind::TaskPushFailed,
                        &instance,
                        now,
                        Some(error.to_string()),
                    ),
                )
                .await
            }
            None => {
                sqlx::query(
                    "UPDATE task_instances SET status = 'failed', ended_at = $2, attempts = attempts + 1, updated_at = $2 WHERE id = $1",
                )
                .bind(id)
                .bind(now)
                .execute(&mut **tx)
                .await
                .map_err(map_db_err)?;

                insert_event(
                    tx,
                    &NewEvent::for_task(
                        EventKind::TaskPushFailed,
                        &instance,
                        now,
                        Some(error.to_string()),
                    ),
                )
                .await?;
                insert_event(
                    tx,
                    &NewEvent::for_task(
                        EventKind::TaskFailed,
                        &instance,
                        now,
                        Some("dispatch retries exhausted".to_string()),
                    ),
                )
                .await
            }
        }
    }

    async fn commit(mut self: Box<Self>) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.commit().await.map_err(map_db_err)?;
        }
        Ok(())
    }
}

async fn insert_event(
    tx: &mut sqlx::Transaction<'static, sqlx::Postgres>,
    event: &NewEvent,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        INSERT INTO taskflow_events (workflow_instance, task_instance, timestamp, event, message)
        VALUES ($1, $2, $3, $4, $5)
        "#,
    )
    .bind(event.workflow_instance)
    .bind(event.task_instance)
    .bind(event.timestamp)
    .bind(event.kind.as_str())
    .bind(&event.message)
    .execute(&mut **tx)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

fn prefixed_task_instance_columns(alias: &str) -> String {
    TASK_INSTANCE_COLUMNS
        .split(", ")
        .map(|column| format!("{alias}.{column}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn workflow_instance_from_row(row: &PgRow) -> Result<WorkflowInstance, StoreError> {
    let status: String = row.get("status");
    Ok(WorkflowInstance {
        id: row.get("id"),
        workflow: row.get("workflow"),
        scheduled: row.get("scheduled"),
        run_at: row.get("run_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        status: status.parse()?,
        params: row.get("params"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn task_instance_from_row(row: &PgRow) -> Result<TaskInstance, StoreError> {
    let status: String = row.get("status");
    Ok(TaskInstance {
        id: row.get("id"),
        task: row.get("task"),
        workflow_instance: row.get("workflow_instance"),
        scheduled: row.get("scheduled"),
        push: row.get("push"),
        status: status.parse()?,
        priority: row.get("priority"),
        run_at: row.get("run_at"),
        started_at: row.get("started_at"),
        ended_at: row.get("ended_at"),
        attempts: row.get("attempts"),
        params: row.get("params"),
        push_data: row.get("push_data"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

fn map_db_err(err: sqlx::Error) -> StoreError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => StoreError::Transient(err.to_string()),
        sqlx::Error::Database(db) => match db.code().as_deref() {
            // serialization_failure, deadlock_detected, admin_shutdown
            Some("40001") | Some("40P01") | Some("57P01") => {
                StoreError::Transient(err.to_string())
            }
            _ => StoreError::Database(err.to_string()),
        },
        _ => StoreError::Database(err.to_string()),
    }
}
