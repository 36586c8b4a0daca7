//! Pusher loop
//!
//! One tick performs two passes:
//!
//! 1. **Dispatch**: claim due queued push instances (row-locked, skipping
//!    rows held by parallel pushers), group them by `push_destination`,
//!    hand each group to its worker, and record per-row outcomes while the
//!    rows stay locked.
//! 2. **Sync**: ask each destination's worker for the current states of its
//!    in-flight instances and apply them under the task state machine.
//!
//! Terminal task states never mutate workflow instance status here; the
//! scheduler's next advancement pass observes them and moves the workflow,
//! which keeps scheduler and pusher from racing on the same parent row.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

use taskflow_core::clock::Clock;
use taskflow_core::definition::DEFAULT_MAX_RETRIES;
use taskflow_core::registry::Registry;
use taskflow_storage::{
    ClaimedPushBatch, EventKind, NewEvent, RemoteStateUpdate, SyncOutcome, TaskInstance,
    TaskflowStore,
};

use crate::backoff::retry_transient;
use crate::config::PusherConfig;
use crate::error::EngineError;
use crate::push_worker::{PushOutcome, PushWorkerSet};

/// Summary of one pusher tick.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PusherTick {
    pub dispatched: usize,
    pub requeued: usize,
    pub failed: usize,
    pub synced: usize,
    pub rejected: usize,
}

/// The dispatch/reconcile worker.
pub struct Pusher {
    id: String,
    store: Arc<dyn TaskflowStore>,
    registry: Arc<Registry>,
    workers: PushWorkerSet,
    clock: Arc<dyn Clock>,
    config: PusherConfig,
}

impl Pusher {
    pub fn new(
        store: Arc<dyn TaskflowStore>,
        registry: Arc<Registry>,
        workers: PushWorkerSet,
        clock: Arc<dyn Clock>,
        config: PusherConfig,
    ) -> Self {
        Self {
            id: format!("pusher-{}", Uuid::new_v4()),
            store,
            registry,
            workers,
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
            destinations = ?self.workers.destinations(),
            "pusher loop starting"
        );
        if self.workers.is_empty() {
            warn!("no push workers registered; dispatch will stay idle");
        }
        loop {
            if *shutdown_rx.borrow() {
                break;
            }
            match self.tick().await {
                Ok(summary) => debug!(?summary, "pusher tick complete"),
                Err(error) => warn!(%error, "pusher tick abandoned"),
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.tick_interval) => {}
                _ = shutdown_rx.changed() => {}
            }
        }
        info!(id = %self.id, "pusher loop stopped");
    }

    /// One dispatch + sync pass.
    pub async fn tick(&self) -> Result<PusherTick, EngineError> {
        let now = self.clock.now();
        let mut summary = PusherTick::default();
        self.dispatch(now, &mut summary).await?;
        self.sync(now, &mut summary).await?;
        Ok(summary)
    }

    async fn dispatch(
        &self,
        now: DateTime<Utc>,
        summary: &mut PusherTick,
    ) -> Result<(), EngineError> {
        let destinations = self.workers.destinations();
        if destinations.is_empty() {
            return Ok(());
        }

        let mut batch = retry_transient(&self.config.store_retry, || {
            self.store
                .claim_due_push_instances(now, &destinations, self.config.dispatch_batch_size)
        })
        .await?;
        if batch.instances().is_empty() {
            return Ok(());
        }
        debug!(count = batch.instances().len(), "dispatching claimed instances");

        let mut groups: BTreeMap<String, Vec<TaskInstance>> = BTreeMap::new();
        let mut unroutable: Vec<TaskInstance> = Vec::new();
        for instance in batch.instances().to_vec() {
            let destination = self
                .registry
                .get_task(&instance.task)
                .and_then(|task| task.push_destination().map(str::to_string));
            match destination {
                Some(destination) => groups.entry(destination).or_default().push(instance),
                None => unroutable.push(instance),
            }
        }
        // definition disappeared between claim and dispatch; retry later
        for instance in unroutable {
            self.requeue_or_fail(
                batch.as_mut(),
                &instance,
                "task has no registered push destination",
                now,
                summary,
            )
            .await?;
        }

        for (destination, instances) in groups {
            let Some(worker) = self.workers.get(&destination) else {
                for instance in &instances {
                    self.requeue_or_fail(
                        batch.as_mut(),
                        instance,
                        &format!("no push worker for destination `{destination}`"),
                        now,
                        summary,
                    )
                    .await?;
                }
                continue;
            };

            match timeout(
                self.config.batch_deadline,
                worker.push_task_instances(&instances),
            )
            .await
            {
                Ok(Ok(outcomes)) => {
                    let by_id: HashMap<i64, PushOutcome> = outcomes.into_iter().collect();
                    for instance in &instances {
                        match by_id.get(&instance.id) {
                            Some(PushOutcome::Accepted { push_data }) => {
                                batch.mark_pushed(instance.id, push_data.clone()).await?;
                                summary.dispatched += 1;
                            }
                            Some(PushOutcome::Rejected { error }) => {
                                self.requeue_or_fail(
                                    batch.as_mut(),
                                    instance,
                                    error,
                                    now,
                                    summary,
                                )
                                .await?;
                            }
                            None => {
                                self.requeue_or_fail(
                                    batch.as_mut(),
                                    instance,
                                    "worker returned no outcome for instance",
                                    now,
                                    summary,
                                )
                                .await?;
                            }
                        }
                    }
                }
                Ok(Err(error)) => {
                    warn!(%destination, %error, "push worker dispatch failed");
                    for instance in &instances {
                        self.requeue_or_fail(
                            batch.as_mut(),
                            instance,
                            &error.to_string(),
                            now,
                            summary,
                        )
                        .await?;
                    }
                }
                Err(_) => {
                    warn!(
                        %destination,
                        deadline_ms = self.config.batch_deadline.as_millis() as u64,
                        "push worker dispatch exceeded deadline"
                    );
                    for instance in &instances {
                        self.requeue_or_fail(
                            batch.as_mut(),
                            instance,
                            "dispatch deadline exceeded",
                            now,
                            summary,
                        )
                        .await?;
                    }
                }
            }
        }

        batch.commit().await?;
        Ok(())
    }

    /// Requeue a failed dispatch with a delay, or fail it terminally once
    /// its attempts would exceed the task's `max_retries`.
    async fn requeue_or_fail(
        &self,
        batch: &mut dyn ClaimedPushBatch,
        instance: &TaskInstance,
        error: &str,
        now: DateTime<Utc>,
        summary: &mut PusherTick,
    ) -> Result<(), EngineError> {
        let max_retries = self
            .registry
            .get_task(&instance.task)
            .map(|task| task.max_retries() as i32)
            .unwrap_or(DEFAULT_MAX_RETRIES as i32);

        if instance.attempts + 1 > max_retries {
            batch.mark_push_failed(instance.id, error, None).await?;
            summary.failed += 1;
        } else {
            let retry_at = now + Duration::seconds(self.config.retry_delay.as_secs() as i64);
            batch
                .mark_push_failed(instance.id, error, Some(retry_at))
                .await?;
            summary.requeued += 1;
        }
        Ok(())
    }

    async fn sync(&self, now: DateTime<Utc>, summary: &mut PusherTick) -> Result<(), EngineError> {
        let in_flight = retry_transient(&self.config.store_retry, || {
            self.store.in_flight_push_instances()
        })
        .await?;
        if in_flight.is_empty() {
            return Ok(());
        }

        let mut groups: BTreeMap<String, Vec<TaskInstance>> = BTreeMap::new();
        for instance in in_flight {
            let Some(destination) = self
                .registry
                .get_task(&instance.task)
                .and_then(|task| task.push_destination().map(str::to_string))
            else {
                warn!(
                    task = %instance.task,
                    instance_id = instance.id,
                    "in-flight instance has no registered push destination; leaving unchanged"
                );
                continue;
            };
            groups.entry(destination).or_default().push(instance);
        }

        for (destination, instances) in groups {
            // destinations serviced by another pusher replica are not ours
            let Some(worker) = self.workers.get(&destination) else {
                continue;
            };

            match timeout(
                self.config.batch_deadline,
                worker.sync_task_instance_states(&instances),
            )
            .await
            {
                Ok(Ok(states)) => {
                    for state in states {
                        let update = RemoteStateUpdate {
                            status: state.status,
                            started_at: state.started_at,
                            ended_at: state.ended_at,
                            message: state.message,
                        };
                        match self.store.apply_remote_state(state.id, update, now).await {
                            Ok(SyncOutcome::Applied { .. }) => summary.synced += 1,
                            Ok(SyncOutcome::Unchanged) => {}
                            Ok(SyncOutcome::Rejected { from }) => {
                                summary.rejected += 1;
                                warn!(
                                    instance_id = state.id,
                                    from = %from,
                                    to = %state.status,
                                    "rejected illegal remote state transition"
                                );
                            }
                            Err(error) => warn!(
                                instance_id = state.id,
                                %error,
                                "failed to apply remote state; continuing"
                            ),
                        }
                    }
                }
                Ok(Err(error)) => {
                    warn!(%destination, %error, "push worker sync failed");
                    self.store
                        .append_event(NewEvent {
                            workflow_instance: None,
                            task_instance: None,
                            timestamp: now,
                            kind: EventKind::PushWorkerFailure,
                            message: Some(format!(
                                "sync failed for destination `{destination}`: {error}"
                            )),
                        })
                        .await?;
                }
                Err(_) => {
                    warn!(
                        %destination,
                        deadline_ms = self.config.batch_deadline.as_millis() as u64,
                        "push worker sync exceeded deadline"
                    );
                    self.store
                        .append_event(NewEvent {
                            workflow_instance: None,
                            task_instance: None,
                            timestamp: now,
                            kind: EventKind::PushWorkerFailure,
                            message: Some(format!(
                                "sync deadline exceeded for destination `{destination}`"
                            )),
                        })
                        .await?;
                }
            }
        }
        Ok(())
    }
}
