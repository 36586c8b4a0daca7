//! Scheduler scenarios over the in-memory store
//!
//! Fixture DAG: task1, task2 -> task3 -> task4, workflow schedule
//! `0 6 * * *`. Task statuses are driven through the store's remote-state
//! application so every transition respects the task state machine.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, TimeZone, Utc};

use taskflow_core::clock::{Clock, FixedClock};
use taskflow_core::definition::{Task, Workflow};
use taskflow_core::registry::Registry;
use taskflow_core::status::{TaskInstanceStatus, WorkflowInstanceStatus};
use taskflow_engine::{Scheduler, SchedulerConfig};
use taskflow_storage::{
    InMemoryTaskflowStore, NewTaskInstance, NewWorkflowInstance, RemoteStateUpdate, TaskInstance,
    TaskflowStore,
};

fn utc(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
}

struct Harness {
    store: InMemoryTaskflowStore,
    clock: Arc<FixedClock>,
    scheduler: Scheduler,
}

async fn register(store: &InMemoryTaskflowStore, registry: &Registry, workflow: Workflow) {
    store.upsert_workflow(&workflow).await.unwrap();
    for task in workflow.tasks() {
        store.upsert_task(task).await.unwrap();
    }
    registry.add_workflow(workflow);
}

/// task1, task2 -> task3 -> task4 on `workflow1`, plus an unscheduled
/// `workflow2`. Generous task timeouts keep the timeout policy out of the
/// scenarios that do not exercise it.
async fn harness(now: DateTime<Utc>) -> Harness {
    let store = InMemoryTaskflowStore::new();
    let registry = Arc::new(Registry::new());

    let workflow1 = Workflow::builder("workflow1")
        .active(true)
        .schedule("0 6 * * *")
        .task(Task::builder("task1").active(true).timeout(StdDuration::from_secs(3600)))
        .task(Task::builder("task2").active(true).timeout(StdDuration::from_secs(3600)))
        .task(
            Task::builder("task3")
                .active(true)
                .timeout(StdDuration::from_secs(3600))
                .depends_on("task1")
                .depends_on("task2"),
        )
        .task(
            Task::builder("task4")
                .active(true)
                .timeout(StdDuration::from_secs(3600))
                .depends_on("task3"),
        )
        .build()
        .unwrap();
    register(&store, &registry, workflow1).await;

    let workflow2 = Workflow::builder("workflow2").active(true).build().unwrap();
    register(&store, &registry, workflow2).await;

    let clock = Arc::new(FixedClock::new(now));
    let scheduler = Scheduler::new(
        Arc::new(store.clone()),
        registry,
        clock.clone(),
        SchedulerConfig::default(),
    );
    Harness {
        store,
        clock,
        scheduler,
    }
}

async fn seed_scheduled_instance(harness: &Harness, run_at: DateTime<Utc>) -> i64 {
    harness
        .store
        .create_workflow_instance(NewWorkflowInstance {
            workflow: "workflow1".to_string(),
            scheduled: true,
            run_at,
            params: None,
        })
        .await
        .unwrap()
        .id
}

fn task_instance(harness: &Harness, name: &str) -> TaskInstance {
    harness
        .store
        .all_task_instances()
        .into_iter()
        .find(|ti| ti.task == name)
        .unwrap_or_else(|| panic!("no task instance for `{name}`"))
}

/// Walk a task instance through worker-observed states.
async fn drive_task(harness: &Harness, name: &str, statuses: &[TaskInstanceStatus]) {
    let instance = task_instance(harness, name);
    for status in statuses {
        harness
            .store
            .apply_remote_state(
                instance.id,
                RemoteStateUpdate {
                    status: *status,
                    started_at: None,
                    ended_at: None,
                    message: None,
                },
                harness.clock.now(),
            )
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn recurring_workflow_fires_queue_ahead() {
    let h = harness(utc(2017, 6, 3, 6, 0, 0)).await;

    h.scheduler.tick().await.unwrap();

    let instances = h.store.all_workflow_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, WorkflowInstanceStatus::Queued);
    assert!(instances[0].scheduled);
    assert_eq!(instances[0].run_at, utc(2017, 6, 4, 6, 0, 0));
    assert!(h.store.all_task_instances().is_empty());

    // idempotent per cadence: re-running with the clock fixed never
    // produces a second scheduled instance
    for _ in 0..3 {
        h.scheduler.tick().await.unwrap();
    }
    assert_eq!(h.store.all_workflow_instances().len(), 1);
}

#[tokio::test]
async fn due_queued_run_starts_first_layer() {
    let h = harness(utc(2017, 6, 3, 6, 0, 45)).await;
    let instance_id = seed_scheduled_instance(&h, utc(2017, 6, 3, 6, 0, 0)).await;

    h.scheduler.tick().await.unwrap();

    let instance = h
        .store
        .get_workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, WorkflowInstanceStatus::Running);
    assert!(instance.started_at.is_some());

    let mut tasks: Vec<String> = h
        .store
        .all_task_instances()
        .into_iter()
        .map(|ti| {
            assert_eq!(ti.status, TaskInstanceStatus::Queued);
            assert_eq!(ti.workflow_instance, Some(instance_id));
            ti.task
        })
        .collect();
    tasks.sort();
    assert_eq!(tasks, vec!["task1", "task2"]);

    // advancement is idempotent: one instance per (run, task)
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.store.all_task_instances().len(), 2);
}

#[tokio::test]
async fn running_layer_makes_no_changes() {
    let h = harness(utc(2017, 6, 3, 6, 0, 45)).await;
    seed_scheduled_instance(&h, utc(2017, 6, 3, 6, 0, 0)).await;
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "task1", &[TaskInstanceStatus::Running]).await;
    drive_task(&h, "task2", &[TaskInstanceStatus::Running]).await;

    h.clock.set(utc(2017, 6, 3, 6, 12, 0));
    h.scheduler.tick().await.unwrap();

    let instances = h.store.all_task_instances();
    assert_eq!(instances.len(), 2);
    for instance in instances {
        assert_eq!(instance.status, TaskInstanceStatus::Running);
    }
    assert_eq!(
        h.store.all_workflow_instances()[0].status,
        WorkflowInstanceStatus::Running
    );
}

#[tokio::test]
async fn completed_layer_queues_the_next() {
    let h = harness(utc(2017, 6, 3, 6, 0, 45)).await;
    seed_scheduled_instance(&h, utc(2017, 6, 3, 6, 0, 0)).await;
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "task1", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;
    drive_task(&h, "task2", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;

    h.clock.set(utc(2017, 6, 3, 6, 12, 0));
    h.scheduler.tick().await.unwrap();

    let task3 = task_instance(&h, "task3");
    assert_eq!(task3.status, TaskInstanceStatus::Queued);
    assert_eq!(h.store.all_task_instances().len(), 3);
    assert_eq!(
        h.store.all_workflow_instances()[0].status,
        WorkflowInstanceStatus::Running
    );
}

#[tokio::test]
async fn full_success_completes_the_run() {
    let h = harness(utc(2017, 6, 3, 6, 0, 45)).await;
    let instance_id = seed_scheduled_instance(&h, utc(2017, 6, 3, 6, 0, 0)).await;
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "task1", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;
    drive_task(&h, "task2", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "task3", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "task4", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;

    h.scheduler.tick().await.unwrap();

    let instance = h
        .store
        .get_workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, WorkflowInstanceStatus::Success);
    assert!(instance.ended_at.is_some());
    assert_eq!(h.store.all_task_instances().len(), 4);

    // terminal status is monotone and no further work is queued
    h.scheduler.tick().await.unwrap();
    let instance = h
        .store
        .get_workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, WorkflowInstanceStatus::Success);
    assert_eq!(h.store.all_task_instances().len(), 4);

    // at most one task instance per (run, task)
    let mut tasks: Vec<String> = h
        .store
        .task_instances_for_run(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|ti| ti.task)
        .collect();
    tasks.sort();
    let before = tasks.len();
    tasks.dedup();
    assert_eq!(tasks.len(), before);
    assert_eq!(before, 4);

    let events: Vec<String> = h
        .store
        .events_for_workflow_instance(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.event)
        .collect();
    assert!(events.contains(&"workflow_started".to_string()));
    assert!(events.contains(&"workflow_success".to_string()));
}

#[tokio::test]
async fn failure_fails_the_run_and_stops_downstream() {
    let h = harness(utc(2017, 6, 3, 6, 0, 45)).await;
    let instance_id = seed_scheduled_instance(&h, utc(2017, 6, 3, 6, 0, 0)).await;
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "task1", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;
    drive_task(&h, "task2", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "task3", &[TaskInstanceStatus::Running, TaskInstanceStatus::Failed]).await;

    h.scheduler.tick().await.unwrap();

    let instance = h
        .store
        .get_workflow_instance(instance_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, WorkflowInstanceStatus::Failed);
    assert!(instance.ended_at.is_some());

    // task4 is never queued
    assert_eq!(h.store.all_task_instances().len(), 3);
    assert!(h
        .store
        .all_task_instances()
        .iter()
        .all(|ti| ti.task != "task4"));

    // failed is monotone
    h.scheduler.tick().await.unwrap();
    assert_eq!(
        h.store
            .get_workflow_instance(instance_id)
            .await
            .unwrap()
            .unwrap()
            .status,
        WorkflowInstanceStatus::Failed
    );

    let events: Vec<String> = h
        .store
        .events_for_workflow_instance(instance_id)
        .await
        .unwrap()
        .into_iter()
        .map(|event| event.event)
        .collect();
    assert!(events.contains(&"workflow_failed".to_string()));
}

#[tokio::test]
async fn catch_up_fires_once_at_the_most_recent_missed_slot() {
    let store = InMemoryTaskflowStore::new();
    let registry = Arc::new(Registry::new());
    let nightly = Workflow::builder("nightly")
        .active(true)
        .schedule("0 6 * * *")
        .task(Task::builder("only").active(true).timeout(StdDuration::from_secs(3600)))
        .build()
        .unwrap();
    register(&store, &registry, nightly).await;
    let clock = Arc::new(FixedClock::new(utc(2017, 6, 3, 6, 0, 0)));
    let scheduler = Scheduler::new(
        Arc::new(store.clone()),
        registry,
        clock.clone(),
        SchedulerConfig::default(),
    );
    let h = Harness {
        store,
        clock,
        scheduler,
    };

    h.scheduler.tick().await.unwrap();
    assert_eq!(h.store.all_workflow_instances().len(), 1);

    // run the 06-04 instance to completion
    h.clock.set(utc(2017, 6, 4, 6, 0, 30));
    h.scheduler.tick().await.unwrap();
    drive_task(&h, "only", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;
    h.scheduler.tick().await.unwrap();
    assert_eq!(
        h.store.all_workflow_instances()[0].status,
        WorkflowInstanceStatus::Success
    );

    // scheduler was down for days; exactly one catch-up fire, at the most
    // recent missed slot
    h.clock.set(utc(2017, 6, 10, 9, 0, 0));
    h.scheduler.tick().await.unwrap();

    let mut instances = h.store.all_workflow_instances();
    instances.sort_by_key(|instance| instance.id);
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[1].run_at, utc(2017, 6, 10, 6, 0, 0));
    assert!(instances[1].scheduled);
}

#[tokio::test]
async fn validity_window_suppresses_fires() {
    let store = InMemoryTaskflowStore::new();
    let registry = Arc::new(Registry::new());
    let expired = Workflow::builder("expired")
        .active(true)
        .schedule("0 6 * * *")
        .end_date(utc(2017, 6, 1, 0, 0, 0))
        .task(Task::builder("noop").active(true))
        .build()
        .unwrap();
    let not_yet = Workflow::builder("not-yet")
        .active(true)
        .schedule("0 6 * * *")
        .start_date(utc(2018, 1, 1, 0, 0, 0))
        .task(Task::builder("noop2").active(true))
        .build()
        .unwrap();
    register(&store, &registry, expired).await;
    register(&store, &registry, not_yet).await;

    let clock = Arc::new(FixedClock::new(utc(2017, 6, 3, 6, 0, 0)));
    let scheduler = Scheduler::new(
        Arc::new(store.clone()),
        registry,
        clock,
        SchedulerConfig::default(),
    );

    scheduler.tick().await.unwrap();
    assert!(store.all_workflow_instances().is_empty());
}

#[tokio::test]
async fn inactive_workflow_does_not_fire() {
    let store = InMemoryTaskflowStore::new();
    let registry = Arc::new(Registry::new());
    let dormant = Workflow::builder("dormant")
        .active(false)
        .schedule("0 6 * * *")
        .task(Task::builder("noop").active(true))
        .build()
        .unwrap();
    register(&store, &registry, dormant).await;

    let clock = Arc::new(FixedClock::new(utc(2017, 6, 3, 6, 0, 0)));
    let scheduler = Scheduler::new(
        Arc::new(store.clone()),
        registry,
        clock,
        SchedulerConfig::default(),
    );

    scheduler.tick().await.unwrap();
    assert!(store.all_workflow_instances().is_empty());
}

#[tokio::test]
async fn explicit_instance_of_empty_workflow_completes_immediately() {
    let h = harness(utc(2017, 6, 3, 6, 0, 45)).await;
    let instance = h
        .store
        .create_workflow_instance(NewWorkflowInstance {
            workflow: "workflow2".to_string(),
            scheduled: false,
            run_at: utc(2017, 6, 3, 6, 0, 0),
            params: None,
        })
        .await
        .unwrap();

    h.scheduler.tick().await.unwrap();

    let instance = h
        .store
        .get_workflow_instance(instance.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(instance.status, WorkflowInstanceStatus::Success);
    assert!(instance.started_at.is_some());
    assert!(instance.ended_at.is_some());
}

#[tokio::test]
async fn unknown_workflow_instance_is_skipped_not_fatal() {
    let h = harness(utc(2017, 6, 3, 6, 0, 45)).await;
    let instance = h
        .store
        .create_workflow_instance(NewWorkflowInstance {
            workflow: "ghost".to_string(),
            scheduled: false,
            run_at: utc(2017, 6, 3, 6, 0, 0),
            params: None,
        })
        .await
        .unwrap();

    h.scheduler.tick().await.unwrap();

    assert_eq!(
        h.store
            .get_workflow_instance(instance.id)
            .await
            .unwrap()
            .unwrap()
            .status,
        WorkflowInstanceStatus::Queued
    );
}

// =========================================================================
// Standalone recurring tasks
// =========================================================================

async fn standalone_harness(now: DateTime<Utc>, task: Task) -> Harness {
    let store = InMemoryTaskflowStore::new();
    let registry = Arc::new(Registry::new());
    store.upsert_task(&task).await.unwrap();
    registry.add_task(task).unwrap();

    let clock = Arc::new(FixedClock::new(now));
    let scheduler = Scheduler::new(
        Arc::new(store.clone()),
        registry,
        clock.clone(),
        SchedulerConfig::default(),
    );
    Harness {
        store,
        clock,
        scheduler,
    }
}

/// A standalone instance as an earlier scheduled fire would have left it.
async fn seed_standalone_instance(
    harness: &Harness,
    task: &str,
    run_at: DateTime<Utc>,
) -> TaskInstance {
    harness
        .store
        .insert_task_instance(NewTaskInstance {
            task: task.to_string(),
            workflow_instance: None,
            scheduled: true,
            push: false,
            priority: 0,
            run_at,
            attempts: 0,
            params: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn standalone_first_fire_waits_for_its_slot() {
    let task = Task::builder("cleanup")
        .active(true)
        .schedule("0 * * * *")
        .timeout(StdDuration::from_secs(86400))
        .build()
        .unwrap();
    let h = standalone_harness(utc(2017, 6, 3, 6, 30, 0), task).await;

    // no prior scheduled instance and the 07:00 slot has not arrived:
    // nothing is inserted
    h.scheduler.tick().await.unwrap();
    assert!(h.store.all_task_instances().is_empty());

    h.clock.set(utc(2017, 6, 3, 6, 59, 0));
    h.scheduler.tick().await.unwrap();
    assert!(h.store.all_task_instances().is_empty());
}

#[tokio::test]
async fn standalone_fire_waits_for_the_next_slot() {
    let task = Task::builder("cleanup")
        .active(true)
        .schedule("0 * * * *")
        .timeout(StdDuration::from_secs(86400))
        .build()
        .unwrap();
    let h = standalone_harness(utc(2017, 6, 3, 7, 30, 0), task).await;
    seed_standalone_instance(&h, "cleanup", utc(2017, 6, 3, 7, 0, 0)).await;
    drive_task(&h, "cleanup", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;

    // slot 08:00 has not arrived at 07:30
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.store.all_task_instances().len(), 1);

    h.clock.set(utc(2017, 6, 3, 8, 15, 0));
    h.scheduler.tick().await.unwrap();

    let mut instances = h.store.all_task_instances();
    instances.sort_by_key(|ti| ti.id);
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[1].run_at, utc(2017, 6, 3, 8, 0, 0));
    assert_eq!(instances[1].status, TaskInstanceStatus::Queued);
    assert!(instances[1].scheduled);

    // firing is idempotent per cadence
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.store.all_task_instances().len(), 2);
}

#[tokio::test]
async fn standalone_catch_up_fires_at_most_recent_missed_slot() {
    let task = Task::builder("cleanup")
        .active(true)
        .schedule("0 * * * *")
        .timeout(StdDuration::from_secs(86400))
        .build()
        .unwrap();
    let h = standalone_harness(utc(2017, 6, 3, 7, 30, 0), task).await;
    seed_standalone_instance(&h, "cleanup", utc(2017, 6, 3, 7, 0, 0)).await;
    drive_task(&h, "cleanup", &[TaskInstanceStatus::Running, TaskInstanceStatus::Success]).await;

    // hours of downtime: one fire, at the most recent missed slot
    h.clock.set(utc(2017, 6, 3, 12, 40, 0));
    h.scheduler.tick().await.unwrap();

    let mut instances = h.store.all_task_instances();
    instances.sort_by_key(|ti| ti.id);
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[1].run_at, utc(2017, 6, 3, 12, 0, 0));
}

#[tokio::test]
async fn standalone_concurrency_cap_blocks_new_fires() {
    let task = Task::builder("cleanup")
        .active(true)
        .schedule("0 * * * *")
        .concurrency(1)
        .timeout(StdDuration::from_secs(86400))
        .build()
        .unwrap();
    let h = standalone_harness(utc(2017, 6, 3, 8, 15, 0), task).await;
    seed_standalone_instance(&h, "cleanup", utc(2017, 6, 3, 7, 0, 0)).await;

    // the 07:00 instance is still live at 08:15
    h.scheduler.tick().await.unwrap();
    assert_eq!(h.store.all_task_instances().len(), 1);
}

#[tokio::test]
async fn standalone_timeout_retries_while_attempts_remain() {
    let task = Task::builder("flaky")
        .active(true)
        .schedule("0 * * * *")
        .timeout(StdDuration::from_secs(60))
        .max_retries(1)
        .build()
        .unwrap();
    let h = standalone_harness(utc(2017, 6, 3, 7, 2, 0), task).await;
    seed_standalone_instance(&h, "flaky", utc(2017, 6, 3, 7, 0, 0)).await;

    // the 07:00 instance overruns its 60s budget
    h.scheduler.tick().await.unwrap();

    let mut instances = h.store.all_task_instances();
    instances.sort_by_key(|ti| ti.id);
    assert_eq!(instances.len(), 2);
    assert_eq!(instances[0].status, TaskInstanceStatus::TimedOut);
    assert_eq!(instances[1].status, TaskInstanceStatus::Queued);
    assert!(!instances[1].scheduled);
    assert_eq!(instances[1].attempts, 0);

    let events: Vec<String> = h
        .store
        .all_events()
        .into_iter()
        .map(|event| event.event)
        .collect();
    assert!(events.contains(&"task_timed_out".to_string()));
    assert!(events.contains(&"task_retry_queued".to_string()));
}

#[tokio::test]
async fn standalone_timeout_without_attempts_left_does_not_retry() {
    let task = Task::builder("flaky")
        .active(true)
        .schedule("0 * * * *")
        .timeout(StdDuration::from_secs(60))
        .max_retries(1)
        .build()
        .unwrap();
    let h = standalone_harness(utc(2017, 6, 3, 7, 2, 0), task).await;
    // an instance whose dispatch attempts are already exhausted
    h.store
        .insert_task_instance(NewTaskInstance {
            task: "flaky".to_string(),
            workflow_instance: None,
            scheduled: true,
            push: false,
            priority: 0,
            run_at: utc(2017, 6, 3, 7, 0, 0),
            attempts: 2,
            params: None,
        })
        .await
        .unwrap();

    h.scheduler.tick().await.unwrap();

    let instances = h.store.all_task_instances();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, TaskInstanceStatus::TimedOut);
    assert_eq!(instances[0].attempts, 2);
}
