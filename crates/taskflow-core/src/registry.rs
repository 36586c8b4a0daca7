//! In-memory catalog of declared workflows and standalone tasks
//!
//! The registry is read-mostly: the scheduler and pusher read immutable
//! snapshots, and `refresh` swaps in a new snapshot after re-reading the
//! mutable scheduling flags from the store. Definitional shape (task
//! membership, dependency edges) is fixed at program load and never re-read.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::warn;

use crate::definition::{Task, Workflow};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("task `{task}` belongs to workflow `{workflow}`; register the workflow instead")]
    MisconfiguredTask { task: String, workflow: String },

    /// The backing store could not be read while refreshing flags.
    #[error("schedule source unavailable: {0}")]
    SourceUnavailable(String),
}

/// Mutable scheduling flags re-read from the store on refresh.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleFlags {
    pub active: bool,
    pub schedule: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

/// Which definition table a name lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchedulableKind {
    Workflow,
    Task,
}

/// Store-side source of persisted scheduling flags.
///
/// Implemented by the storage layer; the registry only needs this one read.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn schedule_flags(
        &self,
        kind: SchedulableKind,
        name: &str,
    ) -> Result<Option<ScheduleFlags>, RegistryError>;
}

#[derive(Default, Debug)]
struct Snapshot {
    workflows: BTreeMap<String, Arc<Workflow>>,
    tasks: BTreeMap<String, Arc<Task>>,
}

/// Catalog of declared definitions with atomic snapshot refresh.
#[derive(Debug)]
pub struct Registry {
    inner: RwLock<Arc<Snapshot>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Arc::new(Snapshot::default())),
        }
    }

    /// Register (or replace) a workflow and the tasks it owns.
    pub fn add_workflow(&self, workflow: Workflow) {
        let mut guard = self.inner.write();
        let mut next = clone_snapshot(&guard);
        next.workflows
            .insert(workflow.name().to_string(), Arc::new(workflow));
        *guard = Arc::new(next);
    }

    /// Register (or replace) a standalone task.
    ///
    /// Tasks that belong to a workflow are registered through the workflow;
    /// adding one here is a misconfiguration.
    pub fn add_task(&self, task: Task) -> Result<(), RegistryError> {
        if let Some(workflow) = task.workflow() {
            return Err(RegistryError::MisconfiguredTask {
                task: task.name().to_string(),
                workflow: workflow.to_string(),
            });
        }
        let mut guard = self.inner.write();
        let mut next = clone_snapshot(&guard);
        next.tasks.insert(task.name().to_string(), Arc::new(task));
        *guard = Arc::new(next);
        Ok(())
    }

    pub fn get_workflow(&self, name: &str) -> Option<Arc<Workflow>> {
        self.inner.read().workflows.get(name).cloned()
    }

    /// Look up a task by name, searching workflow-owned tasks first and then
    /// the standalone map.
    pub fn get_task(&self, name: &str) -> Option<Arc<Task>> {
        let snapshot = self.inner.read().clone();
        for workflow in snapshot.workflows.values() {
            if let Some(task) = workflow.task(name) {
                return Some(Arc::new(task.clone()));
            }
        }
        snapshot.tasks.get(name).cloned()
    }

    /// All registered workflows, in name order.
    pub fn workflows(&self) -> Vec<Arc<Workflow>> {
        self.inner.read().workflows.values().cloned().collect()
    }

    /// All standalone tasks, in name order.
    pub fn standalone_tasks(&self) -> Vec<Arc<Task>> {
        self.inner.read().tasks.values().cloned().collect()
    }

    /// Re-read the mutable scheduling flags of every entry from the store
    /// and swap in a fresh snapshot. Entries that fail to load or re-parse
    /// keep their previous flags; the failure is logged and the refresh
    /// continues.
    pub async fn refresh(&self, source: &dyn ScheduleSource) {
        let current = self.inner.read().clone();
        let mut next = Snapshot::default();

        for (name, workflow) in &current.workflows {
            let refreshed = match source
                .schedule_flags(SchedulableKind::Workflow, name)
                .await
            {
                Ok(Some(flags)) => match workflow.with_flags(&flags) {
                    Ok(updated) => Arc::new(updated),
                    Err(error) => {
                        warn!(workflow = %name, %error, "persisted schedule is invalid; keeping previous flags");
                        workflow.clone()
                    }
                },
                Ok(None) => workflow.clone(),
                Err(error) => {
                    warn!(workflow = %name, %error, "failed to refresh workflow flags");
                    workflow.clone()
                }
            };
            next.workflows.insert(name.clone(), refreshed);
        }

        for (name, task) in &current.tasks {
            let refreshed = match source.schedule_flags(SchedulableKind::Task, name).await {
                Ok(Some(flags)) => match task.with_flags(&flags) {
                    Ok(updated) => Arc::new(updated),
                    Err(error) => {
                        warn!(task = %name, %error, "persisted schedule is invalid; keeping previous flags");
                        task.clone()
                    }
                },
                Ok(None) => task.clone(),
                Err(error) => {
                    warn!(task = %name, %error, "failed to refresh task flags");
                    task.clone()
                }
            };
            next.tasks.insert(name.clone(), refreshed);
        }

        *self.inner.write() = Arc::new(next);
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

fn clone_snapshot(snapshot: &Arc<Snapshot>) -> Snapshot {
    Snapshot {
        workflows: snapshot.workflows.clone(),
        tasks: snapshot.tasks.clone(),
    }
}
