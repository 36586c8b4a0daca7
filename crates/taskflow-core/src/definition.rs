//! Workflow and task definitions
//!
//! Definitions are immutable values. A [`WorkflowBuilder`] collects tasks and
//! their dependency edges, validates the graph (cycles, unknown references)
//! and freezes it together with its layered [`DagResolver`]. After that the
//! only thing that changes at runtime are the scheduling flags, re-read from
//! the store by the registry.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::cron::{CronSchedule, ScheduleError};
use crate::dag::{DagError, DagResolver, DependencyGraph};
use crate::registry::ScheduleFlags;

pub const DEFAULT_MAX_RETRIES: u32 = 1;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, thiserror::Error)]
pub enum DefinitionError {
    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error("duplicate task `{task}` in workflow `{workflow}`")]
    DuplicateTask { workflow: String, task: String },

    #[error("`{0}` requires concurrency >= 1")]
    ZeroConcurrency(String),

    #[error("standalone task `{0}` declares dependencies; dependencies only work inside a workflow")]
    StandaloneDependencies(String),
}

/// A named unit of work, owned by a workflow or standalone.
#[derive(Debug, Clone)]
pub struct Task {
    name: String,
    workflow: Option<String>,
    active: bool,
    title: Option<String>,
    description: Option<String>,
    concurrency: u32,
    sla: Option<Duration>,
    schedule: Option<CronSchedule>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    default_priority: i32,
    max_retries: u32,
    timeout: Duration,
    params: Option<Value>,
    push_destination: Option<String>,
    fn_def: Option<Value>,
}

impl Task {
    pub fn builder(name: impl Into<String>) -> TaskBuilder {
        TaskBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the owning workflow, if any.
    pub fn workflow(&self) -> Option<&str> {
        self.workflow.as_deref()
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    pub fn sla(&self) -> Option<Duration> {
        self.sla
    }

    pub fn schedule(&self) -> Option<&CronSchedule> {
        self.schedule.as_ref()
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn params(&self) -> Option<&Value> {
        self.params.as_ref()
    }

    pub fn push_destination(&self) -> Option<&str> {
        self.push_destination.as_deref()
    }

    /// Execution descriptor interpreted by the worker; opaque to the engine.
    pub fn fn_def(&self) -> Option<&Value> {
        self.fn_def.as_ref()
    }

    /// Push-style tasks are dispatched by the pusher loop.
    pub fn is_push(&self) -> bool {
        self.push_destination.is_some()
    }

    /// Copy of this task with refreshed scheduling flags.
    pub fn with_flags(&self, flags: &ScheduleFlags) -> Result<Task, ScheduleError> {
        let mut task = self.clone();
        task.active = flags.active;
        task.schedule = flags
            .schedule
            .as_deref()
            .map(CronSchedule::parse)
            .transpose()?;
        task.start_date = flags.start_date;
        task.end_date = flags.end_date;
        Ok(task)
    }
}

/// Builder for [`Task`]. Dependencies declared here are validated by the
/// owning [`WorkflowBuilder`]; standalone tasks must not declare any.
#[derive(Debug, Clone)]
pub struct TaskBuilder {
    name: String,
    active: bool,
    title: Option<String>,
    description: Option<String>,
    concurrency: u32,
    sla: Option<Duration>,
    schedule: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    default_priority: i32,
    max_retries: u32,
    timeout: Duration,
    params: Option<Value>,
    push_destination: Option<String>,
    fn_def: Option<Value>,
    dependencies: BTreeSet<String>,
}

impl TaskBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: false,
            title: None,
            description: None,
            concurrency: 1,
            sla: None,
            schedule: None,
            start_date: None,
            end_date: None,
            default_priority: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: DEFAULT_TIMEOUT,
            params: None,
            push_destination: None,
            fn_def: None,
            dependencies: BTreeSet::new(),
        }
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn sla(mut self, sla: Duration) -> Self {
        self.sla = Some(sla);
        self
    }

    pub fn schedule(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(expr.into());
        self
    }

    pub fn start_date(mut self, at: DateTime<Utc>) -> Self {
        self.start_date = Some(at);
        self
    }

    pub fn end_date(mut self, at: DateTime<Utc>) -> Self {
        self.end_date = Some(at);
        self
    }

    pub fn default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }

    pub fn push_destination(mut self, destination: impl Into<String>) -> Self {
        self.push_destination = Some(destination.into());
        self
    }

    pub fn fn_def(mut self, fn_def: Value) -> Self {
        self.fn_def = Some(fn_def);
        self
    }

    /// Declare a dependency on another task in the same workflow.
    pub fn depends_on(mut self, task: impl Into<String>) -> Self {
        self.dependencies.insert(task.into());
        self
    }

    /// Build a standalone task (no owning workflow).
    pub fn build(self) -> Result<Task, DefinitionError> {
        if !self.dependencies.is_empty() {
            return Err(DefinitionError::StandaloneDependencies(self.name));
        }
        self.finish(None)
    }

    fn finish(self, workflow: Option<String>) -> Result<Task, DefinitionError> {
        if self.concurrency == 0 {
            return Err(DefinitionError::ZeroConcurrency(self.name));
        }
        let schedule = self
            .schedule
            .as_deref()
            .map(CronSchedule::parse)
            .transpose()?;
        Ok(Task {
            name: self.name,
            workflow,
            active: self.active,
            title: self.title,
            description: self.description,
            concurrency: self.concurrency,
            sla: self.sla,
            schedule,
            start_date: self.start_date,
            end_date: self.end_date,
            default_priority: self.default_priority,
            max_retries: self.max_retries,
            timeout: self.timeout,
            params: self.params,
            push_destination: self.push_destination,
            fn_def: self.fn_def,
        })
    }
}

/// A named DAG of tasks with an optional recurring schedule.
#[derive(Debug, Clone)]
pub struct Workflow {
    name: String,
    active: bool,
    title: Option<String>,
    description: Option<String>,
    concurrency: u32,
    sla: Option<Duration>,
    schedule: Option<CronSchedule>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    default_priority: i32,
    tasks: BTreeMap<String, Task>,
    graph: DependencyGraph,
    resolver: DagResolver,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn active(&self) -> bool {
        self.active
    }

    pub fn title(&self) -> Option<&str> {
        self.title.as_deref()
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn concurrency(&self) -> u32 {
        self.concurrency
    }

    pub fn sla(&self) -> Option<Duration> {
        self.sla
    }

    pub fn schedule(&self) -> Option<&CronSchedule> {
        self.schedule.as_ref()
    }

    pub fn start_date(&self) -> Option<DateTime<Utc>> {
        self.start_date
    }

    pub fn end_date(&self) -> Option<DateTime<Utc>> {
        self.end_date
    }

    pub fn default_priority(&self) -> i32 {
        self.default_priority
    }

    pub fn task(&self, name: &str) -> Option<&Task> {
        self.tasks.get(name)
    }

    pub fn tasks(&self) -> impl Iterator<Item = &Task> {
        self.tasks.values()
    }

    /// Task name -> set of task names it depends on.
    pub fn dependency_graph(&self) -> &DependencyGraph {
        &self.graph
    }

    /// The layered resolver frozen at build time.
    pub fn resolver(&self) -> &DagResolver {
        &self.resolver
    }

    /// Copy of this workflow with refreshed scheduling flags.
    pub fn with_flags(&self, flags: &ScheduleFlags) -> Result<Workflow, ScheduleError> {
        let mut workflow = self.clone();
        workflow.active = flags.active;
        workflow.schedule = flags
            .schedule
            .as_deref()
            .map(CronSchedule::parse)
            .transpose()?;
        workflow.start_date = flags.start_date;
        workflow.end_date = flags.end_date;
        Ok(workflow)
    }
}

/// Builder for [`Workflow`]; validates and freezes the DAG on `build`.
#[derive(Debug, Clone)]
pub struct WorkflowBuilder {
    name: String,
    active: bool,
    title: Option<String>,
    description: Option<String>,
    concurrency: u32,
    sla: Option<Duration>,
    schedule: Option<String>,
    start_date: Option<DateTime<Utc>>,
    end_date: Option<DateTime<Utc>>,
    default_priority: i32,
    tasks: Vec<TaskBuilder>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            active: false,
            title: None,
            description: None,
            concurrency: 1,
            sla: None,
            schedule: None,
            start_date: None,
            end_date: None,
            default_priority: 0,
            tasks: Vec::new(),
        }
    }

    pub fn active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn concurrency(mut self, concurrency: u32) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn sla(mut self, sla: Duration) -> Self {
        self.sla = Some(sla);
        self
    }

    pub fn schedule(mut self, expr: impl Into<String>) -> Self {
        self.schedule = Some(expr.into());
        self
    }

    pub fn start_date(mut self, at: DateTime<Utc>) -> Self {
        self.start_date = Some(at);
        self
    }

    pub fn end_date(mut self, at: DateTime<Utc>) -> Self {
        self.end_date = Some(at);
        self
    }

    pub fn default_priority(mut self, priority: i32) -> Self {
        self.default_priority = priority;
        self
    }

    pub fn task(mut self, task: TaskBuilder) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn build(self) -> Result<Workflow, DefinitionError> {
        if self.concurrency == 0 {
            return Err(DefinitionError::ZeroConcurrency(self.name));
        }
        let schedule = self
            .schedule
            .as_deref()
            .map(CronSchedule::parse)
            .transpose()?;

        let mut graph = DependencyGraph::new();
        let mut tasks = BTreeMap::new();
        for builder in self.tasks {
            let dependencies = builder.dependencies.clone();
            let task = builder.finish(Some(self.name.clone()))?;
            if graph.insert(task.name().to_string(), dependencies).is_some() {
                return Err(DefinitionError::DuplicateTask {
                    workflow: self.name,
                    task: task.name().to_string(),
                });
            }
            tasks.insert(task.name().to_string(), task);
        }

        let resolver = DagResolver::new(&graph)?;

        Ok(Workflow {
            name: self.name,
            active: self.active,
            title: self.title,
            description: self.description,
            concurrency: self.concurrency,
            sla: self.sla,
            schedule,
            start_date: self.start_date,
            end_date: self.end_date,
            default_priority: self.default_priority,
            tasks,
            graph,
            resolver,
        })
    }
}
