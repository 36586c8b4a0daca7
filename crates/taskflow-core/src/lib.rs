//! # Taskflow Core
//!
//! Domain types for the taskflow scheduling engine:
//!
//! - **Definitions**: immutable [`Workflow`] and [`Task`] values built by
//!   validating builders; a workflow freezes its dependency graph at build
//!   time.
//! - **Registry**: in-memory catalog of declared workflows and standalone
//!   tasks, with atomic snapshot refresh of the mutable scheduling flags.
//! - **DagResolver**: layered topological resolution of which tasks in a
//!   running workflow instance are eligible next, and the overall run verdict.
//! - **CronSchedule**: next/previous fire computation over standard 5-field
//!   cron expressions.
//! - **Clock**: the single injectable source of "now".
//!
//! Everything here is pure or in-memory; persistence and the periodic loops
//! live in the `taskflow-storage` and `taskflow-engine` crates.

pub mod clock;
pub mod cron;
pub mod dag;
pub mod definition;
pub mod registry;
pub mod status;

pub use clock::{Clock, FixedClock, SystemClock};
pub use cron::{CronSchedule, ScheduleError};
pub use dag::{DagError, DagResolver, DependencyGraph, Resolution, RunVerdict};
pub use definition::{DefinitionError, Task, TaskBuilder, Workflow, WorkflowBuilder};
pub use registry::{
    Registry, RegistryError, SchedulableKind, ScheduleFlags, ScheduleSource,
};
pub use status::{StatusParseError, TaskInstanceStatus, WorkflowInstanceStatus};
