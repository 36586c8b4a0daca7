//! Store adapter for the taskflow engine
//!
//! [`store::TaskflowStore`] is the seam between the periodic loops and the
//! relational store: typed reads/writes over the five taskflow tables plus
//! two composite operations that need transactions and row locks (workflow
//! layer advancement and the dispatch claim). [`PostgresTaskflowStore`] is
//! the production implementation; [`InMemoryTaskflowStore`] mirrors its
//! observable semantics for tests.

pub mod memory;
pub mod postgres;
pub mod store;

pub use memory::InMemoryTaskflowStore;
pub use postgres::PostgresTaskflowStore;
pub use store::{
    ClaimedPushBatch, EventKind, NewEvent, NewTaskInstance, NewWorkflowInstance,
    RemoteStateUpdate, RunAdvance, StoreError, StoreScheduleSource, SyncOutcome, TaskInstance,
    TaskflowEvent, TaskflowStore, WorkflowInstance,
};

/// Schema migrations, applied at process startup.
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
