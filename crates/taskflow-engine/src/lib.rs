//! # Taskflow Engine
//!
//! The two periodic workers that drive taskflow:
//!
//! - [`Scheduler`]: fires recurring workflows from their cron schedules
//!   (with catch-up), starts due queued runs, advances running workflow
//!   instances layer by layer, and schedules standalone recurring tasks
//!   (including their timeout/retry policy).
//! - [`Pusher`]: claims due queued push instances under row locks, hands
//!   them to the matching [`PushWorker`] per destination, and reconciles
//!   worker-observed states back into the store.
//!
//! Both loops take a store handle, a clock, and a registry snapshot as
//! explicit inputs; there are no globals. They may run in one process or in
//! separate processes, and multiple replicas are safe because every
//! state-changing transaction locks the parent workflow instance row and
//! dispatch claiming skips locked rows.

pub mod backoff;
pub mod config;
pub mod error;
pub mod push_worker;
pub mod pusher;
pub mod scheduler;

pub use backoff::{retry_transient, Backoff};
pub use config::{PusherConfig, SchedulerConfig};
pub use error::EngineError;
pub use push_worker::{PushOutcome, PushWorker, PushWorkerError, PushWorkerSet, RemoteState};
pub use pusher::{Pusher, PusherTick};
pub use scheduler::{Scheduler, SchedulerTick};
