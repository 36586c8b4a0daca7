//! Engine error types

use taskflow_storage::StoreError;

use crate::push_worker::PushWorkerError;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    PushWorker(#[from] PushWorkerError),

    /// An instance references a workflow the registry does not know.
    #[error("no workflow named `{0}` is registered")]
    UnknownWorkflow(String),
}
