use thiserror::Error;

use crate::backend::BackendError;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("scheduler already running")]
    AlreadyRunning,
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),
}
