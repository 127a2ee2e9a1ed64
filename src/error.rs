use thiserror::Error;

pub type SyncResult<T> = Result<T, SyncError>;

/// Failures surfaced by the synchronization core.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("invalid user id: {0:?}")]
    InvalidUserId(String),

    #[error("invalid device id: {0:?}")]
    InvalidDeviceId(String),

    #[error("invalid book id: {0:?}")]
    InvalidBookId(String),

    #[error("invalid chapter id: {0:?}")]
    InvalidChapterId(String),

    #[error("progress must be within [0, 1], got {0}")]
    ProgressOutOfRange(f64),

    #[error("invalid timestamp {value:?}: {reason}")]
    InvalidTimestamp { value: String, reason: String },

    /// Socket read/write failure. Only ever terminates the affected connection.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection hub is not running")]
    HubClosed,

    #[error("progress store error: {0}")]
    Store(#[from] anyhow::Error),
}

impl SyncError {
    /// Errors the caller caused; reported as 4xx over HTTP.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            SyncError::InvalidUserId(_)
                | SyncError::InvalidDeviceId(_)
                | SyncError::InvalidBookId(_)
                | SyncError::InvalidChapterId(_)
                | SyncError::ProgressOutOfRange(_)
                | SyncError::InvalidTimestamp { .. }
        )
    }
}
