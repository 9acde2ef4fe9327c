use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("server did not report a usable content length")]
    SizeUnknown,
    #[error("server response error, status {status}")]
    ServerResponse { status: u16 },
    #[error("transfer failed: {0}")]
    Transfer(String),
    #[error("ledger conflict: {0}")]
    Conflict(String),
    #[error("fetch already active: {0}")]
    LockHeld(String),
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("network error: {0}")]
    Network(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("io error: {0}")]
    Io(String),
}

impl CoreError {
    /// A later fetch for the same url continues from the persisted offset.
    pub fn is_resumable(&self) -> bool {
        matches!(self, CoreError::Transfer(_))
    }

    pub(crate) fn into_transfer(self) -> CoreError {
        match self {
            CoreError::Network(msg) | CoreError::Io(msg) | CoreError::Storage(msg) => {
                CoreError::Transfer(msg)
            }
            other => other,
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;
