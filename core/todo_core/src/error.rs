use thiserror::Error;

#[derive(Debug, Error)]
pub enum TodoError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("stored value could not be parsed: {0}")]
    StorageParse(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("notification permission not granted")]
    PermissionDenied,

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("push subscription failed: {0}")]
    Subscription(String),
}

pub type Result<T> = std::result::Result<T, TodoError>;
