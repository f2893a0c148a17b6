use serde::{Deserialize, Serialize};

/// Errors surfaced by the storage and rendering layers.
///
/// Store-level rejections carry the store's last error text verbatim.
/// Lookups that simply find nothing return `None` instead of an error.
#[derive(Debug, thiserror::Error)]
pub enum GeoStoreError {
    /// The underlying feature store rejected an operation.
    #[error("{0}")]
    Store(String),

    /// SQL outside what the store understands.
    #[error("Unsupported SQL: {0}")]
    UnsupportedSql(String),

    #[error("Not opened")]
    NotOpened,

    #[error("'{0}' not found")]
    NotFound(String),

    #[error("Dataset is read only")]
    ReadOnly,

    /// No unique name could be produced for a new object.
    #[error("Failed to create unique name for '{0}'")]
    InvalidName(String),

    #[error("Operation canceled")]
    Canceled,

    #[error("'{0}' has unsupported type")]
    Unsupported(String),

    #[error("Copy failed: {0}")]
    CopyFailed(String),

    #[error("Move failed: {0}")]
    MoveFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    /// A bounded lock wait expired.
    #[error("Lock wait timed out")]
    Timeout,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, GeoStoreError>;

/// Status codes reported through progress callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResultCode {
    Success,
    InProcess,
    Warning,
    Finished,
    Canceled,
    CopyFailed,
    MoveFailed,
    DeleteFailed,
    CreateFailed,
    InsertFailed,
    Unsupported,
}

impl GeoStoreError {
    /// The progress code matching this error.
    pub fn code(&self) -> ResultCode {
        match self {
            GeoStoreError::Canceled => ResultCode::Canceled,
            GeoStoreError::CopyFailed(_) => ResultCode::CopyFailed,
            GeoStoreError::MoveFailed(_) => ResultCode::MoveFailed,
            GeoStoreError::DeleteFailed(_) => ResultCode::DeleteFailed,
            GeoStoreError::Unsupported(_) | GeoStoreError::UnsupportedSql(_) => {
                ResultCode::Unsupported
            }
            _ => ResultCode::CreateFailed,
        }
    }

    pub(crate) fn copy_or_move(moving: bool, message: impl Into<String>) -> Self {
        if moving {
            GeoStoreError::MoveFailed(message.into())
        } else {
            GeoStoreError::CopyFailed(message.into())
        }
    }
}
