use thiserror::Error;

#[derive(Error, Debug)]
pub enum EavError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Integrity error: {0}")]
    Integrity(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EavError {
    /// Whether this failure is a transient database conflict worth retrying
    /// (deadlock / busy / locked). Everything else propagates immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            EavError::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, EavError>;
