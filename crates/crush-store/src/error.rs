use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    SessionNotFound(String),
    #[error("message not found")]
    MessageNotFound,
    #[error("message already finished: {0}")]
    MessageFinished(String),
    #[error("part update would make accumulated length decrease")]
    NonMonotonic,
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Internal(String),
}
