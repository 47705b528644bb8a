use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Conversation not found: {id}")]
    ConversationNotFound { id: String },

    #[error("Harness run not found: {id}")]
    RunNotFound { id: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;
