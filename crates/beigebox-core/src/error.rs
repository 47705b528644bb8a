use thiserror::Error;

#[derive(Debug, Error)]
pub enum BeigeBoxError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Runtime overlay error: {0}")]
    RuntimeOverlay(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, BeigeBoxError>;
