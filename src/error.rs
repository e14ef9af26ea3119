use thiserror::Error;

#[derive(Error, Debug)]
pub enum FactEngineError {
    #[error("Unknown fact key: {0}")]
    UnknownFactKey(String),

    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    #[error("Unknown issue level: {0}")]
    UnknownIssueLevel(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid fact scope for unit '{unit_id}' year {year}: {details}")]
    InvalidScope {
        unit_id: String,
        year: i32,
        details: String,
    },

    #[error("Draft not found: {0}")]
    DraftNotFound(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FactEngineError>;
