use crate::models::execution::ExecutionRecord;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CourierError {
    #[error("session already exists for agent {0}")]
    AlreadyExists(String),

    #[error("session not found for agent {0}")]
    NotFound(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The backend call was classified as failed. The record has already been
    /// persisted; `message` is the classification's error text.
    #[error("{message}")]
    ExecutionFailed {
        message: String,
        record: Box<ExecutionRecord>,
    },

    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IPC error: {0}")]
    Ipc(String),
}

impl From<TransportError> for CourierError {
    fn from(e: TransportError) -> Self {
        CourierError::Connection(e.to_string())
    }
}
