//! Persistence errors.

use thiserror::Error;

/// Storage failure. Fatal to the enclosing transaction: the caller sees
/// no partial state change. Repeated failures escalate to process
/// shutdown at the runner level.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("migration {version} failed: {message}")]
    Migration { version: i64, message: String },
}
