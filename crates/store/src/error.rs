//! Error types for the store crate.
//!
//! Every repository method returns [`Result`], so callers decide whether a
//! failed read degrades to a neutral value or aborts the request.

use thiserror::Error;

/// Errors that can occur while reading from or writing to the durable store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Underlying SQLite failure (locked database, constraint error, I/O)
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded
    #[error("JSON column error in {column}: {reason}")]
    Json { column: String, reason: String },

    /// A stored value could not be mapped back onto a domain type
    #[error("Invalid value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// The connection mutex was poisoned by a panicking writer
    #[error("Store connection poisoned")]
    Poisoned,

    /// Schema bootstrap failed
    #[error("Schema migration failed: {0}")]
    Migration(String),
}

impl StoreError {
    pub(crate) fn json(column: &str, err: serde_json::Error) -> Self {
        StoreError::Json {
            column: column.to_string(),
            reason: err.to_string(),
        }
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, StoreError>;
