use store::StoreError;
use thiserror::Error;

/// Errors raised while ingesting events or building profiles
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type Result<T> = std::result::Result<T, IngestError>;
