use store::StoreError;
use thiserror::Error;

/// Errors that can occur while allocating or tracking experiments
#[derive(Error, Debug)]
pub enum ExperimentError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Invalid goal: {0}")]
    InvalidGoal(String),
}

pub type Result<T> = std::result::Result<T, ExperimentError>;
