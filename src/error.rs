use crate::store::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Invalid URL format: {0}")]
    InvalidUrl(String),
    #[error("Custom name '{0}' contains no usable characters")]
    InvalidAlias(String),
    #[error("This custom name is already in use. Please choose a different one.")]
    AliasTaken(String),
    #[error("Could not generate a unique id after {0} attempts")]
    IdSpaceExhausted(usize),
    #[error("Failed to access URL data: {0}")]
    Persistence(#[from] StorageError),
}
