use thiserror::Error;

use crate::common::error::CorralError::GenericError;

#[derive(Debug, Error)]
pub enum CorralError {
    #[error("Invalid object: {0}")]
    InvalidObject(String),
    #[error("Store error: {0}")]
    StoreError(#[from] crate::store::StoreError),
    #[error("Error: {0}")]
    GenericError(String),
}

pub fn error<T>(message: String) -> crate::Result<T> {
    Err(GenericError(message))
}

impl From<String> for CorralError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

impl From<&str> for CorralError {
    fn from(e: &str) -> Self {
        GenericError(e.to_string())
    }
}
