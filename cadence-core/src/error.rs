use thiserror::Error;

use crate::adapter::FetchError;

#[derive(Error, Debug)]
pub enum CadenceError {
    #[error("Store error: {0}")]
    Store(String),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, CadenceError>;
