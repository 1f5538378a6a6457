//! Error handling module for the bridge

use thiserror::Error;

use crate::store::StoreError;

/// Custom error type for the bridge
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Flow file error: {0}")]
    FlowFile(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Unknown node: {0}")]
    UnknownNode(String),

    #[error("Node '{node}' does not accept input")]
    InputNotAccepted { node: String },

    #[error("Unknown error: {0}")]
    Unknown(String),
}

/// Result type for the bridge
pub type Result<T> = std::result::Result<T, Error>;

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Unknown(err.to_string())
    }
}
