use thiserror::Error;

use wirevae_core::CoreError;

/// Errors raised by the wireframe autoencoder.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VaeError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Batch item has no valid segment, so its count class is undefined.
    #[error("Batch item {index} has no valid segments")]
    EmptyWireframe { index: usize },
}

pub type Result<T> = std::result::Result<T, VaeError>;
