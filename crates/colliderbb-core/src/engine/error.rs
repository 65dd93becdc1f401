use thiserror::Error;

use super::backend::BackendError;
use super::config::ConfigError;
use super::verify::VerificationError;
use crate::core::io::checkpoint::CheckpointError;
use crate::core::models::TableError;
use crate::core::models::collider::ColliderError;
use crate::core::slicing::SlicingError;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid configuration: {source}")]
    Config {
        #[from]
        source: ConfigError,
    },

    #[error("Collider model error: {source}")]
    Collider {
        #[from]
        source: ColliderError,
    },

    #[error("Slicing failed: {source}")]
    Slicing {
        #[from]
        source: SlicingError,
    },

    #[error("Optics table error: {source}")]
    Table {
        #[from]
        source: TableError,
    },

    #[error("Checkpoint error: {source}")]
    Checkpoint {
        #[from]
        source: CheckpointError,
    },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Verification(#[from] VerificationError),

    #[error("{what} failed to converge after {iterations} iterations")]
    Convergence { what: String, iterations: usize },

    #[error("Invalid model state: {0}")]
    InvalidState(String),
}
