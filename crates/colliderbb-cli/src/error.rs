use colliderbb::engine::error::EngineError;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CliError>;

#[derive(Debug, Error)]
pub enum CliError {
    /// Failure inside the library: installation, leveling, verification mismatches.
    #[error(transparent)]
    Core(#[from] EngineError),

    /// Merged settings that the library builders refuse.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A checkpoint, table or TOML file that could not be read or parsed.
    #[error("Cannot read '{path}': {source}", path = path.display())]
    FileParsing {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
