use std::io;
use std::path::PathBuf;

use blocks::BlockError;
use inplace::RecoveryError;
use thiserror::Error;

use crate::{EXIT_ABORTED, EXIT_USAGE};

/// Failures that stop a command before it reaches the update engine's own
/// outcome reporting.
#[derive(Debug, Error)]
pub enum CliError {
    /// Invalid combination of arguments.
    #[error("{0}")]
    Usage(String),
    /// A file could not be read or written.
    #[error("{}: {source}", path.display())]
    Io {
        /// Path that failed.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// The configuration file is not valid.
    #[error("invalid configuration {}: {source}", path.display())]
    Config {
        /// Configuration file path.
        path: PathBuf,
        /// The decoding error.
        #[source]
        source: serde_json::Error,
    },
    /// A file could not be hashed.
    #[error("cannot hash {}: {source}", path.display())]
    Hash {
        /// File being hashed.
        path: PathBuf,
        /// The hashing error.
        #[source]
        source: BlockError,
    },
    /// A journal entry could not be resolved.
    #[error(transparent)]
    Recovery(#[from] RecoveryError),
}

impl CliError {
    /// Returns the process exit code for the error.
    #[must_use]
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Recovery(_) => EXIT_ABORTED,
            Self::Usage(_) | Self::Io { .. } | Self::Config { .. } | Self::Hash { .. } => {
                EXIT_USAGE
            }
        }
    }
}
