//! Error vocabulary shared by every component in this crate.

use std::path::PathBuf;

/// The error kinds named in the core's error handling design: invalid
/// caller input, a bundle that fails structural validation, I/O failure,
/// allocation failure, and unexpected kernel behavior. Each variant carries
/// enough context to print a useful message without inspecting the variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid bundle at {path:?}: {reason}")]
    InvalidBundle { path: PathBuf, reason: String },

    #[error("I/O error on {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("kernel operation failed: {0}")]
    Kernel(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    pub fn invalid_bundle(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::InvalidBundle {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
