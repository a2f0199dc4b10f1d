//! Error taxonomy shared by the publishing and client sides.
//!
//! Low-level file and codec helpers report `anyhow::Error` with context, the same way
//! the rest of the crate's internals do; those surface here as [`PatchError::Other`].

use std::path::PathBuf;

use thiserror::Error;

use crate::version::Version;

#[derive(Debug, Error)]
pub enum PatchError {
    /// A required setting, version or path is missing or unusable.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("build {version} already exists")]
    AlreadyExists { version: Version },

    #[error("nothing to build: {} is empty", path.display())]
    EmptyInput { path: PathBuf },

    #[error("cannot build a patch from {version} to itself")]
    SameVersion { version: Version },

    #[error("no build has been published yet")]
    NoAvailableBuilds,

    /// A download exhausted its retries, or the URL could not be used at all.
    #[error("transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The remote file does not exist. Not retried.
    #[error("remote file not found: {url}")]
    Missing { url: String },

    #[error("patch {from} -> {to} could not be downloaded intact after {attempts} attempts")]
    PatchUndownloadable {
        from: Version,
        to: Version,
        attempts: u32,
    },

    #[error("integrity check failed for {path}: expected {expected}, got {actual}")]
    Integrity {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot decode {what}: {message}")]
    Codec { what: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PatchError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn transport(url: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn codec(what: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::Codec {
            what: what.into(),
            message: message.to_string(),
        }
    }

    /// Errors worth another attempt: the network hiccuped or a write failed mid-stream.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Io { .. })
    }
}

impl From<tokio::task::JoinError> for PatchError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Other(anyhow::Error::from(e))
    }
}

pub type Result<T, E = PatchError> = std::result::Result<T, E>;
