//! Error types for the loader
//!
//! Per-line and per-job problems ([`ParseError`], [`CacheError`]) are folded
//! into outcome tallies by the pipeline. Only [`LoadError`] ends a run.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for run-level operations
pub type Result<T> = std::result::Result<T, LoadError>;

/// Why a single log line could not become an event
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed line: expected 5 tab-separated fields, got {fields}")]
    MalformedLine { fields: usize },

    #[error("bad coordinates")]
    BadCoordinates,

    #[error("no valid app ids")]
    NoValidAppIds,

    #[error("line is not valid UTF-8")]
    InvalidUtf8,
}

/// Failure talking to a cache endpoint
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Connect, read, write or timeout failure
    #[error("memcached at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },

    /// The server answered, and the answer was a refusal
    #[error("memcached at {address} rejected the request: {response}")]
    Rejected { address: String, response: String },
}

impl CacheError {
    pub fn unreachable(address: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unreachable {
            address: address.into(),
            reason: reason.to_string(),
        }
    }

    pub fn rejected(address: impl Into<String>, response: impl Into<String>) -> Self {
        Self::Rejected {
            address: address.into(),
            response: response.into(),
        }
    }
}

/// Run-level errors
#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Cannot list source directory {dir}: {source}")]
    Discovery {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid file pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(
        "Run aborted: memcached at {address} rejected a write ({message}); \
         {processed} processed, {errors} errors before abort"
    )]
    FatalServer {
        address: String,
        message: String,
        processed: u64,
        errors: u64,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline task failed: {0}")]
    TaskFailed(String),
}

impl LoadError {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }
}

impl From<tokio::task::JoinError> for LoadError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::TaskFailed(err.to_string())
    }
}
