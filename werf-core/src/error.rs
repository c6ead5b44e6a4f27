//! Error types for the stage pipeline.
//!
//! All errors use `thiserror` for ergonomic error handling and proper error chains.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, WerfError>;

/// Main error type for the stage pipeline.
#[derive(Error, Debug)]
pub enum WerfError {
    // Configuration errors: fail fast, no retry
    #[error("invalid configuration: {reason}")]
    UserConfig { reason: String },

    #[error("environment unsupported: {reason}")]
    EnvironmentUnsupported { reason: String },

    // External collaborator errors
    #[error("stages storage error: {reason}")]
    Storage { reason: String },

    #[error("container runtime error: {reason}")]
    Runtime { reason: String },

    #[error("git repo {repo}: {reason}")]
    Git { repo: String, reason: String },

    #[error("commit {commit} does not exist in repo {repo}")]
    MissingCommit { repo: String, commit: String },

    // Integrity errors
    #[error("malformed labels on image {image}: {reason}")]
    MalformedLabels { image: String, reason: String },

    #[error("unknown image referenced: {image}")]
    UnknownImage { image: String },

    #[error("circular import dependency involving image {image}")]
    CircularImportDependency { image: String },

    #[error("stage {stage} of image {image}: {reason}")]
    StageFailed { image: String, stage: String, reason: String },

    #[error("build cancelled")]
    Cancelled,

    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WerfError {
    /// Create an Io error with path context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Create a Runtime error from any displayable reason.
    pub fn runtime(reason: impl std::fmt::Display) -> Self {
        Self::Runtime { reason: reason.to_string() }
    }

    /// Create a Storage error from any displayable reason.
    pub fn storage(reason: impl std::fmt::Display) -> Self {
        Self::Storage { reason: reason.to_string() }
    }
}
