//! Unified error types for the tf-pilot engine.

use crate::domain::LockRecord;
use std::path::PathBuf;
use thiserror::Error;

/// Main engine error type
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Lock error: {0}")]
    Lock(#[from] LockError),

    #[error("Step error: {0}")]
    Step(#[from] StepError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Engine settings and repo configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The repo config file does not exist. Callers fall back to defaults.
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("unable to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

impl ConfigError {
    /// Whether this error only signals a missing config file
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Lock manager errors
#[derive(Debug, Error)]
pub enum LockError {
    #[error(
        "This project is currently locked by #{} ({}). The locking plan must be applied or discarded before future plans can execute.",
        .0.pull.num,
        .0.pull.url
    )]
    Conflict(Box<LockRecord>),

    #[error("Invalid lock key: {0}")]
    InvalidKey(String),

    #[error("Lock storage error: {0}")]
    Storage(String),

    #[error("Lock state is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Step runner errors
#[derive(Debug, Error)]
pub enum StepError {
    #[error("no plan found at path {dir:?} and workspace {workspace:?} - did you run plan?")]
    PlanNotFound { dir: String, workspace: String },

    #[error("running {command:?} in {path:?}: {output}")]
    ToolFailed {
        command: String,
        path: PathBuf,
        output: String,
    },

    #[error("Failed to spawn process: {0}")]
    SpawnFailed(String),

    #[error("step cancelled")]
    Cancelled,

    #[error("step timed out after {0} seconds")]
    TimedOut(u64),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, EngineError>;

/// Result type alias for configuration operations
pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Result type alias for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// Result type alias for step operations
pub type StepResult<T> = std::result::Result<T, StepError>;
