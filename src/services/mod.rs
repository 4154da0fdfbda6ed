//! Infrastructure services for tf-pilot.
//!
//! This module contains:
//! - ParserValidator: Repo config parsing and validation
//! - LockManager: Per-workspace locks over a durable backend
//! - plan_store: Plan file naming and lifecycle
//! - Step runners and the TerraformExecutor they drive
//! - ProjectCommandRunner: Orchestration of plan, apply and unlock

pub mod executor;
pub mod locking;
pub mod orchestrator;
pub mod plan_store;
pub mod repo_config;
pub mod status;
pub mod steps;

pub use executor::{ShellCommand, TerraformExecutor, ToolExecutor};
pub use locking::{FileLockBackend, LockBackend, LockManager, MemoryLockBackend};
pub use orchestrator::{EngineSettings, ProjectCommandRunner};
pub use repo_config::ParserValidator;
pub use status::{CommitStatusUpdater, LoggingStatusUpdater, StatusUpdate};
pub use steps::{
    ApplyStepRunner, InitStepRunner, PlanStepRunner, RunStepRunner, StageOutcome, StepPipeline,
    StepRunner,
};
