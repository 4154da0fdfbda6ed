//! Domain entities for tf-pilot.
//!
//! This module contains the core business entities:
//! - CommitStatus: Outcome reported to the VCS host
//! - Lock: Exclusive hold on a repo/dir/workspace tuple
//! - Project: Validated repo configuration
//! - Workflow: Pipeline steps and invocation state
//! - Command: Incoming requests and per-run context

mod command;
mod commit_status;
mod lock;
mod project;
mod workflow;

pub use command::{CommandRequest, ProjectCommandContext, ProjectResult};
pub use commit_status::CommitStatus;
pub use lock::{normalize_dir, AcquireOutcome, LockKey, LockRecord, PullRequest, ReleaseOutcome};
pub use project::{
    parse_version, ApplyRequirement, Autoplan, Project, ValidConfig, DEFAULT_WORKSPACE,
};
pub use workflow::{CommandName, InvocationState, RejectReason, Stage, Step, Workflow};
