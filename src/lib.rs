//! tf-pilot: pull-request driven terraform orchestration
//!
//! This crate locks project workspaces per pull request, runs the configured
//! init/plan/apply pipeline against them and reports commit statuses.

pub mod config;
pub mod domain;
pub mod error;
pub mod services;

pub use config::EngineConfig;
pub use error::{EngineError, Result};
pub use services::ProjectCommandRunner;
