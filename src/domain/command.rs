//! Incoming commands and the per-invocation context handed to step runners.

use super::lock::{normalize_dir, PullRequest};
use super::project::{Project, DEFAULT_WORKSPACE};
use super::workflow::{CommandName, InvocationState};
use semver::Version;
use std::path::PathBuf;

/// A parsed pull-request comment, as delivered by the comment parser
#[derive(Debug, Clone)]
pub struct CommandRequest {
    /// Repository in `owner/name` form
    pub repo_full_name: String,
    pub pull: PullRequest,
    pub name: CommandName,
    /// Repo-relative dir; ignored when `project_name` is set
    pub dir: String,
    pub workspace: String,
    /// Target a named project from the repo config
    pub project_name: Option<String>,
    /// Extra arguments the user appended after `--`
    pub comment_args: Vec<String>,
    /// Whether the pull request is approved on the VCS host
    pub approved: bool,
}

impl CommandRequest {
    pub fn new(repo_full_name: &str, pull: PullRequest, name: CommandName) -> Self {
        Self {
            repo_full_name: repo_full_name.to_string(),
            pull,
            name,
            dir: ".".to_string(),
            workspace: DEFAULT_WORKSPACE.to_string(),
            project_name: None,
            comment_args: Vec::new(),
            approved: false,
        }
    }

    pub fn with_dir(mut self, dir: &str) -> Self {
        self.dir = normalize_dir(dir);
        self
    }

    pub fn with_workspace(mut self, workspace: &str) -> Self {
        self.workspace = workspace.to_string();
        self
    }

    pub fn with_project_name(mut self, name: &str) -> Self {
        self.project_name = Some(name.to_string());
        self
    }

    pub fn with_comment_args(mut self, args: Vec<String>) -> Self {
        self.comment_args = args;
        self
    }

    pub fn approved(mut self, approved: bool) -> Self {
        self.approved = approved;
        self
    }
}

/// Everything a step runner needs for one project. Owned by a single run.
#[derive(Debug, Clone)]
pub struct ProjectCommandContext {
    pub repo_full_name: String,
    pub pull: PullRequest,
    /// Checkout of the pull request's head
    pub repo_dir: PathBuf,
    pub repo_rel_dir: String,
    pub workspace: String,
    pub project: Project,
    pub comment_args: Vec<String>,
    /// Engine-wide fallback when the project pins no version
    pub default_terraform_version: Option<Version>,
    /// Log sink for this run
    pub span: tracing::Span,
}

impl ProjectCommandContext {
    /// Absolute directory the tool runs in
    pub fn project_path(&self) -> PathBuf {
        if self.repo_rel_dir == "." {
            self.repo_dir.clone()
        } else {
            self.repo_dir.join(&self.repo_rel_dir)
        }
    }

    /// Version to run: the project's pin, else the engine default
    pub fn terraform_version(&self) -> Option<&Version> {
        self.project
            .terraform_version
            .as_ref()
            .or(self.default_terraform_version.as_ref())
    }
}

/// Outcome of a command against one project, consumed by the comment renderer
#[derive(Debug, Clone)]
pub struct ProjectResult {
    pub command: CommandName,
    pub repo_rel_dir: String,
    pub workspace: String,
    pub project_name: Option<String>,
    pub state: InvocationState,
    /// Combined output of every step that ran
    pub output: String,
    pub error: Option<String>,
}

impl ProjectResult {
    pub fn is_success(&self) -> bool {
        matches!(self.state, InvocationState::Completed { success: true })
    }
}
