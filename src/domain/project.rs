//! Validated repo configuration: projects and the workflows they use.

use super::lock::normalize_dir;
use super::workflow::Workflow;
use semver::Version;
use std::collections::BTreeMap;

/// Workspace used when a project doesn't declare one
pub const DEFAULT_WORKSPACE: &str = "default";

/// Parse a terraform version, accepting the `major.minor` shorthand
pub fn parse_version(raw: &str) -> Result<Version, semver::Error> {
    let trimmed = raw.trim().trim_start_matches('v');
    if trimmed.matches('.').count() == 1 {
        Version::parse(&format!("{}.0", trimmed))
    } else {
        Version::parse(trimmed)
    }
}

/// Requirements that must be met before apply may run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyRequirement {
    /// The pull request must be approved
    Approved,
}

/// When to plan a project automatically on push
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Autoplan {
    pub enabled: bool,
    pub when_modified: Vec<String>,
}

impl Default for Autoplan {
    fn default() -> Self {
        Self {
            enabled: true,
            when_modified: vec!["**/*.tf".to_string()],
        }
    }
}

/// One project from the repo config
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Directory relative to the repo root
    pub dir: String,
    pub workspace: String,
    /// Unique name, required when another project shares dir and workspace
    pub name: Option<String>,
    pub terraform_version: Option<Version>,
    pub workflow: Option<String>,
    pub autoplan: Autoplan,
    pub apply_requirements: Vec<ApplyRequirement>,
}

impl Project {
    /// A project with only a dir and workspace, used when the repo has no config file
    pub fn new(dir: &str, workspace: &str) -> Self {
        Self {
            dir: normalize_dir(dir),
            workspace: workspace.to_string(),
            name: None,
            terraform_version: None,
            workflow: None,
            autoplan: Autoplan::default(),
            apply_requirements: Vec::new(),
        }
    }

    /// Human readable identifier for logs and status descriptions
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("dir: {} workspace: {}", self.dir, self.workspace),
        }
    }

    pub fn requires_approval(&self) -> bool {
        self.apply_requirements.contains(&ApplyRequirement::Approved)
    }
}

/// A parsed and cross-validated repo config
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidConfig {
    pub version: u32,
    pub projects: Vec<Project>,
    pub workflows: BTreeMap<String, Workflow>,
}

impl ValidConfig {
    /// Projects declared for a dir and workspace
    pub fn find_projects(&self, dir: &str, workspace: &str) -> Vec<&Project> {
        let dir = normalize_dir(dir);
        self.projects
            .iter()
            .filter(|p| p.dir == dir && p.workspace == workspace)
            .collect()
    }

    /// The project with the given name
    pub fn find_project_by_name(&self, name: &str) -> Option<&Project> {
        self.projects
            .iter()
            .find(|p| p.name.as_deref() == Some(name))
    }

    /// The workflow a project runs, falling back to the default workflow
    pub fn workflow_for(&self, project: &Project) -> Workflow {
        project
            .workflow
            .as_ref()
            .and_then(|name| self.workflows.get(name))
            .cloned()
            .unwrap_or_default()
    }
}
