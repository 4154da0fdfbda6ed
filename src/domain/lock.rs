//! Lock entity and acquisition outcomes.

use crate::error::LockError;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// `owner/name`, exactly one slash
fn repo_name_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^[^/\s]+/[^/\s]+$").expect("Invalid regex"))
}

/// The tuple a lock protects: one workspace of one project directory in one repo
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LockKey {
    /// Repository in `owner/name` form
    pub repo_full_name: String,
    /// Project directory relative to the repo root
    pub path: String,
    /// Terraform workspace
    pub workspace: String,
}

impl LockKey {
    /// Create a key, normalising the path so `.` and `./` address the same project.
    ///
    /// The repo name holds exactly one slash and the workspace none, so the
    /// path is everything between them in [`LockKey::id`].
    pub fn new(repo_full_name: &str, path: &str, workspace: &str) -> Result<Self, LockError> {
        if !repo_name_regex().is_match(repo_full_name) {
            return Err(LockError::InvalidKey(format!(
                "repo name {:?} is not in owner/name form",
                repo_full_name
            )));
        }
        if workspace.is_empty() {
            return Err(LockError::InvalidKey("workspace must not be empty".to_string()));
        }
        if workspace.contains('/') {
            return Err(LockError::InvalidKey(format!(
                "workspace {:?} must not contain '/'",
                workspace
            )));
        }
        Ok(Self {
            repo_full_name: repo_full_name.to_string(),
            path: normalize_dir(path),
            workspace: workspace.to_string(),
        })
    }

    /// Stable string id used as the storage key. Distinct keys give distinct ids.
    pub fn id(&self) -> String {
        format!("{}/{}/{}", self.repo_full_name, self.path, self.workspace)
    }
}

impl std::fmt::Display for LockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} dir: {:?} workspace: {:?}",
            self.repo_full_name, self.path, self.workspace
        )
    }
}

/// Clean a repo-relative directory: strips `./`, duplicate and trailing slashes
pub fn normalize_dir(dir: &str) -> String {
    let parts: Vec<&str> = dir
        .split('/')
        .filter(|p| !p.is_empty() && *p != ".")
        .collect();
    if parts.is_empty() {
        ".".to_string()
    } else {
        parts.join("/")
    }
}

/// The pull request that owns a lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub num: u64,
    pub author: String,
    pub url: String,
}

impl PullRequest {
    pub fn new(num: u64, author: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            num,
            author: author.into(),
            url: url.into(),
        }
    }
}

/// A persisted exclusive hold on a [`LockKey`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: LockKey,
    pub pull: PullRequest,
    /// Name of the project that took the lock, when named
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    pub acquired_at: DateTime<Utc>,
}

impl LockRecord {
    pub fn new(key: LockKey, pull: PullRequest, project_name: Option<String>) -> Self {
        Self {
            key,
            pull,
            project_name,
            acquired_at: Utc::now(),
        }
    }

    /// Whether this lock belongs to the given pull request
    pub fn is_held_by(&self, pull_num: u64) -> bool {
        self.pull.num == pull_num
    }
}

/// Result of a lock acquisition attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// A new lock was created
    Acquired(LockRecord),
    /// The requesting pull request already held it; the existing record is returned
    AlreadyHeldBySelf(LockRecord),
    /// Another pull request holds it
    DeniedHeldByOther(LockRecord),
}

impl AcquireOutcome {
    /// Whether the caller now holds the lock
    pub fn is_held(&self) -> bool {
        !matches!(self, Self::DeniedHeldByOther(_))
    }

    pub fn record(&self) -> &LockRecord {
        match self {
            Self::Acquired(r) | Self::AlreadyHeldBySelf(r) | Self::DeniedHeldByOther(r) => r,
        }
    }
}

/// Result of a lock release attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released(LockRecord),
    NotHeld,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_dir() {
        assert_eq!(normalize_dir("."), ".");
        assert_eq!(normalize_dir("./"), ".");
        assert_eq!(normalize_dir(""), ".");
        assert_eq!(normalize_dir("./staging//db/"), "staging/db");
    }

    #[test]
    fn test_key_equality_after_normalisation() {
        let a = LockKey::new("acme/infra", "./prod/", "default").unwrap();
        let b = LockKey::new("acme/infra", "prod", "default").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.id(), "acme/infra/prod/default");
    }

    #[test]
    fn test_key_rejects_bad_repo_name() {
        assert!(LockKey::new("infra", ".", "default").is_err());
        assert!(LockKey::new("acme/infra", ".", "").is_err());
        assert!(LockKey::new("acme/infra/extra", ".", "default").is_err());
        assert!(LockKey::new("acme/infra", ".", "prod/eu").is_err());
    }

    #[test]
    fn test_ids_distinct_when_slashes_shift() {
        let a = LockKey::new("acme/infra", "x", "y").unwrap();
        let b = LockKey::new("acme/infra", "x/y", "default").unwrap();
        assert_ne!(a.id(), b.id());

        let c = LockKey::new("acme/infra", "x/y", "z").unwrap();
        assert!(LockKey::new("acme/infra", "x", "y/z").is_err());
        assert!(LockKey::new("acme/infra/x", "y", "z").is_err());
        assert_eq!(c.id(), "acme/infra/x/y/z");
    }

    #[test]
    fn test_outcome_is_held() {
        let key = LockKey::new("acme/infra", ".", "default").unwrap();
        let rec = LockRecord::new(key, PullRequest::new(7, "alice", "url"), None);
        assert!(AcquireOutcome::Acquired(rec.clone()).is_held());
        assert!(AcquireOutcome::AlreadyHeldBySelf(rec.clone()).is_held());
        assert!(!AcquireOutcome::DeniedHeldByOther(rec).is_held());
    }
}
