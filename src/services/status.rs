//! Commit status reporting seam.
//!
//! The engine only decides which status to emit; a VCS client turns a
//! [`StatusUpdate`] into the platform's status API call.

use crate::domain::{CommandName, CommitStatus};
use crate::error::Result;
use async_trait::async_trait;

/// One status transition for one project run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub repo_full_name: String,
    pub pull_num: u64,
    pub command: CommandName,
    /// Project display name, or dir/workspace when unnamed
    pub project: String,
    pub status: CommitStatus,
    pub description: String,
}

impl StatusUpdate {
    /// Status context shown by the VCS, e.g. `tf-pilot/plan: core`
    pub fn context(&self) -> String {
        format!("tf-pilot/{}: {}", self.command, self.project)
    }
}

/// Delivers commit statuses to the VCS host
#[async_trait]
pub trait CommitStatusUpdater: Send + Sync {
    async fn update(&self, update: &StatusUpdate) -> Result<()>;
}

/// Updater that only writes statuses to the log
#[derive(Debug, Default, Clone)]
pub struct LoggingStatusUpdater;

#[async_trait]
impl CommitStatusUpdater for LoggingStatusUpdater {
    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        tracing::info!(
            repo = %update.repo_full_name,
            pull = update.pull_num,
            context = %update.context(),
            status = %update.status,
            "{}",
            update.description
        );
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Keeps every update for assertions
    #[derive(Default)]
    pub struct RecordingStatusUpdater {
        pub updates: Mutex<Vec<StatusUpdate>>,
    }

    impl RecordingStatusUpdater {
        pub fn statuses(&self) -> Vec<CommitStatus> {
            self.updates.lock().unwrap().iter().map(|u| u.status).collect()
        }

        pub fn clear(&self) {
            self.updates.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl CommitStatusUpdater for RecordingStatusUpdater {
        async fn update(&self, update: &StatusUpdate) -> Result<()> {
            self.updates.lock().unwrap().push(update.clone());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context() {
        let update = StatusUpdate {
            repo_full_name: "acme/infra".to_string(),
            pull_num: 3,
            command: CommandName::Apply,
            project: "core".to_string(),
            status: CommitStatus::Pending,
            description: "Apply in progress...".to_string(),
        };
        assert_eq!(update.context(), "tf-pilot/apply: core");
    }

    #[tokio::test]
    async fn test_logging_updater_never_fails() {
        let update = StatusUpdate {
            repo_full_name: "acme/infra".to_string(),
            pull_num: 3,
            command: CommandName::Plan,
            project: "dir: . workspace: default".to_string(),
            status: CommitStatus::Failed,
            description: "Plan failed.".to_string(),
        };
        assert!(LoggingStatusUpdater.update(&update).await.is_ok());
    }
}
