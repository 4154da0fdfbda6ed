//! End-to-end plan → conflict → apply → release flow over a persisted lock store.

use async_trait::async_trait;
use semver::Version;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tf_pilot::domain::{
    CommandName, CommandRequest, CommitStatus, InvocationState, PullRequest, RejectReason,
};
use tf_pilot::error::{Result, StepResult};
use tf_pilot::services::{
    CommitStatusUpdater, EngineSettings, FileLockBackend, LockManager, ProjectCommandRunner,
    StatusUpdate, StepPipeline, ToolExecutor,
};
use tokio_util::sync::CancellationToken;

/// Pretends to be terraform: `plan -out <file>` writes the file
#[derive(Default)]
struct FakeTerraform {
    calls: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl ToolExecutor for FakeTerraform {
    async fn run_command_with_version(
        &self,
        _span: &tracing::Span,
        _path: &Path,
        args: &[String],
        _version: Option<&Version>,
        _workspace: &str,
        _cancel: &CancellationToken,
    ) -> StepResult<String> {
        self.calls.lock().unwrap().push(args.to_vec());
        if let Some(pos) = args.iter().position(|a| a == "-out") {
            std::fs::write(&args[pos + 1], b"planned changes").unwrap();
        }
        Ok(format!("terraform {}", args[0]))
    }
}

#[derive(Default)]
struct Statuses(Mutex<Vec<StatusUpdate>>);

#[async_trait]
impl CommitStatusUpdater for Statuses {
    async fn update(&self, update: &StatusUpdate) -> Result<()> {
        self.0.lock().unwrap().push(update.clone());
        Ok(())
    }
}

fn request(pull: u64, name: CommandName) -> CommandRequest {
    CommandRequest::new(
        "acme/infra",
        PullRequest::new(pull, "dev", format!("https://github.com/acme/infra/pull/{}", pull)),
        name,
    )
    .with_dir("network")
    .with_workspace("default")
}

async fn run_one(
    runner: &ProjectCommandRunner<FileLockBackend>,
    req: CommandRequest,
    repo_dir: &Path,
) -> tf_pilot::domain::ProjectResult {
    let mut results = runner
        .execute(&req, repo_dir, &CancellationToken::new())
        .await;
    assert_eq!(results.len(), 1);
    results.remove(0)
}

#[tokio::test]
async fn test_plan_conflict_apply_release() {
    let data = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    std::fs::create_dir(repo.path().join("network")).unwrap();
    let plan_file = repo.path().join("network").join("default.tfplan");

    let exec = Arc::new(FakeTerraform::default());
    let statuses = Arc::new(Statuses::default());
    let backend = FileLockBackend::open(data.path().join("locks.json"))
        .await
        .unwrap();
    let runner = ProjectCommandRunner::new(
        LockManager::new(Arc::new(backend)),
        StepPipeline::new(exec.clone(), Duration::from_secs(30)),
        statuses.clone(),
        EngineSettings::default(),
    );

    // Pull 7 plans: lock and artifact appear
    let result = run_one(&runner, request(7, CommandName::Plan), repo.path()).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert!(plan_file.is_file());
    let locks = runner.locks().list().await.unwrap();
    assert_eq!(locks.len(), 1);
    assert_eq!(locks[0].pull.num, 7);

    // Pull 9 is denied and told who holds the lock
    let result = run_one(&runner, request(9, CommandName::Plan), repo.path()).await;
    assert_eq!(result.state, InvocationState::Rejected(RejectReason::LockConflict));
    assert!(result.error.as_deref().unwrap().contains("#7"));

    // Pull 7 applies the stored plan
    let result = run_one(&runner, request(7, CommandName::Apply), repo.path()).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(result.output, "terraform apply");
    let calls = exec.calls.lock().unwrap().clone();
    let apply = calls.last().unwrap();
    assert_eq!(&apply[..3], &["apply", "-input=false", "-no-color"]);
    assert_eq!(apply.last().unwrap(), &plan_file.to_string_lossy());

    // Closing pull 7 frees the tuple for pull 9
    let released = runner
        .pull_request_closed("acme/infra", 7, Some(repo.path()))
        .await
        .unwrap();
    assert_eq!(released.len(), 1);
    let result = run_one(&runner, request(9, CommandName::Plan), repo.path()).await;
    assert!(result.is_success(), "{:?}", result.error);
    assert_eq!(runner.locks().list().await.unwrap()[0].pull.num, 9);

    // Every run ended in exactly one terminal status
    let statuses: Vec<CommitStatus> = statuses
        .0
        .lock()
        .unwrap()
        .iter()
        .map(|u| u.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            CommitStatus::Pending,
            CommitStatus::Success,
            CommitStatus::Failed,
            CommitStatus::Pending,
            CommitStatus::Success,
            CommitStatus::Pending,
            CommitStatus::Success,
        ]
    );
}

#[tokio::test]
async fn test_locks_survive_restart() {
    let data = TempDir::new().unwrap();
    let repo = TempDir::new().unwrap();
    std::fs::create_dir(repo.path().join("network")).unwrap();
    let locks_file = data.path().join("locks.json");

    let build = |backend: FileLockBackend| {
        ProjectCommandRunner::new(
            LockManager::new(Arc::new(backend)),
            StepPipeline::new(Arc::new(FakeTerraform::default()), Duration::from_secs(30)),
            Arc::new(Statuses::default()),
            EngineSettings::default(),
        )
    };

    let first = build(FileLockBackend::open(&locks_file).await.unwrap());
    assert!(run_one(&first, request(7, CommandName::Plan), repo.path())
        .await
        .is_success());
    drop(first);

    let second = build(FileLockBackend::open(&locks_file).await.unwrap());
    let result = run_one(&second, request(9, CommandName::Plan), repo.path()).await;
    assert_eq!(result.state, InvocationState::Rejected(RejectReason::LockConflict));

    let result = run_one(&second, request(7, CommandName::Apply), repo.path()).await;
    assert!(result.is_success(), "{:?}", result.error);
}
