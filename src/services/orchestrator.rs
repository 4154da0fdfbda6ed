//! Project command orchestration.
//!
//! Resolves the projects a command targets, takes or checks their locks,
//! runs the workflow stage and reports commit statuses. Every failure is
//! turned into a [`ProjectResult`]; nothing here aborts the process.

use super::locking::{LockBackend, LockManager};
use super::plan_store;
use super::repo_config::ParserValidator;
use super::status::{CommitStatusUpdater, StatusUpdate};
use super::steps::StepPipeline;
use crate::config::EngineConfig;
use crate::domain::{
    AcquireOutcome, CommandName, CommandRequest, CommitStatus, InvocationState, LockKey,
    LockRecord, Project, ProjectCommandContext, ProjectResult, RejectReason, Workflow,
};
use crate::error::{ConfigError, LockError, Result, StepError};
use semver::Version;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Settings threaded into every run instead of read from globals
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub repo_config_filename: String,
    pub default_terraform_version: Option<Version>,
}

impl EngineSettings {
    pub fn from_config(config: &EngineConfig) -> std::result::Result<Self, ConfigError> {
        Ok(Self {
            repo_config_filename: config.repo_config_filename.clone(),
            default_terraform_version: config.default_version()?,
        })
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            repo_config_filename: crate::config::DEFAULT_REPO_CONFIG.to_string(),
            default_terraform_version: None,
        }
    }
}

/// Drives plan, apply and unlock for one repo checkout
pub struct ProjectCommandRunner<B: LockBackend + ?Sized> {
    locks: LockManager<B>,
    parser: ParserValidator,
    pipeline: StepPipeline,
    status: Arc<dyn CommitStatusUpdater>,
    settings: EngineSettings,
}

impl<B: LockBackend + ?Sized> ProjectCommandRunner<B> {
    pub fn new(
        locks: LockManager<B>,
        pipeline: StepPipeline,
        status: Arc<dyn CommitStatusUpdater>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            locks,
            parser: ParserValidator::new(),
            pipeline,
            status,
            settings,
        }
    }

    pub fn locks(&self) -> &LockManager<B> {
        &self.locks
    }

    /// Run `req` against the checkout at `repo_dir`.
    ///
    /// Returns one result per targeted project. `cancel` bounds every tool
    /// process; a cancelled run fails but keeps its lock.
    pub async fn execute(
        &self,
        req: &CommandRequest,
        repo_dir: &Path,
        cancel: &CancellationToken,
    ) -> Vec<ProjectResult> {
        if req.name == CommandName::Unlock {
            return match self.unlock(req, repo_dir).await {
                Ok(results) => results,
                Err(e) => vec![self.rejected_without_project(req, RejectReason::LockConflict, e.to_string())],
            };
        }

        let targets = match self.resolve_projects(req, repo_dir) {
            Ok(targets) => targets,
            Err(e) => {
                tracing::warn!(repo = %req.repo_full_name, pull = req.pull.num, error = %e, "could not resolve projects");
                let result =
                    self.rejected_without_project(req, RejectReason::ConfigError, e.to_string());
                self.report(
                    req,
                    &format!("dir: {} workspace: {}", req.dir, req.workspace),
                    CommitStatus::Failed,
                    format!("{} failed: {}", req.name.title(), e),
                )
                .await;
                return vec![result];
            }
        };

        let mut results = Vec::with_capacity(targets.len());
        for (project, workflow) in targets {
            results.push(
                self.run_project(req, repo_dir, project, workflow, cancel)
                    .await,
            );
        }
        results
    }

    /// Projects a command addresses, with the workflow each runs
    pub fn resolve_projects(
        &self,
        req: &CommandRequest,
        repo_dir: &Path,
    ) -> std::result::Result<Vec<(Project, Workflow)>, ConfigError> {
        let filename = &self.settings.repo_config_filename;
        let config = if self.parser.has_config(repo_dir, filename)? {
            match self.parser.read_config(repo_dir, filename) {
                Ok(config) => Some(config),
                Err(e) if e.is_not_found() => None,
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        let Some(config) = config else {
            if let Some(name) = &req.project_name {
                return Err(ConfigError::Invalid(format!(
                    "cannot target project name {:?} because {} does not exist",
                    name, filename
                )));
            }
            tracing::debug!(repo = %req.repo_full_name, "no repo config, using default workflow");
            return Ok(vec![(
                Project::new(&req.dir, &req.workspace),
                Workflow::default(),
            )]);
        };

        if let Some(name) = &req.project_name {
            let project = config.find_project_by_name(name).ok_or_else(|| {
                ConfigError::Invalid(format!("no project with name {:?} is defined in {}", name, filename))
            })?;
            return Ok(vec![(project.clone(), config.workflow_for(project))]);
        }

        let matches = config.find_projects(&req.dir, &req.workspace);
        match matches.as_slice() {
            [] => Ok(vec![(
                Project::new(&req.dir, &req.workspace),
                Workflow::default(),
            )]),
            [project] => Ok(vec![((*project).clone(), config.workflow_for(project))]),
            _ => Err(ConfigError::Invalid(format!(
                "must specify project name: more than one project defined in {} matched dir: {:?} workspace: {:?}",
                filename, req.dir, req.workspace
            ))),
        }
    }

    async fn run_project(
        &self,
        req: &CommandRequest,
        repo_dir: &Path,
        project: Project,
        workflow: Workflow,
        cancel: &CancellationToken,
    ) -> ProjectResult {
        let span = tracing::info_span!(
            "project_command",
            repo = %req.repo_full_name,
            pull = req.pull.num,
            command = %req.name,
            dir = %project.dir,
            workspace = %project.workspace,
        );
        let ctx = ProjectCommandContext {
            repo_full_name: req.repo_full_name.clone(),
            pull: req.pull.clone(),
            repo_dir: repo_dir.to_path_buf(),
            repo_rel_dir: project.dir.clone(),
            workspace: project.workspace.clone(),
            project,
            comment_args: req.comment_args.clone(),
            default_terraform_version: self.settings.default_terraform_version.clone(),
            span,
        };
        let mut state = InvocationState::Received;
        state.advance(InvocationState::Resolved);

        let key = match LockKey::new(&ctx.repo_full_name, &ctx.repo_rel_dir, &ctx.workspace) {
            Ok(key) => key,
            Err(e) => {
                state.advance(InvocationState::Rejected(RejectReason::ConfigError));
                return self.finish_rejected(req, &ctx, state, e.to_string()).await;
            }
        };

        let fresh_lock = match req.name {
            CommandName::Plan => match self.lock_for_plan(&ctx, &key).await {
                Ok(fresh) => fresh,
                Err((reason, msg)) => {
                    state.advance(InvocationState::Rejected(reason));
                    return self.finish_rejected(req, &ctx, state, msg).await;
                }
            },
            CommandName::Apply => {
                if let Err((reason, msg)) = self.check_apply(req, &ctx, &key).await {
                    state.advance(InvocationState::Rejected(reason));
                    return self.finish_rejected(req, &ctx, state, msg).await;
                }
                false
            }
            CommandName::Unlock => false,
        };
        state.advance(InvocationState::Locked);

        let Some(stage) = workflow.stage_for(req.name) else {
            state.advance(InvocationState::Rejected(RejectReason::ConfigError));
            return self
                .finish_rejected(req, &ctx, state, format!("{} runs no steps", req.name))
                .await;
        };

        state.advance(InvocationState::Running);
        self.report(
            req,
            &ctx.project.display_name(),
            CommitStatus::Pending,
            format!("{} in progress...", req.name.title()),
        )
        .await;

        let outcome = self.pipeline.run_stage(&ctx, stage, cancel).await;
        let success = outcome.is_success();
        state.advance(InvocationState::Completed { success });

        let error = outcome.error.as_ref().map(|e| e.to_string());
        if let Some(err) = &outcome.error {
            // A plan that never produced a file gives its fresh lock back;
            // cancelled or timed-out runs keep theirs until an explicit unlock.
            let interrupted = matches!(err, StepError::Cancelled | StepError::TimedOut(_));
            if fresh_lock && !interrupted {
                if let Err(e) = self.locks.release(&key, ctx.pull.num).await {
                    tracing::warn!(parent: &ctx.span, error = %e, "failed to release lock after failed plan");
                }
            }
        }

        let (status, description) = if success {
            (CommitStatus::Success, format!("{} succeeded.", req.name.title()))
        } else {
            (CommitStatus::Failed, format!("{} failed.", req.name.title()))
        };
        self.report(req, &ctx.project.display_name(), status, description)
            .await;
        tracing::info!(parent: &ctx.span, success, "project command finished");

        ProjectResult {
            command: req.name,
            repo_rel_dir: ctx.repo_rel_dir.clone(),
            workspace: ctx.workspace.clone(),
            project_name: ctx.project.name.clone(),
            state,
            output: outcome.combined_output(),
            error,
        }
    }

    /// Take the lock for a plan. Returns whether the lock is newly created.
    async fn lock_for_plan(
        &self,
        ctx: &ProjectCommandContext,
        key: &LockKey,
    ) -> std::result::Result<bool, (RejectReason, String)> {
        match self
            .locks
            .try_acquire(key, &ctx.pull, ctx.project.name.as_deref())
            .await
        {
            Ok(AcquireOutcome::Acquired(_)) => Ok(true),
            Ok(AcquireOutcome::AlreadyHeldBySelf(_)) => Ok(false),
            Ok(AcquireOutcome::DeniedHeldByOther(holder)) => Err((
                RejectReason::LockConflict,
                LockError::Conflict(Box::new(holder)).to_string(),
            )),
            Err(e) => Err((RejectReason::LockConflict, e.to_string())),
        }
    }

    /// Apply needs approval when required, this pull's lock and its plan file
    async fn check_apply(
        &self,
        req: &CommandRequest,
        ctx: &ProjectCommandContext,
        key: &LockKey,
    ) -> std::result::Result<(), (RejectReason, String)> {
        if ctx.project.requires_approval() && !req.approved {
            return Err((
                RejectReason::Unapproved,
                "Pull request must be approved before running apply.".to_string(),
            ));
        }

        let plan_not_found = || {
            (
                RejectReason::PlanNotFound,
                StepError::PlanNotFound {
                    dir: ctx.repo_rel_dir.clone(),
                    workspace: ctx.workspace.clone(),
                }
                .to_string(),
            )
        };

        match self.locks.get(key).await {
            Ok(Some(holder)) if holder.is_held_by(ctx.pull.num) => {}
            Ok(Some(holder)) => {
                return Err((
                    RejectReason::LockConflict,
                    LockError::Conflict(Box::new(holder)).to_string(),
                ))
            }
            // No lock means no plan was made under this pull's ownership
            Ok(None) => return Err(plan_not_found()),
            Err(e) => return Err((RejectReason::LockConflict, e.to_string())),
        }

        let plan = plan_store::plan_path(&ctx.project_path(), &ctx.workspace, Some(&ctx.project));
        if !plan_store::plan_exists(&plan) {
            return Err(plan_not_found());
        }
        Ok(())
    }

    /// Release every lock this pull holds in the repo and delete their plans
    pub async fn unlock(&self, req: &CommandRequest, repo_dir: &Path) -> Result<Vec<ProjectResult>> {
        let released = self
            .locks
            .release_all_for_pull(&req.repo_full_name, req.pull.num)
            .await?;
        let mut results = Vec::with_capacity(released.len());
        for record in released {
            let mut output = format!("Unlocked {}", record.key);
            if let Err(e) = delete_plan_for(repo_dir, &record) {
                output.push_str(&format!("\nCould not delete plan: {}", e));
            }
            let mut state = InvocationState::Resolved;
            state.advance(InvocationState::Completed { success: true });
            results.push(ProjectResult {
                command: CommandName::Unlock,
                repo_rel_dir: record.key.path.clone(),
                workspace: record.key.workspace.clone(),
                project_name: record.project_name.clone(),
                state,
                output,
                error: None,
            });
        }
        Ok(results)
    }

    /// Pull request closed or merged: drop its locks and stale plans
    pub async fn pull_request_closed(
        &self,
        repo_full_name: &str,
        pull_num: u64,
        repo_dir: Option<&Path>,
    ) -> Result<Vec<LockRecord>> {
        let released = self
            .locks
            .release_all_for_pull(repo_full_name, pull_num)
            .await?;
        if let Some(dir) = repo_dir {
            for record in &released {
                // Logged by delete_plan_for
                let _ = delete_plan_for(dir, record);
            }
        }
        Ok(released)
    }

    async fn finish_rejected(
        &self,
        req: &CommandRequest,
        ctx: &ProjectCommandContext,
        state: InvocationState,
        message: String,
    ) -> ProjectResult {
        tracing::info!(parent: &ctx.span, reason = %message, "project command rejected");
        self.report(
            req,
            &ctx.project.display_name(),
            CommitStatus::Failed,
            format!("{} failed: {}", req.name.title(), message),
        )
        .await;
        ProjectResult {
            command: req.name,
            repo_rel_dir: ctx.repo_rel_dir.clone(),
            workspace: ctx.workspace.clone(),
            project_name: ctx.project.name.clone(),
            state,
            output: String::new(),
            error: Some(message),
        }
    }

    fn rejected_without_project(
        &self,
        req: &CommandRequest,
        reason: RejectReason,
        message: String,
    ) -> ProjectResult {
        let mut state = InvocationState::Received;
        state.advance(InvocationState::Rejected(reason));
        ProjectResult {
            command: req.name,
            repo_rel_dir: req.dir.clone(),
            workspace: req.workspace.clone(),
            project_name: req.project_name.clone(),
            state,
            output: String::new(),
            error: Some(message),
        }
    }

    /// Status failures are logged; they never change the run's outcome
    async fn report(
        &self,
        req: &CommandRequest,
        project: &str,
        status: CommitStatus,
        description: String,
    ) {
        let update = StatusUpdate {
            repo_full_name: req.repo_full_name.clone(),
            pull_num: req.pull.num,
            command: req.name,
            project: project.to_string(),
            status,
            description,
        };
        if let Err(e) = self.status.update(&update).await {
            tracing::warn!(
                repo = %req.repo_full_name,
                pull = req.pull.num,
                status = %status,
                error = %e,
                "failed to update commit status"
            );
        }
    }
}

/// Remove the plan a released lock guarded. Failures are logged and returned.
fn delete_plan_for(repo_dir: &Path, record: &LockRecord) -> std::io::Result<()> {
    let mut project = Project::new(&record.key.path, &record.key.workspace);
    project.name = record.project_name.clone();
    let base = if project.dir == "." {
        repo_dir.to_path_buf()
    } else {
        repo_dir.join(&project.dir)
    };
    let plan = plan_store::plan_path(&base, &record.key.workspace, Some(&project));
    match plan_store::remove_plan(&plan) {
        Ok(true) => {
            tracing::debug!(plan = %plan.display(), "deleted stale plan");
            Ok(())
        }
        Ok(false) => Ok(()),
        Err(e) => {
            tracing::warn!(plan = %plan.display(), lock = %record.key, error = %e, "failed to delete plan");
            Err(e)
        }
    }
}
