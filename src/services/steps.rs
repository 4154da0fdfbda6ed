//! Step runners and the sequencer that drives them.
//!
//! Each runner performs one stage of a workflow through the same
//! [`StepRunner::run`] capability; [`StepPipeline`] maps declared steps onto
//! runners and stops at the first failure.

use super::executor::{ShellCommand, ToolExecutor};
use super::plan_store;
use crate::domain::{ProjectCommandContext, Stage, Step, DEFAULT_WORKSPACE};
use crate::error::{StepError, StepResult};
use async_trait::async_trait;
use semver::Version;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Flags every non-interactive terraform call gets
const INPUT_FALSE: &str = "-input=false";
const NO_COLOR: &str = "-no-color";

/// Executes one pipeline step
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Run in `path`. `extra_args` come from the workflow declaration.
    async fn run(
        &self,
        ctx: &ProjectCommandContext,
        extra_args: &[String],
        path: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<String>;
}

/// `terraform init`
pub struct InitStepRunner {
    executor: Arc<dyn ToolExecutor>,
}

impl InitStepRunner {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StepRunner for InitStepRunner {
    async fn run(
        &self,
        ctx: &ProjectCommandContext,
        extra_args: &[String],
        path: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<String> {
        let mut args = vec!["init".to_string(), INPUT_FALSE.to_string(), NO_COLOR.to_string()];
        args.extend(extra_args.iter().cloned());
        self.executor
            .run_command_with_version(
                &ctx.span,
                path,
                &args,
                ctx.terraform_version(),
                &ctx.workspace,
                cancel,
            )
            .await
    }
}

/// `terraform plan`, switching to the context's workspace first
pub struct PlanStepRunner {
    executor: Arc<dyn ToolExecutor>,
}

impl PlanStepRunner {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }

    async fn switch_workspace(
        &self,
        ctx: &ProjectCommandContext,
        path: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<()> {
        // Workspaces arrived in 0.9, named `env` until 0.10
        let version = ctx.terraform_version();
        if let Some(v) = version.filter(|v| **v < Version::new(0, 9, 0)) {
            if ctx.workspace != DEFAULT_WORKSPACE {
                return Err(StepError::ToolFailed {
                    command: "workspace".to_string(),
                    path: path.to_path_buf(),
                    output: format!("terraform version {} does not support workspaces", v),
                });
            }
            return Ok(());
        }
        let zero_point_nine = version.is_some_and(|v| *v < Version::new(0, 10, 0));
        let subcommand = if zero_point_nine { "env" } else { "workspace" };

        // `show` only exists from 0.10
        if !zero_point_nine {
            let current = self.workspace_cmd(ctx, path, &[subcommand, "show"], cancel).await?;
            if current.trim() == ctx.workspace {
                return Ok(());
            }
        }
        tracing::debug!(parent: &ctx.span, workspace = %ctx.workspace, "switching workspace");
        let workspace = ctx.workspace.as_str();
        match self
            .workspace_cmd(ctx, path, &[subcommand, "select", NO_COLOR, workspace], cancel)
            .await
        {
            Ok(_) => Ok(()),
            Err(StepError::ToolFailed { .. }) => {
                self.workspace_cmd(ctx, path, &[subcommand, "new", NO_COLOR, workspace], cancel)
                    .await?;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn workspace_cmd(
        &self,
        ctx: &ProjectCommandContext,
        path: &Path,
        args: &[&str],
        cancel: &CancellationToken,
    ) -> StepResult<String> {
        let args: Vec<String> = args.iter().map(|a| a.to_string()).collect();
        self.executor
            .run_command_with_version(
                &ctx.span,
                path,
                &args,
                ctx.terraform_version(),
                &ctx.workspace,
                cancel,
            )
            .await
    }
}

#[async_trait]
impl StepRunner for PlanStepRunner {
    async fn run(
        &self,
        ctx: &ProjectCommandContext,
        extra_args: &[String],
        path: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<String> {
        self.switch_workspace(ctx, path, cancel).await?;

        let plan_file = plan_store::plan_path(path, &ctx.workspace, Some(&ctx.project));
        let mut args = vec![
            "plan".to_string(),
            INPUT_FALSE.to_string(),
            "-refresh".to_string(),
            NO_COLOR.to_string(),
            "-out".to_string(),
            plan_file.to_string_lossy().into_owned(),
        ];
        args.extend(extra_args.iter().cloned());
        args.extend(ctx.comment_args.iter().cloned());
        self.executor
            .run_command_with_version(
                &ctx.span,
                path,
                &args,
                ctx.terraform_version(),
                &ctx.workspace,
                cancel,
            )
            .await
    }
}

/// `terraform apply` of the plan file left by [`PlanStepRunner`]
pub struct ApplyStepRunner {
    executor: Arc<dyn ToolExecutor>,
}

impl ApplyStepRunner {
    pub fn new(executor: Arc<dyn ToolExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl StepRunner for ApplyStepRunner {
    async fn run(
        &self,
        ctx: &ProjectCommandContext,
        extra_args: &[String],
        path: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<String> {
        let plan_file = plan_store::plan_path(path, &ctx.workspace, Some(&ctx.project));
        if !plan_store::plan_exists(&plan_file) {
            return Err(StepError::PlanNotFound {
                dir: ctx.repo_rel_dir.clone(),
                workspace: ctx.workspace.clone(),
            });
        }

        let mut args = vec!["apply".to_string(), INPUT_FALSE.to_string(), NO_COLOR.to_string()];
        args.extend(extra_args.iter().cloned());
        args.extend(ctx.comment_args.iter().cloned());
        args.push(plan_file.to_string_lossy().into_owned());

        let out = self
            .executor
            .run_command_with_version(
                &ctx.span,
                path,
                &args,
                ctx.terraform_version(),
                &ctx.workspace,
                cancel,
            )
            .await?;
        tracing::info!(parent: &ctx.span, "apply successful");
        Ok(out)
    }
}

/// User-declared `run` step. `extra_args` are joined into one shell command line.
pub struct RunStepRunner {
    timeout: Duration,
}

impl RunStepRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl StepRunner for RunStepRunner {
    async fn run(
        &self,
        ctx: &ProjectCommandContext,
        extra_args: &[String],
        path: &Path,
        cancel: &CancellationToken,
    ) -> StepResult<String> {
        let plan_file = plan_store::plan_path(path, &ctx.workspace, Some(&ctx.project));
        let mut shell = ShellCommand::new(extra_args.join(" "), path, self.timeout)
            .env("WORKSPACE", ctx.workspace.clone())
            .env("DIR", path.display().to_string())
            .env("PLANFILE", plan_file.display().to_string())
            .env("PULL_NUM", ctx.pull.num.to_string())
            .env("PULL_AUTHOR", ctx.pull.author.clone())
            .env("HEAD_REPO_FULL_NAME", ctx.repo_full_name.clone());
        if let Some(v) = ctx.terraform_version() {
            shell = shell.env("TF_PILOT_TERRAFORM_VERSION", v.to_string());
        }
        let out = shell.run(cancel).await?;
        tracing::debug!(parent: &ctx.span, command = %shell.command, "run step succeeded");
        Ok(out)
    }
}

/// Output of a stage: every step's output in order, plus the error that stopped it
#[derive(Debug)]
pub struct StageOutcome {
    pub outputs: Vec<String>,
    pub error: Option<StepError>,
}

impl StageOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }

    pub fn combined_output(&self) -> String {
        self.outputs.join("\n")
    }
}

/// Runs a stage's steps in order without knowing what each step does
#[derive(Clone)]
pub struct StepPipeline {
    init: Arc<dyn StepRunner>,
    plan: Arc<dyn StepRunner>,
    apply: Arc<dyn StepRunner>,
    run: Arc<dyn StepRunner>,
}

impl StepPipeline {
    /// Standard runners over one executor
    pub fn new(executor: Arc<dyn ToolExecutor>, run_timeout: Duration) -> Self {
        Self {
            init: Arc::new(InitStepRunner::new(Arc::clone(&executor))),
            plan: Arc::new(PlanStepRunner::new(Arc::clone(&executor))),
            apply: Arc::new(ApplyStepRunner::new(executor)),
            run: Arc::new(RunStepRunner::new(run_timeout)),
        }
    }

    /// Runner and arguments for a declared step
    fn dispatch(&self, step: &Step) -> (&Arc<dyn StepRunner>, Vec<String>) {
        match step {
            Step::Init { extra_args } => (&self.init, extra_args.clone()),
            Step::Plan { extra_args } => (&self.plan, extra_args.clone()),
            Step::Apply { extra_args } => (&self.apply, extra_args.clone()),
            Step::Run { command } => (&self.run, vec![command.clone()]),
        }
    }

    /// Run every step of `stage`; the first error aborts the rest
    pub async fn run_stage(
        &self,
        ctx: &ProjectCommandContext,
        stage: &Stage,
        cancel: &CancellationToken,
    ) -> StageOutcome {
        let path = ctx.project_path();
        let mut outputs = Vec::with_capacity(stage.steps.len());
        for step in &stage.steps {
            tracing::debug!(parent: &ctx.span, step = step.name(), "running step");
            let (runner, args) = self.dispatch(step);
            match runner.run(ctx, &args, &path, cancel).await {
                Ok(out) => outputs.push(out),
                Err(e) => {
                    tracing::warn!(parent: &ctx.span, step = step.name(), error = %e, "step failed");
                    return StageOutcome {
                        outputs,
                        error: Some(e),
                    };
                }
            }
        }
        StageOutcome {
            outputs,
            error: None,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::VecDeque;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// One recorded executor call
    #[derive(Debug, Clone, PartialEq)]
    pub struct Call {
        pub path: PathBuf,
        pub args: Vec<String>,
        pub version: Option<Version>,
        pub workspace: String,
    }

    /// Executor that records calls and replays scripted results
    #[derive(Default)]
    pub struct FakeExecutor {
        pub calls: Mutex<Vec<Call>>,
        responses: Mutex<VecDeque<StepResult<String>>>,
        /// Write a plan file whenever `-out <path>` is passed
        pub write_plans: bool,
    }

    impl FakeExecutor {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn writing_plans() -> Self {
            Self {
                write_plans: true,
                ..Self::default()
            }
        }

        pub fn respond(&self, result: StepResult<String>) {
            self.responses.lock().unwrap().push_back(result);
        }

        pub fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ToolExecutor for FakeExecutor {
        async fn run_command_with_version(
            &self,
            _span: &tracing::Span,
            path: &Path,
            args: &[String],
            version: Option<&Version>,
            workspace: &str,
            _cancel: &CancellationToken,
        ) -> StepResult<String> {
            self.calls.lock().unwrap().push(Call {
                path: path.to_path_buf(),
                args: args.to_vec(),
                version: version.cloned(),
                workspace: workspace.to_string(),
            });
            if self.write_plans {
                if let Some(pos) = args.iter().position(|a| a == "-out") {
                    std::fs::write(&args[pos + 1], b"plan").unwrap();
                }
            }
            self.responses
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(format!("ran {}", args.join(" "))))
        }
    }
}
