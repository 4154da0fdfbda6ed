//! tf-pilot: pull-request driven terraform orchestration
//!
//! Operator entry point. Runs one plan/apply/unlock command against a
//! checked-out repo, or inspects and clears persisted locks.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tf_pilot::domain::{
    CommandName, CommandRequest, LockKey, PullRequest, ReleaseOutcome, DEFAULT_WORKSPACE,
};
use tf_pilot::services::{
    EngineSettings, FileLockBackend, LockManager, LoggingStatusUpdater, ProjectCommandRunner,
    StepPipeline, TerraformExecutor,
};
use tf_pilot::EngineConfig;

#[derive(Parser, Debug)]
#[command(name = "tf-pilot", version, about = "Pull-request driven terraform plan/apply")]
struct Cli {
    /// Engine config file (TOML)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Plan a project, taking its lock
    Plan(RunArgs),
    /// Apply a project's stored plan
    Apply(RunArgs),
    /// Release every lock a pull request holds
    Unlock(PullArgs),
    /// Release a pull request's locks after it closed or merged
    Close(PullArgs),
    /// List held locks
    Locks,
    /// Release one lock regardless of holder
    ForceUnlock(ForceUnlockArgs),
}

#[derive(Parser, Debug)]
struct PullArgs {
    /// Repository in owner/name form
    #[arg(long)]
    repo: String,

    /// Pull request number
    #[arg(long)]
    pull: u64,

    /// Checkout of the pull request's head
    #[arg(long, value_name = "PATH")]
    repo_dir: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    pull: PullArgs,

    /// Pull request author
    #[arg(long, default_value = "")]
    author: String,

    /// Pull request URL, shown in lock conflicts
    #[arg(long, default_value = "")]
    url: String,

    /// Project directory relative to the repo root
    #[arg(short, long, default_value = ".")]
    dir: String,

    /// Terraform workspace
    #[arg(short, long, default_value = DEFAULT_WORKSPACE)]
    workspace: String,

    /// Named project from the repo config
    #[arg(short, long)]
    project: Option<String>,

    /// The pull request is approved
    #[arg(long)]
    approved: bool,

    /// Extra arguments passed to terraform
    #[arg(last = true)]
    extra_args: Vec<String>,
}

#[derive(Parser, Debug)]
struct ForceUnlockArgs {
    #[arg(long)]
    repo: String,

    #[arg(short, long, default_value = ".")]
    dir: String,

    #[arg(short, long, default_value = DEFAULT_WORKSPACE)]
    workspace: String,
}

/// Initialize logging with RUST_LOG environment variable support
fn init_logging(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(io::stderr))
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Misconfiguration is fatal before any command runs
    let config = EngineConfig::load(cli.config.as_deref()).context("loading engine config")?;
    init_logging(&config.log_level);

    let backend = FileLockBackend::open(config.locks_file())
        .await
        .with_context(|| format!("opening lock store {}", config.locks_file().display()))?;
    let locks = LockManager::new(Arc::new(backend));
    let timeout = Duration::from_secs(config.terraform.step_timeout_seconds);
    let executor = Arc::new(TerraformExecutor::new(&config.terraform.binary, timeout));
    let runner = ProjectCommandRunner::new(
        locks.clone(),
        StepPipeline::new(executor, timeout),
        Arc::new(LoggingStatusUpdater),
        EngineSettings::from_config(&config)?,
    );

    match cli.command {
        Commands::Plan(args) => run_command(&runner, CommandName::Plan, args, &config).await,
        Commands::Apply(args) => run_command(&runner, CommandName::Apply, args, &config).await,
        Commands::Unlock(args) => {
            let repo_dir = checkout_dir(&args, &config);
            let req = CommandRequest::new(
                &args.repo,
                PullRequest::new(args.pull, "", ""),
                CommandName::Unlock,
            );
            let results = runner.unlock(&req, &repo_dir).await?;
            for result in &results {
                println!("{}", result.output);
            }
            if results.is_empty() {
                println!("No locks held by {}#{}", args.repo, args.pull);
            }
            Ok(())
        }
        Commands::Close(args) => {
            let repo_dir = checkout_dir(&args, &config);
            let released = runner
                .pull_request_closed(&args.repo, args.pull, Some(&repo_dir))
                .await?;
            println!("Released {} lock(s) for {}#{}", released.len(), args.repo, args.pull);
            Ok(())
        }
        Commands::Locks => {
            for record in locks.list().await? {
                println!(
                    "{}\t#{}\t{}\t{}",
                    record.key,
                    record.pull.num,
                    record.pull.author,
                    record.acquired_at.to_rfc3339()
                );
            }
            Ok(())
        }
        Commands::ForceUnlock(args) => {
            let key = LockKey::new(&args.repo, &args.dir, &args.workspace)?;
            match locks.force_release(&key).await? {
                ReleaseOutcome::Released(rec) => {
                    println!("Released {} held by #{}", key, rec.pull.num)
                }
                ReleaseOutcome::NotHeld => println!("{} is not locked", key),
            }
            Ok(())
        }
    }
}

/// Default checkout location: `<data_dir>/repos/<owner>/<name>/<pull>`
fn checkout_dir(args: &PullArgs, config: &EngineConfig) -> PathBuf {
    args.repo_dir.clone().unwrap_or_else(|| {
        config
            .repos_dir()
            .join(&args.repo)
            .join(args.pull.to_string())
    })
}

async fn run_command(
    runner: &ProjectCommandRunner<FileLockBackend>,
    name: CommandName,
    args: RunArgs,
    config: &EngineConfig,
) -> Result<()> {
    let repo_dir = checkout_dir(&args.pull, config);
    let mut req = CommandRequest::new(
        &args.pull.repo,
        PullRequest::new(args.pull.pull, args.author, args.url),
        name,
    )
    .with_dir(&args.dir)
    .with_workspace(&args.workspace)
    .with_comment_args(args.extra_args)
    .approved(args.approved);
    if let Some(project) = &args.project {
        req = req.with_project_name(project);
    }

    tracing::info!("Running {} in {:?}", name, repo_dir);

    // Ctrl+C cancels the running tool; the lock stays held
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, cancelling");
                cancel.cancel();
            }
        })
    };
    let results = runner.execute(&req, &repo_dir, &cancel).await;
    watcher.abort();

    let mut failed = false;
    for result in &results {
        if !result.output.is_empty() {
            println!("{}", result.output);
        }
        if let Some(err) = &result.error {
            eprintln!("{}: {}", name.title(), err);
        }
        failed |= !result.is_success();
    }
    if failed {
        anyhow::bail!("{} failed", name);
    }
    Ok(())
}
