use anyhow::{Context, Result};
use clap::Parser;
use ralph_parallel::parallel::WorkspaceDisposition;
use ralph_parallel::shutdown::{register_signal_handlers, ShutdownState};
use ralph_parallel::{Collaborators, ConfigLoader, ConfigOverrides, Orchestrator, RunSummary};
use std::path::PathBuf;
use std::process::ExitCode;

/// ralph-parallel - run a backlog of tasks in parallel git worktrees
#[derive(Parser, Debug)]
#[command(name = "ralph-parallel")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Repository to work on (its checkout must be on the mainline)
    #[arg(long, env = "RALPH_REPO", default_value = ".")]
    repo: PathBuf,

    /// Maximum number of tasks running at once
    #[arg(short = 'j', long)]
    workers: Option<usize>,

    /// Per-task time limit in seconds
    #[arg(long)]
    task_timeout: Option<u64>,

    /// How long to wait for in-flight work on shutdown, in seconds
    #[arg(long)]
    shutdown_timeout: Option<u64>,

    /// Don't commit changes a runner left uncommitted
    #[arg(long)]
    no_auto_commit: bool,

    /// Mainline branch
    #[arg(long)]
    mainline: Option<String>,

    /// What to do with workspaces left by an earlier run
    /// (merge-pending, discard-all, report-only)
    #[arg(long, value_parser = clap::value_parser!(WorkspaceDisposition))]
    disposition: Option<WorkspaceDisposition>,

    /// Directory holding open task files, relative to the repository
    #[arg(long)]
    active_dir: Option<PathBuf>,

    /// Directory completed task files are moved to, relative to the repository
    #[arg(long)]
    done_dir: Option<PathBuf>,

    /// Global config file (defaults to the user config directory)
    #[arg(long, env = "RALPH_PARALLEL_CONFIG")]
    config: Option<PathBuf>,

    /// Ignore the state of earlier runs
    #[arg(long)]
    fresh: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,

    /// Runner command, run once per task inside its workspace
    #[arg(long, env = "RALPH_RUNNER")]
    runner: Option<String>,

    /// Runner arguments; `{task_id}`, `{workspace}` and `{branch}` are expanded
    #[arg(last = true)]
    runner_args: Vec<String>,
}

impl Cli {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            max_workers: self.workers,
            task_timeout_secs: self.task_timeout,
            shutdown_timeout_secs: self.shutdown_timeout,
            auto_commit: self.no_auto_commit.then_some(false),
            mainline: self.mainline.clone(),
            workspace_disposition: self.disposition,
            active_dir: self.active_dir.clone(),
            done_dir: self.done_dir.clone(),
            runner_command: self.runner.clone(),
            runner_args: self.runner_args.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(summary) if summary.failed.is_empty() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(2),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<RunSummary> {
    let repo = cli
        .repo
        .canonicalize()
        .with_context(|| format!("Repository not found: {}", cli.repo.display()))?;

    let mut loader = ConfigLoader::new().with_project_path(&repo);
    if let Some(path) = &cli.config {
        loader = loader.with_global_path(Some(path.clone()));
    }
    let config = loader
        .load(&cli.overrides())
        .context("Failed to load configuration")?;
    let collaborators =
        Collaborators::from_config(&config, &repo).context("Failed to set up the task runner")?;

    let shutdown = ShutdownState::new();
    if let Err(e) = register_signal_handlers(shutdown.clone()) {
        log::warn!("Failed to register signal handlers: {}", e);
    }

    let summary = Orchestrator::new(config, &repo, collaborators, shutdown)
        .with_fresh(cli.fresh)
        .run()
        .await
        .with_context(|| format!("Run against {} failed", repo.display()))?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(summary)
}

fn print_summary(summary: &RunSummary) {
    println!("Run {} ({:.1}s)", summary.run_id, summary.duration_secs);
    println!("  dispatched:  {}", summary.dispatched);
    let groups = [
        ("merged", &summary.merged),
        ("recovered", &summary.recovered),
        ("closed", &summary.closed),
        ("failed", &summary.failed),
        ("interrupted", &summary.interrupted),
        ("transient", &summary.transient),
        ("blocked", &summary.blocked),
    ];
    for (label, ids) in groups {
        if ids.is_empty() {
            continue;
        }
        println!("  {:<12} {} ({})", format!("{}:", label), ids.len(), ids.join(", "));
    }
    if summary.orphans_found > 0 {
        println!("  orphaned workspaces found: {}", summary.orphans_found);
    }
    if summary.shutdown_requested {
        println!("  stopped early on shutdown request");
    }
}
