use clap::Parser;
use crossterm::style::Stylize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use drover::backend::{create_backend, preflight};
use drover::config::{Config, Overrides};
use drover::display::LiveDisplay;
use drover::scheduler::{RunSummary, Scheduler};
use drover::tasklist::{Task, TaskList};
use drover::{log, Result};

/// Drive a task list through an external AI coding agent.
#[derive(Parser, Debug)]
#[command(name = "drover", version, about)]
struct Cli {
    /// Path to the markdown task list
    tasks: PathBuf,

    /// Backend platform (claude, codex)
    #[arg(long)]
    backend: Option<String>,

    /// Model passed to the backend when nothing else resolves one
    #[arg(long)]
    model: Option<String>,

    /// Concurrent workers for independent tasks (1-5)
    #[arg(long, short = 'j')]
    parallel: Option<usize>,

    /// Stop dispatching new tasks after the first failure
    #[arg(long)]
    fail_fast: bool,

    /// Per-task timeout in seconds
    #[arg(long)]
    timeout: Option<f64>,

    /// Verbose logging to ~/.drover/drover.log
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    log::init_with_debug(cli.debug);

    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            eprintln!("{} {}", "error:".red().bold(), e);
            std::process::exit(2);
        }
    }
}

async fn run(cli: Cli) -> Result<bool> {
    Config::ensure_dirs()?;
    let config = Config::load()?;
    let overrides = Overrides {
        backend: cli.backend,
        model: cli.model,
        max_parallel_tasks: cli.parallel,
        fail_fast: cli.fail_fast,
        task_timeout_secs: cli.timeout,
    };
    let run_config = config.resolve(&overrides)?;

    let backend = create_backend(&run_config)?;
    preflight(backend.as_ref())?;

    let list = TaskList::load(&cli.tasks)?;
    let pending: Vec<Task> = list.pending().cloned().collect();
    if pending.is_empty() {
        println!("Nothing to do: every task is already complete.");
        return Ok(true);
    }

    let run_id = uuid::Uuid::new_v4();
    let log_root = Config::logs_dir()?.join(run_id.to_string());
    println!(
        "Running {} task(s) on {} (output logs: {})",
        pending.len(),
        backend.name().to_string().bold(),
        log_root.display()
    );

    let (events, display) = LiveDisplay::spawn(&pending, Some(log_root), true)?;
    let scheduler = Scheduler::new(backend, run_config, events, Arc::new(Mutex::new(list)));
    let summary = scheduler.run(pending).await?;
    drop(scheduler);
    display.join()?;

    print_summary(&summary);
    Ok(summary.failed_count() == 0)
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!(
        "{} succeeded, {} failed, {} skipped",
        summary.success_count().to_string().green().bold(),
        summary.failed_count().to_string().red().bold(),
        summary.skipped_count().to_string().dark_grey().bold(),
    );
    if summary.failed_count() > 0 {
        println!("{}", "Failed:".red());
        for name in summary.failed() {
            println!("  {}", name);
        }
    }
    if summary.skipped_count() > 0 {
        println!("{}", "Skipped:".dark_grey());
        for name in summary.skipped() {
            println!("  {}", name);
        }
    }
}
