use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use draftgate_core::{RetryRunner, RunRequest, StepArtifact, StepInput};
use draftgate_logging::{init_tracing, LogFormat, Logger};
use draftgate_store::{SqliteBackend, StateStore};

mod config;
mod exec;

use config::ProjectConfig;
use exec::{CommandExecutor, CommandValidator};

#[derive(Parser, Debug)]
#[command(
    name = "draftgate",
    about = "Quality-gated retry harness for content pipelines",
    version
)]
struct Cli {
    /// Database path (default: ~/.local/share/draftgate/draftgate.db)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log output format
    #[arg(long, value_enum, default_value = "pretty", global = true)]
    log_format: LogFormatChoice,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Drive one step through the retry loop
    Run {
        /// Step identifier
        #[arg(short, long)]
        step: String,

        /// JSON file with the initial artifact ({"items": [...]})
        #[arg(short, long)]
        input: PathBuf,

        /// Executor command (reads StepInput JSON on stdin, prints a StepArtifact)
        #[arg(long)]
        executor_cmd: Option<String>,

        /// Validator command (reads a StepArtifact on stdin, prints a ValidationReport)
        #[arg(long)]
        validator_cmd: Option<String>,

        /// Quality target the score must reach
        #[arg(short, long)]
        target_score: Option<f64>,

        /// Retry budget
        #[arg(short = 'n', long)]
        max_iterations: Option<usize>,

        /// Output final result as JSON
        #[arg(long)]
        json_output: bool,
    },
    /// List persisted steps
    Steps,
    /// Show one step's retry context
    Show { step: String },
    /// Remove one step's record
    Clear { step: String },
    /// Remove all records and the locked set
    ClearAll,
    /// Snapshot the whole store under a name
    Checkpoint { name: String },
    /// Restore the store from a named checkpoint
    Restore { name: String },
    /// Empty the shared locked-item set
    UnlockAll,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormatChoice {
    Pretty,
    Json,
    Compact,
}

impl From<LogFormatChoice> for LogFormat {
    fn from(choice: LogFormatChoice) -> Self {
        match choice {
            LogFormatChoice::Pretty => LogFormat::Pretty,
            LogFormatChoice::Json => LogFormat::Json,
            LogFormatChoice::Compact => LogFormat::Compact,
        }
    }
}

/// Open the store, degrading to memory-only when the database is unusable.
fn open_store(db: Option<&PathBuf>) -> StateStore {
    let backend = match db {
        Some(path) => SqliteBackend::open_at(path),
        None => SqliteBackend::open(),
    };
    match backend {
        Ok(backend) => StateStore::with_backend(Box::new(backend)),
        Err(e) => {
            eprintln!("{} {e}", "warning: database unavailable, state will not persist:".yellow());
            StateStore::in_memory()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let log_format: LogFormat = cli.log_format.into();
    init_tracing("warn", log_format);

    let working_dir = std::env::current_dir().context("Failed to get current directory")?;
    let project = ProjectConfig::load(&working_dir)?.unwrap_or_default();

    let db = cli.db.clone().or(project.db_path.clone());
    let store = Arc::new(open_store(db.as_ref()));

    match cli.command {
        Commands::Run {
            step,
            input,
            executor_cmd,
            validator_cmd,
            target_score,
            max_iterations,
            json_output,
        } => {
            let executor_cmd = executor_cmd
                .or(project.executor.command)
                .context("No executor command: pass --executor-cmd or set [executor] in draftgate.toml")?;
            let validator_cmd = validator_cmd
                .or(project.validator.command)
                .context("No validator command: pass --validator-cmd or set [validator] in draftgate.toml")?;
            let target_score = target_score.or(project.target_score).unwrap_or(90.0);
            let max_iterations = max_iterations.or(project.max_iterations).unwrap_or(5);

            let content = std::fs::read_to_string(&input)
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let artifact: StepArtifact = serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse {}", input.display()))?;

            let executor = CommandExecutor::new(executor_cmd);
            let validator = CommandValidator::new(validator_cmd);
            let logger = Arc::new(Logger::new(log_format));
            let runner = RetryRunner::new(&executor, &validator, store, logger);

            let interrupt = runner.interrupt_handle();
            ctrlc::set_handler(move || {
                interrupt.store(true, Ordering::SeqCst);
            })
            .context("Failed to install Ctrl-C handler")?;

            let result = runner
                .run(RunRequest {
                    step_id: step,
                    initial_input: StepInput::new(artifact.items),
                    target_score,
                    max_iterations,
                })
                .await?;

            if json_output {
                println!("{}", serde_json::to_string_pretty(&result)?);
            }
            std::process::exit(result.exit_code());
        }

        Commands::Steps => {
            let steps = store.list_steps();
            if steps.is_empty() {
                println!("No persisted steps.");
                return Ok(());
            }
            for s in steps {
                let score = s
                    .retry
                    .as_ref()
                    .and_then(|c| c.last_score())
                    .map(|v| format!("{v:.1}"))
                    .unwrap_or_else(|| "-".to_string());
                let iterations = s
                    .retry
                    .as_ref()
                    .map(|c| c.iteration_count.to_string())
                    .unwrap_or_else(|| "0".to_string());
                println!(
                    "{:<24} {:<10} score {:>6}  iterations {}",
                    s.step_id.bold(),
                    s.status.to_string(),
                    score,
                    iterations
                );
            }
        }

        Commands::Show { step } => {
            let Some(state) = store.get_step(&step) else {
                anyhow::bail!("No state for step '{step}'");
            };
            println!("{} {}", "step:".dimmed(), state.step_id.bold());
            println!("{} {}", "status:".dimmed(), state.status);
            println!("{} {}", "updated:".dimmed(), state.timestamp.to_rfc3339());
            for (k, v) in &state.metadata {
                println!("{} {}", format!("{k}:").dimmed(), v);
            }
            if let Some(ctx) = &state.retry {
                println!(
                    "{} {}/{} used, target {:.0}",
                    "iterations:".dimmed(),
                    ctx.iteration_count,
                    ctx.max_iterations,
                    ctx.target_score
                );
                println!(
                    "{} {:?}",
                    "scores:".dimmed(),
                    ctx.score_history
                );
                println!(
                    "{} {}",
                    "failing categories:".dimmed(),
                    if ctx.failing_categories.is_empty() {
                        "none".to_string()
                    } else {
                        ctx.failing_categories.join(", ")
                    }
                );
                println!("{} {}", "locked items:".dimmed(), ctx.locked_items.len());
                if let Some(strategy) = ctx.strategy {
                    println!("{} {}", "last strategy:".dimmed(), strategy);
                }
            } else {
                println!("{}", "no retry context".dimmed());
            }
        }

        Commands::Clear { step } => {
            store.clear_step(&step);
            println!("Cleared step '{step}'.");
        }

        Commands::ClearAll => {
            store.clear_all();
            println!("Cleared all state.");
        }

        Commands::Checkpoint { name } => {
            store.create_checkpoint(&name);
            println!("Checkpoint '{name}' created.");
        }

        Commands::Restore { name } => {
            if store.restore_checkpoint(&name) {
                println!("Checkpoint '{name}' restored.");
            } else {
                anyhow::bail!("No checkpoint named '{name}'");
            }
        }

        Commands::UnlockAll => {
            store.unlock_all();
            println!("Locked-item set emptied.");
        }
    }

    Ok(())
}
