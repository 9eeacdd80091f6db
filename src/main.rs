//! stride main entry point.

use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use stride::config::Config;
use stride::error::Error;
use stride::platform::Platform;
use stride::task::{Task, TaskType};
use stride::trajectory::{TrajectoryRecorder, scan};

#[derive(Parser)]
#[command(name = "stride", version, about = "Agent execution platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the platform until interrupted.
    Run,
    /// Submit a single task, wait for it, print the answer, exit.
    Once {
        /// Natural-language task description.
        description: String,
        /// Task type: reasoning | code | web | research | general.
        #[arg(long, default_value = "general")]
        task_type: TaskType,
        /// Assistant-turn budget.
        #[arg(long)]
        max_steps: Option<u32>,
        /// Wall-clock budget in seconds.
        #[arg(long)]
        timeout_seconds: Option<u64>,
        /// Session to attach the task to.
        #[arg(long)]
        session: Option<String>,
    },
    /// Print the recorded outcome of a task from its trajectory file.
    Status {
        /// Task id.
        task_id: uuid::Uuid,
    },
    /// Install a tool server from a git URL or local path and add it to
    /// the registry snapshot.
    Install {
        /// `https://…`, `git@…`, or a local directory.
        source: String,
    },
    /// Seal partial trajectory files left by a crash.
    Scan,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(1);
        }
    };

    match run(cli.command.unwrap_or(Command::Run), config).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// 1 for configuration errors, 2 for unavailable external dependencies at
/// startup, 3 for fatal runtime errors.
fn exit_code_for(error: &Error) -> u8 {
    match error {
        Error::Config(_) => 1,
        Error::Queue(_) | Error::Session(_) => 2,
        _ => 3,
    }
}

async fn run(command: Command, config: Config) -> Result<ExitCode, Error> {
    match command {
        Command::Run => {
            let platform = Platform::start(config).await?;
            tracing::info!("ready; press ctrl-c to stop");
            let _ = tokio::signal::ctrl_c().await;
            platform.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }

        Command::Once {
            description,
            task_type,
            max_steps,
            timeout_seconds,
            session,
        } => {
            let platform = Platform::start(config).await?;

            let mut task = Task::new(description, task_type);
            if let Some(max_steps) = max_steps {
                task = task.with_max_steps(max_steps);
            }
            if let Some(timeout) = timeout_seconds {
                task = task.with_timeout_seconds(timeout);
            }
            if let Some(session) = session {
                task = task.with_session(session);
            }
            let poll_budget = Duration::from_secs(task.timeout_seconds + 120);

            let task_id = platform.dispatcher.submit(task).await?;
            println!("submitted {task_id}");

            let started = std::time::Instant::now();
            let outcome = loop {
                if started.elapsed() > poll_budget {
                    break None;
                }
                tokio::time::sleep(Duration::from_millis(250)).await;
                match platform.dispatcher.status(task_id).await? {
                    Some(status) if status.state.is_terminal() => break Some(status),
                    _ => {}
                }
            };

            let code = match outcome {
                Some(status) => {
                    println!("state: {:?}", status.state);
                    if let Some(message) = &status.message {
                        println!("{message}");
                    }
                    if let Some(path) = platform.recorder.find(task_id).await {
                        println!("trajectory: {}", path.display());
                    }
                    ExitCode::SUCCESS
                }
                None => {
                    eprintln!("task did not reach a terminal state in time");
                    ExitCode::from(3)
                }
            };

            platform.shutdown().await;
            Ok(code)
        }

        Command::Status { task_id } => {
            let recorder =
                TrajectoryRecorder::new(config.trajectory_dir, config.trajectory_grouping);
            match recorder.find(task_id).await {
                Some(path) => {
                    let records = recorder.read(&path).await?;
                    for record in &records {
                        if let stride::trajectory::TrajectoryRecord::Outcome(outcome) = record {
                            println!("status: {:?}", outcome.status);
                            println!("attempt: {}", outcome.attempt);
                            println!("steps: {}", outcome.steps);
                            println!(
                                "tokens: {} in / {} out, cost: {} micro-dollars",
                                outcome.total_tokens_in,
                                outcome.total_tokens_out,
                                outcome.total_cost_micros
                            );
                            if let Some(answer) = &outcome.final_answer {
                                println!("answer: {answer}");
                            }
                        }
                    }
                    println!("trajectory: {}", path.display());
                    Ok(ExitCode::SUCCESS)
                }
                None => {
                    eprintln!("no trajectory found for {task_id}");
                    Ok(ExitCode::from(3))
                }
            }
        }

        Command::Install { source } => {
            let install_root = config
                .orchestrator
                .snapshot_path
                .parent()
                .map(|p| p.join("servers"))
                .unwrap_or_else(|| std::path::PathBuf::from("servers"));

            let registry = std::sync::Arc::new(stride::orchestrator::ToolRegistry::new(
                config.orchestrator.clone(),
            ));
            if let Err(e) = registry.load_snapshot().await {
                tracing::warn!("snapshot restore failed: {e}");
            }

            let server_id =
                stride::orchestrator::install::install(&registry, &install_root, &source).await?;
            registry.save_snapshot().await?;
            println!("installed tool server '{server_id}'");
            registry.shutdown().await;
            Ok(ExitCode::SUCCESS)
        }

        Command::Scan => {
            let sealed = scan::scan_and_mark_crashed(&config.trajectory_dir).await?;
            if sealed.is_empty() {
                println!("no partial trajectories found");
            }
            for entry in sealed {
                println!(
                    "sealed {} (attempt {}, {} steps): {}",
                    entry.task_id,
                    entry.attempt,
                    entry.steps,
                    entry.path.display()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
