//! setfarm - workflow engine CLI.
//!
//! Front end for both humans (`run`, `medic`, `cron`) and agents (`step`):
//! the `step` subcommands are the agent text protocol, with results on
//! stdout and diagnostics on stderr. Exit codes: 0 success, 1 user-visible
//! error, 2 invalid arguments.

mod render;

use chrono::Utc;
use clap::{Parser, Subcommand};
use setfarm_core::config::Config;
use setfarm_core::types::{Id, RunStatus};
use setfarm_engine::cron::CommandCronGateway;
use setfarm_engine::protocol::{CompleteOutcome, FailOutcome, HAS_WORK, NO_WORK};
use setfarm_engine::Engine;
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, EnvFilter};

/// CLI for the setfarm workflow engine.
#[derive(Parser)]
#[command(name = "setfarm")]
#[command(about = "Multi-agent workflow engine over a shared task queue")]
#[command(version)]
struct Cli {
    /// Config file path (overrides <state_dir>/config)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Agent text protocol: peek, claim, complete, fail
    Step {
        #[command(subcommand)]
        command: StepCommand,
    },

    /// Run management
    Run {
        #[command(subcommand)]
        command: RunCommand,
    },

    /// Watchdog: reconciliation passes and history
    Medic {
        #[command(subcommand)]
        command: MedicCommand,
    },

    /// Cron gateway maintenance
    Cron {
        #[command(subcommand)]
        command: CronCommand,
    },
}

#[derive(Subcommand)]
enum StepCommand {
    /// Print HAS_WORK or NO_WORK for a role. Pure read.
    Peek {
        /// Role identifier (e.g. workflow/developer)
        role: String,
    },

    /// Atomically claim the next unit for a role; prints claim JSON or NO_WORK
    Claim {
        /// Role identifier (e.g. workflow/developer)
        role: String,
    },

    /// Report a unit's output (raw KEY: value lines on stdin)
    Complete {
        /// Step or story id returned by claim
        unit_id: String,
    },

    /// Report a unit failure
    Fail {
        /// Step or story id returned by claim
        unit_id: String,

        /// Human-readable reason
        reason: String,
    },
}

#[derive(Subcommand)]
enum RunCommand {
    /// Start a run of a declared workflow
    Start {
        /// Workflow id (a YAML file in the workflows directory)
        workflow_id: String,

        /// Task description the run executes against
        #[arg(required = true, num_args = 1..)]
        task: Vec<String>,
    },

    /// List runs (optionally filter by status)
    List {
        /// Filter by status (running, done, failed)
        #[arg(long, value_parser = parse_run_status)]
        status: Option<RunStatus>,
    },

    /// Show detailed information about a run
    Show {
        /// Run ID
        run_id: String,
    },

    /// Resume a failed run
    Resume {
        /// Run ID
        run_id: String,
    },
}

#[derive(Subcommand)]
enum MedicCommand {
    /// Execute one reconciliation pass now
    Run,

    /// Show recent medic passes
    History {
        /// Number of passes to show
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Subcommand)]
enum CronCommand {
    /// Re-ensure cron jobs for every workflow with running runs
    Sync,
}

fn parse_run_status(s: &str) -> Result<RunStatus, String> {
    RunStatus::parse(s).ok_or_else(|| format!("invalid status: {s} (running, done, failed)"))
}

fn main() {
    // Diagnostics go to stderr; stdout carries protocol output only.
    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => die(&format!("failed to create runtime: {e}")),
    };

    let code = runtime.block_on(execute(cli));
    std::process::exit(code);
}

fn die(msg: &str) -> ! {
    eprintln!("setfarm: {msg}");
    std::process::exit(1);
}

async fn execute(cli: Cli) -> i32 {
    let config = match Config::resolve(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("setfarm: {e}");
            return 1;
        }
    };

    let gateway = Arc::new(CommandCronGateway::from_config(&config));
    let engine = match Engine::open(config, gateway).await {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("setfarm: {e}");
            return 1;
        }
    };

    let result = match cli.command {
        Command::Step { command } => run_step(&engine, command).await,
        Command::Run { command } => run_run(&engine, command).await,
        Command::Medic { command } => run_medic(&engine, command).await,
        Command::Cron { command } => run_cron(&engine, command).await,
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("setfarm: {e}");
            1
        }
    }
}

async fn run_step(engine: &Engine, command: StepCommand) -> setfarm_engine::Result<i32> {
    match command {
        StepCommand::Peek { role } => {
            let has_work = engine.protocol().peek(&role).await?;
            println!("{}", if has_work { HAS_WORK } else { NO_WORK });
            Ok(0)
        }
        StepCommand::Claim { role } => {
            match engine.protocol().claim(&role).await? {
                Some(unit) => match unit.to_json() {
                    Ok(json) => println!("{json}"),
                    Err(e) => {
                        eprintln!("setfarm: failed to encode claim: {e}");
                        return Ok(1);
                    }
                },
                None => println!("{NO_WORK}"),
            }
            Ok(0)
        }
        StepCommand::Complete { unit_id } => {
            let mut raw = String::new();
            if let Err(e) = std::io::stdin().read_to_string(&mut raw) {
                eprintln!("setfarm: failed to read stdin: {e}");
                return Ok(1);
            }
            let outcome = engine
                .protocol()
                .complete(&Id::from_string(unit_id), &raw)
                .await?;
            match outcome {
                CompleteOutcome::Completed => {
                    println!("ok");
                    Ok(0)
                }
                CompleteOutcome::AlreadyTerminal => {
                    println!("ok (already complete)");
                    Ok(0)
                }
                CompleteOutcome::RunNotRunning => {
                    println!("ok (run no longer running, output ignored)");
                    Ok(0)
                }
                CompleteOutcome::NotClaimed => {
                    eprintln!("setfarm: unit is not claimed");
                    Ok(1)
                }
                CompleteOutcome::TreatedAsFailed { reason } => {
                    eprintln!("setfarm: output rejected: {reason}");
                    Ok(1)
                }
            }
        }
        StepCommand::Fail { unit_id, reason } => {
            let outcome = engine
                .protocol()
                .fail(&Id::from_string(unit_id), &reason)
                .await?;
            match outcome {
                FailOutcome::Retried { retry_count } => {
                    println!("retry {retry_count} scheduled");
                }
                FailOutcome::Exhausted => println!("retry budget exhausted"),
                FailOutcome::Ignored => println!("ignored"),
            }
            Ok(0)
        }
    }
}

async fn run_run(engine: &Engine, command: RunCommand) -> setfarm_engine::Result<i32> {
    match command {
        RunCommand::Start { workflow_id, task } => {
            let run = engine.start_run(&workflow_id, &task.join(" ")).await?;
            render::print_run_created(&run);
            Ok(0)
        }
        RunCommand::List { status } => {
            let runs = engine.store().list_runs(status).await?;
            render::print_run_list(&runs);
            Ok(0)
        }
        RunCommand::Show { run_id } => {
            let id = Id::from_string(run_id);
            let run = engine.store().get_run(&id).await?;
            let steps = engine.store().list_steps(&id).await?;
            let stories = engine.store().list_stories_for_run(&id).await?;
            let events = engine.store().list_events(&id).await?;
            let recent: Vec<_> = events.into_iter().rev().take(15).rev().collect();
            render::print_run_details(&run, &steps, &stories, &recent);
            Ok(0)
        }
        RunCommand::Resume { run_id } => {
            let count = engine.resume_run(&Id::from_string(run_id)).await?;
            println!("resumed (resume {count})");
            Ok(0)
        }
    }
}

async fn run_medic(engine: &Engine, command: MedicCommand) -> setfarm_engine::Result<i32> {
    match command {
        MedicCommand::Run => {
            let report = engine.medic().run_pass(Utc::now()).await?;
            println!("{}", report.summary());
            for finding in &report.findings {
                println!(
                    "  [{}] {} ({}{})",
                    finding.check.as_str(),
                    finding.detail,
                    if finding.remediated { "remediated" } else { "no action" },
                    finding
                        .run_id
                        .as_ref()
                        .map(|id| format!(", run {id}"))
                        .unwrap_or_default(),
                );
            }
            Ok(0)
        }
        MedicCommand::History { limit } => {
            let checks = engine.store().list_medic_checks(limit).await?;
            render::print_medic_history(&checks);
            Ok(0)
        }
    }
}

async fn run_cron(engine: &Engine, command: CronCommand) -> setfarm_engine::Result<i32> {
    match command {
        CronCommand::Sync => {
            engine.medic().restore_crons().await?;
            println!("cron jobs synced");
            Ok(0)
        }
    }
}
