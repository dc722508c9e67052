//! jobstats command line
//!
//! Stores the stats blob a job epilog produces and reads statistics back for
//! reporting. Storage is picked by the config file: the workload manager's own
//! job record, or the external relational database when `[external]` is enabled.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use jobstats_db::{JobKey, RelationalStore, StatsCoordinator, StatsError, StoreError};
use jobstats_logging::LogConfig;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

mod config;

/// sysexits EX_TEMPFAIL: the caller may retry later.
const EXIT_TEMPFAIL: u8 = 75;
/// sysexits EX_NOINPUT: nothing stored for the job.
const EXIT_NOT_FOUND: u8 = 66;

#[derive(Parser, Debug)]
#[command(
    name = "jobstats",
    version,
    about = "Store and inspect per-job resource usage statistics"
)]
struct Cli {
    /// Enable verbose logging (debug to stderr)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Config file
    #[arg(
        long,
        global = true,
        env = "JOBSTATS_CONFIG",
        default_value = config::DEFAULT_CONFIG_PATH
    )]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Store an encoded stats blob for a job
    Store {
        #[command(flatten)]
        job: JobArgs,

        /// Blob text (read from stdin when omitted)
        blob: Option<String>,
    },

    /// Print the stored statistics for a job as JSON
    Show {
        #[command(flatten)]
        job: JobArgs,

        /// Print the stored blob instead of decoding it
        #[arg(long)]
        raw: bool,
    },

    /// List the most recently updated jobs (external database only)
    Recent {
        /// Number of jobs to list
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
    },

    /// Delete a job's statistics (external database only)
    Delete {
        #[command(flatten)]
        job: JobArgs,
    },

    /// Create the external database tables
    InitSchema,
}

#[derive(clap::Args, Debug)]
struct JobArgs {
    /// Cluster name
    #[arg(short, long)]
    cluster: String,

    /// Job id
    #[arg(short, long)]
    job_id: i64,
}

impl JobArgs {
    fn key(&self) -> JobKey {
        JobKey::new(self.cluster.clone(), self.job_id)
    }
}

/// How a successful run ended.
#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Done,
    NotFound,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let app_config = match config::load_config(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {}", err);
            return ExitCode::from(1);
        }
    };

    if let Err(err) = jobstats_logging::init_logging(LogConfig {
        app_name: "jobstats",
        verbose: cli.verbose,
        log_dir: app_config.logging.dir.as_deref(),
        filter: app_config.logging.filter.as_deref(),
        rotation: app_config.logging.rotation(),
    }) {
        eprintln!("Warning: {:#}", err);
    }

    match run_command(cli.command, &app_config).await {
        Ok(Outcome::Done) => ExitCode::SUCCESS,
        Ok(Outcome::NotFound) => ExitCode::from(EXIT_NOT_FOUND),
        Err(err) => {
            eprintln!("Error: {:#}", err);
            ExitCode::from(exit_code(&err))
        }
    }
}

async fn run_command(command: Commands, app_config: &config::AppConfig) -> Result<Outcome> {
    let coordinator = StatsCoordinator::connect(&app_config.storage)
        .await
        .context("Failed to open job stats storage")?;
    debug!(mode = %coordinator.mode(), "Storage connected");

    match command {
        Commands::Store { job, blob } => {
            let key = job.key();
            let blob = match blob {
                Some(blob) => blob,
                None => read_stdin().await?,
            };
            if blob.trim().is_empty() {
                bail!("No stats blob given for {}", key);
            }

            coordinator
                .save_blob(&key, &blob)
                .await
                .with_context(|| format!("Failed to store statistics for {}", key))?;
            info!(job = %key, "Statistics stored");
            Ok(Outcome::Done)
        }

        Commands::Show { job, raw } => {
            let key = job.key();
            let output = if raw {
                coordinator.load_blob(&key).await
            } else {
                match coordinator.load(&key).await {
                    Ok(Some(payload)) => Ok(Some(
                        serde_json::to_string_pretty(&payload)
                            .context("Failed to render statistics")?,
                    )),
                    Ok(None) => Ok(None),
                    Err(err) => Err(err),
                }
            }
            .with_context(|| format!("Failed to read statistics for {}", key))?;

            match output {
                Some(text) => {
                    println!("{}", text);
                    Ok(Outcome::Done)
                }
                None => {
                    eprintln!("No statistics stored for {}", key);
                    Ok(Outcome::NotFound)
                }
            }
        }

        Commands::Recent { limit } => {
            let store = relational(&coordinator)?;
            let summaries = store
                .recent(limit)
                .await
                .context("Failed to list recent jobs")?;

            for summary in summaries {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    summary.cluster,
                    summary.job_id,
                    summary
                        .updated_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_default(),
                    display_opt(summary.total_time),
                    display_opt(summary.gpu_count),
                );
            }
            Ok(Outcome::Done)
        }

        Commands::Delete { job } => {
            let key = job.key();
            let deleted = relational(&coordinator)?
                .delete(&key)
                .await
                .with_context(|| format!("Failed to delete statistics for {}", key))?;
            if deleted {
                Ok(Outcome::Done)
            } else {
                eprintln!("No statistics stored for {}", key);
                Ok(Outcome::NotFound)
            }
        }

        Commands::InitSchema => {
            relational(&coordinator)?
                .ensure_schema()
                .await
                .context("Failed to create tables")?;
            println!("Schema ready");
            Ok(Outcome::Done)
        }
    }
}

fn relational(coordinator: &StatsCoordinator) -> Result<&RelationalStore> {
    coordinator
        .relational()
        .context("This command needs the external database ([external] enabled = true)")
}

async fn read_stdin() -> Result<String> {
    let mut blob = String::new();
    tokio::io::stdin()
        .read_to_string(&mut blob)
        .await
        .context("Failed to read blob from stdin")?;
    Ok(blob)
}

fn display_opt(value: Option<i64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Exit status for a failed run: temporary storage trouble gets EX_TEMPFAIL
/// so the epilog can retry.
fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(e) = cause.downcast_ref::<StatsError>() {
            return if e.is_retryable() { EXIT_TEMPFAIL } else { 1 };
        }
        if let Some(e) = cause.downcast_ref::<StoreError>() {
            return if e.is_retryable() { EXIT_TEMPFAIL } else { 1 };
        }
    }
    1
}
