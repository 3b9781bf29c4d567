use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use host_supervisor::config::SupervisorConfig;
use host_supervisor::invocation::DirectoryStorage;
use host_supervisor::manager::JobsManager;

#[derive(Parser)]
#[command(name = "host-supervisor", about = "Continuous job host supervisor", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Supervise the configured jobs until interrupted
    Run,
    /// Enqueue a function invocation and print its correlation id
    Invoke {
        function: String,
        /// Raw payload handed to the function's input binding
        #[arg(long, default_value = "")]
        payload: String,
        /// Defaults to the first configured job
        #[arg(long)]
        job: Option<String>,
    },
    /// Print the status record of an invocation, if the host wrote one
    Status {
        function: String,
        id: Uuid,
        #[arg(long)]
        job: Option<String>,
    },
    /// Print the configured jobs as JSON
    List,
}

/// Exit code of `status` while the host has not recorded a status yet.
const STATUS_PENDING: u8 = 2;

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let _log_guard = init_tracing();
    let cli = Cli::parse();

    let config = load_config().context("Invalid configuration")?;
    let storage = Arc::new(DirectoryStorage::new(config.storage_dir.clone()));
    let manager = JobsManager::continuous(&config, storage.clone(), storage);

    let code = execute(cli.command, &config, &manager).await?;
    Ok(ExitCode::from(code))
}

fn load_config() -> host_supervisor::error::Result<SupervisorConfig> {
    Ok(SupervisorConfig::from_env()?)
}

/// Run one command and return the process exit code.
async fn execute(
    command: Command,
    config: &SupervisorConfig,
    manager: &JobsManager,
) -> anyhow::Result<u8> {
    match command {
        Command::Run => run(config, manager).await?,
        Command::Invoke {
            function,
            payload,
            job,
        } => {
            let job = job.as_deref().unwrap_or(config.host_job_name());
            let id = manager.invoke(job, &function, &payload).await?;
            println!("{id}");
        }
        Command::Status { function, id, job } => {
            let job = job.as_deref().unwrap_or(config.host_job_name());
            match manager.get_status(job, &function, id).await? {
                Some(status) => println!("{status}"),
                None => {
                    eprintln!("No status recorded for {id} yet");
                    return Ok(STATUS_PENDING);
                }
            }
        }
        Command::List => {
            let jobs = manager.list_jobs().await?;
            println!("{}", serde_json::to_string_pretty(&jobs)?);
        }
    }

    Ok(0)
}

async fn run(config: &SupervisorConfig, manager: &JobsManager) -> anyhow::Result<()> {
    eprintln!("Host supervisor v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Jobs root: {}", config.jobs_root.display());
    eprintln!("   Jobs: {}", config.job_names.join(", "));
    eprintln!("   Host: {}", config.host_executable.display());
    eprintln!("   Storage: {}\n", config.storage_dir.display());

    manager.open().await;
    for view in manager.list_jobs().await? {
        if let Some(status) = view.status {
            info!(job = %view.job.name, phase = %status.phase, error = ?status.error, "Initial state");
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    manager.shutdown().await;
    Ok(())
}

/// Console logging, plus a daily file when `HOST_SUPERVISOR_LOG_DIR` is set.
fn init_tracing() -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("HOST_SUPERVISOR_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "host-supervisor.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();

    guard
}
