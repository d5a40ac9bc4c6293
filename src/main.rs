use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;
use warden::config::ConfigStore;
use warden::{Supervisor, SupervisorOptions};

/// Warden - process supervision and auto-restart for artifact-launched services
#[derive(Parser)]
#[command(name = "warden")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the durable configuration file
    #[arg(short, long, default_value = "monitor_config.json")]
    config: PathBuf,

    /// Override the configured artifact folder
    #[arg(short, long)]
    folder: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervision loop until interrupted
    Run {
        /// Seconds between monitoring passes
        #[arg(short, long, default_value = "30")]
        interval: u64,
    },

    /// List live supervised services
    List,

    /// List launchable artifacts in a folder
    Artifacts {
        /// Folder to scan (defaults to the configured folder)
        folder: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warden=info")),
        )
        .init();

    let cli = Cli::parse();
    let store = ConfigStore::new(&cli.config);

    let result = match cli.command.unwrap_or(Commands::Run { interval: 30 }) {
        Commands::Run { interval } => {
            let options = SupervisorOptions {
                check_interval: Duration::from_secs(interval),
                ..SupervisorOptions::default()
            };
            let supervisor = Arc::new(Supervisor::new(store, options));
            match apply_folder_override(&supervisor, cli.folder.as_deref()).await {
                Ok(()) => run_loop(supervisor).await,
                Err(e) => Err(e),
            }
        }
        Commands::List => {
            let supervisor = Supervisor::new(store, SupervisorOptions::default());
            list_services(&supervisor).await
        }
        Commands::Artifacts { folder } => {
            let supervisor = Supervisor::new(store, SupervisorOptions::default());
            list_artifacts(&supervisor, folder.or(cli.folder)).await
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn apply_folder_override(
    supervisor: &Supervisor,
    folder: Option<&Path>,
) -> anyhow::Result<()> {
    if let Some(folder) = folder {
        supervisor
            .set_folder_path(folder)
            .await
            .context("invalid artifact folder")?;
    }
    Ok(())
}

async fn run_loop(supervisor: Arc<Supervisor>) -> anyhow::Result<()> {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loop_handle = tokio::spawn(Arc::clone(&supervisor).run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for interrupt signal")?;
    info!("interrupt received, stopping");
    let _ = shutdown_tx.send(true);
    let _ = loop_handle.await;
    Ok(())
}

async fn list_services(supervisor: &Supervisor) -> anyhow::Result<()> {
    let services = supervisor.list_services().await;
    if services.is_empty() {
        println!("No supervised services running.");
        return Ok(());
    }

    println!(
        "{:<8} {:<20} {:<6} {:>8} {:>12} {:>12} {}",
        "PID", "NAME", "KIND", "CPU%", "MEM MB", "UPTIME", "STATE"
    );
    for service in services {
        let state = if service.restarting {
            service.phase.to_string()
        } else if service.policy.as_ref().map_or(false, |p| p.enabled) {
            "watched".to_string()
        } else {
            "unwatched".to_string()
        };
        println!(
            "{:<8} {:<20} {:<6} {:>8.1} {:>12.1} {:>12} {}",
            service.record.pid,
            service.record.logical_name,
            service.record.kind,
            service.record.cpu_percent,
            service.record.memory_mb(),
            service.record.uptime_formatted(),
            state
        );
    }
    Ok(())
}

async fn list_artifacts(supervisor: &Supervisor, folder: Option<PathBuf>) -> anyhow::Result<()> {
    let entries = match folder {
        Some(folder) => warden::service::list_artifacts(&folder)?,
        None => supervisor.list_artifacts().await?,
    };

    if entries.is_empty() {
        println!("No launchable artifacts found.");
        return Ok(());
    }
    for entry in entries {
        println!("{:<6} {:>10.1} MB  {}", entry.kind, entry.size_mb(), entry.name);
    }
    Ok(())
}
