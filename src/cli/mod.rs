// CLI module - The `flotilla` runner binary

mod output;

use crate::config::FleetConfig;
use crate::orchestrator::{InstanceSpec, Orchestrator};
use crate::providers::DirectoryWorkspaceProvider;
use crate::state::{JsonStateStore, MemoryStateStore, StateStore};
use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Flotilla - supervise a fleet of long-running worker processes
#[derive(Parser)]
#[command(name = "flotilla")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recover persisted state, start configured instances and supervise until interrupted
    Run {
        /// Fleet configuration file (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Validate a configuration file and print what it would run
    Check {
        /// Fleet configuration file (.toml or .json)
        #[arg(short, long)]
        config: PathBuf,
    },

    /// Show instances recorded in a state file
    Status {
        /// State file written by a running fleet
        #[arg(short, long)]
        state_file: PathBuf,
    },
}

impl Cli {
    /// Run the CLI application
    pub async fn run() -> anyhow::Result<()> {
        let cli = Cli::parse();
        cli.init_logging();
        cli.execute().await
    }

    fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(&self.log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        // A subscriber may already be installed when embedded
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init();
    }

    async fn execute(&self) -> anyhow::Result<()> {
        match &self.command {
            Commands::Run { config } => run_fleet(config).await,
            Commands::Check { config } => check_config(config),
            Commands::Status { state_file } => show_status(state_file),
        }
    }
}

async fn run_fleet(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;

    let store: Arc<dyn StateStore> = match &config.state_file {
        Some(state_file) => Arc::new(JsonStateStore::new(state_file)),
        None => Arc::new(MemoryStateStore::new()),
    };

    let mut builder = Orchestrator::builder(config.clone()).state_store(store);
    if let Some(root) = &config.workspace_root {
        builder = builder.workspace_provider(Arc::new(DirectoryWorkspaceProvider::new(root)));
    }
    let orchestrator = builder.build()?;

    let summary = orchestrator.recover().await?;
    if summary.restored > 0 {
        output::print_info(&format!(
            "Recovered {} instance(s): {} re-attached, {} crashed",
            summary.restored, summary.reattached, summary.crashed
        ));
    }

    for instance in &config.instances {
        if orchestrator.get_status(&instance.id).is_ok() {
            continue;
        }
        match orchestrator.start_instance(InstanceSpec::from(instance)).await {
            Ok(started) => output::print_success_msg(&format!(
                "Started {} (pid {})",
                started.id,
                started
                    .pid()
                    .map(|pid| pid.to_string())
                    .unwrap_or_else(|| "-".to_string())
            )),
            Err(e) => output::print_error(&format!("Failed to start {}: {}", instance.id, e)),
        }
    }

    output::print_instance_table(&orchestrator.list_instances());

    wait_for_shutdown_signal().await?;

    info!("Shutdown requested");
    orchestrator
        .shutdown(config.supervisor.stop_timeout())
        .await;
    output::print_instance_table(&orchestrator.list_instances());
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Ctrl-C handler failed: {}", e);
            }
        }
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")
}

fn check_config(path: &Path) -> anyhow::Result<()> {
    let config = FleetConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?;

    output::print_success_msg(&format!("{} is valid", path.display()));
    output::print_config_summary(&config);
    Ok(())
}

fn show_status(state_file: &Path) -> anyhow::Result<()> {
    let store = JsonStateStore::new(state_file);
    let instances = store
        .load_all()
        .with_context(|| format!("reading {}", state_file.display()))?;

    output::print_instance_table(&instances);
    Ok(())
}
