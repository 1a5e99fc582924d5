//! vmfleet instance-group CLI
//!
//! Initializes the instance group against the local Incus daemon and runs
//! one operation per invocation. Results are printed as JSON on stdout;
//! logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vmfleet_instance_group::incus::{IncusBackend, IncusConfig};
use vmfleet_instance_group::{GroupConfig, GroupError, InstanceGroup, InstanceState};

/// Manage a group of ephemeral worker VMs.
#[derive(Debug, Parser)]
#[command(name = "instance-group")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, global = true, env = "VMFLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show provider metadata.
    Info,

    /// Report the state of every instance.
    Update,

    /// Show connection details for an instance.
    ConnectInfo {
        /// Instance name.
        name: String,
    },

    /// Request more instances.
    Increase {
        /// Number of instances wanted.
        delta: usize,
    },

    /// Delete the named instances.
    Decrease {
        /// Instance names.
        #[arg(required = true)]
        names: Vec<String>,
    },

    /// Purge deleted instances from the state file.
    Shutdown,
}

/// Contents of the configuration file.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileConfig {
    #[serde(flatten)]
    group: GroupConfig,
    incus: IncusConfig,
}

impl FileConfig {
    fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }
}

#[derive(Debug, Serialize)]
struct InstanceReport<'a> {
    name: &'a str,
    state: InstanceState,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| cli.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run(cli).await {
        match e.downcast_ref::<GroupError>() {
            Some(group_error) => error!(
                reason = group_error.reason_code(),
                error = %group_error,
                "Command failed"
            ),
            None => error!(error = %e, "Command failed"),
        }
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let file = FileConfig::load(cli.config.as_deref())?;

    let mut incus = file.incus;
    incus.operation_timeout = file.group.clone().with_defaults().operation_timeout();
    info!(socket = %incus.socket_path.display(), "Using Incus backend");
    let backend = Arc::new(IncusBackend::new(incus));

    let (group, provider) = InstanceGroup::initialize(file.group, backend).await?;

    match cli.command {
        Commands::Info => print_json(&provider)?,
        Commands::Update => {
            let mut reports = Vec::new();
            group.update(|name, state| {
                reports.push((name.to_string(), state));
            });
            let reports: Vec<InstanceReport<'_>> = reports
                .iter()
                .map(|(name, state)| InstanceReport {
                    name,
                    state: *state,
                })
                .collect();
            print_json(&reports)?;
        }
        Commands::ConnectInfo { name } => {
            let info = group.connect_info(&name).await?;
            print_json(&info)?;
        }
        Commands::Increase { delta } => {
            let created = group.increase(delta).await?;
            print_json(&serde_json::json!({ "created": created }))?;
        }
        Commands::Decrease { names } => {
            let removed = group.decrease(names.as_slice()).await;
            print_json(&serde_json::json!({ "removed": removed }))?;
        }
        Commands::Shutdown => {
            let purged = group.shutdown();
            print_json(&serde_json::json!({ "purged": purged }))?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
