//! tidegated — operator commands for Tidegate.
//!
//! Administers the scaling control loop's failsafe breaker: reads
//! configuration, connects to the Consul KV store, and flips a pool's (or
//! job's) failsafe mode. The loop itself is embedded through
//! `tidegate_control::ScalingController::from_config` by the process that
//! owns the compute provider and planner.
//!
//! # Usage
//!
//! ```text
//! tidegated failsafe --disable --pool example-group --config /etc/tidegate
//! tidegated failsafe --enable --pool nightly --job --force
//! ```

use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{ArgGroup, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tidegate_core::{FailureMessage, LogNotifier, ResourceType, ScalingState, TidegateConfig};
use tidegate_failsafe::Failsafe;
use tidegate_state::{ConsulKv, ReadStatus, StateStoreClient};

#[derive(Parser, Debug)]
#[command(name = "tidegated", about = "Tidegate failsafe administration")]
struct Cli {
    /// Config file, or a directory of *.toml files merged in name order.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter directive (overridden by RUST_LOG).
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Enable or disable failsafe mode for a worker pool or job.
    #[command(group(ArgGroup::new("mode").required(true).args(["enable", "disable"])))]
    Failsafe {
        /// Stop all automated scaling of the resource.
        #[arg(long)]
        enable: bool,

        /// Resume automated scaling and clear the failure count.
        #[arg(long)]
        disable: bool,

        /// Worker pool (or job, with --job) name.
        #[arg(long)]
        pool: String,

        /// Target a job's scaling state instead of a worker pool's.
        #[arg(long)]
        job: bool,

        /// Skip the confirmation prompt.
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => TidegateConfig::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => TidegateConfig::default(),
    };

    let directive = cli.log_level.as_deref().unwrap_or(&config.log_level);
    init_tracing(directive)?;

    match cli.command {
        Command::Failsafe {
            enable,
            pool,
            job,
            force,
            ..
        } => {
            let resource_type = if job {
                ResourceType::Job
            } else {
                ResourceType::Cluster
            };
            run_failsafe(&config, resource_type, &pool, enable, force).await
        }
    }
}

fn init_tracing(directive: &str) -> anyhow::Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(directive)
            .with_context(|| format!("invalid log level {directive:?}"))?,
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
    Ok(())
}

async fn run_failsafe(
    config: &TidegateConfig,
    resource_type: ResourceType,
    name: &str,
    enable: bool,
    force: bool,
) -> anyhow::Result<()> {
    let backend = ConsulKv::new(&config.consul.address, config.consul.token.clone())
        .context("connecting to consul")?;
    let store = StateStoreClient::new(Arc::new(backend));
    let failsafe = Failsafe::new(store.clone(), Arc::new(LogNotifier));

    let mut state = ScalingState::new(&config.consul.key_root, resource_type, name);
    match store.read_state(&mut state, false).await {
        ReadStatus::Unavailable => bail!(
            "could not read scaling state at {} from {}",
            state.state_path,
            config.consul.address
        ),
        ReadStatus::Corrupt => {
            warn!(state_path = %state.state_path, "existing scaling state is unreadable and will be replaced");
        }
        ReadStatus::Missing => {
            info!(state_path = %state.state_path, "no scaling state yet, a new record will be written");
        }
        ReadStatus::Loaded { .. } | ReadStatus::Initialized => {}
    }

    let action = if enable { "enable" } else { "disable" };
    if !force {
        let prompt = format!(
            "{action} failsafe mode for {resource_type} {name} (failure count {}, failsafe {})?",
            state.failure_count, state.failsafe_mode
        );
        let confirmed = tokio::task::spawn_blocking(move || confirm(&prompt)).await??;
        if !confirmed {
            println!("aborted");
            return Ok(());
        }
    }

    let msg = FailureMessage::for_state(&state);
    failsafe.set_mode(&mut state, enable, &msg).await;

    // set_mode only logs store errors; confirm the write landed.
    let mut stored = ScalingState::new(&config.consul.key_root, resource_type, name);
    let status = store.read_state(&mut stored, false).await;
    if !matches!(status, ReadStatus::Loaded { .. }) || stored.failsafe_mode != enable {
        bail!("failed to {action} failsafe mode at {}", state.state_path);
    }

    println!("{}", serde_json::to_string_pretty(&stored)?);
    Ok(())
}

fn confirm(prompt: &str) -> io::Result<bool> {
    print!("{prompt} [y/N]: ");
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().lock().read_line(&mut line)?;
    Ok(is_yes(&line))
}

fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
