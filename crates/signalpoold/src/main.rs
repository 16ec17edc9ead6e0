//! signalpoold — the SignalPool pod daemon.
//!
//! Hosts one pod agent against a shared coordination store:
//! - Membership heartbeat
//! - Queue sampling and metric publication
//! - Scaling evaluation (decisions are written for the orchestrator)
//! - Failover scan and ring maintenance
//!
//! # Usage
//!
//! ```text
//! signalpoold run --config pool.toml --store redis://cache:6379 --pod-id pricer-7
//! signalpoold decision --store redis://cache:6379
//! signalpoold config --config pool.toml
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use sha2::{Digest, Sha256};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use signalpool_core::PoolConfig;
use signalpool_state::{Keyspace, ScalingDecision, SharedClock, SystemClock, decode};
use signalpoold::{PodAgent, StoreSpec, open_store};

const DEFAULT_FILTER: &str = "info,signalpool=debug";

#[derive(Parser)]
#[command(name = "signalpoold", about = "SignalPool pod daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log output format.
    #[arg(long, value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Command {
    /// Join the pool and run until Ctrl-C.
    Run {
        /// TOML configuration file. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Coordination store: memory, redb:PATH, or redis://URL.
        #[arg(long, default_value = "memory")]
        store: StoreSpec,

        /// Pod identity. Generated from the host name when omitted.
        #[arg(long)]
        pod_id: Option<String>,
    },
    /// Print the currently published scaling decision as JSON.
    Decision {
        #[arg(long)]
        config: Option<PathBuf>,

        #[arg(long, default_value = "memory")]
        store: StoreSpec,
    },
    /// Print the effective configuration after file and environment overrides.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            store,
            pod_id,
        } => run(config.as_deref(), store, pod_id).await,
        Command::Decision { config, store } => print_decision(config.as_deref(), store).await,
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

/// Defaults, then the file if given, then `SIGNALPOOL_*` overrides.
fn load_config(path: Option<&Path>) -> anyhow::Result<PoolConfig> {
    if let Some(path) = path {
        return PoolConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()));
    }
    let mut config = PoolConfig::default();
    config.apply_env(|key| std::env::var(key).ok())?;
    config.validate()?;
    Ok(config)
}

async fn run(
    config: Option<&Path>,
    store: StoreSpec,
    pod_id: Option<String>,
) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let pod_id = pod_id.unwrap_or_else(generate_pod_id);
    info!(%pod_id, namespace = %config.namespace, store = %store, "signalpool pod starting");

    let clock: SharedClock = Arc::new(SystemClock);
    let store = open_store(&store, clock.clone()).await?;

    let mut metadata = HashMap::new();
    metadata.insert("pid".to_string(), process::id().to_string());
    metadata.insert("version".to_string(), env!("CARGO_PKG_VERSION").to_string());

    let agent = Arc::new(PodAgent::new(pod_id, config, store, clock).with_metadata(metadata));

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let agent_handle = tokio::spawn(agent.clone().run(shutdown_rx));

    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for Ctrl-C, shutting down");
    }
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    agent_handle.await.context("pod agent task panicked")??;
    info!(pod_id = %agent.pod_id(), "signalpool pod stopped");
    Ok(())
}

async fn print_decision(config: Option<&Path>, store: StoreSpec) -> anyhow::Result<()> {
    let config = load_config(config)?;
    let store = open_store(&store, Arc::new(SystemClock)).await?;
    let keys = Keyspace::new(config.namespace.clone());

    match store.get(&keys.scale_decision()).await? {
        Some(bytes) => {
            let decision: ScalingDecision = decode(&bytes)?;
            println!("{}", serde_json::to_string_pretty(&decision)?);
        }
        None => println!("null"),
    }
    Ok(())
}

/// `{host}-{8 hex}`: stable prefix for humans, random-enough suffix so two
/// processes on one host never collide.
fn generate_pod_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "pod".to_string());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();

    let mut hasher = Sha256::new();
    hasher.update(host.as_bytes());
    hasher.update(process::id().to_be_bytes());
    hasher.update(nanos.to_be_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{host}-{}", &digest[..8])
}
