//! recon-node: applies a resource manifest against the control plane.
//!
//! - Reads the manifest and the state file
//! - Reconciles every declared resource concurrently
//! - Prunes resources the manifest no longer declares
//! - Writes the updated state file

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use recon_core::{EngineConfig, HttpRemote, MemoryRemote, RemoteClient, Timeouts};
use serde_json::Value;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod agent;
mod manifest;

use agent::{Agent, Report};
use manifest::{Kind, Manifest, StateFile};

/// recon node agent
#[derive(Parser, Debug)]
#[command(name = "recon-node", version, about)]
struct Args {
    /// Control plane endpoint (e.g. https://management.azure.com). Dry run in memory when unset.
    #[arg(long, env = "RECON_ENDPOINT")]
    endpoint: Option<String>,

    /// Bearer token for the control plane
    #[arg(long, env = "RECON_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Subscription that owns the managed resources
    #[arg(long, env = "RECON_SUBSCRIPTION_ID")]
    subscription_id: String,

    /// State file
    #[arg(long, env = "RECON_STATE", default_value = "recon-state.json")]
    state: PathBuf,

    /// Engine configuration file (timeouts and polling, JSON)
    #[arg(long, env = "RECON_CONFIG")]
    config: Option<PathBuf>,

    /// Override every operation timeout, in seconds
    #[arg(long, env = "RECON_TIMEOUT_SECS")]
    timeout_secs: Option<u64>,

    /// Initial long-running-operation poll interval, in milliseconds
    #[arg(long, env = "RECON_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// api-version used when no per-type override matches
    #[arg(long, default_value = "2023-08-01")]
    default_api_version: String,

    /// Per-type api-version, e.g. Microsoft.Cache/redis=2023-08-01
    #[arg(long = "api-version", value_parser = parse_key_value)]
    api_versions: Vec<(String, String)>,

    /// Objects to pre-load into the in-memory control plane (JSON map of id to body)
    #[arg(long, conflicts_with = "endpoint")]
    seed: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconcile the manifest and prune undeclared resources
    Apply {
        #[arg(long, env = "RECON_MANIFEST")]
        manifest: PathBuf,
    },
    /// Re-read every resource in state, dropping deleted ones
    Refresh,
    /// Delete every resource in state
    Destroy,
    /// Adopt an existing resource into state
    Import {
        /// Name to record the resource under
        name: String,
        #[arg(value_enum)]
        kind: Kind,
        /// Resource identifier
        id: String,
    },
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got {:?}", s))?;
    if key.is_empty() || value.is_empty() {
        return Err(format!("expected KEY=VALUE, got {:?}", s));
    }
    Ok((key.to_string(), value.to_string()))
}

async fn engine_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let data = tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read config {}", path.display()))?;
            serde_json::from_slice(&data)
                .with_context(|| format!("Invalid config {}", path.display()))?
        }
        None => EngineConfig::default(),
    };
    if let Some(secs) = args.timeout_secs {
        config.timeouts = Timeouts::uniform(Duration::from_secs(secs));
    }
    if let Some(ms) = args.poll_interval_ms {
        config.poll.initial_interval = Duration::from_millis(ms);
    }
    Ok(config)
}

async fn remote(args: &Args) -> Result<Arc<dyn RemoteClient>> {
    if let Some(endpoint) = &args.endpoint {
        info!("Control plane: {}", endpoint);
        let mut remote = HttpRemote::new(endpoint, &args.default_api_version);
        if let Some(token) = &args.token {
            remote = remote.with_token(token);
        }
        for (resource_type, version) in &args.api_versions {
            remote = remote.with_api_version(resource_type, version);
        }
        return Ok(Arc::new(remote));
    }

    warn!("No endpoint given, using an in-memory control plane (dry run)");
    let Some(path) = &args.seed else {
        return Ok(Arc::new(MemoryRemote::new()));
    };
    let data = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read seed {}", path.display()))?;
    let objects: HashMap<String, Value> = serde_json::from_slice(&data)
        .with_context(|| format!("Invalid seed {}", path.display()))?;
    info!("Seeded {} objects from {}", objects.len(), path.display());
    Ok(Arc::new(MemoryRemote::from_seed(objects)?))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "recon_node=info,recon_core=info,reqwest=warn,hyper=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = engine_config(&args).await?;
    let agent = Agent::new(remote(&args).await?, &args.subscription_id, config);

    let mut state = StateFile::load(&args.state).await?;
    info!(
        "Loaded {} resources from {}",
        state.resources.len(),
        args.state.display()
    );

    let report = match &args.command {
        Command::Apply { manifest } => {
            let manifest = Manifest::load(manifest).await?;
            agent.apply(&manifest, &mut state).await
        }
        Command::Refresh => agent.refresh(&mut state).await,
        Command::Destroy => agent.destroy(&mut state).await,
        Command::Import { name, kind, id } => {
            agent.import(&mut state, name, *kind, id).await?;
            Report::default()
        }
    };

    state.save(&args.state).await?;

    if !report.is_success() {
        for (name, error) in &report.failed {
            warn!("{}: {}", name, error);
        }
        bail!("{} resource(s) failed", report.failed.len());
    }
    info!("Done");
    Ok(())
}
