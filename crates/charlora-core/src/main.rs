//! Charlora - Entry Point
//!
//! This binary starts the one-click character LoRA training service.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use charlora_core::config::{Config, CONFIG_ENV_VAR};
use charlora_core::{server, JobService, NvidiaSmiProbe};

#[derive(Debug, Parser)]
#[command(name = "charlora", version, about = "One-click character LoRA training service")]
struct Args {
    /// Configuration file (YAML).
    #[arg(long, env = CONFIG_ENV_VAR)]
    config: Option<PathBuf>,

    /// Listen address; overrides `server.address`.
    #[arg(long)]
    address: Option<SocketAddr>,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.json_logs);

    let path = Config::resolve_path(args.config, None);
    let config = Config::load(&path).with_context(|| format!("loading configuration from {}", path.display()))?;
    let address = args.address.unwrap_or(config.server.address);
    info!(
        config = %path.display(),
        jobs_root = %config.training.jobs_root.display(),
        ed_lora_dir = %config.training.ed_lora_dir.display(),
        "Configuration loaded"
    );

    let service = JobService::new(config, Arc::new(NvidiaSmiProbe::default()));
    server::run(service, address).await.context("HTTP server failed")?;
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "charlora_core=debug,charlora_training=debug,info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
