//! Sandboxed code execution server.
//!
//! Loads the YAML configuration, checks that the container runtime is
//! reachable and the sandbox image is present, then serves `POST /run` until
//! Ctrl+C or SIGTERM. In-flight runs are cancelled on shutdown and their
//! containers removed before the process exits.

use anyhow::{Context, Result};
use clap::Parser;
use log::LevelFilter;
use sandrun_core::{ConfigLoader, DockerRuntime, SandboxRunner};
use sandrun_server::{shutdown_signal, SandrunServer, ServerConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[clap(author, version, about = "sandrun - run untrusted C programs in throwaway containers")]
struct Cli {
    #[clap(long, short, help = "Path to the YAML configuration file (built-in defaults when omitted)")]
    config: Option<PathBuf>,

    #[clap(long, help = "Override the configured bind address")]
    bind_addr: Option<SocketAddr>,

    #[clap(long, help = "Serve static files from this directory")]
    static_dir: Option<PathBuf>,

    #[clap(long, short, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level_filter = cli.log_level.parse().unwrap_or(LevelFilter::Info);
    env_logger::Builder::new()
        .filter_level(log_level_filter)
        .init();

    let mut config = match &cli.config {
        Some(path) => {
            log::info!("Loading configuration from file: {}", path.display());
            ConfigLoader::from_file(path).await?
        }
        None => {
            log::info!("No configuration file given, using built-in defaults");
            ConfigLoader::defaults()?
        }
    };
    if let Some(addr) = cli.bind_addr {
        config.server.bind_addr = addr;
    }
    if let Some(dir) = cli.static_dir {
        config.server.static_dir = Some(dir);
    }

    let runtime = DockerRuntime::connect(Duration::from_secs(config.runtime.request_timeout_secs))
        .context("Failed to connect to the Docker daemon")?;
    runtime
        .preflight(&config.sandbox.image)
        .await
        .with_context(|| format!("Sandbox image {} is not usable", config.sandbox.image))?;

    let runner = SandboxRunner::from_config(Arc::new(runtime), &config)?;
    log::info!(
        "Sandbox ready: image={} deadline={}s max_source={}B",
        config.sandbox.image,
        config.sandbox.exec_timeout_secs,
        config.sandbox.max_source_bytes
    );

    let server = SandrunServer::with_config(
        Arc::new(runner),
        ServerConfig::from_settings(&config.server),
    );

    if let Err(e) = server.serve_with_shutdown(shutdown_signal()).await {
        log::error!("Server failed: {}", e);
        return Err(e.into());
    }

    Ok(())
}
