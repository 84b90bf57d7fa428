//! Service binary
//!
//! Wires the orchestrator to a configuration file (optional first argument,
//! JSON) and the process environment: tracing to stderr, SIGINT/SIGTERM for
//! graceful shutdown, exit code from the shutdown reason.
//!
//! The change feed and the subscriber registry are external collaborators;
//! this binary starts with the in-memory registry (populated by the CRUD
//! surface) and expects a feed implementation to be linked in by the
//! embedding build. Until one is, it refuses to start rather than pretend
//! to tail anything.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use webhook_core::Config;
use webhook_service::orchestrator::{Orchestrator, Seams};
use webhook_service::registry::InMemoryRegistry;

mod feed_binding;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match run().await {
        Ok(code) => code,
        Err(error) => {
            error!(%error, "fatal error during startup");
            ExitCode::from(2)
        }
    }
}

async fn run() -> anyhow::Result<ExitCode> {
    let config = load_config()?;

    let feed = feed_binding::build_feed(&config).context("no change feed available")?;
    let registry = Arc::new(InMemoryRegistry::new());

    let orchestrator = Arc::new(
        Orchestrator::new(config, Seams::new(feed, registry))
            .context("invalid configuration")?,
    );

    let shutdown_trigger = Arc::clone(&orchestrator);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            shutdown_trigger.trigger_shutdown();
        }
    });

    let reason = orchestrator.run().await;
    Ok(ExitCode::from(reason.exit_code() as u8))
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::args().nth(1) {
        Some(path) => {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("reading config file {path}"))?;
            let config: Config =
                serde_json::from_str(&raw).with_context(|| format!("parsing config file {path}"))?;
            Ok(config)
        }
        None => Ok(Config::default()),
    }
}
