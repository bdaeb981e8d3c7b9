//! Stdio entry point: load settings, wire the service graph, serve.

use anyhow::Context;
use cognitive_processor::config::Settings;
use cognitive_processor::server::{Server, ServerContext};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the protocol.
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let config_path = std::env::var("CONFIG_PATH").ok().map(PathBuf::from);
    let (mut settings, writeback) =
        Settings::load(config_path.as_deref()).context("loading settings")?;
    settings.apply_env();
    tracing::info!(
        data_dir = %settings.data_dir.display(),
        writeback,
        providers = settings.providers.len(),
        "settings loaded"
    );

    let ctx = ServerContext::from_settings(settings).context("wiring services")?;
    let ctx = Arc::new(ctx);

    // Background provider probes feed the health monitor.
    let probe_task = Arc::clone(&ctx.dispatcher).spawn_health_task(Arc::clone(&ctx.health));

    let server = Server::new(Arc::clone(&ctx));
    let result = server.run().await;

    probe_task.abort();
    result.context("serving")
}
