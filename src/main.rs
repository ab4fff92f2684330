//! `tcp-lb` binary: build everything from a TOML file and serve until Ctrl-C.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;

use tcp_lb::config::load_config;
use tcp_lb::{App, AppContext, LbConfig};

#[derive(Debug, Parser)]
#[command(name = "tcp-lb", version, about = "Non-blocking TCP load balancer")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides `observability.log_level`.
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => load_config(path)?,
        None => LbConfig::default(),
    };
    if let Some(level) = args.log_level {
        config.observability.log_level = level;
    }
    AppContext::init_observability(&config.observability);

    tracing::info!(version = env!("CARGO_PKG_VERSION"), config = ?args.config, "tcp-lb starting");

    let ctx = Arc::new(AppContext::new());
    let app = App::build(&config)?;
    if let Err(e) = app.start() {
        app.close();
        return Err(e.into());
    }
    app.register_teardown(&ctx);

    let mut shutdown = ctx.shutdown().subscribe();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Shutdown signal received"),
            Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
        }
        signal_ctx.teardown();
    });

    // teardown may also be requested by anything else holding the context
    let _ = shutdown.recv().await;

    tracing::info!("Shutdown complete");
    Ok(())
}
