//! sip: serve any CLI command through the browser.

use clap::Parser;
use sip_server::{CliOverrides, ServerConfig, SessionManager};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// sip: run a command on a pseudo-terminal and share it over WebSocket
#[derive(Parser, Debug)]
#[command(name = "sip", version, about = "Serve a terminal command to the browser")]
struct Cli {
    /// Address to listen on
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Verbose logging
    #[arg(long)]
    debug: bool,

    /// Working directory for the command
    #[arg(short, long)]
    dir: Option<PathBuf>,

    /// Config file path (default: ~/.config/sip/config.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Command to run, followed by its arguments
    #[arg(last = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let overrides = CliOverrides {
        host: cli.host.clone(),
        port: cli.port,
        debug: cli.debug,
        work_dir: cli.dir.clone(),
    };
    let config = ServerConfig::load(cli.config.as_deref(), overrides);

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let debug = cli.debug || config.as_ref().map(|c| c.debug).unwrap_or(false);
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    let config = match config {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            std::process::exit(1);
        }
    };

    let Some((command, args)) = cli.command.split_first() else {
        error!("no command given; usage: sip [OPTIONS] -- <COMMAND> [ARGS]...");
        std::process::exit(1);
    };

    let manager = match SessionManager::bind(config).await {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "failed to start server");
            std::process::exit(1);
        }
    };

    let url = manager.config().websocket_url(manager.local_addr());
    println!("Serving terminal at {url}");
    info!(version = env!("CARGO_PKG_VERSION"), url = %url, "starting sip");

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("received shutdown signal");
        signal_cancel.cancel();
    });

    match manager.serve_command(cancel, command, args, None).await {
        Ok(info) => {
            info!(reason = %info.reason, code = info.exit_code, "sip stopped");
        }
        Err(e) => {
            error!(error = %e, "server error");
            std::process::exit(1);
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
