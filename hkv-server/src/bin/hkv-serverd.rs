//! Daemon entry point. Owns process exit codes and OS signal wiring
//! (SPEC_FULL.md §2.4) — the library core never calls `exit` or installs
//! signal handlers itself.

use std::env;
use std::process::ExitCode;
use std::sync::Arc;

use hkv_common::Config;
use hkv_server::{handle_connection, Metrics, Server};
use tokio::net::TcpListener;
use tracing::{error, info};

const EXIT_SIGNAL_SHUTDOWN: u8 = 130;
const EXIT_STARTUP_FAILURE: u8 = 1;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    let bind_addr = format!("{}:{}", config.network.host, config.network.port);

    let server = match Server::new(config) {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(error = %e, "failed to construct server");
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };

    if let Err(e) = server.start().await {
        error!(error = %e, "failed to start background tasks");
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }

    let listener = match TcpListener::bind(&bind_addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind listener");
            let _ = server.stop().await;
            return ExitCode::from(EXIT_STARTUP_FAILURE);
        }
    };
    info!(addr = %bind_addr, "hyperkv listening");

    let metrics = Arc::new(Metrics::new());
    let accept_server = Arc::clone(&server);
    let accept_metrics = Arc::clone(&metrics);
    let accept_loop = tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((socket, _addr)) => {
                    let server = Arc::clone(&accept_server);
                    let metrics = Arc::clone(&accept_metrics);
                    tokio::spawn(async move {
                        handle_connection(socket, server, metrics).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "accept failed");
                }
            }
        }
    });

    let shutdown_reason = wait_for_shutdown_signal().await;
    accept_loop.abort();
    info!(reason = shutdown_reason, "shutting down");

    if let Err(e) = server.stop().await {
        error!(error = %e, "error during graceful shutdown");
        return ExitCode::from(EXIT_STARTUP_FAILURE);
    }

    ExitCode::from(EXIT_SIGNAL_SHUTDOWN)
}

fn load_config() -> Result<Config, Box<dyn std::error::Error>> {
    let path = env::args().nth(1).unwrap_or_else(|| "hyperkv.toml".to_string());
    let config = Config::from_file(&path)?;
    let config = config.apply_env_overrides()?;
    config.validate()?;
    Ok(config)
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = term.recv() => "SIGTERM",
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> &'static str {
    let _ = tokio::signal::ctrl_c().await;
    "ctrl_c"
}
