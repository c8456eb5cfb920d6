//! `handover-server` HTTP entrypoint.
//!
//! Serves the demo routes from [`handover::handlers`] and survives binary upgrades:
//!
//! - `kill -HUP <pid>` starts a new generation that inherits the listening socket; the old one
//!   drains and exits once the new one is ready.
//! - `kill -TERM <pid>` (or Ctrl-C) drains connections within `shutdownTimeout` and exits.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control the binding address
//! - `PID_FILE` names a file kept pointing at the serving generation
//! - `SHUTDOWN_TIMEOUT`, `UPGRADE_TIMEOUT` in seconds
//! - `RUST_LOG` controls log verbosity

use axum::Router;
use dotenvy::dotenv;
use std::process;

use handover::config::Config;
use handover::graceful;
use handover::handlers;
use handover::server::HttpServer;
use handover::telemetry::Telemetry;

#[tokio::main]
async fn main() {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "Failed to load configuration");
            process::exit(1);
        }
    };

    let http_endpoints = Router::new()
        .merge(handlers::routes())
        .layer(telemetry.http_tracing());

    let addr = config.addr();
    tracing::info!("Starting server at http://{}", addr);
    let server = HttpServer::new(addr, http_endpoints);

    if let Err(e) = graceful::run(server, config.run_options()).await {
        tracing::error!(error = %e, "Exiting with error");
        process::exit(1);
    }
    tracing::info!(pid = process::id(), "Exited");
}
