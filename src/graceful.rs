//! Runs a server with zero-downtime restarts and graceful shutdown.
//!
//! [`run`] wires the actors from [`crate::actors`] into a single group:
//!
//! - SIGHUP starts a new generation of the binary, which inherits the listening socket; once it
//!   is ready this generation drains and exits.
//! - SIGINT and SIGTERM drain the server within the configured shutdown timeout and exit.
//!
//! # Example
//!
//! ```ignore
//! use handover::graceful::{self, RunOptions};
//! use handover::server::HttpServer;
//!
//! let server = HttpServer::new("127.0.0.1:9000".parse()?, router);
//! graceful::run(server, RunOptions::default()).await?;
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use handover_group::{Group, GroupError};

use crate::actors::{self, UpgradeFailureHook};
use crate::handoff::{Handoff, SetupError};
use crate::policy::ShutdownPolicy;
use crate::server::Server;
use crate::signals::{OsSignals, SignalSource};
use crate::upgrader::{BindError, DEFAULT_UPGRADE_TIMEOUT, Upgrader, UpgraderOptions};

/// Settings for [`run`].
#[derive(Clone)]
pub struct RunOptions {
    pub pid_file: Option<PathBuf>,
    pub shutdown: ShutdownPolicy,
    pub upgrade_timeout: Duration,
    /// Called when a SIGHUP-triggered upgrade fails. Failures are always logged.
    pub on_upgrade_failure: Option<UpgradeFailureHook>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            pid_file: None,
            shutdown: ShutdownPolicy::default(),
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
            on_upgrade_failure: None,
        }
    }
}

impl RunOptions {
    pub fn upgrader_options(&self) -> UpgraderOptions {
        UpgraderOptions {
            pid_file: self.pid_file.clone(),
            upgrade_timeout: self.upgrade_timeout,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to set up graceful upgrades: {0}")]
    Setup(#[from] SetupError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error("Error running service: {0}")]
    Group(#[from] GroupError),
}

/// Serves `server` until a termination signal arrives or a successor takes over.
///
/// Picks up the listening socket from a predecessor when started by one, and uses real Unix
/// signals. Returns once every actor has stopped.
pub async fn run<S: Server>(server: S, options: RunOptions) -> Result<(), Error> {
    let upgrader = Upgrader::from_env(options.upgrader_options())?;
    let hangups = OsSignals::hangup().map_err(SetupError::Signals)?;
    let terminations = OsSignals::termination().map_err(SetupError::Signals)?;
    run_with(server, upgrader, hangups, terminations, options).await
}

/// Like [`run`], with the handoff and signal sources supplied by the caller.
pub async fn run_with<S, H, A, B>(
    server: S,
    upgrader: Upgrader<H>,
    hangups: A,
    terminations: B,
    options: RunOptions,
) -> Result<(), Error>
where
    S: Server,
    H: Handoff,
    A: SignalSource,
    B: SignalSource,
{
    let upgrader = Arc::new(upgrader);
    let result = serve(Arc::new(server), &upgrader, hangups, terminations, options).await;
    upgrader.stop();
    result
}

async fn serve<S, H, A, B>(
    server: Arc<S>,
    upgrader: &Arc<Upgrader<H>>,
    hangups: A,
    terminations: B,
    options: RunOptions,
) -> Result<(), Error>
where
    S: Server,
    H: Handoff,
    A: SignalSource,
    B: SignalSource,
{
    let listener = upgrader.listen(server.addr()).inspect_err(|e| {
        tracing::error!(error = %e, "Error creating new listener");
    })?;

    let mut group = Group::new();
    group
        .add(actors::server(server, listener, options.shutdown))
        .add(actors::termination_watcher(terminations))
        .add(actors::hangup_watcher(
            upgrader.clone(),
            hangups,
            options.on_upgrade_failure,
        ))
        .add(actors::lifecycle(upgrader.clone()));

    group.run().await.inspect_err(|e| {
        tracing::error!(error = %e, "Error running service");
    })?;
    Ok(())
}
