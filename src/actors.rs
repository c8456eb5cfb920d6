//! The actors a serving process registers with its [`Group`](handover_group::Group).
//!
//! | Actor | Runs until | Interrupt |
//! |-------|------------|-----------|
//! | [`server`] | the server stops serving | drain within the shutdown policy, then force-close |
//! | [`termination_watcher`] | SIGINT or SIGTERM | stop watching |
//! | [`hangup_watcher`] | interrupted; upgrades on every SIGHUP | stop watching |
//! | [`lifecycle`] | a successor took over or the upgrader stopped | stop the upgrader |

use std::process;
use std::sync::Arc;

use handover_group::{Actor, BoxError};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::handoff::Handoff;
use crate::policy::ShutdownPolicy;
use crate::server::Server;
use crate::signals::{Signal, SignalSource};
use crate::upgrader::{ExitReason, UpgradeError, Upgrader};

/// Called whenever a SIGHUP-triggered upgrade fails, e.g. to alert an operator.
pub type UpgradeFailureHook = Arc<dyn Fn(&UpgradeError) + Send + Sync>;

/// Serves `listener` until interrupted, then drains the server.
///
/// Connections still open at the policy's deadline are force-closed. Errors during the drain
/// are logged; they never replace the error that caused the shutdown.
pub fn server<S: Server>(server: Arc<S>, listener: TcpListener, policy: ShutdownPolicy) -> Actor {
    let serving = server.clone();
    Actor::new(
        "server",
        async move {
            tracing::info!(addr = %serving.addr(), pid = process::id(), "Listening");
            serving.serve(listener).await.map_err(BoxError::from)
        },
        move |cause| async move {
            match &cause {
                Some(e) => tracing::warn!(error = %e, "Shutting down server after failure"),
                None => tracing::info!("Shutting down server"),
            }
            let deadline = policy.deadline();
            let Err(e) = server.shutdown(deadline).await else {
                return;
            };
            tracing::error!(
                error = %e,
                timeout = ?policy.timeout(),
                "Error shutting down server, closing remaining connections"
            );
            if let Err(e) = server.close().await {
                tracing::error!(error = %e, "Error closing server");
            }
        },
    )
}

/// Returns once SIGINT or SIGTERM arrives, which shuts the whole group down.
pub fn termination_watcher<S: SignalSource>(signals: S) -> Actor {
    let cancellation_token = CancellationToken::new();
    let watching = cancellation_token.clone();
    Actor::new(
        "termination-watcher",
        async move {
            let mut signals = signals;
            loop {
                tokio::select! {
                    _ = watching.cancelled() => return Ok(()),
                    signal = signals.recv() => match signal {
                        Some(signal @ (Signal::Interrupt | Signal::Terminate)) => {
                            tracing::info!("Received {signal}, exiting gracefully...");
                            return Ok(());
                        }
                        Some(signal) => tracing::debug!(%signal, "Ignoring signal"),
                        None => {
                            watching.cancelled().await;
                            return Ok(());
                        }
                    },
                }
            }
        },
        move |_cause| async move { cancellation_token.cancel() },
    )
}

/// Starts an upgrade on every SIGHUP until interrupted.
///
/// A failed upgrade is logged and reported to `on_failure`; the current generation keeps
/// serving and the watcher keeps waiting for the next SIGHUP.
pub fn hangup_watcher<H, S>(
    upgrader: Arc<Upgrader<H>>,
    signals: S,
    on_failure: Option<UpgradeFailureHook>,
) -> Actor
where
    H: Handoff,
    S: SignalSource,
{
    let cancellation_token = CancellationToken::new();
    let watching = cancellation_token.clone();
    Actor::new(
        "hangup-watcher",
        async move {
            let mut signals = signals;
            loop {
                let signal = tokio::select! {
                    _ = watching.cancelled() => return Ok(()),
                    signal = signals.recv() => signal,
                };
                match signal {
                    Some(Signal::Hangup) => {
                        tracing::info!("Received SIGHUP, restarting gracefully...");
                        let upgraded = tokio::select! {
                            _ = watching.cancelled() => return Ok(()),
                            upgraded = upgrader.upgrade() => upgraded,
                        };
                        if let Err(e) = upgraded {
                            tracing::error!(error = %e, "Upgrade failed");
                            if let Some(on_failure) = &on_failure {
                                on_failure(&e);
                            }
                        }
                    }
                    Some(signal) => tracing::debug!(%signal, "Ignoring signal"),
                    None => {
                        watching.cancelled().await;
                        return Ok(());
                    }
                }
            }
        },
        move |_cause| async move { cancellation_token.cancel() },
    )
}

/// Declares this generation ready, then waits until it should exit.
pub fn lifecycle<H: Handoff>(upgrader: Arc<Upgrader<H>>) -> Actor {
    let stopping = upgrader.clone();
    Actor::new(
        "upgrader",
        async move {
            upgrader.ready()?;
            match upgrader.exit().await {
                ExitReason::Upgraded => tracing::info!("Successor took over, exiting"),
                ExitReason::Stopped => tracing::debug!("Upgrader stopped"),
            }
            Ok(())
        },
        move |_cause| async move { stopping.stop() },
    )
}
