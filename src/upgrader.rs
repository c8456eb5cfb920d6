//! Upgrade coordinator: keeps listening sockets alive across process generations.
//!
//! One [`Upgrader`] exists per process. It hands out listeners (inherited from a predecessor
//! when possible), tells the predecessor when this generation is ready, starts successors on
//! request and reports, through [`Upgrader::exit`], when this generation should go away.
//!
//! The predecessor keeps accepting until its successor called [`Upgrader::ready`], so a clean
//! upgrade never leaves the address without an accepting process. A successor that fails to
//! start, or does not get ready in time, is killed and the current generation keeps serving.

use std::fs::{self, Permissions};
use std::io::{self, Write};
use std::net::SocketAddr;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, OnceLock, PoisonError};
use std::time::Duration;

use tempfile::NamedTempFile;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::handoff::{Handoff, ProcessHandoff, SetupError, Successor};

/// Default time a successor gets to report readiness.
pub const DEFAULT_UPGRADE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct UpgraderOptions {
    /// Where to record the pid of the generation currently serving.
    pub pid_file: Option<PathBuf>,
    /// How long to wait for a successor to become ready before giving up on it.
    pub upgrade_timeout: Duration,
}

impl Default for UpgraderOptions {
    fn default() -> Self {
        Self {
            pid_file: None,
            upgrade_timeout: DEFAULT_UPGRADE_TIMEOUT,
        }
    }
}

/// Why a generation was told to exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// A successor is ready and serving.
    Upgraded,
    /// The upgrader was stopped.
    Stopped,
}

/// A listening socket could not be obtained.
#[derive(Debug, thiserror::Error)]
pub enum BindError {
    #[error("Upgrader is stopped, refusing to listen on {0}")]
    Stopped(SocketAddr),
    #[error("Failed to bind to {addr}: {source}")]
    Bind { addr: SocketAddr, source: io::Error },
    #[error("Failed to prepare listener on {addr}: {source}")]
    Prepare { addr: SocketAddr, source: io::Error },
}

/// A replacement attempt failed; the current generation keeps running.
#[derive(Debug, thiserror::Error)]
pub enum UpgradeError {
    #[error("Cannot upgrade before this generation is ready")]
    NotReady,
    #[error("An upgrade is already in progress")]
    InProgress,
    #[error("The previous generation has not exited yet")]
    ParentAlive,
    #[error("This generation has already been superseded")]
    Superseded,
    #[error("Upgrader is stopped")]
    Stopped,
    #[error("Failed to write PID file {path}: {source}")]
    PidFile { path: PathBuf, source: io::Error },
    #[error("Failed to notify the predecessor: {0}")]
    Notify(io::Error),
    #[error("Failed to start successor: {0}")]
    Spawn(io::Error),
    #[error("Successor failed before becoming ready: {0}")]
    Successor(io::Error),
    #[error("Successor did not become ready within {0:?}")]
    Timeout(Duration),
}

/// Coordinates the handoff between this process generation and its neighbours.
pub struct Upgrader<H = ProcessHandoff> {
    handoff: H,
    options: UpgraderOptions,
    listeners: Mutex<Vec<(String, std::net::TcpListener)>>,
    upgrading: tokio::sync::Mutex<()>,
    ready: AtomicBool,
    superseded: AtomicBool,
    stopping: AtomicBool,
    stopped: CancellationToken,
    exit: CancellationToken,
    exit_reason: OnceLock<ExitReason>,
}

impl Upgrader<ProcessHandoff> {
    /// Builds an upgrader for this process, picking up sockets from a predecessor if one
    /// started us.
    pub fn from_env(options: UpgraderOptions) -> Result<Self, SetupError> {
        Ok(Self::new(ProcessHandoff::from_env()?, options))
    }
}

impl<H: Handoff> Upgrader<H> {
    pub fn new(handoff: H, options: UpgraderOptions) -> Self {
        Self {
            handoff,
            options,
            listeners: Mutex::new(Vec::new()),
            upgrading: tokio::sync::Mutex::new(()),
            ready: AtomicBool::new(false),
            superseded: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            stopped: CancellationToken::new(),
            exit: CancellationToken::new(),
            exit_reason: OnceLock::new(),
        }
    }

    pub fn has_parent(&self) -> bool {
        self.handoff.has_parent()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn pid_file(&self) -> Option<&Path> {
        self.options.pid_file.as_deref()
    }

    /// Returns a listener for `addr`, inherited from the predecessor when it handed one off.
    ///
    /// The listener is remembered so it can be passed on to a successor. Must be called from
    /// within a Tokio runtime.
    pub fn listen(&self, addr: SocketAddr) -> Result<TcpListener, BindError> {
        if self.stopped.is_cancelled() {
            return Err(BindError::Stopped(addr));
        }
        let key = addr.to_string();
        let listener = match self.handoff.inherit(&key) {
            Some(listener) => {
                tracing::info!(%addr, "Inherited listener from predecessor");
                listener
            }
            None => std::net::TcpListener::bind(addr)
                .map_err(|source| BindError::Bind { addr, source })?,
        };

        let prepare = |listener: std::net::TcpListener| {
            listener.set_nonblocking(true)?;
            let handed_off = listener.try_clone()?;
            Ok::<_, io::Error>((TcpListener::from_std(listener)?, handed_off))
        };
        let (listener, handed_off) =
            prepare(listener).map_err(|source| BindError::Prepare { addr, source })?;
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((key, handed_off));
        Ok(listener)
    }

    /// Declares this generation ready to serve.
    ///
    /// Records our pid in the PID file, if one is configured, closes inherited listeners that
    /// were never claimed through [`listen`](Self::listen), then lets a waiting predecessor
    /// exit. If the predecessor cannot be notified the PID file is handed back to it. Calling
    /// it again is a no-op.
    pub fn ready(&self) -> Result<(), UpgradeError> {
        if self.is_ready() {
            return Ok(());
        }
        let mut previous = None;
        if let Some(path) = &self.options.pid_file {
            previous = read_pid_file(path).ok().flatten();
            write_pid_file(path, process::id()).map_err(|source| UpgradeError::PidFile {
                path: path.clone(),
                source,
            })?;
        }
        self.handoff.close_inherited();
        if let Err(e) = self.handoff.notify_ready() {
            if let Some(path) = &self.options.pid_file {
                restore_pid_file(path, previous);
            }
            return Err(UpgradeError::Notify(e));
        }
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(
            pid = process::id(),
            has_parent = self.has_parent(),
            "Generation is ready"
        );
        Ok(())
    }

    /// Starts the next generation and waits until it is ready.
    ///
    /// On success [`exit`](Self::exit) fires with [`ExitReason::Upgraded`]. On failure the
    /// successor, if it was started, is killed and this generation may try again later.
    /// Dropping the returned future also kills a pending successor.
    pub async fn upgrade(&self) -> Result<(), UpgradeError> {
        if self.stopped.is_cancelled() {
            return Err(UpgradeError::Stopped);
        }
        if !self.is_ready() {
            return Err(UpgradeError::NotReady);
        }
        if !self.handoff.parent_exited() {
            return Err(UpgradeError::ParentAlive);
        }
        let Ok(_upgrading) = self.upgrading.try_lock() else {
            return Err(UpgradeError::InProgress);
        };
        if self.superseded.load(Ordering::SeqCst) {
            return Err(UpgradeError::Superseded);
        }

        let successor = {
            let listeners = self
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.handoff
                .spawn(&listeners)
                .map_err(UpgradeError::Spawn)?
        };
        let mut pending = PendingSuccessor::new(successor);
        tracing::info!(
            pid = ?pending.successor.pid(),
            "Started successor, waiting for it to become ready"
        );

        let timeout = self.options.upgrade_timeout;
        let result = tokio::select! {
            ready = tokio::time::timeout(timeout, pending.successor.ready()) => match ready {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(UpgradeError::Successor(e)),
                Err(_) => Err(UpgradeError::Timeout(timeout)),
            },
            _ = self.stopped.cancelled() => Err(UpgradeError::Stopped),
        };
        result?;

        let pid = pending.successor.pid();
        pending.release();
        self.superseded.store(true, Ordering::SeqCst);
        tracing::info!(pid = ?pid, "Successor is ready, this generation is superseded");
        self.fire_exit(ExitReason::Upgraded);
        Ok(())
    }

    /// Resolves once this generation should exit.
    pub async fn exit(&self) -> ExitReason {
        self.exit.cancelled().await;
        self.exit_reason
            .get()
            .copied()
            .unwrap_or(ExitReason::Stopped)
    }

    /// Releases everything the upgrader holds and makes [`exit`](Self::exit) fire.
    ///
    /// Kills a successor that is still starting, closes the handoff copies of the listeners and
    /// removes the PID file unless a successor took it over. Safe to call repeatedly.
    pub fn stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        self.stopped.cancel();
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        if let Some(path) = &self.options.pid_file
            && self.is_ready()
            && !self.superseded.load(Ordering::SeqCst)
        {
            remove_own_pid_file(path, process::id());
        }
        self.fire_exit(ExitReason::Stopped);
    }

    fn fire_exit(&self, reason: ExitReason) {
        let _ = self.exit_reason.set(reason);
        self.exit.cancel();
    }
}

/// Kills the successor on drop unless it was released.
struct PendingSuccessor {
    successor: Box<dyn Successor>,
    armed: bool,
}

impl PendingSuccessor {
    fn new(successor: Box<dyn Successor>) -> Self {
        Self {
            successor,
            armed: true,
        }
    }

    fn release(mut self) {
        self.armed = false;
    }
}

impl Drop for PendingSuccessor {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!(
                pid = ?self.successor.pid(),
                "Killing successor that did not become ready"
            );
            self.successor.kill();
        }
    }
}

/// Replaces the PID file atomically, so a concurrently starting process never reads a
/// half-written file.
fn write_pid_file(path: &Path, pid: u32) -> io::Result<()> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    writeln!(file, "{pid}")?;
    file.as_file().set_permissions(Permissions::from_mode(0o644))?;
    file.as_file().sync_all()?;
    file.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Puts the predecessor's pid back after this generation failed to take over.
fn restore_pid_file(path: &Path, previous: Option<u32>) {
    let own = process::id();
    match previous {
        Some(pid) if pid != own => {
            if let Err(e) = write_pid_file(path, pid) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to restore PID file");
            }
        }
        _ => remove_own_pid_file(path, own),
    }
}

fn read_pid_file(path: &Path) -> io::Result<Option<u32>> {
    let content = fs::read_to_string(path)?;
    Ok(content.trim().parse().ok())
}

fn remove_own_pid_file(path: &Path, pid: u32) {
    match read_pid_file(path) {
        Ok(Some(recorded)) if recorded == pid => {
            if let Err(e) = fs::remove_file(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to remove PID file");
            }
        }
        Ok(_) => {
            tracing::debug!(
                path = %path.display(),
                "PID file belongs to another generation, keeping it"
            )
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to read PID file"),
    }
}
