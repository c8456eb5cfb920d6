//! Passing listening sockets from one process generation to the next.
//!
//! The [`Handoff`] trait is the capability the [`Upgrader`](crate::upgrader::Upgrader) needs
//! from the operating system: pick up sockets left by a predecessor, tell that predecessor we
//! are ready, and start a successor that inherits our sockets. [`ProcessHandoff`] implements
//! it by re-executing the current binary:
//!
//! - listening sockets are inherited across `exec` and announced in `HANDOVER_FDS` as
//!   comma-separated `addr=fd` pairs;
//! - the successor reports readiness by writing a single byte to the pipe whose write end is
//!   announced in `HANDOVER_READY_FD`. End-of-file without that byte means the successor died
//!   before it became ready.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Write};
use std::net::TcpListener;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, FromRawFd, IntoRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};
use nix::unistd::{Pid, getppid};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;
use tokio::process::{Child, Command};

/// Environment variable listing the listening sockets handed to a successor.
pub const ENV_FDS: &str = "HANDOVER_FDS";
/// Environment variable holding the write end of the readiness pipe.
pub const ENV_READY_FD: &str = "HANDOVER_READY_FD";

/// The generation could not pick up the state left by its predecessor.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("Malformed HANDOVER_FDS entry `{0}`")]
    MalformedFds(String),
    #[error("Malformed HANDOVER_READY_FD value `{0}`")]
    MalformedReadyFd(String),
    #[error("Inherited descriptor {fd} is unusable: {source}")]
    Descriptor { fd: RawFd, source: nix::Error },
    #[error("Failed to locate the current executable: {0}")]
    CurrentExe(io::Error),
    #[error("Failed to register signal handlers: {0}")]
    Signals(io::Error),
}

/// A process generation that was started to replace the current one.
#[async_trait]
pub trait Successor: Send {
    fn pid(&self) -> Option<u32>;

    /// Resolves once the successor reported that it is serving.
    ///
    /// Fails if the successor went away before reporting readiness.
    async fn ready(&mut self) -> io::Result<()>;

    /// Terminates the successor. Called when it failed or did not get ready in time.
    fn kill(&mut self);
}

/// Operating-system side of a handoff between process generations.
pub trait Handoff: Send + Sync + 'static {
    /// Takes the listener a predecessor handed off for `addr`, if there is one.
    fn inherit(&self, addr: &str) -> Option<TcpListener>;

    /// Whether this generation was started by a predecessor that waits for it.
    fn has_parent(&self) -> bool;

    /// Whether the predecessor process is gone. Always true without a predecessor.
    fn parent_exited(&self) -> bool;

    /// Closes every inherited listener that was not claimed through
    /// [`inherit`](Self::inherit), so connections to addresses this generation no longer
    /// serves are refused instead of queueing forever.
    fn close_inherited(&self);

    /// Tells the waiting predecessor that this generation serves. A no-op without a
    /// predecessor, and on every call after the first.
    fn notify_ready(&self) -> io::Result<()>;

    /// Starts the next generation, handing it `listeners`.
    fn spawn(&self, listeners: &[(String, TcpListener)]) -> io::Result<Box<dyn Successor>>;
}

/// Handoff that re-executes the current binary with the same arguments.
#[derive(Debug)]
pub struct ProcessHandoff {
    inherited: Mutex<HashMap<String, OwnedFd>>,
    ready: Mutex<Option<OwnedFd>>,
    parent: Option<Pid>,
    program: PathBuf,
    args: Vec<OsString>,
}

impl ProcessHandoff {
    /// Picks up whatever a predecessor left in the environment.
    ///
    /// Child processes spawned by the application itself inherit the `HANDOVER_*` variables but
    /// none of the descriptors they name, so they must not build a `ProcessHandoff`.
    pub fn from_env() -> Result<Self, SetupError> {
        let fds = env::var(ENV_FDS).ok();
        let ready = env::var(ENV_READY_FD).ok();
        let program = current_exe()?;
        let args = env::args_os().skip(1).collect();

        let fds = fds.as_deref().map(parse_fds).transpose()?.unwrap_or_default();
        let ready = ready.as_deref().map(parse_fd).transpose()?;

        let mut inherited = HashMap::with_capacity(fds.len());
        for (addr, fd) in fds {
            inherited.insert(addr, adopt(fd)?);
        }
        let ready = ready.map(adopt).transpose()?;
        if !inherited.is_empty() || ready.is_some() {
            tracing::info!(
                sockets = inherited.len(),
                "Started by a predecessor, inheriting its listeners"
            );
        }

        Ok(Self {
            inherited: Mutex::new(inherited),
            parent: ready.is_some().then(getppid),
            ready: Mutex::new(ready),
            program,
            args,
        })
    }
}

impl Handoff for ProcessHandoff {
    fn inherit(&self, addr: &str) -> Option<TcpListener> {
        self.inherited
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(addr)
            .map(TcpListener::from)
    }

    fn has_parent(&self) -> bool {
        self.parent.is_some()
    }

    fn parent_exited(&self) -> bool {
        // An orphaned process is adopted by init or a subreaper.
        self.parent.is_none_or(|parent| getppid() != parent)
    }

    fn close_inherited(&self) {
        let unclaimed = std::mem::take(
            &mut *self
                .inherited
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for addr in unclaimed.keys() {
            tracing::info!(%addr, "Closing inherited listener that was not claimed");
        }
    }

    fn notify_ready(&self) -> io::Result<()> {
        let ready = self
            .ready
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match ready {
            Some(fd) => File::from(fd).write_all(b"1"),
            None => Ok(()),
        }
    }

    fn spawn(&self, listeners: &[(String, TcpListener)]) -> io::Result<Box<dyn Successor>> {
        let (reader, writer) = io::pipe()?;
        let writer = OwnedFd::from(writer);
        let ready_fd = writer.as_raw_fd();

        let announced = listeners
            .iter()
            .map(|(addr, listener)| format!("{addr}={}", listener.as_raw_fd()))
            .collect::<Vec<_>>()
            .join(",");
        let passed: Vec<RawFd> = listeners
            .iter()
            .map(|(_, listener)| listener.as_raw_fd())
            .chain(std::iter::once(ready_fd))
            .collect();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ENV_FDS, announced)
            .env(ENV_READY_FD, ready_fd.to_string());
        // Safety: the hook only issues fcntl calls, which are async-signal-safe, on descriptors
        // that stay open in the parent until `spawn` returns.
        unsafe {
            command.pre_exec(move || {
                for fd in &passed {
                    set_cloexec(BorrowedFd::borrow_raw(*fd), false)?;
                }
                Ok(())
            });
        }
        let child = command.spawn()?;
        drop(writer);

        let reader = pipe::Receiver::from_owned_fd(OwnedFd::from(reader))?;
        Ok(Box::new(ProcessSuccessor { child, reader }))
    }
}

struct ProcessSuccessor {
    child: Child,
    reader: pipe::Receiver,
}

#[async_trait]
impl Successor for ProcessSuccessor {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn ready(&mut self) -> io::Result<()> {
        let mut byte = [0u8; 1];
        match self.reader.read(&mut byte).await? {
            0 => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "successor exited before signalling readiness",
            )),
            _ => Ok(()),
        }
    }

    fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::debug!(error = %e, "Successor already gone");
        }
    }
}

/// The path of the running binary.
///
/// Once a deployment replaced the file on disk, Linux reports the old inode as
/// `<path> (deleted)`; the successor must run whatever now lives at `<path>`.
fn current_exe() -> Result<PathBuf, SetupError> {
    let path = env::current_exe().map_err(SetupError::CurrentExe)?;
    let stripped = path
        .to_str()
        .and_then(|p| p.strip_suffix(" (deleted)"))
        .map(PathBuf::from);
    Ok(stripped.unwrap_or(path))
}

/// Takes ownership of a descriptor handed over by the predecessor and keeps it from leaking
/// into processes we spawn ourselves.
fn adopt(fd: RawFd) -> Result<OwnedFd, SetupError> {
    // Safety: the predecessor passed this descriptor to us for exclusive use.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    match set_cloexec(owned.as_fd(), true) {
        Ok(()) => Ok(owned),
        Err(source) => {
            // Not ours to close: it was never open in this process.
            let _ = owned.into_raw_fd();
            Err(SetupError::Descriptor { fd, source })
        }
    }
}

fn set_cloexec(fd: BorrowedFd<'_>, enabled: bool) -> nix::Result<()> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, enabled);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

fn parse_fd(value: &str) -> Result<RawFd, SetupError> {
    value
        .trim()
        .parse::<RawFd>()
        .ok()
        .filter(|fd| *fd >= 0)
        .ok_or_else(|| SetupError::MalformedReadyFd(value.to_string()))
}

fn parse_fds(value: &str) -> Result<Vec<(String, RawFd)>, SetupError> {
    value
        .split(',')
        .filter(|entry| !entry.trim().is_empty())
        .map(|entry| {
            let (addr, fd) = entry
                .rsplit_once('=')
                .ok_or_else(|| SetupError::MalformedFds(entry.to_string()))?;
            let fd = fd
                .trim()
                .parse::<RawFd>()
                .ok()
                .filter(|fd| *fd >= 0)
                .ok_or_else(|| SetupError::MalformedFds(entry.to_string()))?;
            if addr.is_empty() {
                return Err(SetupError::MalformedFds(entry.to_string()));
            }
            Ok((addr.to_string(), fd))
        })
        .collect()
}
