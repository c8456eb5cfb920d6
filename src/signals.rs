//! Process signals as an injectable event source.
//!
//! Watchers consume signals through the [`SignalSource`] trait, so they can be driven by real
//! Unix signals ([`OsSignals`]) or by synthetic events sent through a Tokio channel.
//!
//! # Example
//!
//! ```ignore
//! use handover::signals::{OsSignals, Signal, SignalSource};
//!
//! let mut signals = OsSignals::termination()?;
//! if let Some(signal) = signals.recv().await {
//!     println!("Received {signal}");
//! }
//! ```

use std::fmt;
use std::io;

use async_trait::async_trait;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Signals the orchestration reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGHUP: replace the running binary.
    Hangup,
    /// SIGINT: shut down gracefully.
    Interrupt,
    /// SIGTERM: shut down gracefully.
    Terminate,
}

impl Signal {
    pub fn kind(self) -> SignalKind {
        match self {
            Signal::Hangup => SignalKind::hangup(),
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Signal::Hangup => "SIGHUP",
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A stream of delivered signals.
#[async_trait]
pub trait SignalSource: Send + 'static {
    /// Waits for the next signal. Returns `None` once the source is closed.
    async fn recv(&mut self) -> Option<Signal>;
}

#[async_trait]
impl SignalSource for mpsc::Receiver<Signal> {
    async fn recv(&mut self) -> Option<Signal> {
        mpsc::Receiver::recv(self).await
    }
}

#[async_trait]
impl SignalSource for mpsc::UnboundedReceiver<Signal> {
    async fn recv(&mut self) -> Option<Signal> {
        mpsc::UnboundedReceiver::recv(self).await
    }
}

/// Unix signals delivered to this process.
///
/// One background task per subscribed signal forwards deliveries into a channel. The tasks
/// stop when the `OsSignals` is dropped.
pub struct OsSignals {
    receiver: mpsc::Receiver<Signal>,
    task_tracker: TaskTracker,
    cancellation_token: CancellationToken,
}

impl OsSignals {
    /// Subscribes to `signals`.
    ///
    /// Returns an error if signal registration fails. Must be called from within a Tokio
    /// runtime.
    pub fn try_new(signals: &[Signal]) -> Result<Self, io::Error> {
        let (sender, receiver) = mpsc::channel(signals.len().max(1) * 2);
        let cancellation_token = CancellationToken::new();
        let task_tracker = TaskTracker::new();
        for &kind in signals {
            let mut stream = signal(kind.kind())?;
            let sender = sender.clone();
            let token = cancellation_token.clone();
            task_tracker.spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        delivered = stream.recv() => {
                            if delivered.is_none() || sender.send(kind).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
        task_tracker.close();
        Ok(Self {
            receiver,
            task_tracker,
            cancellation_token,
        })
    }

    /// SIGHUP only.
    pub fn hangup() -> Result<Self, io::Error> {
        Self::try_new(&[Signal::Hangup])
    }

    /// SIGINT and SIGTERM.
    pub fn termination() -> Result<Self, io::Error> {
        Self::try_new(&[Signal::Interrupt, Signal::Terminate])
    }

    /// Stops listening and waits for the forwarding tasks to finish.
    pub async fn close(self) {
        self.cancellation_token.cancel();
        self.task_tracker.wait().await;
    }
}

#[async_trait]
impl SignalSource for OsSignals {
    async fn recv(&mut self) -> Option<Signal> {
        self.receiver.recv().await
    }
}

impl Drop for OsSignals {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
