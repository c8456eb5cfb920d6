//! The network server driven by the server actor.
//!
//! [`Server`] is the interface the orchestration needs from a server: serve a listener until
//! told to stop, drain gracefully within a deadline, and force-close whatever is left.
//! [`HttpServer`] implements it for an axum [`Router`].

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

/// How long `close` waits for severed connections to be torn down.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ServeError {
    #[error("Server is already serving")]
    AlreadyServing,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Draining or closing the server did not complete. Logged, never escalated.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error("Graceful shutdown did not complete before the deadline")]
    DeadlineElapsed,
    #[error("Connections were still open {0:?} after being force-closed")]
    CloseIncomplete(Duration),
}

/// A network server that can be drained and force-closed.
#[async_trait]
pub trait Server: Send + Sync + 'static {
    /// The address the server is configured to listen on.
    fn addr(&self) -> SocketAddr;

    /// Accepts and serves connections until the server is shut down or closed.
    async fn serve(&self, listener: TcpListener) -> Result<(), ServeError>;

    /// Stops accepting and waits for in-flight connections to finish, until `deadline` if
    /// there is one.
    async fn shutdown(&self, deadline: Option<Instant>) -> Result<(), ShutdownError>;

    /// Immediately terminates every remaining connection.
    async fn close(&self) -> Result<(), ShutdownError>;
}

/// An axum application served over connections that can be severed on demand.
pub struct HttpServer {
    addr: SocketAddr,
    router: Router,
    close_grace: Duration,
    serving: AtomicBool,
    drain: CancellationToken,
    sever: CancellationToken,
    done: CancellationToken,
}

impl HttpServer {
    pub fn new(addr: SocketAddr, router: Router) -> Self {
        Self {
            addr,
            router,
            close_grace: DEFAULT_CLOSE_GRACE,
            serving: AtomicBool::new(false),
            drain: CancellationToken::new(),
            sever: CancellationToken::new(),
            done: CancellationToken::new(),
        }
    }

    pub fn with_close_grace(mut self, close_grace: Duration) -> Self {
        self.close_grace = close_grace;
        self
    }
}

#[async_trait]
impl Server for HttpServer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn serve(&self, listener: TcpListener) -> Result<(), ServeError> {
        if self.serving.swap(true, Ordering::SeqCst) {
            return Err(ServeError::AlreadyServing);
        }
        let listener = SeverableListener {
            inner: listener,
            sever: self.sever.clone(),
        };
        let drain = self.drain.clone();
        let result = axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(async move { drain.cancelled().await })
            .await;
        self.done.cancel();
        result.map_err(ServeError::Io)
    }

    async fn shutdown(&self, deadline: Option<Instant>) -> Result<(), ShutdownError> {
        self.drain.cancel();
        if !self.serving.load(Ordering::SeqCst) {
            return Ok(());
        }
        match deadline {
            None => {
                self.done.cancelled().await;
                Ok(())
            }
            Some(deadline) => tokio::time::timeout_at(deadline, self.done.cancelled())
                .await
                .map_err(|_| ShutdownError::DeadlineElapsed),
        }
    }

    async fn close(&self) -> Result<(), ShutdownError> {
        self.drain.cancel();
        self.sever.cancel();
        if !self.serving.load(Ordering::SeqCst) {
            return Ok(());
        }
        tokio::time::timeout(self.close_grace, self.done.cancelled())
            .await
            .map_err(|_| ShutdownError::CloseIncomplete(self.close_grace))
    }
}

/// Hands out connections that fail with `ConnectionAborted` once `sever` fires.
struct SeverableListener {
    inner: TcpListener,
    sever: CancellationToken,
}

impl axum::serve::Listener for SeverableListener {
    type Io = SeverableStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        loop {
            match self.inner.accept().await {
                Ok((stream, addr)) => return (SeverableStream::new(stream, &self.sever), addr),
                Err(e) => handle_accept_error(e).await,
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}

async fn handle_accept_error(e: io::Error) {
    if matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
    ) {
        return;
    }
    // Typically out of file descriptors: back off instead of spinning.
    tracing::error!(error = %e, "Failed to accept connection");
    tokio::time::sleep(Duration::from_secs(1)).await;
}

/// A TCP stream whose I/O starts failing as soon as its server is force-closed.
struct SeverableStream {
    inner: TcpStream,
    severed: Pin<Box<WaitForCancellationFutureOwned>>,
    is_severed: bool,
}

impl SeverableStream {
    fn new(inner: TcpStream, sever: &CancellationToken) -> Self {
        Self {
            inner,
            severed: Box::pin(sever.clone().cancelled_owned()),
            is_severed: false,
        }
    }

    fn poll_severed(&mut self, cx: &mut Context<'_>) -> bool {
        if !self.is_severed && self.severed.as_mut().poll(cx).is_ready() {
            self.is_severed = true;
        }
        self.is_severed
    }
}

fn aborted() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "connection force-closed")
}

impl AsyncRead for SeverableStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_severed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for SeverableStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_severed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_severed(cx) {
            return Poll::Ready(Err(aborted()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
