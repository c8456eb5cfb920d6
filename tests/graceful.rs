mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::routing::get;
use common::{Behavior, FakeHandoff, loopback_listener};
use handover::graceful::{self, Error, RunOptions};
use handover::group::GroupError;
use handover::policy::ShutdownPolicy;
use handover::server::{HttpServer, ServeError, Server, ShutdownError};
use handover::signals::Signal;
use handover::upgrader::{UpgradeError, Upgrader, UpgraderOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Harness {
    addr: SocketAddr,
    handoff: FakeHandoff,
    hangups: mpsc::Sender<Signal>,
    terminations: mpsc::Sender<Signal>,
    running: JoinHandle<Result<(), Error>>,
}

fn router() -> Router {
    Router::new()
        .route("/", get(|| async { "hello" }))
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_millis(300)).await;
                "done"
            }),
        )
}

/// Runs an [`HttpServer`] on a loopback socket handed in through a fake predecessor, and
/// waits until the generation declared itself ready.
async fn start(behavior: Behavior, options: RunOptions) -> Harness {
    let (listener, addr) = loopback_listener();
    let handoff = FakeHandoff::new(behavior);
    handoff.offer(&addr.to_string(), listener);
    let upgrader = Upgrader::new(handoff.clone(), options.upgrader_options());

    let (hangups, hangup_rx) = mpsc::channel(4);
    let (terminations, termination_rx) = mpsc::channel(4);
    let server = HttpServer::new(addr, router());
    let running = tokio::spawn(graceful::run_with(
        server,
        upgrader,
        hangup_rx,
        termination_rx,
        options,
    ));
    wait_until(|| handoff.notified() > 0).await;
    Harness {
        addr,
        handoff,
        hangups,
        terminations,
        running,
    }
}

async fn get_once(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let request = format!("GET {path} HTTP/1.1\r\nHost: test\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn finish(running: JoinHandle<Result<(), Error>>) -> Result<(), Error> {
    tokio::time::timeout(Duration::from_secs(5), running)
        .await
        .expect("group did not stop")
        .unwrap()
}

#[tokio::test]
async fn test_terminate_drains_and_returns_ok() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("server.pid");
    let harness = start(
        Behavior::Hang,
        RunOptions {
            pid_file: Some(pid_file.clone()),
            ..RunOptions::default()
        },
    )
    .await;

    let response = get_once(harness.addr, "/").await;
    assert!(response.ends_with("hello"));
    wait_until(|| pid_file.exists()).await;

    harness.terminations.send(Signal::Terminate).await.unwrap();
    finish(harness.running).await.unwrap();
    assert!(!pid_file.exists());
    assert_eq!(harness.handoff.spawned(), 0);
}

#[tokio::test]
async fn test_interrupt_behaves_like_terminate() {
    let harness = start(Behavior::Hang, RunOptions::default()).await;
    get_once(harness.addr, "/").await;
    harness.terminations.send(Signal::Interrupt).await.unwrap();
    finish(harness.running).await.unwrap();
}

#[tokio::test]
async fn test_hangup_hands_listener_to_successor_and_exits() {
    let harness = start(
        Behavior::Ready(Duration::from_millis(20)),
        RunOptions::default(),
    )
    .await;
    get_once(harness.addr, "/").await;

    harness.hangups.send(Signal::Hangup).await.unwrap();
    finish(harness.running).await.unwrap();
    assert_eq!(harness.handoff.spawned(), 1);
    assert_eq!(harness.handoff.killed(), 0);
    assert_eq!(harness.handoff.handed_off(), vec![harness.addr.to_string()]);
}

#[tokio::test]
async fn test_failed_upgrade_keeps_serving() {
    let failures = Arc::new(AtomicUsize::new(0));
    let hook_failures = failures.clone();
    let harness = start(
        Behavior::Fail(Duration::from_millis(10)),
        RunOptions {
            on_upgrade_failure: Some(Arc::new(move |_: &UpgradeError| {
                hook_failures.fetch_add(1, Ordering::SeqCst);
            })),
            ..RunOptions::default()
        },
    )
    .await;
    get_once(harness.addr, "/").await;

    harness.hangups.send(Signal::Hangup).await.unwrap();
    wait_until(|| failures.load(Ordering::SeqCst) > 0).await;
    assert_eq!(harness.handoff.killed(), 1);
    assert!(!harness.running.is_finished());

    let response = get_once(harness.addr, "/").await;
    assert!(response.ends_with("hello"));

    // A later SIGHUP may still succeed.
    harness
        .handoff
        .set_behavior(Behavior::Ready(Duration::from_millis(10)));
    harness.hangups.send(Signal::Hangup).await.unwrap();
    finish(harness.running).await.unwrap();
    assert_eq!(failures.load(Ordering::SeqCst), 1);
    assert_eq!(harness.handoff.spawned(), 2);
}

#[tokio::test]
async fn test_terminate_while_upgrade_pending_kills_successor() {
    let harness = start(Behavior::Hang, RunOptions::default()).await;
    get_once(harness.addr, "/").await;

    harness.hangups.send(Signal::Hangup).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(harness.handoff.spawned(), 1);

    harness.terminations.send(Signal::Terminate).await.unwrap();
    finish(harness.running).await.unwrap();
    assert_eq!(harness.handoff.killed(), 1);
}

#[tokio::test]
async fn test_shutdown_timeout_force_closes_slow_client() {
    let harness = start(
        Behavior::Hang,
        RunOptions {
            shutdown: ShutdownPolicy::new(Duration::from_millis(200)),
            ..RunOptions::default()
        },
    )
    .await;

    let mut slow = TcpStream::connect(harness.addr).await.unwrap();
    slow.write_all(b"GET / HTTP/1.1\r\nHost: te").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = Instant::now();
    harness.terminations.send(Signal::Terminate).await.unwrap();
    finish(harness.running).await.unwrap();
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(200), "{elapsed:?}");
    assert!(elapsed < Duration::from_secs(2), "{elapsed:?}");

    let mut rest = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), slow.read_to_end(&mut rest))
        .await
        .unwrap();
    assert!(read.map(|n| n == 0).unwrap_or(true));
}

#[tokio::test]
async fn test_unbounded_shutdown_waits_for_in_flight_request() {
    let harness = start(
        Behavior::Hang,
        RunOptions {
            shutdown: ShutdownPolicy::unbounded(),
            ..RunOptions::default()
        },
    )
    .await;
    let addr = harness.addr;
    let request = tokio::spawn(async move { get_once(addr, "/slow").await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    harness.terminations.send(Signal::Terminate).await.unwrap();
    finish(harness.running).await.unwrap();

    let response = request.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.ends_with("done"));
}

#[tokio::test]
async fn test_occupied_address_fails_with_bind_error() {
    let (_taken, addr) = loopback_listener();
    let upgrader = Upgrader::new(FakeHandoff::new(Behavior::Hang), UpgraderOptions::default());
    let (_hangups, hangup_rx) = mpsc::channel::<Signal>(1);
    let (_terminations, termination_rx) = mpsc::channel::<Signal>(1);

    let result = graceful::run_with(
        HttpServer::new(addr, router()),
        upgrader,
        hangup_rx,
        termination_rx,
        RunOptions::default(),
    )
    .await;
    assert!(matches!(result, Err(Error::Bind(_))));
}

/// A server whose accept loop breaks down right away.
struct BrokenServer {
    addr: SocketAddr,
}

#[async_trait]
impl Server for BrokenServer {
    fn addr(&self) -> SocketAddr {
        self.addr
    }

    async fn serve(&self, _listener: TcpListener) -> Result<(), ServeError> {
        Err(ServeError::Io(std::io::Error::other("accept loop broke")))
    }

    async fn shutdown(&self, _deadline: Option<Instant>) -> Result<(), ShutdownError> {
        Ok(())
    }

    async fn close(&self) -> Result<(), ShutdownError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_server_failure_is_surfaced() {
    let (listener, addr) = loopback_listener();
    let handoff = FakeHandoff::new(Behavior::Hang);
    handoff.offer(&addr.to_string(), listener);
    let upgrader = Upgrader::new(handoff, UpgraderOptions::default());
    let (_hangups, hangup_rx) = mpsc::channel::<Signal>(1);
    let (_terminations, termination_rx) = mpsc::channel::<Signal>(1);

    let result = graceful::run_with(
        BrokenServer { addr },
        upgrader,
        hangup_rx,
        termination_rx,
        RunOptions::default(),
    )
    .await;
    match result {
        Err(Error::Group(GroupError::Actor { actor, source })) => {
            assert_eq!(actor, "server");
            assert!(source.to_string().contains("accept loop broke"));
        }
        other => panic!("unexpected result: {other:?}"),
    }
}
