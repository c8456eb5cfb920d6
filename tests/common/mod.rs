#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use handover::handoff::{Handoff, Successor};

/// What the next successor started by a [`FakeHandoff`] does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    /// Reports readiness after the given delay.
    Ready(Duration),
    /// Dies after the given delay without reporting readiness.
    Fail(Duration),
    /// Never reports anything.
    Hang,
    /// Cannot be started at all.
    SpawnError,
}

#[derive(Debug)]
struct State {
    behavior: Mutex<Behavior>,
    inherited: Mutex<HashMap<String, TcpListener>>,
    has_parent: bool,
    parent_exited: AtomicBool,
    fail_notify: AtomicBool,
    notified: AtomicUsize,
    closed: AtomicUsize,
    spawned: AtomicUsize,
    killed: Arc<AtomicUsize>,
    handed_off: Mutex<Vec<String>>,
}

/// In-process stand-in for re-executing the binary.
#[derive(Debug, Clone)]
pub struct FakeHandoff {
    state: Arc<State>,
}

impl FakeHandoff {
    pub fn new(behavior: Behavior) -> Self {
        Self::build(behavior, false)
    }

    /// A handoff that behaves as if a predecessor started this process and is still running.
    pub fn with_parent(behavior: Behavior) -> Self {
        Self::build(behavior, true)
    }

    fn build(behavior: Behavior, has_parent: bool) -> Self {
        Self {
            state: Arc::new(State {
                behavior: Mutex::new(behavior),
                inherited: Mutex::new(HashMap::new()),
                has_parent,
                parent_exited: AtomicBool::new(!has_parent),
                fail_notify: AtomicBool::new(false),
                notified: AtomicUsize::new(0),
                closed: AtomicUsize::new(0),
                spawned: AtomicUsize::new(0),
                killed: Arc::new(AtomicUsize::new(0)),
                handed_off: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Makes `listener` available for inheritance under `addr`.
    pub fn offer(&self, addr: &str, listener: TcpListener) {
        self.state
            .inherited
            .lock()
            .unwrap()
            .insert(addr.to_string(), listener);
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.state.behavior.lock().unwrap() = behavior;
    }

    pub fn set_parent_exited(&self, exited: bool) {
        self.state.parent_exited.store(exited, Ordering::SeqCst);
    }

    /// Makes every following readiness notification fail as if the predecessor had died.
    pub fn set_fail_notify(&self, fail: bool) {
        self.state.fail_notify.store(fail, Ordering::SeqCst);
    }

    pub fn offered(&self) -> usize {
        self.state.inherited.lock().unwrap().len()
    }

    pub fn notified(&self) -> usize {
        self.state.notified.load(Ordering::SeqCst)
    }

    /// How many offered listeners were closed without being inherited.
    pub fn closed(&self) -> usize {
        self.state.closed.load(Ordering::SeqCst)
    }

    pub fn spawned(&self) -> usize {
        self.state.spawned.load(Ordering::SeqCst)
    }

    pub fn killed(&self) -> usize {
        self.state.killed.load(Ordering::SeqCst)
    }

    /// Addresses of the listeners passed to the most recent successor.
    pub fn handed_off(&self) -> Vec<String> {
        self.state.handed_off.lock().unwrap().clone()
    }
}

impl Handoff for FakeHandoff {
    fn inherit(&self, addr: &str) -> Option<TcpListener> {
        self.state.inherited.lock().unwrap().remove(addr)
    }

    fn has_parent(&self) -> bool {
        self.state.has_parent
    }

    fn parent_exited(&self) -> bool {
        self.state.parent_exited.load(Ordering::SeqCst)
    }

    fn close_inherited(&self) {
        let unclaimed = std::mem::take(&mut *self.state.inherited.lock().unwrap());
        self.state
            .closed
            .fetch_add(unclaimed.len(), Ordering::SeqCst);
    }

    fn notify_ready(&self) -> io::Result<()> {
        if self.state.fail_notify.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "predecessor is gone"));
        }
        self.state.notified.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn spawn(&self, listeners: &[(String, TcpListener)]) -> io::Result<Box<dyn Successor>> {
        let behavior = *self.state.behavior.lock().unwrap();
        if behavior == Behavior::SpawnError {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"));
        }
        let n = self.state.spawned.fetch_add(1, Ordering::SeqCst);
        *self.state.handed_off.lock().unwrap() =
            listeners.iter().map(|(addr, _)| addr.clone()).collect();
        Ok(Box::new(FakeSuccessor {
            pid: 10_000 + n as u32,
            behavior,
            killed: self.state.killed.clone(),
        }))
    }
}

struct FakeSuccessor {
    pid: u32,
    behavior: Behavior,
    killed: Arc<AtomicUsize>,
}

#[async_trait]
impl Successor for FakeSuccessor {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    async fn ready(&mut self) -> io::Result<()> {
        match self.behavior {
            Behavior::Ready(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
            Behavior::Fail(delay) => {
                tokio::time::sleep(delay).await;
                Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "successor exited before signalling readiness",
                ))
            }
            Behavior::Hang | Behavior::SpawnError => std::future::pending().await,
        }
    }

    fn kill(&mut self) {
        self.killed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Binds a listener on a free loopback port, returning it with its address.
pub fn loopback_listener() -> (TcpListener, std::net::SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    (listener, addr)
}
