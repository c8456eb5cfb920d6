//! Zero-downtime restarts and graceful shutdown for long-running network servers.
//!
//! A serving process runs a small set of cooperating actors under one supervisor group. The
//! first actor to finish shuts the others down, so the process exits as a unit.
//!
//! # Lifecycle
//!
//! - **SIGHUP** starts a new generation of the same binary. The listening socket is passed on
//!   without ever being closed, so connecting clients see no refusals. Once the successor
//!   reports readiness, this generation drains its connections and exits.
//! - **SIGINT / SIGTERM** drain the server within the configured shutdown timeout, then
//!   force-close what is left.
//!
//! # Modules
//!
//! - [`actors`]: The server, signal watcher and lifecycle actors.
//! - [`config`]: Configuration for the `handover-server` binary.
//! - [`graceful`]: Top-level wiring: [`graceful::run`] serves until termination or takeover.
//! - [`handlers`]: Demo HTTP routes reporting which generation answered.
//! - [`handoff`]: Passing listening sockets to a successor process.
//! - [`policy`]: The shutdown timeout policy.
//! - [`server`]: The [`Server`](server::Server) abstraction and its axum implementation.
//! - [`signals`]: Injectable signal sources.
//! - [`telemetry`]: Logging setup.
//! - [`upgrader`]: Socket inheritance, readiness, PID file and upgrade coordination.
//!
//! The supervisor group itself lives in the `handover-group` crate and is re-exported as
//! [`group`].

pub mod actors;
pub mod config;
pub mod graceful;
pub mod handlers;
pub mod handoff;
pub mod policy;
pub mod server;
pub mod signals;
pub mod telemetry;
pub mod upgrader;

pub use handover_group as group;
