//! Supervised actor groups.
//!
//! A [`Group`] runs a set of [`Actor`]s concurrently. Each actor is a pair of a long-running
//! `run` future and an `interrupt` callback. As soon as the first `run` future completes, every
//! actor (the one that completed included) is interrupted, and [`Group::run`] waits for all of
//! them to wind down before returning the result of the actor that completed first.
//!
//! # Example
//!
//! ```ignore
//! use handover_group::{Actor, Group};
//! use tokio_util::sync::CancellationToken;
//!
//! let token = CancellationToken::new();
//! let mut group = Group::new();
//! group.add(Actor::new(
//!     "worker",
//!     {
//!         let token = token.clone();
//!         async move {
//!             token.cancelled().await;
//!             Ok(())
//!         }
//!     },
//!     move |_cause| async move { token.cancel() },
//! ));
//! group.run().await?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::future::{self, Future};
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::{self, JoinError, JoinSet};

/// Error type returned by an actor's `run` future.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

type Interrupt = Box<dyn FnOnce(Option<GroupError>) -> BoxFuture<'static, ()> + Send>;

/// The error surfaced by [`Group::run`] when the triggering actor did not finish cleanly.
///
/// Cloneable so every interrupt callback can observe the cause of the shutdown.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GroupError {
    #[error("actor `{actor}` failed: {source}")]
    Actor {
        actor: String,
        source: Arc<dyn Error + Send + Sync + 'static>,
    },
    #[error("actor `{actor}` panicked: {message}")]
    Panicked { actor: String, message: String },
    #[error("actor `{actor}` was cancelled")]
    Cancelled { actor: String },
}

impl GroupError {
    /// Name of the actor this error originated from.
    pub fn actor(&self) -> &str {
        match self {
            GroupError::Actor { actor, .. }
            | GroupError::Panicked { actor, .. }
            | GroupError::Cancelled { actor } => actor,
        }
    }
}

/// A unit of work supervised by a [`Group`].
///
/// `interrupt` is called exactly once, after the first actor of the group returned. It receives
/// the error of that actor, if any, and must make `run` return promptly.
pub struct Actor {
    name: String,
    run: BoxFuture<'static, Result<(), BoxError>>,
    interrupt: Interrupt,
}

impl Actor {
    pub fn new<R, I, F>(name: impl Into<String>, run: R, interrupt: I) -> Self
    where
        R: Future<Output = Result<(), BoxError>> + Send + 'static,
        I: FnOnce(Option<GroupError>) -> F + Send + 'static,
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            name: name.into(),
            run: run.boxed(),
            interrupt: Box::new(move |cause| interrupt(cause).boxed()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Actor").field("name", &self.name).finish()
    }
}

/// An ordered collection of actors that live and die together.
#[derive(Debug, Default)]
pub struct Group {
    actors: Vec<Actor>,
}

impl Group {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an actor. Interrupts are started in reverse registration order.
    pub fn add(&mut self, actor: Actor) -> &mut Self {
        self.actors.push(actor);
        self
    }

    pub fn len(&self) -> usize {
        self.actors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actors.is_empty()
    }

    /// Runs all actors concurrently until the first one returns.
    ///
    /// The first actor to return is the trigger: every actor is then interrupted with the
    /// trigger's error, and this method waits until all interrupts and all `run` futures have
    /// completed. Returns the trigger's result; results of the other actors are logged and
    /// dropped. A group without actors returns `Ok(())` right away.
    pub async fn run(self) -> Result<(), GroupError> {
        if self.actors.is_empty() {
            return Ok(());
        }

        let size = self.actors.len();
        let mut names = Vec::with_capacity(size);
        let mut interrupts = Vec::with_capacity(size);
        let mut started = Vec::with_capacity(size);
        let mut running = JoinSet::new();
        let mut indices = HashMap::with_capacity(size);

        for (index, actor) in self.actors.into_iter().enumerate() {
            let Actor {
                name,
                run,
                interrupt,
            } = actor;
            let (started_tx, started_rx) = oneshot::channel();
            let mut run = run;
            let mut started_tx = Some(started_tx);
            // Reports the first poll only once it has returned.
            let handle = running.spawn(future::poll_fn(move |cx| {
                let polled = run.poll_unpin(cx);
                if let Some(started_tx) = started_tx.take() {
                    let _ = started_tx.send(());
                }
                polled
            }));
            indices.insert(handle.id(), index);
            names.push(name);
            interrupts.push(interrupt);
            started.push(started_rx);
        }

        let Some(joined) = running.join_next_with_id().await else {
            return Ok(());
        };
        let (trigger, result) = outcome(joined, &indices, &names);
        match &result {
            Ok(()) => {
                tracing::info!(actor = %names[trigger], "Actor returned, interrupting group")
            }
            Err(e) => tracing::error!(
                actor = %names[trigger],
                error = %e,
                "Actor failed, interrupting group"
            ),
        }

        // Never interrupt an actor whose run has not been polled yet.
        for started in started {
            let _ = started.await;
        }

        let cause = result.as_ref().err().cloned();
        let mut interrupting = JoinSet::new();
        let mut interrupt_indices = HashMap::with_capacity(size);
        for (index, interrupt) in interrupts.into_iter().enumerate().rev() {
            let cause = cause.clone();
            let handle = interrupting.spawn(async move { interrupt(cause).await });
            interrupt_indices.insert(handle.id(), index);
        }
        while let Some(joined) = interrupting.join_next_with_id().await {
            if let Err(e) = joined {
                let actor = &names[interrupt_indices[&e.id()]];
                tracing::error!(actor = %actor, error = %e, "Actor interrupt did not complete");
            }
        }

        while let Some(joined) = running.join_next_with_id().await {
            let (index, rest) = outcome(joined, &indices, &names);
            match rest {
                Ok(()) => tracing::debug!(actor = %names[index], "Actor stopped"),
                Err(e) => {
                    tracing::warn!(actor = %names[index], error = %e, "Actor stopped with error")
                }
            }
        }

        result
    }
}

fn outcome(
    joined: Result<(task::Id, Result<(), BoxError>), JoinError>,
    indices: &HashMap<task::Id, usize>,
    names: &[String],
) -> (usize, Result<(), GroupError>) {
    match joined {
        Ok((id, result)) => {
            let index = indices[&id];
            let result = result.map_err(|source| GroupError::Actor {
                actor: names[index].clone(),
                source: Arc::from(source),
            });
            (index, result)
        }
        Err(e) => {
            let index = indices[&e.id()];
            let actor = names[index].clone();
            let error = if e.is_panic() {
                GroupError::Panicked {
                    actor,
                    message: panic_message(e.into_panic()),
                }
            } else {
                GroupError::Cancelled { actor }
            };
            (index, Err(error))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
