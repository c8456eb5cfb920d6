//! Deadline-bounded shutdown policy.
//!
//! Decides how long a graceful drain may take before remaining connections are force-closed.

use std::time::Duration;
use tokio::time::Instant;

/// Default drain budget.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);

/// How long a graceful drain may last.
///
/// `None` means there is no deadline: the drain waits for every connection to finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownPolicy {
    timeout: Option<Duration>,
}

impl ShutdownPolicy {
    /// A policy with the given drain budget. A zero duration disables the deadline.
    pub fn new(timeout: Duration) -> Self {
        if timeout.is_zero() {
            Self::unbounded()
        } else {
            Self {
                timeout: Some(timeout),
            }
        }
    }

    /// A policy that waits for the drain indefinitely.
    pub fn unbounded() -> Self {
        Self { timeout: None }
    }

    /// Builds the policy from a number of seconds as found in configuration.
    ///
    /// Zero, negative and non-finite values disable the deadline.
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_finite() && secs > 0.0 {
            Duration::try_from_secs_f64(secs)
                .map(Self::new)
                .unwrap_or_else(|_| Self::unbounded())
        } else {
            Self::unbounded()
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The instant at which a drain started at `now` must be abandoned.
    pub fn deadline_from(&self, now: Instant) -> Option<Instant> {
        self.timeout.map(|timeout| now + timeout)
    }

    /// The deadline for a drain starting right now.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline_from(Instant::now())
    }
}

impl Default for ShutdownPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_SHUTDOWN_TIMEOUT)
    }
}
