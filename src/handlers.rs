//! HTTP endpoints served by `handover-server`.
//!
//! - `GET /` reports which process answered, so clients can watch generations change.
//! - `GET /delay/{ms}` answers after `ms` milliseconds, for exercising drains by hand.

use std::process;
use std::time::Duration;

use axum::extract::Path;
use axum::routing::get;
use axum::{Json, Router, response::IntoResponse};
use serde::Serialize;
use tracing::instrument;

/// Longest delay `GET /delay/{ms}` accepts.
pub const MAX_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct GenerationInfo {
    pub pid: u32,
    pub version: &'static str,
}

impl GenerationInfo {
    fn current() -> Self {
        Self {
            pid: process::id(),
            version: env!("CARGO_PKG_VERSION"),
        }
    }
}

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DelayedResponse {
    pub pid: u32,
    pub delayed_ms: u64,
}

pub fn routes() -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/delay/{ms}", get(get_delay))
}

/// `GET /`: the pid and version of the generation that served the request.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    Json(GenerationInfo::current())
}

/// `GET /delay/{ms}`: sleeps for `ms` milliseconds (capped at [`MAX_DELAY`]) before answering.
#[instrument(skip_all)]
pub async fn get_delay(Path(ms): Path<u64>) -> impl IntoResponse {
    let delay = Duration::from_millis(ms).min(MAX_DELAY);
    tokio::time::sleep(delay).await;
    Json(DelayedResponse {
        pid: process::id(),
        delayed_ms: delay.as_millis() as u64,
    })
}
