use axum::http::Request;
use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::{DefaultOnFailure, DefaultOnResponse, MakeSpan, TraceLayer};
use tracing::{Level, Span};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Log filter used when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info";

/// Logging setup for a serving process.
///
/// ```ignore
/// let telemetry = Telemetry::new()
///     .with_name(env!("CARGO_PKG_NAME"))
///     .with_version(env!("CARGO_PKG_VERSION"))
///     .register();
/// ```
#[derive(Debug, Clone)]
pub struct Telemetry {
    name: &'static str,
    version: &'static str,
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME"),
            version: env!("CARGO_PKG_VERSION"),
        }
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = version;
        self
    }

    /// Installs the global `tracing` subscriber.
    ///
    /// Honors `RUST_LOG`, defaulting to `info`. A subscriber that is already installed is kept.
    pub fn register(self) -> Self {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
        let installed = tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .try_init();
        match installed {
            Ok(()) => tracing::info!(
                service = self.name,
                version = self.version,
                pid = std::process::id(),
                "Logging initialized"
            ),
            Err(e) => tracing::debug!(error = %e, "Tracing subscriber already installed"),
        }
        self
    }

    /// A `TraceLayer` that opens one span per request, tagged with this process id.
    ///
    /// Requests served by different generations end up in differently tagged spans.
    pub fn http_tracing(
        &self,
    ) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>, RequestSpan> {
        TraceLayer::new_for_http()
            .make_span_with(RequestSpan {
                service: self.name,
            })
            .on_response(DefaultOnResponse::new().level(Level::INFO))
            .on_failure(DefaultOnFailure::new().level(Level::ERROR))
    }
}

/// Builds the per-request span for [`Telemetry::http_tracing`].
#[derive(Debug, Clone, Copy)]
pub struct RequestSpan {
    service: &'static str,
}

impl<B> MakeSpan<B> for RequestSpan {
    fn make_span(&mut self, request: &Request<B>) -> Span {
        tracing::info_span!(
            "http_request",
            service = self.service,
            pid = std::process::id(),
            method = %request.method(),
            uri = %request.uri(),
        )
    }
}
