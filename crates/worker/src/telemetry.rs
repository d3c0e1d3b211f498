// Tracing setup for the worker process
//
// Console logging through tracing-subscriber with an EnvFilter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const DEFAULT_FILTER: &str = "atcdrill_worker=info,atcdrill_jobs=info";

/// Configuration for logging
#[derive(Debug, Clone, Default)]
pub struct TelemetryConfig {
    /// Log filter (e.g., "info", "atcdrill_jobs=debug")
    pub log_filter: Option<String>,
    /// Include the event target in each line
    pub with_target: bool,
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG`: Full filter directive
    /// - `LOG_LEVEL`: Level for the worker and job crates when `RUST_LOG` is unset
    pub fn from_env() -> Self {
        let log_filter = std::env::var("RUST_LOG").ok().or_else(|| {
            std::env::var("LOG_LEVEL")
                .ok()
                .map(|level| format!("atcdrill_worker={level},atcdrill_jobs={level}"))
        });

        Self {
            log_filter,
            with_target: true,
        }
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(DEFAULT_FILTER))
    }
}

/// Install the global tracing subscriber
///
/// Call once, before anything logs.
pub fn init_telemetry(config: TelemetryConfig) {
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.filter());

    tracing_subscriber::registry().with(console_layer).init();

    tracing::debug!(
        filter = config.log_filter.as_deref().unwrap_or(DEFAULT_FILTER),
        "Telemetry initialized"
    );
}
