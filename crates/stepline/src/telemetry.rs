//! Tracing initialization

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

/// Logging configuration
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Explicit log filter (e.g. "debug", "stepline=trace")
    pub log_filter: Option<String>,

    /// Shift of the default level: positive is more verbose, negative quieter
    pub verbosity: i8,

    /// Whether to print event targets
    pub with_target: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: None,
            verbosity: 0,
            with_target: true,
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `RUST_LOG` or `LOG_LEVEL`: Log filter
    pub fn from_env() -> Self {
        Self {
            log_filter: std::env::var("RUST_LOG")
                .ok()
                .or_else(|| std::env::var("LOG_LEVEL").ok())
                .filter(|f| !f.trim().is_empty()),
            ..Default::default()
        }
    }

    /// Set the verbosity offset
    pub fn with_verbosity(mut self, verbosity: i8) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Filter used when no explicit filter is configured
    ///
    /// Starts at `info` for this crate and `warn` for everything else.
    pub fn default_filter(&self) -> String {
        let ours = level(2 + self.verbosity as i32);
        let others = level(1 + self.verbosity as i32);
        format!("{},stepline={},stepline_cli={}", others, ours, ours)
    }

    fn filter(&self) -> EnvFilter {
        self.log_filter
            .as_ref()
            .and_then(|f| EnvFilter::try_new(f).ok())
            .unwrap_or_else(|| EnvFilter::new(self.default_filter()))
    }
}

fn level(index: i32) -> &'static str {
    LEVELS[index.clamp(0, LEVELS.len() as i32 - 1) as usize]
}

/// Install the global tracing subscriber
///
/// Does nothing if a subscriber is already installed.
///
/// # Example
///
/// ```ignore
/// use stepline::telemetry::{init_tracing, TelemetryConfig};
///
/// init_tracing(TelemetryConfig::from_env().with_verbosity(1));
/// ```
pub fn init_tracing(config: TelemetryConfig) {
    let layer = tracing_subscriber::fmt::layer()
        .with_target(config.with_target)
        .with_filter(config.filter());

    if tracing_subscriber::registry().with(layer).try_init().is_err() {
        tracing::debug!("Tracing subscriber already installed");
    }
}
