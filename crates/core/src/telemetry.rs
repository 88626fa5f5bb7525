//! Tracing subscriber setup for embedding binaries.

use tracing_subscriber::{
    EnvFilter, fmt,
    filter::Directive,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::LoggingConfig;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("invalid log level {level:?}: {reason}")]
    InvalidLevel { level: String, reason: String },

    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install the global subscriber. Logs go to stderr; `RUST_LOG` overrides
/// the configured level.
pub fn init(logging: &LoggingConfig) -> Result<(), TelemetryError> {
    let directive = default_directive(&logging.level)?;
    let env_filter = EnvFilter::builder().with_default_directive(directive).from_env_lossy();

    let fmt_layer = if logging.json {
        fmt::layer()
            .json()
            .with_current_span(true)
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed()
    } else {
        fmt::layer().compact().with_target(true).with_writer(std::io::stderr).boxed()
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|err| TelemetryError::Install(err.to_string()))
}

fn default_directive(level: &str) -> Result<Directive, TelemetryError> {
    level
        .trim()
        .parse()
        .map_err(|err: tracing_subscriber::filter::ParseError| TelemetryError::InvalidLevel {
            level: level.to_string(),
            reason: err.to_string(),
        })
}
