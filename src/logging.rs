//! Tracing subscriber setup for the `transferbox` binary.
//!
//! Pretty console output by default, JSON lines with `--json-logs`. The
//! library itself only emits `tracing` events and never installs a
//! subscriber.

use tracing::Level;
use tracing_subscriber::{
    EnvFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct LogConfig {
    /// Output logs as JSON
    pub json: bool,
    /// Default to DEBUG instead of INFO
    pub verbose: bool,
}

/// Directive used when `RUST_LOG` is not set.
pub fn default_directive(config: &LogConfig) -> String {
    let level = if config.verbose { Level::DEBUG } else { Level::INFO };
    format!("transferbox={}", level.as_str().to_lowercase())
}

/// Install the global subscriber. `RUST_LOG` overrides the default level.
///
/// Calling this twice is harmless; the second registration is ignored.
pub fn init(config: LogConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive(&config)));

    let result = if config.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .json()
                    .with_span_events(FmtSpan::CLOSE)
                    .with_current_span(true)
                    .with_target(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()
    };

    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}
