//! Structured logging setup
//!
//! Log output goes to stderr so that `--json` command output on stdout stays
//! machine-readable. Debug builds print human-readable lines; release builds
//! print JSON with the current span attached. `PLEXUS_LOG_FORMAT=json|pretty`
//! overrides the build default.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Environment variable selecting the log format
pub const LOG_FORMAT_ENV: &str = "PLEXUS_LOG_FORMAT";

/// How log lines are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Pretty,
    Json,
}

impl LogFormat {
    /// Format for this build, unless overridden by `value`
    pub fn resolve(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("json") => LogFormat::Json,
            Some(v) if v.eq_ignore_ascii_case("pretty") => LogFormat::Pretty,
            _ if cfg!(debug_assertions) => LogFormat::Pretty,
            _ => LogFormat::Json,
        }
    }
}

/// Filter for `log_level`, with `RUST_LOG` taking precedence when set and valid
pub fn build_filter(log_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::try_new(format!("{},plexus_engine={}", log_level, log_level))
            .unwrap_or_else(|_| EnvFilter::new("info"))
    })
}

/// Install the global subscriber at `log_level`
///
/// Only the first call installs anything; later calls are no-ops.
pub fn init_telemetry_with_level(log_level: &str) {
    let filter = build_filter(log_level);
    let format = LogFormat::resolve(std::env::var(LOG_FORMAT_ENV).ok().as_deref());

    let installed = match format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .pretty()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_writer(std::io::stderr),
            )
            .try_init(),
    };

    if installed.is_ok() {
        tracing::debug!(?format, log_level, "Telemetry initialized");
    }
}

/// Install the global subscriber at `warn`, for use before config is read
pub fn init_telemetry() {
    init_telemetry_with_level("warn");
}
