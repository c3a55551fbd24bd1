//! Telemetry and Observability
//!
//! Sets up `tracing-subscriber` for structured logging. The log level
//! comes from config with an `RUST_LOG` override; the output format is
//! config-driven, with "auto" following the build profile.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Pretty-printed terminal output
    Pretty,
    /// JSON structured output with span context
    Json,
}

impl LogFormat {
    /// Resolve a configured format name. "auto" (and anything
    /// unrecognized) follows the build profile: pretty for debug
    /// builds, JSON otherwise.
    pub fn resolve(name: &str) -> Self {
        match name {
            "pretty" => LogFormat::Pretty,
            "json" => LogFormat::Json,
            _ => {
                if cfg!(debug_assertions) {
                    LogFormat::Pretty
                } else {
                    LogFormat::Json
                }
            }
        }
    }
}

/// Initialize the tracing subscriber.
///
/// Level priority: `RUST_LOG` env var > `log_level` parameter.
pub fn init_telemetry_with(log_level: &str, format: LogFormat) {
    let default_filter = format!("{},drover_engine={}", log_level, log_level);

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&default_filter));

    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Pretty => registry
            .with(fmt::layer().pretty().with_target(false))
            .try_init()
            .ok(),
        LogFormat::Json => registry
            .with(fmt::layer().json().with_current_span(true))
            .try_init()
            .ok(),
    };
}

/// Initialize with defaults, for use before config is available.
pub fn init_telemetry() {
    init_telemetry_with("info", LogFormat::resolve("auto"));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_resolution() {
        assert_eq!(LogFormat::resolve("pretty"), LogFormat::Pretty);
        assert_eq!(LogFormat::resolve("json"), LogFormat::Json);

        let auto = LogFormat::resolve("auto");
        if cfg!(debug_assertions) {
            assert_eq!(auto, LogFormat::Pretty);
        } else {
            assert_eq!(auto, LogFormat::Json);
        }
    }
}
