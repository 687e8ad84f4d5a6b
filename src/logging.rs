//! Logging initialization.
//!
//! Sets up a `tracing-subscriber` with an env filter and either a
//! human-readable or a JSON formatter.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: standard filter directives (e.g. "info,nano_serve=debug")
//! - `NANO_SERVE_LOG`: plain level used when `RUST_LOG` is unset
//! - `NANO_SERVE_LOG_FORMAT`: "human" (default) or "json"

use std::str::FromStr;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Error, Result};

/// Default log level when no environment variable is set.
const DEFAULT_LOG_LEVEL: &str = "info";

/// Environment variable for a plain log level.
const LOG_LEVEL_ENV: &str = "NANO_SERVE_LOG";

/// Environment variable for the output format.
const LOG_FORMAT_ENV: &str = "NANO_SERVE_LOG_FORMAT";

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable output.
    #[default]
    Human,
    /// One JSON object per event.
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "human" | "text" => Ok(Self::Human),
            "json" => Ok(Self::Json),
            other => Err(Error::Config(format!("invalid log format: {other}"))),
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let level = std::env::var(LOG_LEVEL_ENV).unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
        EnvFilter::new(level)
    })
}

/// Install the global subscriber.
///
/// `format` overrides `NANO_SERVE_LOG_FORMAT`. Returns `Ok(false)` if a
/// subscriber was already installed.
pub fn init_logging(format: Option<LogFormat>) -> Result<bool> {
    let format = match format {
        Some(format) => format,
        None => match std::env::var(LOG_FORMAT_ENV) {
            Ok(value) => value.parse()?,
            Err(_) => LogFormat::default(),
        },
    };

    let registry = tracing_subscriber::registry().with(env_filter());
    let installed = match format {
        LogFormat::Human => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_current_span(false)).try_init(),
    };
    Ok(installed.is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("human".parse::<LogFormat>().unwrap(), LogFormat::Human);
        assert!("yaml".parse::<LogFormat>().is_err());
    }

    #[test]
    fn test_second_init_is_noop() {
        let _ = init_logging(Some(LogFormat::Human));
        assert!(!init_logging(Some(LogFormat::Human)).unwrap());
    }
}
