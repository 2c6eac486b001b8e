//! Logging utilities for CARP Rust components.

use std::fmt;
use std::str::FromStr;
use tracing_subscriber::{EnvFilter, fmt as layer, prelude::*};

/// Output format of the installed subscriber
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            s if s.eq_ignore_ascii_case("text") || s.eq_ignore_ascii_case("pretty") => {
                Ok(LogFormat::Text)
            }
            s if s.eq_ignore_ascii_case("json") => Ok(LogFormat::Json),
            other => Err(crate::Error::config(format!("unknown log format {other:?}"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Install the global subscriber.
///
/// RUST_LOG takes precedence; `default_level` applies when it is unset or
/// unparsable.
pub fn init(format: LogFormat, default_level: &str) {
    let registry = tracing_subscriber::registry().with(filter(default_level));
    match format {
        LogFormat::Text => registry.with(layer::layer()).init(),
        LogFormat::Json => registry.with(layer::layer().json()).init(),
    }
}

fn filter(default_level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level))
}
