//! Structured logging using the tracing crate
//!
//! The library itself only emits events; installing a subscriber is left to
//! the application. These helpers cover the common setups.
//!
//! ## Environment Variables
//!
//! - `LOG_LEVEL`: ERROR, WARN, INFO, DEBUG or TRACE; defaults to INFO
//! - `LOG_FORMAT`: json, pretty or compact; defaults to json
//! - `LOG_SPANS`: include span open/close events (true/false)
//! - `RUST_LOG`: full filter override
//!
//! ```bash
//! LOG_FORMAT=pretty LOG_LEVEL=DEBUG iotlink run --config device.toml
//! ```

use std::env;
use tracing::Level;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Log output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    /// Structured JSON (machine-readable)
    Json,
    /// Multi-line with colors
    Pretty,
    /// Single line with colors
    Compact,
}

impl LogFormat {
    /// Parse log format from string; unknown values fall back to JSON
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "pretty" => LogFormat::Pretty,
            "compact" => LogFormat::Compact,
            _ => LogFormat::Json,
        }
    }
}

/// Resolved logging settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub level: Level,
    pub format: LogFormat,
    pub include_spans: bool,
    /// `RUST_LOG` style override; replaces the level-based filter entirely
    pub filter_override: Option<String>,
}

impl LoggingConfig {
    /// Read `LOG_LEVEL`, `LOG_FORMAT`, `LOG_SPANS` and `RUST_LOG`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let level = lookup("LOG_LEVEL")
            .map(|value| parse_level(&value))
            .unwrap_or(Level::INFO);
        let format = lookup("LOG_FORMAT")
            .map(|value| LogFormat::parse(&value))
            .unwrap_or(LogFormat::Json);
        let include_spans = lookup("LOG_SPANS")
            .map(|value| value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let filter_override = lookup("RUST_LOG").filter(|value| !value.trim().is_empty());

        Self {
            level,
            format,
            include_spans,
            filter_override,
        }
    }

    /// Filter for the subscriber. Dependency noise is capped at WARN.
    pub fn env_filter(&self) -> EnvFilter {
        if let Some(directives) = &self.filter_override {
            return EnvFilter::new(directives);
        }

        let mut filter = EnvFilter::new(self.level.to_string());
        for directive in ["rustls=warn", "hyper=warn", "reqwest=warn", "tokio=warn"] {
            if let Ok(directive) = directive.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_uppercase().as_str() {
        "ERROR" => Level::ERROR,
        "WARN" => Level::WARN,
        "DEBUG" => Level::DEBUG,
        "TRACE" => Level::TRACE,
        _ => Level::INFO,
    }
}

fn span_events(include_spans: bool) -> fmt::format::FmtSpan {
    if include_spans {
        fmt::format::FmtSpan::NEW | fmt::format::FmtSpan::CLOSE
    } else {
        fmt::format::FmtSpan::NONE
    }
}

/// Install a global subscriber.
///
/// Returns false when one was already installed, which is common in tests
/// and in applications that configure tracing themselves.
pub fn init_logging(level: Level, format: LogFormat, include_spans: bool) -> bool {
    install(&LoggingConfig {
        level,
        format,
        include_spans,
        filter_override: env::var("RUST_LOG").ok().filter(|v| !v.trim().is_empty()),
    })
}

/// Install a global subscriber configured from the environment
pub fn init_default_logging() -> bool {
    install(&LoggingConfig::from_env())
}

fn install(config: &LoggingConfig) -> bool {
    let subscriber = tracing_subscriber::registry().with(config.env_filter());
    let spans = span_events(config.include_spans);

    let installed = match config.format {
        LogFormat::Json => subscriber
            .with(fmt::layer().json().with_span_events(spans))
            .try_init(),
        LogFormat::Pretty => subscriber
            .with(fmt::layer().pretty().with_ansi(true).with_span_events(spans))
            .try_init(),
        LogFormat::Compact => subscriber
            .with(
                fmt::layer()
                    .compact()
                    .with_ansi(true)
                    .with_target(false)
                    .with_span_events(spans),
            )
            .try_init(),
    };
    installed.is_ok()
}

/// Create an MQTT operation span
#[macro_export]
macro_rules! mqtt_span {
    ($($field:tt)*) => {
        tracing::info_span!("mqtt_operation", $($field)*)
    };
}

/// Create a credential resolution span
#[macro_export]
macro_rules! auth_span {
    ($($field:tt)*) => {
        tracing::info_span!("credential_resolution", $($field)*)
    };
}

pub use {auth_span, mqtt_span};
