//! Structured logging for jqlake
//! JSON logging for batch jobs, pretty output for interactive use

use anyhow::Result;
use std::io;
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    EnvFilter, Registry,
};

/// Logging configuration
#[derive(Clone, Debug)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Enable JSON format (default: true for batch jobs)
    pub json_format: bool,

    /// Enable span events for timing ingest/transform phases
    pub log_spans: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            log_spans: false,
        }
    }
}

impl LogConfig {
    /// Production logging config (JSON, INFO level)
    pub fn production() -> Self {
        Self {
            level: "info".to_string(),
            json_format: true,
            log_spans: true,
        }
    }

    /// Development logging config (pretty, DEBUG level)
    pub fn development() -> Self {
        Self {
            level: "debug".to_string(),
            json_format: false,
            log_spans: false,
        }
    }
}

/// Initialize structured logging with the given configuration
pub fn init_logging(config: LogConfig) -> Result<()> {
    let filter = EnvFilter::try_new(&config.level).or_else(|_| EnvFilter::try_new("info"))?;

    let span_events = if config.log_spans {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    if config.json_format {
        let fmt_layer = fmt::layer()
            .json()
            .with_span_events(span_events)
            .with_target(true)
            .with_writer(io::stdout);

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let fmt_layer = fmt::layer()
            .with_span_events(span_events)
            .with_target(true)
            .with_writer(io::stdout);

        let subscriber = Registry::default().with(filter).with(fmt_layer);
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}

/// Initialize logging from JQLAKE_LOG / JQLAKE_LOG_FORMAT environment variables
pub fn init_from_env() -> Result<()> {
    let level = std::env::var("JQLAKE_LOG").unwrap_or_else(|_| "info".to_string());
    let json_format = std::env::var("JQLAKE_LOG_FORMAT")
        .map(|v| v.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    init_logging(LogConfig {
        level,
        json_format,
        log_spans: false,
    })
}
