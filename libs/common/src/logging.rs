//! Unified logging module for gateway services
//!
//! Console output uses a compact `timestamp [LEVEL] message` format. An
//! optional daily-rolling file sink is written through a non-blocking
//! appender.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::{self, format::Writer, FmtContext, FormatEvent, FormatFields},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or a full filter spec
    pub level: String,
    /// Emit JSON lines instead of the bracketed text format
    pub json: bool,
    /// Write a daily-rolling log file in addition to the console
    pub file: bool,
    /// Log directory (used when `file` is enabled)
    pub dir: String,
    /// Log file prefix, defaults to the service name
    pub file_prefix: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            file: false,
            dir: "logs".to_string(),
            file_prefix: None,
        }
    }
}

/// Custom format for log level with brackets: `[INFO]`, `[WARN]`, etc.
fn format_level(level: &Level) -> &'static str {
    match *level {
        Level::TRACE => "[TRACE]",
        Level::DEBUG => "[DEBUG]",
        Level::INFO => "[INFO]",
        Level::WARN => "[WARN]",
        Level::ERROR => "[ERROR]",
    }
}

/// Event formatter that outputs: `timestamp [LEVEL] message`
///
/// Example output: `2025-12-02T00:50:44.809Z [INFO] Device 3 online`
struct BracketedLevelFormat;

impl<S, N> FormatEvent<S, N> for BracketedLevelFormat
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let now = chrono::Utc::now();
        write!(writer, "{} ", now.format("%Y-%m-%dT%H:%M:%S%.3fZ"))?;

        let level = *event.metadata().level();
        if writer.has_ansi_escapes() {
            let color = match level {
                Level::TRACE => "\x1b[35m", // magenta
                Level::DEBUG => "\x1b[34m", // blue
                Level::INFO => "\x1b[32m",  // green
                Level::WARN => "\x1b[33m",  // yellow
                Level::ERROR => "\x1b[31m", // red
            };
            write!(writer, "{}{}\x1b[0m ", color, format_level(&level))?;
        } else {
            write!(writer, "{} ", format_level(&level))?;
        }

        ctx.field_format().format_fields(writer.by_ref(), event)?;

        writeln!(writer)
    }
}

/// Build the initial filter string
///
/// `RUST_LOG` wins when set; otherwise the configured level applies globally
/// and the service's own target is lifted to at least the same level.
fn initial_filter(service_name: &str, config: &LoggingConfig) -> String {
    if let Ok(env_str) = std::env::var("RUST_LOG") {
        if !env_str.trim().is_empty() {
            return env_str;
        }
    }
    if config.level.contains('=') || config.level.contains(',') {
        config.level.clone()
    } else {
        format!("{},{}={}", config.level, service_name, config.level)
    }
}

/// Initialize the global subscriber
///
/// Returns the file appender guard when file logging is enabled; the caller
/// must keep it alive for buffered lines to be flushed on exit.
pub fn init_logging(
    service_name: &str,
    config: &LoggingConfig,
) -> Result<Option<WorkerGuard>, Box<dyn std::error::Error + Send + Sync>> {
    let filter_str = initial_filter(service_name, config);
    let env_filter = EnvFilter::try_new(&filter_str)?;

    let console_layer = if config.json {
        fmt::layer().json().with_target(true).boxed()
    } else {
        fmt::layer()
            .with_ansi(true)
            .event_format(BracketedLevelFormat)
            .boxed()
    };

    let (file_layer, guard) = if config.file {
        let dir = PathBuf::from(&config.dir);
        std::fs::create_dir_all(&dir)?;
        let prefix = config
            .file_prefix
            .clone()
            .unwrap_or_else(|| format!("{}.log", service_name));
        let appender = tracing_appender::rolling::daily(&dir, prefix);
        let (non_blocking, guard) = tracing_appender::non_blocking(appender);

        let layer = if config.json {
            fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_target(true)
                .boxed()
        } else {
            fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(BracketedLevelFormat)
                .boxed()
        };
        (Some(layer), Some(guard))
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()?;

    tracing::info!("Logging: {} @ {}", service_name, filter_str);
    if config.file {
        tracing::debug!("File log directory: {}", config.dir);
    }

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_level() {
        assert_eq!(format_level(&Level::INFO), "[INFO]");
        assert_eq!(format_level(&Level::ERROR), "[ERROR]");
    }

    #[test]
    fn test_initial_filter_from_plain_level() {
        if std::env::var("RUST_LOG").is_ok() {
            return;
        }
        let config = LoggingConfig {
            level: "debug".to_string(),
            ..Default::default()
        };
        assert_eq!(initial_filter("plcsrv", &config), "debug,plcsrv=debug");

        let config = LoggingConfig {
            level: "warn,plcsrv=trace".to_string(),
            ..Default::default()
        };
        assert_eq!(initial_filter("plcsrv", &config), "warn,plcsrv=trace");
    }
}
