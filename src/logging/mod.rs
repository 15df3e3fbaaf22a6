use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::{SecondsFormat, Utc};
use serde_json::Value;

use crate::config::LoggingConfig;

/// Severity, ordered so that a lower value is more severe.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum LogLevel {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    /// Per-message chatter from the consumer and workers.
    Trace = 5,
}

impl LogLevel {
    pub const ALLOWED_VALUES: &'static str = "error, warn, info, debug, trace";

    /// Parses `logging.level`; `verbose` and `warning` are accepted as aliases.
    pub fn from_config_value(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" | "warning" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" | "verbose" => Some(Self::Trace),
            _ => None,
        }
    }

    fn label(self) -> &'static str {
        match self {
            Self::Error => "ERROR",
            Self::Warn => "WARN",
            Self::Info => "INFO",
            Self::Debug => "DEBUG",
            Self::Trace => "TRACE",
        }
    }

    /// ANSI foreground colour used when `logging.human_friendly` is set.
    fn ansi_color(self) -> u8 {
        match self {
            Self::Error => 31,
            Self::Warn => 33,
            Self::Info => 32,
            Self::Debug => 36,
            Self::Trace => 90,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggerConfig {
    pub min_level: LogLevel,
    pub human_friendly: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            min_level: LogLevel::Debug,
            human_friendly: false,
        }
    }
}

impl TryFrom<&LoggingConfig> for LoggerConfig {
    type Error = String;

    fn try_from(value: &LoggingConfig) -> Result<Self, Self::Error> {
        let min_level = LogLevel::from_config_value(&value.level).ok_or_else(|| {
            format!(
                "invalid logging.level '{}'. Allowed values: {}",
                value.level,
                LogLevel::ALLOWED_VALUES
            )
        })?;

        Ok(Self {
            min_level,
            human_friendly: value.human_friendly,
        })
    }
}

pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

#[derive(Default)]
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{line}");
    }
}

/// Line-oriented logger shared by every thread of the process.
///
/// Lines look like `<rfc3339 ts> [LEVEL] [context] message payload=<json>`.
pub struct Logger {
    config: LoggerConfig,
    sink: Arc<dyn LogSink>,
}

impl Logger {
    pub fn new(config: LoggerConfig) -> Self {
        Self::with_sink(config, Arc::new(StdoutSink))
    }

    pub fn with_sink(config: LoggerConfig, sink: Arc<dyn LogSink>) -> Self {
        Self { config, sink }
    }

    pub fn warn(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Warn, context, message, None);
    }

    pub fn info(&self, context: Option<&str>, message: &str) {
        self.log(LogLevel::Info, context, message, None);
    }

    pub fn log(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<Value>,
    ) {
        if !self.enabled(level) {
            return;
        }

        let line = self.format_line(level, context, message, payload.as_ref());
        self.sink.write_line(&line);
    }

    /// Lets callers skip building a payload that would be filtered out.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level <= self.config.min_level
    }

    fn format_line(
        &self,
        level: LogLevel,
        context: Option<&str>,
        message: &str,
        payload: Option<&Value>,
    ) -> String {
        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
        let rendered_level = if self.config.human_friendly {
            format!("\x1b[{}m{}\x1b[0m", level.ansi_color(), level.label())
        } else {
            level.label().to_owned()
        };

        let context_part = match context {
            Some(ctx) if !ctx.is_empty() => format!(" [{ctx}]"),
            _ => String::new(),
        };

        let payload_part = match payload {
            Some(value) => format!(" payload={value}"),
            None => String::new(),
        };

        format!("{timestamp} [{rendered_level}]{context_part} {message}{payload_part}")
    }
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("config", &self.config)
            .field("sink", &"<dyn LogSink>")
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use crate::config::LoggingConfig;

    use super::test_support::MemorySink;
    use super::{LogLevel, Logger, LoggerConfig};

    #[test]
    fn default_config_is_non_human_friendly_and_debug_level() {
        let config = LoggerConfig::default();
        assert_eq!(config.min_level, LogLevel::Debug);
        assert!(!config.human_friendly);
    }

    #[test]
    fn parses_config_levels_case_insensitively() {
        assert_eq!(LogLevel::from_config_value("INFO"), Some(LogLevel::Info));
        assert_eq!(LogLevel::from_config_value(" warn "), Some(LogLevel::Warn));
        assert_eq!(LogLevel::from_config_value("verbose"), Some(LogLevel::Trace));
        assert_eq!(LogLevel::from_config_value("loud"), None);
    }

    #[test]
    fn logger_config_rejects_unknown_level() {
        let err = LoggerConfig::try_from(&LoggingConfig {
            level: "loud".to_owned(),
            human_friendly: true,
        })
        .expect_err("unknown level should be rejected");
        assert!(err.contains("logging.level 'loud'"));
    }

    #[test]
    fn debug_threshold_excludes_trace_logs() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(LoggerConfig::default(), sink.clone());

        logger.log(LogLevel::Debug, Some("consumer::tick"), "poll finished", None);
        logger.log(LogLevel::Trace, Some("consumer::route"), "message routed", None);

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[DEBUG] [consumer::tick] poll finished"));
        assert!(!logger.enabled(LogLevel::Trace));
    }

    #[test]
    fn human_friendly_lines_colour_the_level() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(
            LoggerConfig {
                min_level: LogLevel::Info,
                human_friendly: true,
            },
            sink.clone(),
        );

        logger.warn(Some("main::shutdown"), "consumer stop error");

        assert!(sink.lines()[0].contains("[\x1b[33mWARN\x1b[0m] [main::shutdown]"));
    }

    #[test]
    fn log_supports_optional_json_payload() {
        let sink = Arc::new(MemorySink::default());
        let logger = Logger::with_sink(LoggerConfig::default(), sink.clone());

        logger.log(
            LogLevel::Info,
            Some("tests::payload"),
            "job dispatched",
            Some(json!({"job_id":"j1","worker_id":2})),
        );

        let lines = sink.lines();
        assert_eq!(lines.len(), 1);
        assert!(lines[0].contains("[INFO]"));
        assert!(lines[0].contains("[tests::payload]"));
        assert!(lines[0].contains("payload={\"job_id\":\"j1\",\"worker_id\":2}"));
        assert!(lines[0].starts_with("20"));
    }
}
