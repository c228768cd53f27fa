//! Tracing setup for the CLI and embedding applications.
//!
//! Events from this crate are filtered at the configured level while
//! dependencies stay at `warn`, so a `debug` run shows per-slice engine and
//! pipeline traffic without drowning in runtime internals. `RUST_LOG`, when
//! set, replaces the whole filter.
//!
//! ```no_run
//! use spim_daq::{config::SpimConfig, logging};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SpimConfig::load()?;
//! logging::init_from_config(&config)?;
//! tracing::info!(rows = config.acquisition.rows.len(), "Ready");
//! # Ok(())
//! # }
//! ```

use std::str::FromStr;

use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::SpimConfig;

/// Shape of each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Multi-line, colored; for watching a run interactively
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON for log shippers
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(format!(
                "unknown log format '{}' (expected pretty, compact or json)",
                other
            )),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Level for events from this crate
    pub level: Level,
    /// Line format
    pub format: LogFormat,
    /// Include source file and line
    pub source_location: bool,
    /// Colored output (pretty format only)
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            source_location: false,
            ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Settings from the `[application]` section.
    pub fn from_config(config: &SpimConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Change the line format.
    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle source locations.
    pub fn with_source_location(mut self, enabled: bool) -> Self {
        self.source_location = enabled;
        self
    }

    /// Toggle ANSI colors.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Filter directives used when `RUST_LOG` is not set.
    pub fn directives(&self) -> String {
        let level = self.level.as_str().to_ascii_lowercase();
        format!("warn,{}={}", env!("CARGO_CRATE_NAME"), level)
    }
}

/// Install the global subscriber described by the configuration file.
pub fn init_from_config(config: &SpimConfig) -> Result<(), String> {
    init(LoggingConfig::from_config(config)?)
}

/// Install the global subscriber.
///
/// Returns `Ok(())` without changes when a subscriber is already installed.
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.directives()));

    let base = fmt::layer()
        .with_file(config.source_location)
        .with_line_number(config.source_location)
        .with_thread_names(true);
    let layer = match config.format {
        LogFormat::Pretty => base.pretty().with_ansi(config.ansi).boxed(),
        LogFormat::Compact => base.compact().with_ansi(false).boxed(),
        LogFormat::Json => base.json().with_ansi(false).boxed(),
    };

    match tracing_subscriber::registry()
        .with(layer.with_filter(filter))
        .try_init()
    {
        Ok(()) => Ok(()),
        // Tests and host applications may have installed their own subscriber
        Err(e) if e.to_string().contains("already been set") => Ok(()),
        Err(e) => Err(format!("Failed to initialize tracing: {}", e)),
    }
}

/// Parse a level name, case-insensitively.
pub fn parse_log_level(level: &str) -> Result<Level, String> {
    Level::from_str(level).map_err(|_| {
        format!(
            "unknown log level '{}' (expected trace, debug, info, warn or error)",
            level
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!(parse_log_level("Debug"), Ok(Level::DEBUG));
        assert_eq!(parse_log_level("warn"), Ok(Level::WARN));
        assert!(parse_log_level("verbose").is_err());
    }

    #[test]
    fn config_section_maps_to_settings() {
        let mut config = SpimConfig::default();
        config.application.log_level = "trace".into();
        config.application.log_format = "JSON".into();
        let settings = LoggingConfig::from_config(&config).unwrap();
        assert_eq!(settings.level, Level::TRACE);
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.directives(), "warn,spim_daq=trace");

        config.application.log_format = "xml".into();
        assert!(LoggingConfig::from_config(&config).is_err());
    }

    #[test]
    fn second_init_is_harmless() {
        let settings = LoggingConfig::default()
            .with_format(LogFormat::Compact)
            .with_ansi(false);
        assert!(init(settings.clone()).is_ok());
        assert!(init(settings).is_ok());
    }
}
