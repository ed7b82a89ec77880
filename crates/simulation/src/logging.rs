//! Global `tracing` subscriber setup.
//!
//! `RUST_LOG` takes precedence over the configured level when set, so a
//! single module can be turned up without touching the config file:
//!
//! ```text
//! RUST_LOG=info,fba_scp::ballot=trace fba-sim run --nodes 4
//! ```
//!
//! Events go to stderr so command output on stdout stays machine-readable.

use fba_common::config::{LogFormat, LogLevel, LoggingConfig};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Logging options for the process.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Minimum level to output.
    pub level: LogLevel,
    /// Text or JSON lines.
    pub format: LogFormat,
    /// ANSI colors (text format only).
    pub ansi_colors: bool,
    /// Include file and line of each event.
    pub with_source_location: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Text,
            ansi_colors: true,
            with_source_location: false,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }
}

impl From<&LoggingConfig> for LogConfig {
    fn from(config: &LoggingConfig) -> Self {
        Self::default()
            .with_level(config.level)
            .with_format(config.format)
    }
}

fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str()))
}

/// Install the global subscriber.
///
/// Fails if a global subscriber is already installed.
pub fn init(config: &LogConfig) -> anyhow::Result<()> {
    let filter = env_filter(config.level);

    match config.format {
        LogFormat::Text => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(config.ansi_colors)
                .with_target(true)
                .with_file(config.with_source_location)
                .with_line_number(config.with_source_location);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(true)
                .with_file(config.with_source_location)
                .with_line_number(config.with_source_location);

            tracing_subscriber::registry()
                .with(filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}
