//! Logging setup for the `mcache` binary and embedding applications.

use serde::Deserialize;
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// `[logging]` section of the configuration file
#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LogSettings {
    /// Parse log level from string
    pub fn parse_level(s: &str) -> Option<Level> {
        match s.to_lowercase().as_str() {
            "trace" => Some(Level::TRACE),
            "debug" => Some(Level::DEBUG),
            "info" => Some(Level::INFO),
            "warn" | "warning" => Some(Level::WARN),
            "error" => Some(Level::ERROR),
            _ => None,
        }
    }

    /// Level to log at, falling back to info for unknown names
    pub fn level_filter(&self) -> LevelFilter {
        match Self::parse_level(&self.level) {
            Some(level) => LevelFilter::from_level(level),
            None => {
                eprintln!("Warning: Invalid log level '{}', using 'info'", self.level);
                LevelFilter::INFO
            }
        }
    }
}

/// Install a global fmt subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(settings: &LogSettings) {
    let filter = EnvFilter::builder()
        .with_default_directive(settings.level_filter().into())
        .from_env_lossy();
    let _ = tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
