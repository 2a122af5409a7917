//! Logging configuration and setup.

use clap::ValueEnum;
use tracing_subscriber::{
    EnvFilter, Layer, Registry, fmt, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Errors raised while installing the global subscriber.
#[derive(Debug, thiserror::Error)]
pub(crate) enum LogError {
    /// A level or directive did not parse.
    #[error("invalid log filter: {0}")]
    Filter(String),
    /// A global subscriber was already installed.
    #[error("failed to initialize logging: {0}")]
    Init(String),
}

/// Log format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    /// Human-readable multi-line format with colors.
    Pretty,
    /// Compact single-line format (default).
    #[default]
    Compact,
    /// JSON format for structured logging.
    Json,
}

/// Logging configuration. Output always goes to stderr so stdout stays
/// clean for command results.
#[derive(Debug, Clone)]
pub(crate) struct LogConfig {
    /// Log level filter (e.g., "info", "debug", "tempstash=trace").
    pub(crate) level: String,
    /// Log format.
    pub(crate) format: LogFormat,
    /// Whether to use ANSI colors.
    pub(crate) ansi: bool,
    /// Directive overrides appended to `level`.
    pub(crate) directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            format: LogFormat::default(),
            ansi: true,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Create a new log config with the specified level.
    #[must_use]
    pub(crate) fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    /// Set the log format.
    #[must_use]
    pub(crate) fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    /// Add a directive override.
    #[must_use]
    pub(crate) fn with_directive(mut self, directive: impl Into<String>) -> Self {
        self.directives.push(directive.into());
        self
    }

    /// Disable ANSI colors.
    #[must_use]
    pub(crate) fn without_ansi(mut self) -> Self {
        self.ansi = false;
        self
    }

    fn build_filter(&self) -> Result<EnvFilter, LogError> {
        let mut filter =
            EnvFilter::try_new(&self.level).map_err(|e| LogError::Filter(e.to_string()))?;

        for directive in &self.directives {
            filter = filter.add_directive(
                directive
                    .parse()
                    .map_err(|e: tracing_subscriber::filter::ParseError| {
                        LogError::Filter(e.to_string())
                    })?,
            );
        }

        Ok(filter)
    }

    fn build_layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        match self.format {
            LogFormat::Json => fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .boxed(),
            LogFormat::Pretty => fmt::layer()
                .pretty()
                .with_writer(std::io::stderr)
                .with_ansi(self.ansi)
                .boxed(),
            LogFormat::Compact => fmt::layer()
                .compact()
                .with_writer(std::io::stderr)
                .with_ansi(self.ansi)
                .boxed(),
        }
    }
}

/// Install the global subscriber described by `config`.
///
/// # Errors
///
/// Returns an error if a filter directive is invalid or a subscriber is
/// already installed.
pub(crate) fn setup_logging(config: &LogConfig) -> Result<(), LogError> {
    let filter = config.build_filter()?;
    tracing_subscriber::registry()
        .with(config.build_layer().with_filter(filter))
        .try_init()
        .map_err(|e| LogError::Init(e.to_string()))
}
