use std::env;
use std::io;
use std::str::FromStr;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry};

use crate::error::SetupError;
use crate::formatting_layer::JsonLogLayer;
use crate::storage::StorageLayer;

const DEFAULT_LEVEL: &str = "info";

/// Output format of the process logger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human readable lines on stderr.
    #[default]
    Text,
    /// Newline-delimited JSON on stdout.
    Json,
}

impl FromStr for LogFormat {
    type Err = SetupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "standard" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(SetupError::InvalidFormat(other.to_string())),
        }
    }
}

/// Builder for configuring structured logging
pub struct StructLogBuilder {
    application: String,
    version: String,
    hostname: Option<String>,
    format: LogFormat,
    level: String,
}

impl StructLogBuilder {
    /// Create a new builder with required application name and version
    pub fn new(application: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            application: application.into(),
            version: version.into(),
            hostname: None,
            format: LogFormat::default(),
            level: DEFAULT_LEVEL.to_string(),
        }
    }

    /// Set a custom hostname (defaults to system hostname)
    pub fn hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    pub fn format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn json_enabled(mut self, enabled: bool) -> Self {
        self.format = if enabled { LogFormat::Json } else { LogFormat::Text };
        self
    }

    /// `JSON_LOG=true|false` overrides the configured format when present.
    pub fn json_from_env(self) -> Self {
        match env::var("JSON_LOG").ok().and_then(|s| s.parse::<bool>().ok()) {
            Some(enabled) => self.json_enabled(enabled),
            None => self,
        }
    }

    /// Default filter directive, e.g. `debug` or `info,vault_agent=trace`.
    /// `RUST_LOG` takes precedence when set.
    pub fn level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn filter(&self) -> Result<EnvFilter, SetupError> {
        match env::var(EnvFilter::DEFAULT_ENV) {
            Ok(directives) if !directives.trim().is_empty() => EnvFilter::try_new(&directives)
                .map_err(|_| SetupError::InvalidLevel(directives)),
            _ => EnvFilter::try_new(&self.level)
                .map_err(|_| SetupError::InvalidLevel(self.level.clone())),
        }
    }

    /// Initialize the logger with the configured settings.
    ///
    /// Keep the returned guard alive for the lifetime of the process; dropping
    /// it flushes and stops the background JSON writer.
    pub fn init(self) -> Result<Option<WorkerGuard>, SetupError> {
        let filter = self.filter()?;

        LogTracer::init().map_err(|_| SetupError::LogTracerAlreadyInitialized)?;

        match self.format {
            LogFormat::Text => {
                let subscriber = Registry::default().with(filter).with(
                    tracing_subscriber::fmt::layer()
                        .with_writer(io::stderr)
                        .with_target(true),
                );
                tracing::subscriber::set_global_default(subscriber)
                    .map_err(|_| SetupError::SubscriberAlreadySet)?;
                Ok(None)
            }
            LogFormat::Json => {
                let (non_blocking, guard) = tracing_appender::non_blocking(io::stdout());

                let layer = match self.hostname {
                    Some(hostname) => JsonLogLayer::with_hostname(
                        self.application,
                        self.version,
                        hostname,
                        non_blocking,
                    ),
                    None => JsonLogLayer::new(self.application, self.version, non_blocking),
                };

                let subscriber = Registry::default()
                    .with(filter)
                    .with(StorageLayer)
                    .with(layer);

                tracing::subscriber::set_global_default(subscriber)
                    .map_err(|_| SetupError::SubscriberAlreadySet)?;

                Ok(Some(guard))
            }
        }
    }
}
