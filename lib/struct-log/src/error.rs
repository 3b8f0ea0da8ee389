use std::fmt;

/// Errors that can occur during logger setup
#[derive(Debug)]
pub enum SetupError {
    /// LogTracer already initialized (log -> tracing bridge)
    LogTracerAlreadyInitialized,
    /// Global subscriber already set
    SubscriberAlreadySet,
    /// Level directive that `EnvFilter` cannot parse
    InvalidLevel(String),
    /// Unknown output format name
    InvalidFormat(String),
}

impl fmt::Display for SetupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LogTracerAlreadyInitialized => {
                write!(f, "log tracer already initialized")
            }
            Self::SubscriberAlreadySet => {
                write!(f, "global tracing subscriber already set")
            }
            Self::InvalidLevel(level) => write!(f, "invalid log level '{}'", level),
            Self::InvalidFormat(format) => {
                write!(f, "invalid log format '{}' (expected text or json)", format)
            }
        }
    }
}

impl std::error::Error for SetupError {}
