use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;
use vault_client::VaultError;

/// Rejected configuration. Surfaced synchronously by [`Agent::start`](crate::Agent::start).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid duration '{0}' (expected seconds or a value with ms/s/m/h suffix)")]
    InvalidDuration(String),

    #[error("Unknown auth method type '{0}'")]
    UnknownMethod(String),

    #[error("Unknown sink type '{0}'")]
    UnknownSink(String),

    #[error("Auth method '{method}': {source}")]
    Method {
        method: String,
        source: VaultError,
    },

    #[error("Sink '{sink}': {message}")]
    Sink { sink: String, message: String },

    #[error("Invalid backoff: {0}")]
    Backoff(String),

    #[error("{0}")]
    Invalid(String),
}

/// Failure to deliver a credential to one sink. Retried by the sink server.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("Sink IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to wrap credential: {0}")]
    Wrap(#[source] VaultError),

    #[error("Failed to encrypt credential: {0}")]
    Encrypt(String),

    #[error("Sink rejected credential: {0}")]
    Rejected(String),
}

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Authentication failed permanently: {0}")]
    PermanentAuth(String),

    #[error("Credentials did not reach every sink within {0:?}")]
    ExitAfterAuthTimeout(Duration),

    #[error("Agent already stopped")]
    AlreadyStopped,

    #[error("Agent has not been started")]
    NotStarted,

    #[error("Shutdown did not complete within the grace period")]
    ShutdownTimeout,

    #[error("Background task failed: {0}")]
    Internal(String),
}

impl AgentError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> i32 {
        match self {
            AgentError::Config(_) => 2,
            AgentError::PermanentAuth(_) | AgentError::ExitAfterAuthTimeout(_) => 1,
            AgentError::AlreadyStopped
            | AgentError::NotStarted
            | AgentError::ShutdownTimeout
            | AgentError::Internal(_) => 1,
        }
    }
}
