//! Command-line surface of the `vault-agent` binary.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use struct_log::LogFormat;

/// Authenticates to Vault and keeps a fresh token in the configured sinks.
#[derive(Debug, Parser)]
#[command(name = "vault-agent")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to the JSON configuration file.
    #[arg(long, env = "VAULT_AGENT_CONFIG")]
    pub config: PathBuf,

    /// Log level, or a full filter directive. `RUST_LOG` wins when set.
    #[arg(long, default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format. `JSON_LOG=true` also selects JSON.
    #[arg(long, default_value = "text")]
    pub log_format: LogOutput,

    /// Exit once the first token has reached every sink.
    #[arg(long)]
    pub exit_after_auth: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogOutput {
    Text,
    Json,
}

impl From<LogOutput> for LogFormat {
    fn from(output: LogOutput) -> Self {
        match output {
            LogOutput::Text => LogFormat::Text,
            LogOutput::Json => LogFormat::Json,
        }
    }
}
