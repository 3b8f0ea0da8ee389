//! vault-agent - keeps a Vault token alive and delivers it to sinks
//!
//! The [`Agent`] logs in with the configured auth method, renews the token
//! inside a jittered window before it expires, re-logs in when renewal is no
//! longer possible, and hands every fresh token to its sinks (files or
//! in-memory slots). Embedders read [`Agent::status`] or subscribe to
//! [`Event`]s; the `vault-agent` binary wraps the same API.

mod agent;
mod backoff;
pub mod cli;
mod clock;
mod config;
mod error;
mod handler;
mod methods;
mod retry;
pub mod sink;
mod status;
mod supervisor;

#[cfg(test)]
mod testing;

pub use agent::Agent;
pub use backoff::{Backoff, BackoffConfig};
pub use clock::{Clock, Timer, TokioClock};
pub use config::{
    parse_duration, AgentConfig, AgentConfigBuilder, AutoAuthConfig, ConfigDuration,
    EncryptSection, FileConfig, MethodConfig, SinkSection, VaultConfig,
};
pub use error::{AgentError, ConfigError, SinkError};
pub use handler::{Event, HandlerConfig};
pub use methods::METHOD_TYPES;
pub use sink::{FileSink, MemorySink, Sink, SinkConfig, SinkSpec, WriteMode};
pub use status::{AgentStatus, HandlerState, SinkHealth};
