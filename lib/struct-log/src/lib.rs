//! Process-wide `tracing` setup: human-readable or newline-delimited JSON output.

mod builder;
mod error;
mod formatting_layer;
mod storage;

pub use builder::{LogFormat, StructLogBuilder};
pub use error::SetupError;
pub use formatting_layer::JsonLogLayer;
pub use storage::{FieldStorage, StorageLayer, REDACTED_FIELDS};
pub use tracing_appender::non_blocking::WorkerGuard;
