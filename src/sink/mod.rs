//! Credential sinks and the fan-out server that feeds them.

mod encrypt;
mod file;
mod memory;
mod server;

pub use encrypt::Encryptor;
pub use file::{FileSink, WriteMode};
pub use memory::MemorySink;
pub use server::{SinkServer, SinkServerConfig};

use crate::error::{ConfigError, SinkError};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use vault_client::{Credential, SessionClient, Token};

/// Consumer of the current credential.
///
/// `write` must be all-or-nothing from a reader's point of view.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;

    async fn write(&self, credential: &Credential) -> Result<(), SinkError>;
}

/// Sink destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkKind {
    File { path: PathBuf },
    Memory,
}

/// Key material for the encryption directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptConfig {
    pub key_path: PathBuf,
    pub aad: Option<String>,
}

/// Per-sink options as read from the agent configuration.
#[derive(Debug, Clone)]
pub struct SinkConfig {
    pub name: String,
    pub kind: SinkKind,
    pub wrap_ttl: Option<Duration>,
    pub encrypt: Option<EncryptConfig>,
    pub write_mode: WriteMode,
    /// File permissions, unix only.
    pub mode: u32,
    pub span: tracing::Span,
}

impl SinkConfig {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            kind: SinkKind::File { path },
            wrap_ttl: None,
            encrypt: None,
            write_mode: WriteMode::default(),
            mode: file::DEFAULT_MODE,
            span: tracing::Span::none(),
        }
    }

    pub fn memory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: SinkKind::Memory,
            wrap_ttl: None,
            encrypt: None,
            write_mode: WriteMode::default(),
            mode: file::DEFAULT_MODE,
            span: tracing::Span::none(),
        }
    }

    /// Creates the sink and its directives. Memory sinks are also returned
    /// on their own so embedders can read from them.
    pub fn build(self) -> Result<(SinkSpec, Option<Arc<MemorySink>>), ConfigError> {
        let encryptor = match &self.encrypt {
            Some(encrypt) => Some(Encryptor::from_key_file(&encrypt.key_path, encrypt.aad.clone())?),
            None => None,
        };

        let (sink, memory): (Arc<dyn Sink>, _) = match self.kind {
            SinkKind::File { path } => {
                let sink = FileSink::new(path)
                    .with_name(self.name.clone())
                    .with_mode(self.mode)
                    .with_write_mode(self.write_mode);
                sink.validate()?;
                (Arc::new(sink), None)
            }
            SinkKind::Memory => {
                let sink = Arc::new(MemorySink::new(self.name.clone()));
                (sink.clone(), Some(sink))
            }
        };

        let spec = SinkSpec {
            sink,
            wrap_ttl: self.wrap_ttl,
            encryptor,
            span: self.span,
        };
        Ok((spec, memory))
    }
}

/// A sink plus the transformations applied before each write.
#[derive(Clone)]
pub struct SinkSpec {
    pub sink: Arc<dyn Sink>,
    pub wrap_ttl: Option<Duration>,
    pub encryptor: Option<Encryptor>,
    pub span: tracing::Span,
}

impl SinkSpec {
    pub fn new(sink: Arc<dyn Sink>) -> Self {
        Self {
            sink,
            wrap_ttl: None,
            encryptor: None,
            span: tracing::Span::none(),
        }
    }

    pub fn with_wrap_ttl(mut self, ttl: Duration) -> Self {
        self.wrap_ttl = Some(ttl);
        self
    }

    pub fn with_encryptor(mut self, encryptor: Encryptor) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    pub fn name(&self) -> &str {
        self.sink.name()
    }

    /// Applies the wrap and encrypt directives, in that order.
    pub(crate) async fn prepare(
        &self,
        credential: &Credential,
        client: &dyn SessionClient,
    ) -> Result<Credential, SinkError> {
        let mut prepared = match self.wrap_ttl {
            Some(ttl) => client
                .wrap(credential, ttl)
                .await
                .map_err(SinkError::Wrap)?
                .issued_at(credential.issued_at),
            None => credential.clone(),
        };
        if let Some(encryptor) = &self.encryptor {
            prepared.token = Token::new(encryptor.encrypt(prepared.token.as_bytes())?);
        }
        Ok(prepared)
    }
}

impl std::fmt::Debug for SinkSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SinkSpec")
            .field("name", &self.sink.name())
            .field("wrap_ttl", &self.wrap_ttl)
            .field("encrypted", &self.encryptor.is_some())
            .finish()
    }
}
