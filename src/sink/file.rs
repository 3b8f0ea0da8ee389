use super::Sink;
use crate::error::{ConfigError, SinkError};
use async_trait::async_trait;
use serde::Deserialize;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use vault_client::Credential;

pub(crate) const DEFAULT_MODE: u32 = 0o600;
const TEMP_PREFIX: &str = ".vault-agent-sink";

/// How a [`FileSink`] replaces the previous token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Write a temp file in the same directory, then rename it over the target.
    #[default]
    AtomicRename,
    /// Truncate and rewrite the target in place.
    Overwrite,
}

impl FromStr for WriteMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "atomic_rename" => Ok(WriteMode::AtomicRename),
            "overwrite" => Ok(WriteMode::Overwrite),
            other => Err(ConfigError::Invalid(format!("Unknown write mode '{other}'"))),
        }
    }
}

/// Writes the raw token bytes to a file, without a trailing newline.
///
/// The write is synchronous: once `write` has been polled it runs to
/// completion, so an aborted worker never leaves a write behind.
#[derive(Debug, Clone)]
pub struct FileSink {
    name: String,
    path: PathBuf,
    mode: u32,
    write_mode: WriteMode,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            name: format!("file:{}", path.display()),
            path,
            mode: DEFAULT_MODE,
            write_mode: WriteMode::default(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_mode(mut self, mode: u32) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The parent directory must exist before the agent starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let dir = self.dir();
        if dir.is_dir() {
            Ok(())
        } else {
            Err(ConfigError::Sink {
                sink: self.name.clone(),
                message: format!("directory {} does not exist", dir.display()),
            })
        }
    }

    fn dir(&self) -> &Path {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        }
    }

    fn write_atomic(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(self.dir())?;
        set_mode(tmp.path(), self.mode)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }

    fn write_in_place(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(self.mode);
        }
        let mut file = options.open(&self.path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        set_mode(&self.path, self.mode)
    }
}

#[cfg(unix)]
fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[async_trait]
impl Sink for FileSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, credential: &Credential) -> Result<(), SinkError> {
        let bytes = credential.token.as_bytes();
        match self.write_mode {
            WriteMode::AtomicRename => self.write_atomic(bytes)?,
            WriteMode::Overwrite => self.write_in_place(bytes)?,
        }
        tracing::debug!(sink = %self.name, path = %self.path.display(), "Token written");
        Ok(())
    }
}
