use thiserror::Error;

#[derive(Debug, Error)]
pub enum VaultError {
    /// Auth method or client misconfiguration. Retrying cannot help.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Local credential material (token file, metadata service, ...) is not available right now.
    #[error("Credential unavailable: {0}")]
    CredentialUnavailable(String),

    #[error("Vault request error: {0}")]
    Network(String),

    #[error("Vault server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("Vault rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Malformed response: {0}")]
    Malformed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Wire-level classification of a session client failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    NetworkTransient,
    ServerTransient,
    AuthRejected,
    Malformed,
}

/// How a caller should react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Retry with backoff.
    Transient,
    /// The server refused the credentials.
    AuthRejected,
    /// Give up.
    Permanent,
}

impl VaultError {
    pub fn failure_kind(&self) -> Option<FailureKind> {
        match self {
            VaultError::Network(_) => Some(FailureKind::NetworkTransient),
            VaultError::Server { .. } => Some(FailureKind::ServerTransient),
            VaultError::Rejected { .. } => Some(FailureKind::AuthRejected),
            VaultError::Malformed(_) | VaultError::Json(_) => Some(FailureKind::Malformed),
            VaultError::InvalidConfig(_)
            | VaultError::CredentialUnavailable(_)
            | VaultError::Io(_) => None,
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            VaultError::InvalidConfig(_) => ErrorClass::Permanent,
            VaultError::Rejected { .. } => ErrorClass::AuthRejected,
            VaultError::CredentialUnavailable(_)
            | VaultError::Network(_)
            | VaultError::Server { .. }
            | VaultError::Malformed(_)
            | VaultError::Io(_)
            | VaultError::Json(_) => ErrorClass::Transient,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub(crate) fn from_status(status: u16, message: String) -> Self {
        if status >= 500 {
            VaultError::Server { status, message }
        } else {
            VaultError::Rejected { status, message }
        }
    }
}

impl From<reqwest::Error> for VaultError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            VaultError::Malformed(err.to_string())
        } else {
            VaultError::Network(err.to_string())
        }
    }
}
