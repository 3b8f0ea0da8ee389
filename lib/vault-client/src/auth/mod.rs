mod alicloud;
mod aws;
mod azure;
mod gcp;
mod kerberos;
mod kubernetes;
mod token_file;
mod userpass;

pub use alicloud::AliCloudAuth;
pub use aws::AwsIamAuth;
pub use azure::AzureAuth;
pub use gcp::GcpAuth;
pub use kerberos::{KerberosAuth, KerberosSettings, SpnegoNegotiator};
pub use kubernetes::KubernetesAuth;
pub use token_file::TokenFileAuth;
pub use userpass::UserpassAuth;

use crate::VaultError;
use crate::models::AuthRequest;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use tokio::sync::watch;

const NAMESPACE_HEADER: &str = "X-Vault-Namespace";

/// Trait for authentication methods.
///
/// A method only builds the login request; submitting it is the job of a
/// [`SessionClient`](crate::SessionClient). Errors of class
/// [`ErrorClass::Permanent`](crate::ErrorClass::Permanent) abort the login loop,
/// everything else is retried.
#[async_trait]
pub trait AuthMethod: Send + Sync {
    /// Short method name used in logs and status output.
    fn name(&self) -> &'static str;

    /// Builds the next login request. May block on local I/O.
    async fn authenticate(&self) -> Result<AuthRequest, VaultError>;

    /// Bumped whenever an external change invalidates previously issued credentials.
    fn new_credential_notice(&self) -> Option<watch::Receiver<u64>> {
        None
    }

    /// Called after the server accepted a request built by this method.
    fn credential_success_ack(&self) {}

    /// Releases background resources.
    async fn shutdown(&self) {}
}

/// Per-method configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub mount_path: String,
    pub namespace: Option<String>,
    pub options: HashMap<String, String>,
    /// Parent span for events emitted by the method.
    pub span: tracing::Span,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mount_path: String::new(),
            namespace: None,
            options: HashMap::new(),
            span: tracing::Span::none(),
        }
    }
}

impl AuthConfig {
    pub fn new(mount_path: impl Into<String>) -> Self {
        Self {
            mount_path: mount_path.into(),
            ..Self::default()
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn with_span(mut self, span: tracing::Span) -> Self {
        self.span = span;
        self
    }

    /// Non-empty option value.
    pub fn option(&self, key: &str) -> Option<&str> {
        self.options
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    pub fn required(&self, key: &str) -> Result<&str, VaultError> {
        self.option(key)
            .ok_or_else(|| VaultError::InvalidConfig(format!("'{}' must be set", key)))
    }

    pub fn flag(&self, key: &str) -> Result<bool, VaultError> {
        match self.option(key) {
            None => Ok(false),
            Some(v) => parse_bool(v)
                .ok_or_else(|| VaultError::InvalidConfig(format!("'{}' must be a boolean", key))),
        }
    }

    /// Mount path without any `auth/` prefix or surrounding slashes, or `default`.
    pub fn mount_or(&self, default: &str) -> String {
        let mount = normalize_mount(&self.mount_path);
        if mount.is_empty() {
            default.to_string()
        } else {
            mount
        }
    }

    /// Request for `path` carrying the method-level namespace, if any.
    pub(crate) fn request(&self, path: impl Into<String>) -> AuthRequest {
        let request = AuthRequest::new(path);
        match self.namespace.as_deref().filter(|ns| !ns.is_empty()) {
            Some(ns) => request.with_header(NAMESPACE_HEADER, ns),
            None => request,
        }
    }
}

/// The enumerated options shared by the providers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MethodOptions {
    pub mount_path: String,
    pub credential_location: Option<String>,
    pub disable_fast_negotiation: bool,
    pub role: Option<String>,
    pub region: Option<String>,
    pub identity_request_url: Option<String>,
    pub identity_request_headers: Option<String>,
}

impl MethodOptions {
    pub fn from_config(config: &AuthConfig) -> Result<Self, VaultError> {
        Ok(Self {
            mount_path: normalize_mount(&config.mount_path),
            credential_location: config.option("credential_location").map(String::from),
            disable_fast_negotiation: config.flag("disable_fast_negotiation")?,
            role: config.option("role").map(String::from),
            region: config.option("region").map(String::from),
            identity_request_url: config.option("identity_request_url").map(String::from),
            identity_request_headers: config
                .option("identity_request_headers")
                .map(String::from),
        })
    }

    pub fn role(&self) -> Result<&str, VaultError> {
        self.role
            .as_deref()
            .ok_or_else(|| VaultError::InvalidConfig("'role' must be set".into()))
    }
}

/// Strips a leading `auth/` and surrounding slashes.
pub fn normalize_mount(mount: &str) -> String {
    let trimmed = mount.trim().trim_matches('/');
    trimmed
        .strip_prefix("auth/")
        .unwrap_or(trimmed)
        .trim_matches('/')
        .to_string()
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Reads a secret from disk, trimmed. Missing or empty files are transient.
pub(crate) fn read_secret_file(path: &Path) -> Result<String, VaultError> {
    let contents = std::fs::read_to_string(path).map_err(|e| {
        VaultError::CredentialUnavailable(format!("Failed to read {}: {}", path.display(), e))
    })?;
    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Err(VaultError::CredentialUnavailable(format!(
            "{} is empty",
            path.display()
        )));
    }
    Ok(trimmed.to_string())
}
