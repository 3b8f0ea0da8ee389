use super::{AuthConfig, AuthMethod, MethodOptions};
use crate::VaultError;
use crate::models::AuthRequest;
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::path::PathBuf;
use std::sync::Arc;

const DEFAULT_MOUNT: &str = "kerberos";

/// Settings handed to the negotiator for each attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KerberosSettings {
    pub username: String,
    /// Service principal name of the server, e.g. `HTTP/vault.example.com`.
    pub service: String,
    pub realm: String,
    pub keytab_path: PathBuf,
    pub krb5conf_path: PathBuf,
    pub disable_fast_negotiation: bool,
}

/// Produces a SPNEGO init token. GSSAPI bindings live outside this crate.
#[async_trait]
pub trait SpnegoNegotiator: Send + Sync {
    async fn negotiate(&self, settings: &KerberosSettings) -> Result<Vec<u8>, VaultError>;
}

pub struct KerberosAuth {
    config: AuthConfig,
    mount: String,
    settings: KerberosSettings,
    negotiator: Arc<dyn SpnegoNegotiator>,
}

impl KerberosAuth {
    pub fn new(config: AuthConfig, negotiator: Arc<dyn SpnegoNegotiator>) -> Result<Self, VaultError> {
        let options = MethodOptions::from_config(&config)?;
        let settings = KerberosSettings {
            username: config.required("username")?.to_string(),
            service: config.required("service")?.to_string(),
            realm: config.required("realm")?.to_string(),
            keytab_path: PathBuf::from(config.required("keytab_path")?),
            krb5conf_path: PathBuf::from(config.required("krb5conf_path")?),
            disable_fast_negotiation: options.disable_fast_negotiation,
        };

        Ok(Self {
            mount: config.mount_or(DEFAULT_MOUNT),
            config,
            settings,
            negotiator,
        })
    }

    pub fn settings(&self) -> &KerberosSettings {
        &self.settings
    }
}

#[async_trait]
impl AuthMethod for KerberosAuth {
    fn name(&self) -> &'static str {
        "kerberos"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        // SPNEGO tokens are single use; a new one is negotiated per attempt.
        let token = self.negotiator.negotiate(&self.settings).await?;
        if token.is_empty() {
            return Err(VaultError::CredentialUnavailable(
                "SPNEGO negotiation produced an empty token".into(),
            ));
        }

        Ok(self
            .config
            .request(format!("auth/{}/login", self.mount))
            .with_header("Authorization", format!("Negotiate {}", STANDARD.encode(token))))
    }
}
