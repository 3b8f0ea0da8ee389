use super::{AuthConfig, AuthMethod, MethodOptions};
use crate::VaultError;
use crate::models::AuthRequest;
use async_trait::async_trait;
use std::time::Duration;

const DEFAULT_MOUNT: &str = "gcp";
const DEFAULT_METADATA_URL: &str = "http://metadata.google.internal";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// GCE instance identity authentication.
pub struct GcpAuth {
    config: AuthConfig,
    mount: String,
    role: String,
    service_account: String,
    metadata_url: String,
    http: reqwest::Client,
}

impl GcpAuth {
    pub fn new(config: AuthConfig) -> Result<Self, VaultError> {
        let options = MethodOptions::from_config(&config)?;
        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| VaultError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            mount: config.mount_or(DEFAULT_MOUNT),
            role: options.role()?.to_string(),
            service_account: config.option("service_account").unwrap_or("default").to_string(),
            metadata_url: config
                .option("metadata_url")
                .unwrap_or(DEFAULT_METADATA_URL)
                .trim_end_matches('/')
                .to_string(),
            config,
            http,
        })
    }

    async fn identity_token(&self) -> Result<String, VaultError> {
        let url = format!(
            "{}/computeMetadata/v1/instance/service-accounts/{}/identity",
            self.metadata_url, self.service_account
        );
        let audience = format!("http://vault/{}", self.role);

        let response = self
            .http
            .get(&url)
            .header("Metadata-Flavor", "Google")
            .query(&[("audience", audience.as_str()), ("format", "full")])
            .send()
            .await
            .map_err(|e| VaultError::CredentialUnavailable(format!("GCE metadata: {}", e)))?;

        if !response.status().is_success() {
            return Err(VaultError::CredentialUnavailable(format!(
                "GCE metadata returned {}",
                response.status()
            )));
        }

        let jwt = response
            .text()
            .await
            .map_err(|e| VaultError::CredentialUnavailable(format!("GCE metadata: {}", e)))?;
        let jwt = jwt.trim();
        if jwt.is_empty() {
            return Err(VaultError::CredentialUnavailable(
                "GCE metadata returned an empty identity token".into(),
            ));
        }
        Ok(jwt.to_string())
    }
}

#[async_trait]
impl AuthMethod for GcpAuth {
    fn name(&self) -> &'static str {
        "gcp"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        let jwt = self.identity_token().await?;

        Ok(self
            .config
            .request(format!("auth/{}/login", self.mount))
            .with_field("role", self.role.clone())
            .with_field("jwt", jwt))
    }
}
