use super::{AuthConfig, AuthMethod, MethodOptions};
use crate::VaultError;
use crate::models::AuthRequest;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

const DEFAULT_MOUNT: &str = "azure";
const DEFAULT_METADATA_URL: &str = "http://169.254.169.254";
const DEFAULT_RESOURCE: &str = "https://management.azure.com/";
const INSTANCE_API_VERSION: &str = "2017-08-01";
const IDENTITY_API_VERSION: &str = "2018-02-01";
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Deserialize)]
struct InstanceMetadata {
    compute: ComputeMetadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ComputeMetadata {
    name: String,
    resource_group_name: String,
    subscription_id: String,
    #[serde(default)]
    vm_scale_set_name: String,
}

#[derive(Debug, Deserialize)]
struct MsiToken {
    access_token: String,
}

/// Azure managed identity authentication.
pub struct AzureAuth {
    config: AuthConfig,
    mount: String,
    role: String,
    resource: String,
    metadata_url: String,
    http: reqwest::Client,
}

impl AzureAuth {
    pub fn new(config: AuthConfig) -> Result<Self, VaultError> {
        let options = MethodOptions::from_config(&config)?;
        let http = reqwest::Client::builder()
            .timeout(METADATA_TIMEOUT)
            .build()
            .map_err(|e| VaultError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self {
            mount: config.mount_or(DEFAULT_MOUNT),
            role: options.role()?.to_string(),
            resource: config.option("resource").unwrap_or(DEFAULT_RESOURCE).to_string(),
            metadata_url: config
                .option("metadata_url")
                .unwrap_or(DEFAULT_METADATA_URL)
                .trim_end_matches('/')
                .to_string(),
            config,
            http,
        })
    }

    async fn get_metadata<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<T, VaultError> {
        let response = self
            .http
            .get(format!("{}{}", self.metadata_url, path))
            .header("Metadata", "true")
            .query(query)
            .send()
            .await
            .map_err(|e| VaultError::CredentialUnavailable(format!("Azure metadata: {}", e)))?;

        if !response.status().is_success() {
            return Err(VaultError::CredentialUnavailable(format!(
                "Azure metadata {} returned {}",
                path,
                response.status()
            )));
        }

        response
            .json()
            .await
            .map_err(|e| VaultError::CredentialUnavailable(format!("Azure metadata {}: {}", path, e)))
    }
}

#[async_trait]
impl AuthMethod for AzureAuth {
    fn name(&self) -> &'static str {
        "azure"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        let instance: InstanceMetadata = self
            .get_metadata(
                "/metadata/instance",
                &[("api-version", INSTANCE_API_VERSION), ("format", "json")],
            )
            .await?;
        let token: MsiToken = self
            .get_metadata(
                "/metadata/identity/oauth2/token",
                &[("api-version", IDENTITY_API_VERSION), ("resource", self.resource.as_str())],
            )
            .await?;

        let compute = instance.compute;
        let mut request = self
            .config
            .request(format!("auth/{}/login", self.mount))
            .with_field("role", self.role.clone())
            .with_field("jwt", token.access_token)
            .with_field("subscription_id", compute.subscription_id)
            .with_field("resource_group_name", compute.resource_group_name);

        request = if compute.vm_scale_set_name.is_empty() {
            request.with_field("vm_name", compute.name)
        } else {
            request.with_field("vmss_name", compute.vm_scale_set_name)
        };
        Ok(request)
    }
}
