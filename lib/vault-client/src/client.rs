use crate::error::VaultError;
use crate::models::{AuthRequest, Credential, LookupData, SecretResponse};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_USER_AGENT: &str = concat!("vault-agent/", env!("CARGO_PKG_VERSION"));

const TOKEN_HEADER: &str = "X-Vault-Token";
const NAMESPACE_HEADER: &str = "X-Vault-Namespace";
const REQUEST_HEADER: &str = "X-Vault-Request";
const WRAP_TTL_HEADER: &str = "X-Vault-Wrap-TTL";

/// Session operations against the secrets server.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Submits a login request and parses the resulting credential. Not idempotent.
    async fn authenticate(&self, request: &AuthRequest) -> Result<Credential, VaultError>;

    /// Extends the lease of `credential`. The returned credential carries a fresh `issued_at`.
    async fn renew(
        &self,
        credential: &Credential,
        increment: Duration,
    ) -> Result<Credential, VaultError>;

    /// Best-effort revocation; callers log failures and move on.
    async fn revoke(&self, credential: &Credential) -> Result<(), VaultError>;

    /// Response-wraps `credential`, returning a credential whose token is the wrapping token.
    async fn wrap(&self, credential: &Credential, ttl: Duration) -> Result<Credential, VaultError>;
}

pub struct HttpSessionClientBuilder {
    address: Option<String>,
    namespace: Option<String>,
    request_timeout: Duration,
    user_agent: Option<String>,
}

impl Default for HttpSessionClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpSessionClientBuilder {
    pub fn new() -> Self {
        Self {
            address: None,
            namespace: None,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            user_agent: None,
        }
    }

    pub fn address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    pub fn build(self) -> Result<HttpSessionClient, VaultError> {
        let base_url = self
            .address
            .or_else(|| std::env::var("VAULT_ADDR").ok())
            .filter(|a| !a.trim().is_empty())
            .ok_or_else(|| VaultError::InvalidConfig("Vault address not set (VAULT_ADDR)".into()))?;

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(VaultError::InvalidConfig(format!(
                "Vault address must be an http(s) URL: {}",
                base_url
            )));
        }

        let namespace = self
            .namespace
            .or_else(|| std::env::var("VAULT_NAMESPACE").ok())
            .filter(|ns| !ns.is_empty());

        // Proxy settings (HTTP_PROXY, HTTPS_PROXY, NO_PROXY) are picked up by reqwest.
        let http = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .user_agent(
                self.user_agent
                    .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            )
            .build()
            .map_err(|e| VaultError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpSessionClient {
            base_url: base_url.trim_end_matches('/').to_string(),
            namespace,
            http,
        })
    }
}

/// [`SessionClient`] speaking the Vault HTTP API.
#[derive(Debug, Clone)]
pub struct HttpSessionClient {
    base_url: String,
    namespace: Option<String>,
    http: reqwest::Client,
}

impl HttpSessionClient {
    pub fn builder() -> HttpSessionClientBuilder {
        HttpSessionClientBuilder::new()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn namespace(&self) -> Option<&str> {
        self.namespace.as_deref()
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POSTs `body` to `path`. Returns `None` for empty (204) responses.
    async fn post(
        &self,
        path: &str,
        token: Option<&str>,
        headers: &HashMap<String, String>,
        body: &serde_json::Value,
    ) -> Result<Option<SecretResponse>, VaultError> {
        let mut request = self
            .http
            .post(self.url(path))
            .header(REQUEST_HEADER, "true")
            .json(body);

        // A method-level namespace overrides the client default.
        if let Some(ref ns) = self.namespace {
            if !headers.contains_key(NAMESPACE_HEADER) {
                request = request.header(NAMESPACE_HEADER, ns);
            }
        }
        if let Some(token) = token {
            request = request.header(TOKEN_HEADER, token);
        }
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| VaultError::Network(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(VaultError::from_status(status.as_u16(), body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| VaultError::Network(e.to_string()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| VaultError::Malformed(format!("Invalid response from {}: {}", path, e)))
    }
}

#[async_trait]
impl SessionClient for HttpSessionClient {
    async fn authenticate(&self, request: &AuthRequest) -> Result<Credential, VaultError> {
        let token = request.headers.get(TOKEN_HEADER).map(String::as_str);
        let headers: HashMap<String, String> = request
            .headers
            .iter()
            .filter(|(name, _)| name.as_str() != TOKEN_HEADER)
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        let body = serde_json::Value::Object(request.data.clone());
        let response = self
            .post(&request.path, token, &headers, &body)
            .await?
            .ok_or_else(|| VaultError::Malformed(format!("Empty response from {}", request.path)))?;

        if let Some(auth) = response.auth {
            return Ok(auth.into_credential(request.kind));
        }

        // auth/token/lookup-self answers with token data instead of an auth block.
        if let Some(data) = response.data {
            let lookup: LookupData = serde_json::from_value(data).map_err(|e| {
                VaultError::Malformed(format!("No auth block in response from {}: {}", request.path, e))
            })?;
            return Ok(lookup.into_credential(request.kind));
        }

        Err(VaultError::Malformed(format!(
            "No auth block in response from {}",
            request.path
        )))
    }

    async fn renew(
        &self,
        credential: &Credential,
        increment: Duration,
    ) -> Result<Credential, VaultError> {
        let body = serde_json::json!({ "increment": increment.as_secs() });
        let response = self
            .post(
                "auth/token/renew-self",
                Some(credential.token.expose()),
                &HashMap::new(),
                &body,
            )
            .await?
            .ok_or_else(|| VaultError::Malformed("Empty renewal response".into()))?;

        let auth = response
            .auth
            .ok_or_else(|| VaultError::Malformed("No auth block in renewal response".into()))?;

        let mut renewed = auth.into_credential(credential.kind);
        if renewed.accessor.is_empty() {
            renewed.accessor = credential.accessor.clone();
        }
        if renewed.metadata.is_empty() {
            renewed.metadata = credential.metadata.clone();
        }
        Ok(renewed)
    }

    async fn revoke(&self, credential: &Credential) -> Result<(), VaultError> {
        self.post(
            "auth/token/revoke-self",
            Some(credential.token.expose()),
            &HashMap::new(),
            &serde_json::json!({}),
        )
        .await?;
        Ok(())
    }

    async fn wrap(&self, credential: &Credential, ttl: Duration) -> Result<Credential, VaultError> {
        let mut headers = HashMap::new();
        headers.insert(WRAP_TTL_HEADER.to_string(), format!("{}s", ttl.as_secs().max(1)));
        let body = serde_json::json!({ "token": credential.token.expose() });

        let response = self
            .post(
                "sys/wrapping/wrap",
                Some(credential.token.expose()),
                &headers,
                &body,
            )
            .await?
            .ok_or_else(|| VaultError::Malformed("Empty wrapping response".into()))?;

        let wrap = response
            .wrap_info
            .ok_or_else(|| VaultError::Malformed("No wrap_info in wrapping response".into()))?;

        Ok(
            Credential::new(wrap.token, Duration::from_secs(wrap.ttl), false)
                .with_accessor(wrap.accessor)
                .with_kind(credential.kind),
        )
    }
}
