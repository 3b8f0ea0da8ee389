use super::{AuthConfig, AuthMethod, MethodOptions};
use crate::VaultError;
use crate::models::{AuthRequest, CredentialKind, Token};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::BTreeMap;

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_MOUNT: &str = "alicloud";

/// AliCloud RAM authentication via a signed STS `GetCallerIdentity` URL.
pub struct AliCloudAuth {
    config: AuthConfig,
    mount: String,
    role: String,
    region: String,
    identity_request_url: Option<String>,
    identity_request_headers: Option<String>,
}

impl AliCloudAuth {
    pub fn new(config: AuthConfig) -> Result<Self, VaultError> {
        let options = MethodOptions::from_config(&config)?;
        let role = options.role()?.to_string();

        let verbatim = options.identity_request_url.is_some();
        let region = match options.region {
            Some(region) => region,
            None if verbatim => String::new(),
            None => return Err(VaultError::InvalidConfig("'region' must be set".into())),
        };

        if let Some(ref headers) = options.identity_request_headers {
            serde_json::from_str::<BTreeMap<String, serde_json::Value>>(headers).map_err(|e| {
                VaultError::InvalidConfig(format!("'identity_request_headers' is not a JSON object: {}", e))
            })?;
        }

        Ok(Self {
            mount: config.mount_or(DEFAULT_MOUNT),
            config,
            role,
            region,
            identity_request_url: options.identity_request_url,
            identity_request_headers: options.identity_request_headers,
        })
    }

    fn credentials(&self) -> Result<(String, Token, Option<Token>), VaultError> {
        let lookup = |option: &str, env: &str| {
            self.config
                .option(option)
                .map(String::from)
                .or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()))
        };

        match (
            lookup("access_key", "ALICLOUD_ACCESS_KEY"),
            lookup("secret_key", "ALICLOUD_SECRET_KEY"),
        ) {
            (Some(key), Some(secret)) => Ok((
                key,
                Token::new(secret),
                lookup("security_token", "ALICLOUD_SECURITY_TOKEN").map(Token::new),
            )),
            _ => Err(VaultError::CredentialUnavailable(
                "AliCloud credentials not found (ALICLOUD_ACCESS_KEY / ALICLOUD_SECRET_KEY)".into(),
            )),
        }
    }

    fn signed_url(&self, now: DateTime<Utc>, nonce: &str) -> Result<String, VaultError> {
        let (access_key, secret, security_token) = self.credentials()?;

        let mut params = BTreeMap::new();
        params.insert("AccessKeyId", access_key);
        params.insert("Action", "GetCallerIdentity".to_string());
        params.insert("Format", "JSON".to_string());
        params.insert("RegionId", self.region.clone());
        params.insert("SignatureMethod", "HMAC-SHA1".to_string());
        params.insert("SignatureNonce", nonce.to_string());
        params.insert("SignatureVersion", "1.0".to_string());
        params.insert("Timestamp", now.format("%Y-%m-%dT%H:%M:%SZ").to_string());
        params.insert("Version", "2015-04-01".to_string());
        if let Some(token) = security_token {
            params.insert("SecurityToken", token.expose().to_string());
        }

        let query = canonical_query(&params);
        let string_to_sign = format!("GET&{}&{}", percent_encode("/"), percent_encode(&query));

        let mut mac = HmacSha1::new_from_slice(format!("{}&", secret.expose()).as_bytes())
            .map_err(|_| VaultError::InvalidConfig("failed to initialize hmac".into()))?;
        mac.update(string_to_sign.as_bytes());
        let signature = STANDARD.encode(mac.finalize().into_bytes());

        Ok(format!(
            "https://sts.{}.aliyuncs.com/?{}&Signature={}",
            self.region,
            query,
            percent_encode(&signature)
        ))
    }
}

fn canonical_query(params: &BTreeMap<&str, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// RFC 3986 encoding as required by the AliCloud RPC signature.
fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

#[async_trait]
impl AuthMethod for AliCloudAuth {
    fn name(&self) -> &'static str {
        "alicloud"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        let (url, headers) = match self.identity_request_url {
            Some(ref url) => (
                url.clone(),
                self.identity_request_headers
                    .clone()
                    .unwrap_or_else(|| "{}".to_string()),
            ),
            None => {
                let nonce = format!("{:016x}", rand::random::<u64>());
                (self.signed_url(Utc::now(), &nonce)?, "{}".to_string())
            }
        };

        Ok(self
            .config
            .request(format!("auth/{}/login", self.mount))
            .with_kind(CredentialKind::SignedRequest)
            .with_field("role", self.role.clone())
            .with_field("identity_request_url", STANDARD.encode(url))
            .with_field("identity_request_headers", STANDARD.encode(headers)))
    }
}
