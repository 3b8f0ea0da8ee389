use super::{AuthConfig, AuthMethod, MethodOptions};
use crate::VaultError;
use crate::models::{AuthRequest, CredentialKind, Token};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_MOUNT: &str = "aws";
const DEFAULT_REGION: &str = "us-east-1";
const STS_BODY: &str = "Action=GetCallerIdentity&Version=2011-06-15";
const SERVER_ID_HEADER: &str = "X-Vault-AWS-IAM-Server-ID";

struct AwsCredentials {
    access_key_id: String,
    secret_access_key: Token,
    session_token: Option<Token>,
}

/// IAM authentication via a signed `sts:GetCallerIdentity` request.
pub struct AwsIamAuth {
    config: AuthConfig,
    mount: String,
    role: String,
    region: String,
    server_id: Option<String>,
}

impl AwsIamAuth {
    pub fn new(config: AuthConfig) -> Result<Self, VaultError> {
        let options = MethodOptions::from_config(&config)?;

        Ok(Self {
            mount: config.mount_or(DEFAULT_MOUNT),
            role: options.role()?.to_string(),
            region: options.region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            server_id: config.option("header_value").map(String::from),
            config,
        })
    }

    // Explicit options win over the process environment.
    fn credentials(&self) -> Result<AwsCredentials, VaultError> {
        let lookup = |option: &str, env: &str| {
            self.config
                .option(option)
                .map(String::from)
                .or_else(|| std::env::var(env).ok().filter(|v| !v.is_empty()))
        };

        let access_key_id = lookup("access_key", "AWS_ACCESS_KEY_ID");
        let secret_access_key = lookup("secret_key", "AWS_SECRET_ACCESS_KEY");
        match (access_key_id, secret_access_key) {
            (Some(access_key_id), Some(secret)) => Ok(AwsCredentials {
                access_key_id,
                secret_access_key: Token::new(secret),
                session_token: lookup("session_token", "AWS_SESSION_TOKEN").map(Token::new),
            }),
            _ => Err(VaultError::CredentialUnavailable(
                "AWS credentials not found (AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY)".into(),
            )),
        }
    }

    fn sts_host(&self) -> String {
        if self.region == DEFAULT_REGION {
            "sts.amazonaws.com".to_string()
        } else {
            format!("sts.{}.amazonaws.com", self.region)
        }
    }

    fn signed_request(
        &self,
        creds: &AwsCredentials,
        now: DateTime<Utc>,
    ) -> Result<AuthRequest, VaultError> {
        let host = self.sts_host();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();

        let mut headers = BTreeMap::new();
        headers.insert(
            "Content-Type".to_string(),
            "application/x-www-form-urlencoded; charset=utf-8".to_string(),
        );
        headers.insert("Host".to_string(), host.clone());
        headers.insert("X-Amz-Date".to_string(), amz_date);
        if let Some(ref token) = creds.session_token {
            headers.insert("X-Amz-Security-Token".to_string(), token.expose().to_string());
        }
        if let Some(ref server_id) = self.server_id {
            headers.insert(SERVER_ID_HEADER.to_string(), server_id.clone());
        }

        let authorization = sign_v4(
            &SigningParams {
                access_key_id: &creds.access_key_id,
                secret_access_key: creds.secret_access_key.expose(),
                region: &self.region,
                service: "sts",
                now,
            },
            "POST",
            "/",
            "",
            &headers,
            STS_BODY.as_bytes(),
        )?;
        headers.insert("Authorization".to_string(), authorization);

        let header_values: BTreeMap<&str, Vec<&str>> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), vec![v.as_str()]))
            .collect();
        let headers_json = serde_json::to_vec(&header_values)?;

        Ok(self
            .config
            .request(format!("auth/{}/login", self.mount))
            .with_kind(CredentialKind::SignedRequest)
            .with_field("role", self.role.clone())
            .with_field("iam_http_request_method", "POST")
            .with_field("iam_request_url", STANDARD.encode(format!("https://{}/", host)))
            .with_field("iam_request_body", STANDARD.encode(STS_BODY))
            .with_field("iam_request_headers", STANDARD.encode(headers_json)))
    }
}

#[async_trait]
impl AuthMethod for AwsIamAuth {
    fn name(&self) -> &'static str {
        "aws"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        let creds = self.credentials()?;
        self.signed_request(&creds, Utc::now())
    }
}

pub(crate) struct SigningParams<'a> {
    pub access_key_id: &'a str,
    pub secret_access_key: &'a str,
    pub region: &'a str,
    pub service: &'a str,
    pub now: DateTime<Utc>,
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, VaultError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|_| VaultError::InvalidConfig("failed to initialize hmac".into()))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, VaultError> {
    let k_date = hmac_sha256(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac_sha256(&k_date, region.as_bytes())?;
    let k_service = hmac_sha256(&k_region, service.as_bytes())?;
    hmac_sha256(&k_service, b"aws4_request")
}

/// Returns the SigV4 `Authorization` header value for the request.
pub(crate) fn sign_v4(
    params: &SigningParams<'_>,
    method: &str,
    path: &str,
    query: &str,
    headers: &BTreeMap<String, String>,
    body: &[u8],
) -> Result<String, VaultError> {
    let amz_date = params.now.format("%Y%m%dT%H%M%SZ").to_string();
    let date = params.now.format("%Y%m%d").to_string();

    let canonical: BTreeMap<String, String> = headers
        .iter()
        .map(|(k, v)| (k.to_ascii_lowercase(), v.trim().to_string()))
        .collect();
    let canonical_headers: String = canonical
        .iter()
        .map(|(k, v)| format!("{}:{}\n", k, v))
        .collect();
    let signed_headers = canonical.keys().cloned().collect::<Vec<_>>().join(";");

    let canonical_request = format!(
        "{}\n{}\n{}\n{}\n{}\n{}",
        method,
        path,
        query,
        canonical_headers,
        signed_headers,
        hex::encode(Sha256::digest(body))
    );

    let scope = format!("{}/{}/{}/aws4_request", date, params.region, params.service);
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{}\n{}\n{}",
        amz_date,
        scope,
        hex::encode(Sha256::digest(canonical_request.as_bytes()))
    );

    let key = signing_key(params.secret_access_key, &date, params.region, params.service)?;
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    Ok(format!(
        "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
        params.access_key_id, scope, signed_headers, signature
    ))
}
