use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use zeroize::Zeroizing;

/// Opaque session token. Zeroed on drop, redacted in `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct Token(Zeroizing<String>);

impl Token {
    pub fn new(value: impl Into<String>) -> Self {
        Self(Zeroizing::new(value.into()))
    }

    pub fn expose(&self) -> &str {
        self.0.as_str()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Token(<redacted>)")
    }
}

impl From<String> for Token {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for Token {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// What the auth method presented to obtain the credential.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CredentialKind {
    #[default]
    Token,
    Cert,
    SignedRequest,
}

/// Session token plus its lease metadata.
#[derive(Debug, Clone)]
pub struct Credential {
    pub kind: CredentialKind,
    pub token: Token,
    /// Identifier usable for revocation; may be empty.
    pub accessor: String,
    pub lease_duration: Duration,
    pub renewable: bool,
    pub issued_at: Instant,
    pub metadata: HashMap<String, String>,
}

impl Credential {
    pub fn new(token: impl Into<Token>, lease_duration: Duration, renewable: bool) -> Self {
        Self {
            kind: CredentialKind::Token,
            token: token.into(),
            accessor: String::new(),
            lease_duration,
            renewable,
            issued_at: Instant::now(),
            metadata: HashMap::new(),
        }
    }

    /// Token without a lease (never expires, never renewed).
    pub fn static_token(token: impl Into<Token>) -> Self {
        Self::new(token, Duration::ZERO, false)
    }

    pub fn with_accessor(mut self, accessor: impl Into<String>) -> Self {
        self.accessor = accessor.into();
        self
    }

    pub fn with_kind(mut self, kind: CredentialKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn issued_at(mut self, issued_at: Instant) -> Self {
        self.issued_at = issued_at;
        self
    }

    /// A zero lease means the credential never expires.
    pub fn is_non_expiring(&self) -> bool {
        self.lease_duration.is_zero()
    }

    pub fn expires_at(&self) -> Option<Instant> {
        if self.is_non_expiring() {
            None
        } else {
            Some(self.issued_at + self.lease_duration)
        }
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.issued_at)
    }

    /// `now - issued_at >= lease_duration` for a credential with a lease.
    pub fn is_expired(&self, now: Instant) -> bool {
        !self.is_non_expiring() && self.age(now) >= self.lease_duration
    }

    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at()
            .map(|at| at.saturating_duration_since(now))
    }
}

/// One authentication attempt, as built by an [`AuthMethod`](crate::auth::AuthMethod).
#[derive(Clone, Default)]
pub struct AuthRequest {
    /// Path relative to `/v1/`, e.g. `auth/userpass/login/alice`.
    pub path: String,
    pub headers: HashMap<String, String>,
    pub data: serde_json::Map<String, serde_json::Value>,
    pub kind: CredentialKind,
}

impl AuthRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(name.into(), value.into());
        self
    }

    pub fn with_kind(mut self, kind: CredentialKind) -> Self {
        self.kind = kind;
        self
    }
}

// Header values and form fields carry passwords and signed material.
impl fmt::Debug for AuthRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut headers: Vec<&String> = self.headers.keys().collect();
        headers.sort();
        let mut fields: Vec<&String> = self.data.keys().collect();
        fields.sort();
        f.debug_struct("AuthRequest")
            .field("path", &self.path)
            .field("headers", &headers)
            .field("fields", &fields)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Response envelope shared by login, renew, lookup-self and wrap.
#[derive(Debug, Deserialize)]
pub(crate) struct SecretResponse {
    #[serde(default)]
    pub auth: Option<AuthData>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    #[serde(default)]
    pub wrap_info: Option<WrapInfo>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct AuthData {
    pub client_token: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub lease_duration: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}

impl AuthData {
    pub(crate) fn into_credential(self, kind: CredentialKind) -> Credential {
        Credential::new(
            self.client_token,
            Duration::from_secs(self.lease_duration),
            self.renewable,
        )
        .with_accessor(self.accessor)
        .with_kind(kind)
        .with_metadata(self.metadata.unwrap_or_default())
    }
}

/// `data` block of `auth/token/lookup-self`.
#[derive(Debug, Deserialize)]
pub(crate) struct LookupData {
    pub id: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub ttl: u64,
    #[serde(default)]
    pub renewable: bool,
    #[serde(default)]
    pub meta: Option<HashMap<String, String>>,
}

impl LookupData {
    pub(crate) fn into_credential(self, kind: CredentialKind) -> Credential {
        Credential::new(self.id, Duration::from_secs(self.ttl), self.renewable)
            .with_accessor(self.accessor)
            .with_kind(kind)
            .with_metadata(self.meta.unwrap_or_default())
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct WrapInfo {
    pub token: String,
    #[serde(default)]
    pub accessor: String,
    #[serde(default)]
    pub ttl: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_data_deserialize() {
        let json = r#"{
            "auth": {
                "client_token": "s.abc",
                "accessor": "acc1",
                "lease_duration": 60,
                "renewable": true,
                "metadata": {"username": "alice"}
            }
        }"#;
        let resp: SecretResponse = serde_json::from_str(json).unwrap();
        let cred = resp.auth.unwrap().into_credential(CredentialKind::Token);
        assert_eq!(cred.token.expose(), "s.abc");
        assert_eq!(cred.accessor, "acc1");
        assert_eq!(cred.lease_duration, Duration::from_secs(60));
        assert!(cred.renewable);
        assert_eq!(cred.metadata.get("username").unwrap(), "alice");
    }

    #[test]
    fn test_auth_data_null_metadata() {
        let json = r#"{"auth": {"client_token": "s.abc", "metadata": null}}"#;
        let resp: SecretResponse = serde_json::from_str(json).unwrap();
        let cred = resp.auth.unwrap().into_credential(CredentialKind::SignedRequest);
        assert!(cred.metadata.is_empty());
        assert!(cred.is_non_expiring());
        assert_eq!(cred.kind, CredentialKind::SignedRequest);
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_expiry() {
        let cred = Credential::new("t", Duration::from_secs(10), true);
        assert!(!cred.is_expired(Instant::now()));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(cred.is_expired(Instant::now()));
        assert_eq!(cred.remaining(Instant::now()), Some(Duration::ZERO));
    }

    #[test]
    fn test_static_token_never_expires() {
        let cred = Credential::static_token("t");
        let later = cred.issued_at + Duration::from_secs(86_400 * 365);
        assert!(!cred.is_expired(later));
        assert!(cred.expires_at().is_none());
    }

    #[test]
    fn test_debug_redacts_secrets() {
        let cred = Credential::new("super-secret", Duration::from_secs(1), false);
        assert!(!format!("{:?}", cred).contains("super-secret"));

        let req = AuthRequest::new("auth/userpass/login/alice").with_field("password", "p@ss");
        let rendered = format!("{:?}", req);
        assert!(rendered.contains("password"));
        assert!(!rendered.contains("p@ss"));
    }
}
