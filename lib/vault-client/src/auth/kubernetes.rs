use super::{AuthConfig, AuthMethod, MethodOptions, read_secret_file};
use crate::VaultError;
use crate::models::AuthRequest;
use async_trait::async_trait;
use std::path::PathBuf;

const DEFAULT_MOUNT: &str = "kubernetes";
const DEFAULT_JWT_PATH: &str = "/var/run/secrets/kubernetes.io/serviceaccount/token";

/// Kubernetes authentication
pub struct KubernetesAuth {
    config: AuthConfig,
    mount: String,
    role: String,
    jwt_path: PathBuf,
}

impl KubernetesAuth {
    pub fn new(config: AuthConfig) -> Result<Self, VaultError> {
        let options = MethodOptions::from_config(&config)?;
        let role = options.role()?.to_string();
        let jwt_path = config
            .option("token_path")
            .map(String::from)
            .or(options.credential_location)
            .unwrap_or_else(|| DEFAULT_JWT_PATH.to_string());

        Ok(Self {
            mount: config.mount_or(DEFAULT_MOUNT),
            config,
            role,
            jwt_path: PathBuf::from(jwt_path),
        })
    }

    pub fn with_jwt_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.jwt_path = path.into();
        self
    }

    // The service account token is projected and rotated by the kubelet, so
    // it is read on every attempt.
    fn read_jwt(&self) -> Result<String, VaultError> {
        read_secret_file(&self.jwt_path)
    }
}

#[async_trait]
impl AuthMethod for KubernetesAuth {
    fn name(&self) -> &'static str {
        "kubernetes"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        let jwt = self.read_jwt()?;

        Ok(self
            .config
            .request(format!("auth/{}/login", self.mount))
            .with_field("jwt", jwt)
            .with_field("role", self.role.clone()))
    }
}
