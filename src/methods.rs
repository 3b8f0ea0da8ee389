use crate::config::MethodConfig;
use crate::error::ConfigError;
use serde_json::Value;
use std::sync::Arc;
use vault_client::auth::{
    AliCloudAuth, AuthConfig, AuthMethod, AwsIamAuth, AzureAuth, GcpAuth, KerberosAuth,
    KubernetesAuth, SpnegoNegotiator, TokenFileAuth, UserpassAuth,
};

/// Method types accepted in `auto_auth.method.type`.
pub const METHOD_TYPES: [&str; 8] = [
    "userpass",
    "kubernetes",
    "token_file",
    "kerberos",
    "gcp",
    "azure",
    "aws",
    "alicloud",
];

/// Builds the configured auth method. Option values are passed through as strings.
pub(crate) fn build_method(
    config: &MethodConfig,
    negotiator: Option<Arc<dyn SpnegoNegotiator>>,
) -> Result<Arc<dyn AuthMethod>, ConfigError> {
    let kind = config.kind.as_str();
    let auth = auth_config(config);
    let invalid = |source| ConfigError::Method {
        method: kind.to_string(),
        source,
    };

    let method: Arc<dyn AuthMethod> = match kind {
        "userpass" => Arc::new(UserpassAuth::new(auth).map_err(invalid)?),
        "kubernetes" => Arc::new(KubernetesAuth::new(auth).map_err(invalid)?),
        "token_file" => Arc::new(TokenFileAuth::new(auth).map_err(invalid)?),
        "kerberos" => {
            let negotiator = negotiator.ok_or_else(|| {
                ConfigError::Invalid("kerberos auth requires a SPNEGO negotiator".into())
            })?;
            Arc::new(KerberosAuth::new(auth, negotiator).map_err(invalid)?)
        }
        "gcp" => Arc::new(GcpAuth::new(auth).map_err(invalid)?),
        "azure" => Arc::new(AzureAuth::new(auth).map_err(invalid)?),
        "aws" => Arc::new(AwsIamAuth::new(auth).map_err(invalid)?),
        "alicloud" => Arc::new(AliCloudAuth::new(auth).map_err(invalid)?),
        other => return Err(ConfigError::UnknownMethod(other.to_string())),
    };
    Ok(method)
}

fn auth_config(config: &MethodConfig) -> AuthConfig {
    let mut auth = AuthConfig::new(config.mount_path.clone().unwrap_or_default())
        .with_span(tracing::info_span!("auth_method", method = %config.kind));
    if let Some(namespace) = config.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        auth = auth.with_namespace(namespace);
    }
    for (key, value) in &config.config {
        auth = auth.with_option(key.clone(), option_value(value));
    }
    auth
}

fn option_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}
