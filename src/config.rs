//! Agent configuration: the JSON file format and the validating builder.

use crate::backoff::BackoffConfig;
use crate::clock::{Clock, TokioClock};
use crate::error::ConfigError;
use crate::handler::HandlerConfig;
use crate::methods::build_method;
use crate::sink::{
    EncryptConfig, MemorySink, SinkConfig, SinkServerConfig, SinkSpec, WriteMode,
};
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use vault_client::auth::{AuthMethod, SpnegoNegotiator};
use vault_client::{HttpSessionClient, SessionClient};

const DEFAULT_EXIT_AFTER_AUTH_TIMEOUT: Duration = Duration::from_secs(120);
const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Duration given as integer seconds or a string with an `ms`, `s`, `m` or `h` suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConfigDuration(pub Duration);

impl<'de> Deserialize<'de> for ConfigDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(ConfigDuration(Duration::from_secs(secs))),
            Raw::Text(text) => parse_duration(&text)
                .map(ConfigDuration)
                .map_err(serde::de::Error::custom),
        }
    }
}

pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = || ConfigError::InvalidDuration(input.to_string());
    let text = input.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(text.len());
    let (number, unit) = text.split_at(split);

    let value: f64 = number.parse().map_err(|_| invalid())?;
    let secs = match unit.trim() {
        "" | "s" => value,
        "ms" => value / 1000.0,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(invalid()),
    };
    Duration::try_from_secs_f64(secs).map_err(|_| invalid())
}

fn dur(value: Option<ConfigDuration>) -> Option<Duration> {
    value.map(|d| d.0)
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct VaultConfig {
    pub address: Option<String>,
    pub namespace: Option<String>,
    pub request_timeout: Option<ConfigDuration>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MethodConfig {
    #[serde(rename = "type")]
    pub kind: String,
    pub mount_path: Option<String>,
    pub namespace: Option<String>,
    pub min_backoff: Option<ConfigDuration>,
    pub max_backoff: Option<ConfigDuration>,
    #[serde(default)]
    pub exit_on_err: bool,
    /// Response-wrap the login result. Needs exactly one sink that does not wrap itself.
    pub wrap_ttl: Option<ConfigDuration>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EncryptSection {
    pub key_path: PathBuf,
    pub aad: Option<String>,
    /// Environment variable holding the AAD. Exclusive with `aad`.
    pub aad_env_var: Option<String>,
}

impl EncryptSection {
    fn into_encrypt_config(self, sink: &str) -> Result<EncryptConfig, ConfigError> {
        let aad = match (self.aad, self.aad_env_var) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Invalid(format!(
                    "sink '{sink}': set either aad or aad_env_var, not both"
                )));
            }
            (aad, None) => aad,
            (None, Some(var)) => Some(std::env::var(&var).map_err(|_| {
                ConfigError::Invalid(format!(
                    "sink '{sink}': aad_env_var {var} is not set"
                ))
            })?),
        };
        Ok(EncryptConfig {
            key_path: self.key_path,
            aad,
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SinkSection {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub config: Map<String, Value>,
    pub wrap_ttl: Option<ConfigDuration>,
    pub encrypt: Option<EncryptSection>,
    #[serde(default)]
    pub write_mode: WriteMode,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AutoAuthConfig {
    pub method: Option<MethodConfig>,
    #[serde(default)]
    pub sinks: Vec<SinkSection>,
    #[serde(default)]
    pub enable_reauth_on_new_credentials: bool,
}

/// Top-level configuration file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub vault: VaultConfig,
    #[serde(default)]
    pub auto_auth: AutoAuthConfig,
    #[serde(default)]
    pub exit_after_auth: bool,
    pub exit_after_auth_timeout: Option<ConfigDuration>,
    pub revoke_on_shutdown: Option<bool>,
    pub revoke_min_remaining: Option<ConfigDuration>,
    pub renew_increment: Option<ConfigDuration>,
    pub safety_margin: Option<ConfigDuration>,
}

impl FileConfig {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        raw.parse()
    }
}

impl std::str::FromStr for FileConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(serde_json::from_str(s)?)
    }
}

impl SinkSection {
    fn into_sink_config(self, index: usize) -> Result<SinkConfig, ConfigError> {
        let mut options = self.config;
        let name = match options.remove("name") {
            Some(Value::String(name)) if !name.is_empty() => Some(name),
            Some(Value::String(_)) | None => None,
            Some(other) => {
                return Err(ConfigError::Invalid(format!("sink name must be a string, got {other}")));
            }
        };

        let mut sink = match self.kind.as_str() {
            "file" => {
                let path = match options.remove("path") {
                    Some(Value::String(path)) if !path.is_empty() => path,
                    _ => {
                        return Err(ConfigError::Invalid(format!(
                            "sink #{index}: file sink requires 'path'"
                        )));
                    }
                };
                let mut sink = SinkConfig::file(path);
                if let Some(mode) = options.remove("mode") {
                    sink.mode = parse_mode(&mode)?;
                }
                sink
            }
            "memory" => SinkConfig::memory(format!("memory-{index}")),
            other => return Err(ConfigError::UnknownSink(other.to_string())),
        };

        if let Some(unknown) = options.keys().next() {
            return Err(ConfigError::Invalid(format!(
                "sink #{index}: unknown option '{unknown}'"
            )));
        }
        if let Some(name) = name {
            sink.name = name;
        }
        sink.wrap_ttl = match dur(self.wrap_ttl) {
            Some(ttl) if ttl.is_zero() => {
                return Err(ConfigError::Invalid(format!("sink '{}': wrap_ttl must be positive", sink.name)));
            }
            other => other,
        };
        sink.encrypt = self
            .encrypt
            .map(|e| e.into_encrypt_config(&sink.name))
            .transpose()?;
        sink.write_mode = self.write_mode;
        sink.span = tracing::info_span!("sink", sink = %sink.name);
        Ok(sink)
    }
}

/// Permission bits as a number (`384`) or an octal string (`"0600"`).
fn parse_mode(value: &Value) -> Result<u32, ConfigError> {
    let mode = match value {
        Value::Number(n) => n.as_u64().and_then(|m| u32::try_from(m).ok()),
        Value::String(s) => u32::from_str_radix(s.trim().trim_start_matches("0o"), 8).ok(),
        _ => None,
    };
    mode.filter(|m| *m <= 0o777)
        .ok_or_else(|| ConfigError::Invalid(format!("invalid file mode {value}")))
}

/// Validated, frozen configuration consumed by [`Agent`](crate::Agent).
pub struct AgentConfig {
    pub(crate) method: Arc<dyn AuthMethod>,
    pub(crate) client: Arc<dyn SessionClient>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) sinks: Vec<SinkSpec>,
    pub(crate) memory_sinks: HashMap<String, Arc<MemorySink>>,
    pub(crate) handler: HandlerConfig,
    pub(crate) sink_server: SinkServerConfig,
    pub(crate) exit_after_auth: bool,
    pub(crate) exit_after_auth_timeout: Duration,
    pub(crate) shutdown_grace: Duration,
}

impl AgentConfig {
    pub fn builder() -> AgentConfigBuilder {
        AgentConfigBuilder::new()
    }

    pub fn method_name(&self) -> &'static str {
        self.method.name()
    }

    pub fn sink_names(&self) -> Vec<String> {
        self.sinks.iter().map(|s| s.name().to_string()).collect()
    }

    pub fn exit_after_auth(&self) -> bool {
        self.exit_after_auth
    }
}

impl std::fmt::Debug for AgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentConfig")
            .field("method", &self.method.name())
            .field("sinks", &self.sinks)
            .field("handler", &self.handler)
            .field("sink_server", &self.sink_server)
            .field("exit_after_auth", &self.exit_after_auth)
            .field("exit_after_auth_timeout", &self.exit_after_auth_timeout)
            .field("shutdown_grace", &self.shutdown_grace)
            .finish_non_exhaustive()
    }
}

/// Collects the file configuration and injected collaborators, then
/// validates everything at once in [`build`](Self::build).
///
/// Explicit builder settings win over the file.
#[derive(Default)]
pub struct AgentConfigBuilder {
    file: FileConfig,
    method: Option<Arc<dyn AuthMethod>>,
    client: Option<Arc<dyn SessionClient>>,
    clock: Option<Arc<dyn Clock>>,
    negotiator: Option<Arc<dyn SpnegoNegotiator>>,
    sinks: Vec<SinkSpec>,
    login_backoff: Option<BackoffConfig>,
    renew_backoff: Option<BackoffConfig>,
    sink_backoff: Option<BackoffConfig>,
    exit_after_auth: Option<bool>,
    exit_after_auth_timeout: Option<Duration>,
    shutdown_grace: Option<Duration>,
}

impl AgentConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Ok(Self::new().file_config(FileConfig::from_path(path)?))
    }

    pub fn file_config(mut self, file: FileConfig) -> Self {
        self.file = file;
        self
    }

    /// Replaces the method described by `auto_auth.method`.
    pub fn auth_method(mut self, method: Arc<dyn AuthMethod>) -> Self {
        self.method = Some(method);
        self
    }

    /// Replaces the HTTP client built from the `vault` section.
    pub fn session_client(mut self, client: Arc<dyn SessionClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn spnego_negotiator(mut self, negotiator: Arc<dyn SpnegoNegotiator>) -> Self {
        self.negotiator = Some(negotiator);
        self
    }

    /// Adds a sink after the ones from the file.
    pub fn sink(mut self, sink: SinkSpec) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn login_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.login_backoff = Some(backoff);
        self
    }

    pub fn renew_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.renew_backoff = Some(backoff);
        self
    }

    pub fn sink_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.sink_backoff = Some(backoff);
        self
    }

    pub fn exit_after_auth(mut self, enabled: bool) -> Self {
        self.exit_after_auth = Some(enabled);
        self
    }

    pub fn exit_after_auth_timeout(mut self, timeout: Duration) -> Self {
        self.exit_after_auth_timeout = Some(timeout);
        self
    }

    /// Flush grace for sinks on shutdown.
    pub fn shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = Some(grace);
        self
    }

    pub fn build(self) -> Result<AgentConfig, ConfigError> {
        let file = self.file;
        let method_config = file.auto_auth.method.as_ref();

        let method = match (self.method, method_config) {
            (Some(method), _) => method,
            (None, Some(config)) => build_method(config, self.negotiator)?,
            (None, None) => {
                return Err(ConfigError::Invalid("auto_auth.method must be set".into()));
            }
        };

        let login_backoff = match self.login_backoff {
            Some(backoff) => backoff,
            None => {
                let min = method_config.and_then(|m| dur(m.min_backoff));
                let max = method_config.and_then(|m| dur(m.max_backoff));
                BackoffConfig::new(
                    min.unwrap_or(BackoffConfig::LOGIN.min),
                    max.unwrap_or(BackoffConfig::LOGIN.max),
                )
            }
        }
        .validate()?;
        let renew_backoff = self.renew_backoff.unwrap_or(BackoffConfig::RENEW).validate()?;
        let sink_backoff = self.sink_backoff.unwrap_or(BackoffConfig::SINK).validate()?;

        let client = match self.client {
            Some(client) => client,
            None => Arc::new(http_client(&file.vault)?),
        };

        let mut sinks = Vec::new();
        let mut memory_sinks = HashMap::new();
        for (index, section) in file.auto_auth.sinks.into_iter().enumerate() {
            let (spec, memory) = section.into_sink_config(index)?.build()?;
            if let Some(memory) = memory {
                memory_sinks.insert(spec.name().to_string(), memory);
            }
            sinks.push(spec);
        }
        sinks.extend(self.sinks);

        let mut names = HashSet::new();
        for spec in &sinks {
            if !names.insert(spec.name().to_string()) {
                return Err(ConfigError::Sink {
                    sink: spec.name().to_string(),
                    message: "duplicate sink name".into(),
                });
            }
        }

        let wrap_ttl = method_config.and_then(|m| dur(m.wrap_ttl));
        if let Some(ttl) = wrap_ttl {
            if ttl.is_zero() {
                return Err(ConfigError::Invalid("auto_auth.method: wrap_ttl must be positive".into()));
            }
            match sinks.as_slice() {
                [only] if only.wrap_ttl.is_some() => {
                    return Err(ConfigError::Invalid(
                        "wrapping enabled on both the auth method and its sink".into(),
                    ));
                }
                [_] => {}
                _ => {
                    return Err(ConfigError::Invalid(format!(
                        "wrapping on the auth method needs exactly one sink, found {}",
                        sinks.len()
                    )));
                }
            }
        }

        let exit_after_auth = self.exit_after_auth.unwrap_or(file.exit_after_auth);
        if sinks.is_empty() {
            warn!("No sinks configured; credentials are only kept in memory");
        }

        let defaults = HandlerConfig::default();
        let handler = HandlerConfig {
            login_backoff,
            renew_backoff,
            exit_on_err: method_config.is_some_and(|m| m.exit_on_err),
            enable_reauth_on_new_credentials: file.auto_auth.enable_reauth_on_new_credentials,
            renew_increment: dur(file.renew_increment).filter(|d| !d.is_zero()),
            safety_margin: dur(file.safety_margin).unwrap_or(defaults.safety_margin),
            // The delivered token must outlive the process when exiting after auth.
            revoke_on_shutdown: !exit_after_auth
                && file.revoke_on_shutdown.unwrap_or(defaults.revoke_on_shutdown),
            revoke_min_remaining: dur(file.revoke_min_remaining)
                .unwrap_or(defaults.revoke_min_remaining),
            revoke_timeout: defaults.revoke_timeout,
            wrap_ttl,
        };

        let shutdown_grace = self.shutdown_grace.unwrap_or(DEFAULT_SHUTDOWN_GRACE);
        let exit_after_auth_timeout = self
            .exit_after_auth_timeout
            .or(dur(file.exit_after_auth_timeout))
            .unwrap_or(DEFAULT_EXIT_AFTER_AUTH_TIMEOUT);
        if exit_after_auth_timeout.is_zero() {
            return Err(ConfigError::Invalid("exit_after_auth_timeout must be positive".into()));
        }

        Ok(AgentConfig {
            method,
            client,
            clock: self.clock.unwrap_or_else(|| Arc::new(TokioClock)),
            sinks,
            memory_sinks,
            handler,
            sink_server: SinkServerConfig {
                backoff: sink_backoff,
                grace: shutdown_grace,
            },
            exit_after_auth,
            exit_after_auth_timeout,
            shutdown_grace,
        })
    }
}

fn http_client(vault: &VaultConfig) -> Result<HttpSessionClient, ConfigError> {
    let mut builder = HttpSessionClient::builder();
    if let Some(address) = vault.address.as_deref().filter(|a| !a.is_empty()) {
        builder = builder.address(address);
    }
    if let Some(namespace) = vault.namespace.as_deref().filter(|ns| !ns.is_empty()) {
        builder = builder.namespace(namespace);
    }
    if let Some(timeout) = dur(vault.request_timeout) {
        builder = builder.request_timeout(timeout);
    }
    builder
        .build()
        .map_err(|e| ConfigError::Invalid(format!("vault: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::MemorySink;
    use crate::testing::{FakeMethod, ScriptedClient};
    use serde_json::json;
    use tempfile::tempdir;

    fn from_json(value: Value) -> Result<FileConfig, ConfigError> {
        value.to_string().parse()
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1.5s").unwrap(), Duration::from_millis(1500));
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_full_file_parses() {
        let dir = tempdir().unwrap();
        let config = from_json(json!({
            "vault": { "address": "https://vault:8200", "namespace": "ns1", "request_timeout": "30s" },
            "auto_auth": {
                "method": {
                    "type": "userpass", "mount_path": "userpass",
                    "min_backoff": 2, "max_backoff": "1m", "exit_on_err": true,
                    "config": { "username": "alice", "password": "p@ss" }
                },
                "sinks": [
                    { "type": "file", "config": { "path": dir.path().join("t"), "mode": "0640" },
                      "wrap_ttl": "5m", "write_mode": "overwrite" },
                    { "type": "memory", "config": { "name": "cache" } }
                ],
                "enable_reauth_on_new_credentials": true
            },
            "exit_after_auth": true, "exit_after_auth_timeout": "30s",
            "revoke_on_shutdown": false, "revoke_min_remaining": "1s",
            "renew_increment": "1h", "safety_margin": "2s"
        }))
        .unwrap();

        let built = AgentConfigBuilder::new().file_config(config).build().unwrap();
        assert_eq!(built.method_name(), "userpass");
        assert_eq!(
            built.sink_names(),
            vec![format!("file:{}", dir.path().join("t").display()), "cache".to_string()]
        );
        assert!(built.memory_sinks.contains_key("cache"));
        assert_eq!(built.sinks[0].wrap_ttl, Some(Duration::from_secs(300)));
        assert!(built.exit_after_auth);
        assert_eq!(built.exit_after_auth_timeout, Duration::from_secs(30));

        let handler = &built.handler;
        assert_eq!(handler.login_backoff.min, Duration::from_secs(2));
        assert_eq!(handler.login_backoff.max, Duration::from_secs(60));
        assert!(handler.exit_on_err);
        assert!(handler.enable_reauth_on_new_credentials);
        assert!(!handler.revoke_on_shutdown);
        assert_eq!(handler.revoke_min_remaining, Duration::from_secs(1));
        assert_eq!(handler.renew_increment, Some(Duration::from_secs(3600)));
        assert_eq!(handler.safety_margin, Duration::from_secs(2));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        assert!(matches!(
            from_json(json!({ "auto_auth": {}, "listener": {} })),
            Err(ConfigError::Parse(_))
        ));
        assert!(matches!(
            from_json(json!({ "auto_auth": { "method": { "type": "userpass", "role": "x" } } })),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_method() {
        let result = AgentConfigBuilder::new()
            .session_client(Arc::new(ScriptedClient::new()))
            .build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_unknown_sink_type() {
        let config = from_json(json!({ "auto_auth": { "sinks": [ { "type": "socket" } ] } })).unwrap();
        let result = AgentConfigBuilder::new()
            .file_config(config)
            .auth_method(Arc::new(FakeMethod::new()))
            .session_client(Arc::new(ScriptedClient::new()))
            .build();
        assert!(matches!(result, Err(ConfigError::UnknownSink(_))));
    }

    #[test]
    fn test_sink_option_validation() {
        let dir = tempdir().unwrap();
        let cases = [
            json!({ "type": "file", "config": {} }),
            json!({ "type": "file", "config": { "path": dir.path().join("t"), "mode": "999" } }),
            json!({ "type": "file", "config": { "path": dir.path().join("t"), "owner": "root" } }),
            json!({ "type": "file", "config": { "path": dir.path().join("t") }, "wrap_ttl": 0 }),
            json!({ "type": "file", "config": { "path": "/does/not/exist/t" } }),
        ];
        for sink in cases {
            let config = from_json(json!({ "auto_auth": { "sinks": [sink.clone()] } })).unwrap();
            let result = AgentConfigBuilder::new()
                .file_config(config)
                .auth_method(Arc::new(FakeMethod::new()))
                .session_client(Arc::new(ScriptedClient::new()))
                .build();
            assert!(result.is_err(), "accepted {sink}");
        }
    }

    #[test]
    fn test_duplicate_sink_names() {
        let config = from_json(json!({ "auto_auth": { "sinks": [
            { "type": "memory", "config": { "name": "a" } }
        ] } }))
        .unwrap();
        let result = AgentConfigBuilder::new()
            .file_config(config)
            .auth_method(Arc::new(FakeMethod::new()))
            .session_client(Arc::new(ScriptedClient::new()))
            .sink(SinkSpec::new(Arc::new(MemorySink::new("a"))))
            .build();
        assert!(matches!(result, Err(ConfigError::Sink { .. })));
    }

    #[test]
    fn test_defaults() {
        let built = AgentConfigBuilder::new()
            .auth_method(Arc::new(FakeMethod::new()))
            .session_client(Arc::new(ScriptedClient::new()))
            .build()
            .unwrap();
        assert!(!built.exit_after_auth());
        assert_eq!(built.exit_after_auth_timeout, Duration::from_secs(120));
        assert_eq!(built.shutdown_grace, Duration::from_secs(5));
        assert_eq!(built.handler.login_backoff, BackoffConfig::LOGIN);
        assert!(built.handler.revoke_on_shutdown);
        assert_eq!(built.handler.revoke_min_remaining, Duration::ZERO);
        assert_eq!(built.handler.renew_increment, None);
        assert_eq!(built.sink_server.backoff, BackoffConfig::SINK);
    }

    #[test]
    fn test_builder_overrides_file() {
        let config = from_json(json!({ "exit_after_auth": true })).unwrap();
        let built = AgentConfigBuilder::new()
            .file_config(config)
            .auth_method(Arc::new(FakeMethod::new()))
            .session_client(Arc::new(ScriptedClient::new()))
            .exit_after_auth(false)
            .login_backoff(BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(8)))
            .build()
            .unwrap();
        assert!(!built.exit_after_auth);
        assert_eq!(built.handler.login_backoff.max, Duration::from_secs(8));
    }

    #[test]
    fn test_exit_after_auth_keeps_token() {
        let config = from_json(json!({ "exit_after_auth": true, "revoke_on_shutdown": true })).unwrap();
        let built = AgentConfigBuilder::new()
            .file_config(config)
            .auth_method(Arc::new(FakeMethod::new()))
            .session_client(Arc::new(ScriptedClient::new()))
            .build()
            .unwrap();
        assert!(built.exit_after_auth());
        assert!(!built.handler.revoke_on_shutdown);
    }

    fn method_wrap(ttl: Value, sinks: Value) -> Result<AgentConfig, ConfigError> {
        let config = from_json(json!({ "auto_auth": {
            "method": { "type": "userpass", "wrap_ttl": ttl,
                        "config": { "username": "a", "password": "b" } },
            "sinks": sinks
        } }))
        .unwrap();
        AgentConfigBuilder::new()
            .file_config(config)
            .session_client(Arc::new(ScriptedClient::new()))
            .build()
    }

    #[test]
    fn test_method_wrap_ttl() {
        let built = method_wrap(json!("5m"), json!([{ "type": "memory" }])).unwrap();
        assert_eq!(built.handler.wrap_ttl, Some(Duration::from_secs(300)));

        let cases = [
            (json!("5m"), json!([])),
            (json!("5m"), json!([{ "type": "memory" }, { "type": "memory", "config": { "name": "b" } }])),
            (json!("5m"), json!([{ "type": "memory", "wrap_ttl": "1m" }])),
            (json!(0), json!([{ "type": "memory" }])),
        ];
        for (ttl, sinks) in cases {
            let result = method_wrap(ttl.clone(), sinks.clone());
            assert!(matches!(result, Err(ConfigError::Invalid(_))), "accepted {ttl} with {sinks}");
        }
    }

    #[test]
    fn test_encrypt_aad_sources() {
        let section = |aad: Option<&str>, var: Option<&str>| EncryptSection {
            key_path: PathBuf::from("/k"),
            aad: aad.map(str::to_string),
            aad_env_var: var.map(str::to_string),
        };

        let from_env = section(None, Some("PATH")).into_encrypt_config("s");
        match std::env::var("PATH") {
            Ok(path) => assert_eq!(from_env.unwrap().aad, Some(path)),
            Err(_) => assert!(from_env.is_err()),
        }

        let inline = section(Some("inline"), None).into_encrypt_config("s").unwrap();
        assert_eq!(inline.aad.as_deref(), Some("inline"));

        assert!(section(Some("a"), Some("PATH"))
            .into_encrypt_config("s")
            .is_err());
        assert!(section(None, Some("VAULT_AGENT_TEST_AAD_NEVER_SET"))
            .into_encrypt_config("s")
            .is_err());
    }

    #[test]
    fn test_invalid_vault_address() {
        let config = from_json(json!({
            "vault": { "address": "vault:8200" },
            "auto_auth": { "method": { "type": "userpass",
                "config": { "username": "a", "password": "b" } } }
        }))
        .unwrap();
        let result = AgentConfigBuilder::new().file_config(config).build();
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_mode() {
        assert_eq!(parse_mode(&json!(384)).unwrap(), 0o600);
        assert_eq!(parse_mode(&json!("0600")).unwrap(), 0o600);
        assert_eq!(parse_mode(&json!("0o640")).unwrap(), 0o640);
        assert!(parse_mode(&json!("rw")).is_err());
        assert!(parse_mode(&json!(4096)).is_err());
    }
}
