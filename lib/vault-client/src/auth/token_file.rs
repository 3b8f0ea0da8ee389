use super::{AuthConfig, AuthMethod, MethodOptions};
use crate::VaultError;
use crate::models::{AuthRequest, Token};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const LOOKUP_SELF_PATH: &str = "auth/token/lookup-self";
const TOKEN_HEADER: &str = "X-Vault-Token";
const MIN_WATCH_INTERVAL: Duration = Duration::from_millis(100);

/// Presents a pre-issued token read from a file.
///
/// The last successfully read token is cached, so a file that disappears
/// (for instance with `remove_after_reading`) still allows re-login.
pub struct TokenFileAuth {
    config: AuthConfig,
    path: PathBuf,
    remove_after_reading: bool,
    watch_interval: Option<Duration>,
    cache: Mutex<Option<Token>>,
    notice: watch::Sender<u64>,
    watcher: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl TokenFileAuth {
    pub fn new(config: AuthConfig) -> Result<Self, VaultError> {
        let options = MethodOptions::from_config(&config)?;
        let path = config
            .option("token_file_path")
            .map(String::from)
            .or(options.credential_location)
            .ok_or_else(|| VaultError::InvalidConfig("'token_file_path' must be set".into()))?;

        let remove_after_reading = config.flag("remove_after_reading")?;
        let watch_interval = match config.option("watch_interval") {
            None => None,
            Some(v) => Some(parse_interval(v)?),
        };

        let (notice, _) = watch::channel(0);

        Ok(Self {
            config,
            path: PathBuf::from(path),
            remove_after_reading,
            watch_interval,
            cache: Mutex::new(None),
            notice,
            watcher: Mutex::new(None),
            cancel: CancellationToken::new(),
        })
    }

    fn read_token(&self) -> Result<Token, VaultError> {
        let fresh = std::fs::read_to_string(&self.path)
            .ok()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        match fresh {
            Some(value) => {
                let token = Token::new(value);
                *cache = Some(token.clone());
                Ok(token)
            }
            None => cache.clone().ok_or_else(|| {
                VaultError::CredentialUnavailable(format!(
                    "No token in {} and nothing cached",
                    self.path.display()
                ))
            }),
        }
    }

    fn spawn_watcher(&self, interval: Duration) -> Option<JoinHandle<()>> {
        let runtime = tokio::runtime::Handle::try_current().ok()?;
        let path = self.path.clone();
        let notice = self.notice.clone();
        let cancel = self.cancel.clone();
        let span = self.config.span.clone();
        let initial = read_trimmed(&path);

        Some(runtime.spawn(async move {
            let mut last_seen = initial;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }

                let current = read_trimmed(&path);
                if current.is_some() && current != last_seen {
                    tracing::info!(parent: &span, path = %path.display(), "token file changed");
                    notice.send_modify(|generation| *generation += 1);
                }
                if current.is_some() {
                    last_seen = current;
                }
            }
        }))
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    std::fs::read_to_string(path)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn parse_interval(value: &str) -> Result<Duration, VaultError> {
    let invalid = || VaultError::InvalidConfig(format!("invalid watch_interval '{}'", value));
    let (digits, unit) = value
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| value.split_at(i))
        .unwrap_or((value, "s"));
    let n: u64 = digits.parse().map_err(|_| invalid())?;
    let interval = match unit {
        "ms" => Duration::from_millis(n),
        "s" => Duration::from_secs(n),
        "m" => Duration::from_secs(n.checked_mul(60).ok_or_else(invalid)?),
        _ => return Err(invalid()),
    };
    Ok(interval.max(MIN_WATCH_INTERVAL))
}

#[async_trait]
impl AuthMethod for TokenFileAuth {
    fn name(&self) -> &'static str {
        "token_file"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        let token = self.read_token()?;

        Ok(self
            .config
            .request(LOOKUP_SELF_PATH)
            .with_header(TOKEN_HEADER, token.expose())
            .with_field("token", token.expose()))
    }

    fn new_credential_notice(&self) -> Option<watch::Receiver<u64>> {
        let interval = self.watch_interval?;
        let mut watcher = self.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.is_none() {
            *watcher = self.spawn_watcher(interval);
        }
        watcher.as_ref().map(|_| self.notice.subscribe())
    }

    fn credential_success_ack(&self) {
        if !self.remove_after_reading {
            return;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                tracing::debug!(parent: &self.config.span, path = %self.path.display(), "removed token file");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(parent: &self.config.span, path = %self.path.display(), error = %e, "failed to remove token file");
            }
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self
            .watcher
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn auth_for(path: &Path, extra: &[(&str, &str)]) -> TokenFileAuth {
        let mut config =
            AuthConfig::default().with_option("token_file_path", path.to_str().unwrap());
        for (k, v) in extra {
            config = config.with_option(*k, *v);
        }
        TokenFileAuth::new(config).unwrap()
    }

    #[tokio::test]
    async fn test_lookup_self_request() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "s.file-token\n").unwrap();

        let auth = auth_for(&path, &[]);
        let request = auth.authenticate().await.unwrap();

        assert_eq!(request.path, "auth/token/lookup-self");
        assert_eq!(request.headers[TOKEN_HEADER], "s.file-token");
        assert_eq!(request.data["token"], "s.file-token");
    }

    #[tokio::test]
    async fn test_cache_used_after_removal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "s.once").unwrap();

        let auth = auth_for(&path, &[("remove_after_reading", "true")]);
        auth.authenticate().await.unwrap();
        auth.credential_success_ack();
        assert!(!path.exists());

        let request = auth.authenticate().await.unwrap();
        assert_eq!(request.data["token"], "s.once");
    }

    #[tokio::test]
    async fn test_no_file_no_cache() {
        let dir = TempDir::new().unwrap();
        let auth = auth_for(&dir.path().join("missing"), &[]);

        let err = auth.authenticate().await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_notice_without_watch_interval() {
        let dir = TempDir::new().unwrap();
        let auth = auth_for(&dir.path().join("token"), &[]);
        assert!(auth.new_credential_notice().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watcher_signals_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("token");
        std::fs::write(&path, "s.one").unwrap();

        let auth = auth_for(&path, &[("watch_interval", "1s")]);
        let mut notice = auth.new_credential_notice().unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!notice.has_changed().unwrap());

        std::fs::write(&path, "s.two").unwrap();
        tokio::time::timeout(Duration::from_secs(5), notice.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*notice.borrow_and_update(), 1);

        auth.shutdown().await;
    }

    #[test]
    fn test_parse_interval() {
        assert_eq!(parse_interval("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_interval("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_interval("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_interval("1ms").unwrap(), MIN_WATCH_INTERVAL);
        assert!(parse_interval("soon").is_err());
        assert!(matches!(
            parse_interval(&format!("{}m", u64::MAX)),
            Err(VaultError::InvalidConfig(_))
        ));
    }
}
