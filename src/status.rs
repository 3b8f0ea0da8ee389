use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Instant;
use vault_client::Credential;

/// Auth handler state as reported by [`AgentStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerState {
    #[default]
    Init,
    LoggingIn,
    Authenticated,
    Renewing,
    Stopping,
    FailedPermanent,
}

impl HandlerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            HandlerState::Init => "init",
            HandlerState::LoggingIn => "logging_in",
            HandlerState::Authenticated => "authenticated",
            HandlerState::Renewing => "renewing",
            HandlerState::Stopping => "stopping",
            HandlerState::FailedPermanent => "failed_permanent",
        }
    }
}

impl fmt::Display for HandlerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Delivery health of one sink.
#[derive(Debug, Clone)]
pub struct SinkHealth {
    pub name: String,
    pub healthy: bool,
    /// Credentials written so far.
    pub delivered: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
    pub last_delivered_at: Option<Instant>,
}

impl SinkHealth {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            healthy: true,
            delivered: 0,
            consecutive_failures: 0,
            last_error: None,
            last_delivered_at: None,
        }
    }
}

/// Point-in-time view of the agent.
#[derive(Debug, Clone, Default)]
pub struct AgentStatus {
    pub state: HandlerState,
    pub last_error: Option<String>,
    /// `None` before the first login and for non-expiring credentials.
    pub credential_expiry: Option<Instant>,
    pub credential_issued_at: Option<Instant>,
    pub sink_health: Vec<SinkHealth>,
    pub running: bool,
}

/// Shared, lock-free-to-read status snapshot.
///
/// Writers are the handler and the sink workers; readers never wait on I/O.
#[derive(Debug, Clone)]
pub(crate) struct StatusBoard {
    tx: Arc<watch::Sender<AgentStatus>>,
}

impl StatusBoard {
    pub(crate) fn new<I, S>(sink_names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let status = AgentStatus {
            sink_health: sink_names.into_iter().map(SinkHealth::new).collect(),
            ..AgentStatus::default()
        };
        let (tx, _) = watch::channel(status);
        Self { tx: Arc::new(tx) }
    }

    pub(crate) fn snapshot(&self) -> AgentStatus {
        self.tx.borrow().clone()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.tx.subscribe()
    }

    pub(crate) fn set_state(&self, state: HandlerState) {
        self.tx.send_if_modified(|s| {
            let changed = s.state != state;
            s.state = state;
            changed
        });
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.tx.send_modify(|s| s.running = running);
    }

    pub(crate) fn set_error(&self, error: impl Into<String>) {
        let error = error.into();
        self.tx.send_modify(|s| s.last_error = Some(error));
    }

    pub(crate) fn set_credential(&self, credential: &Credential) {
        self.tx.send_modify(|s| {
            s.credential_issued_at = Some(credential.issued_at);
            s.credential_expiry = credential.expires_at();
            s.last_error = None;
        });
    }

    pub(crate) fn update_sink(&self, index: usize, update: impl FnOnce(&mut SinkHealth)) {
        self.tx.send_modify(|s| {
            if let Some(health) = s.sink_health.get_mut(index) {
                update(health);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_credential_updates_expiry() {
        let board = StatusBoard::new(["file", "memory"]);
        board.set_error("boom");

        let credential = Credential::new("s.abc", Duration::from_secs(60), true);
        board.set_credential(&credential);

        let status = board.snapshot();
        assert_eq!(status.credential_issued_at, Some(credential.issued_at));
        assert_eq!(
            status.credential_expiry,
            Some(credential.issued_at + Duration::from_secs(60))
        );
        assert_eq!(status.last_error, None);
        assert_eq!(status.sink_health.len(), 2);
    }

    #[test]
    fn test_update_sink_ignores_unknown_index() {
        let board = StatusBoard::new(["only"]);
        board.update_sink(3, |h| h.healthy = false);
        board.update_sink(0, |h| h.delivered += 1);

        let status = board.snapshot();
        assert_eq!(status.sink_health[0].delivered, 1);
        assert!(status.sink_health[0].healthy);
    }
}
