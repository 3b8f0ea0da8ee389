//! In-process fakes shared by the unit tests.

use crate::clock::{Clock, Timer};
use crate::error::SinkError;
use crate::sink::Sink;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use vault_client::auth::AuthMethod;
use vault_client::{AuthRequest, Credential, SessionClient, VaultError};

/// Scripted outcome of one client or method call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Reply {
    Grant { lease: u64, renewable: bool },
    Network,
    Server,
    Rejected,
    Malformed,
    Unavailable,
    InvalidConfig,
}

impl Reply {
    pub(crate) fn grant(lease: u64) -> Self {
        Reply::Grant {
            lease,
            renewable: true,
        }
    }

    fn error(self) -> VaultError {
        match self {
            Reply::Network => VaultError::Network("connection refused".into()),
            Reply::Server => VaultError::Server {
                status: 503,
                message: "sealed".into(),
            },
            Reply::Rejected => VaultError::Rejected {
                status: 400,
                message: "invalid credentials".into(),
            },
            Reply::Malformed => VaultError::Malformed("missing auth".into()),
            Reply::Unavailable => VaultError::CredentialUnavailable("token file empty".into()),
            Reply::InvalidConfig | Reply::Grant { .. } => {
                VaultError::InvalidConfig("bad method config".into())
            }
        }
    }

    fn into_credential(self, token: String) -> Result<Credential, VaultError> {
        match self {
            Reply::Grant { lease, renewable } => Ok(Credential::new(
                token,
                Duration::from_secs(lease),
                renewable,
            )
            .with_accessor("accessor")),
            other => Err(other.error()),
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap()
}

#[derive(Default)]
pub(crate) struct ScriptedClient {
    logins: Mutex<VecDeque<Reply>>,
    renewals: Mutex<VecDeque<Reply>>,
    login_fallback: Option<Reply>,
    revoke_delay: Option<Duration>,
    renew_delay: Option<Duration>,
    counter: AtomicUsize,
    login_calls: Mutex<Vec<Instant>>,
    renew_calls: Mutex<Vec<(Instant, Duration)>>,
    revoked: Mutex<Vec<String>>,
}

impl ScriptedClient {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_logins(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        lock(&self.logins).extend(replies);
        self
    }

    pub(crate) fn with_renewals(self, replies: impl IntoIterator<Item = Reply>) -> Self {
        lock(&self.renewals).extend(replies);
        self
    }

    /// Reply once the login script is exhausted. Defaults to a 60s renewable grant.
    pub(crate) fn with_login_fallback(mut self, reply: Reply) -> Self {
        self.login_fallback = Some(reply);
        self
    }

    pub(crate) fn with_revoke_delay(mut self, delay: Duration) -> Self {
        self.revoke_delay = Some(delay);
        self
    }

    /// Every renewal takes `delay` before it answers.
    pub(crate) fn with_renew_delay(mut self, delay: Duration) -> Self {
        self.renew_delay = Some(delay);
        self
    }

    pub(crate) fn login_calls(&self) -> Vec<Instant> {
        lock(&self.login_calls).clone()
    }

    pub(crate) fn renew_calls(&self) -> Vec<(Instant, Duration)> {
        lock(&self.renew_calls).clone()
    }

    pub(crate) fn revoked(&self) -> Vec<String> {
        lock(&self.revoked).clone()
    }

    fn next_token(&self, prefix: &str) -> String {
        format!("s.{}-{}", prefix, self.counter.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl SessionClient for ScriptedClient {
    async fn authenticate(&self, _request: &AuthRequest) -> Result<Credential, VaultError> {
        lock(&self.login_calls).push(Instant::now());
        let reply = lock(&self.logins)
            .pop_front()
            .or(self.login_fallback)
            .unwrap_or(Reply::grant(60));
        reply.into_credential(self.next_token("login"))
    }

    async fn renew(
        &self,
        credential: &Credential,
        increment: Duration,
    ) -> Result<Credential, VaultError> {
        lock(&self.renew_calls).push((Instant::now(), increment));
        if let Some(delay) = self.renew_delay {
            tokio::time::sleep(delay).await;
        }
        let reply = lock(&self.renewals).pop_front().unwrap_or(Reply::Grant {
            lease: credential.lease_duration.as_secs(),
            renewable: true,
        });
        reply.into_credential(self.next_token("renew"))
    }

    async fn revoke(&self, credential: &Credential) -> Result<(), VaultError> {
        if let Some(delay) = self.revoke_delay {
            tokio::time::sleep(delay).await;
        }
        lock(&self.revoked).push(credential.token.expose().to_string());
        Ok(())
    }

    async fn wrap(&self, credential: &Credential, ttl: Duration) -> Result<Credential, VaultError> {
        Ok(Credential::new(
            format!("wrapped:{}", credential.token.expose()),
            ttl,
            false,
        ))
    }
}

#[derive(Default)]
pub(crate) struct FakeMethod {
    failures: Mutex<VecDeque<Reply>>,
    notice: Option<watch::Sender<u64>>,
    calls: AtomicUsize,
    acks: AtomicUsize,
    shutdowns: AtomicUsize,
}

impl FakeMethod {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn with_notice(mut self) -> Self {
        let (tx, _) = watch::channel(0);
        self.notice = Some(tx);
        self
    }

    /// Errors returned by the first calls, before requests are built.
    pub(crate) fn with_failures(self, failures: impl IntoIterator<Item = Reply>) -> Self {
        lock(&self.failures).extend(failures);
        self
    }

    pub(crate) fn bump_notice(&self) {
        if let Some(tx) = &self.notice {
            tx.send_modify(|n| *n += 1);
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub(crate) fn acks(&self) -> usize {
        self.acks.load(Ordering::SeqCst)
    }

    pub(crate) fn shutdowns(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AuthMethod for FakeMethod {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn authenticate(&self) -> Result<AuthRequest, VaultError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.failures).pop_front() {
            Some(reply) => Err(reply.error()),
            None => Ok(AuthRequest::new("auth/fake/login").with_field("password", "pw")),
        }
    }

    fn new_credential_notice(&self) -> Option<watch::Receiver<u64>> {
        self.notice.as_ref().map(watch::Sender::subscribe)
    }

    fn credential_success_ack(&self) {
        self.acks.fetch_add(1, Ordering::SeqCst);
    }

    async fn shutdown(&self) {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Sink that records every token it accepts.
pub(crate) struct RecordingSink {
    name: String,
    delay: Option<Duration>,
    fail_remaining: AtomicU32,
    attempts: AtomicUsize,
    writes: Mutex<Vec<(Instant, String)>>,
}

impl RecordingSink {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            delay: None,
            fail_remaining: AtomicU32::new(0),
            attempts: AtomicUsize::new(0),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Every write takes `delay` before it lands.
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// The first `n` writes fail.
    pub(crate) fn failing(self, n: u32) -> Self {
        self.fail_remaining.store(n, Ordering::SeqCst);
        self
    }

    pub(crate) fn tokens(&self) -> Vec<String> {
        lock(&self.writes).iter().map(|(_, t)| t.clone()).collect()
    }

    pub(crate) fn write_times(&self) -> Vec<Instant> {
        lock(&self.writes).iter().map(|(at, _)| *at).collect()
    }

    pub(crate) fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for RecordingSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn write(&self, credential: &Credential) -> Result<(), SinkError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SinkError::Rejected("disk full".into()));
        }
        lock(&self.writes).push((Instant::now(), credential.token.expose().to_string()));
        Ok(())
    }
}

/// Monotonic clock running a fixed offset ahead of tokio's clock.
#[derive(Debug)]
pub(crate) struct OffsetClock(pub(crate) Duration);

impl OffsetClock {
    fn tokio_deadline(&self, deadline: Instant) -> Instant {
        deadline.checked_sub(self.0).unwrap_or_else(Instant::now)
    }
}

#[async_trait]
impl Clock for OffsetClock {
    fn now(&self) -> Instant {
        Instant::now() + self.0
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(self.tokio_deadline(deadline)).await
    }

    fn timer_at(&self, deadline: Instant) -> Timer {
        Timer::new(deadline, tokio::time::sleep_until(self.tokio_deadline(deadline)))
    }
}
