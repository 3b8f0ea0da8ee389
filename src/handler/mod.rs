//! The auth handler: login, renewal and re-login of the agent's credential.

mod schedule;

use crate::backoff::{Backoff, BackoffConfig};
use crate::clock::Clock;
use crate::error::AgentError;
use crate::retry::{retry_event, sleep_or_cancel, ErrorKey, FailureStreak};
use crate::status::{HandlerState, StatusBoard};
use schedule::NextAction;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument};
use vault_client::auth::AuthMethod;
use vault_client::{Credential, ErrorClass, SessionClient, VaultError};

const DEFAULT_SAFETY_MARGIN: Duration = Duration::from_secs(1);
const REVOKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Credential lifecycle notifications.
#[derive(Debug, Clone)]
pub enum Event {
    CredentialAcquired(Credential),
    CredentialRenewed(Credential),
    CredentialLost(String),
    ShutdownRequested,
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    pub login_backoff: BackoffConfig,
    pub renew_backoff: BackoffConfig,
    /// Any login failure is terminal.
    pub exit_on_err: bool,
    /// Follow the method's new-credential notices.
    pub enable_reauth_on_new_credentials: bool,
    /// Requested lease extension; the current lease when unset.
    pub renew_increment: Option<Duration>,
    pub safety_margin: Duration,
    pub revoke_on_shutdown: bool,
    /// Skip revocation when less than this much lease is left.
    pub revoke_min_remaining: Duration,
    pub revoke_timeout: Duration,
    /// Response-wrap every login result with this TTL. Wrapped tokens are never renewed.
    pub wrap_ttl: Option<Duration>,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            login_backoff: BackoffConfig::LOGIN,
            renew_backoff: BackoffConfig::RENEW,
            exit_on_err: false,
            enable_reauth_on_new_credentials: false,
            renew_increment: None,
            safety_margin: DEFAULT_SAFETY_MARGIN,
            revoke_on_shutdown: true,
            revoke_min_remaining: Duration::ZERO,
            revoke_timeout: REVOKE_TIMEOUT,
            wrap_ttl: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Init,
    LoggingIn { rejected_before: bool },
    Authenticated,
    Renewing,
    Stopping,
    FailedPermanent(String),
}

/// Drives one credential through login, renewal and re-login.
///
/// Runs as a single task. The only inputs are the cancellation token and the
/// method's notice channel; the only outputs are the latest-wins credential
/// slot, the status board and the event stream.
pub struct AuthHandler {
    method: Arc<dyn AuthMethod>,
    client: Arc<dyn SessionClient>,
    clock: Arc<dyn Clock>,
    config: HandlerConfig,
    status: StatusBoard,
    events: broadcast::Sender<Event>,
}

impl AuthHandler {
    pub(crate) fn new(
        method: Arc<dyn AuthMethod>,
        client: Arc<dyn SessionClient>,
        clock: Arc<dyn Clock>,
        config: HandlerConfig,
        status: StatusBoard,
        events: broadcast::Sender<Event>,
    ) -> Self {
        Self {
            method,
            client,
            clock,
            config,
            status,
            events,
        }
    }

    /// Runs until cancelled or until login fails permanently.
    ///
    /// Dropping `output` on return closes the sink server's input.
    pub(crate) async fn run(
        self,
        output: watch::Sender<Option<Credential>>,
        cancel: CancellationToken,
    ) -> Result<(), AgentError> {
        let span = tracing::info_span!("auth_handler", method = self.method.name());
        let notice = if self.config.enable_reauth_on_new_credentials {
            self.method.new_credential_notice()
        } else {
            None
        };

        let mut task = HandlerTask {
            login_backoff: Backoff::new(self.config.login_backoff),
            renew_backoff: Backoff::new(self.config.renew_backoff),
            streak: FailureStreak::default(),
            current: None,
            notice,
            output,
            cancel,
            handler: self,
        };
        task.drive().instrument(span).await
    }
}

struct HandlerTask {
    handler: AuthHandler,
    login_backoff: Backoff,
    renew_backoff: Backoff,
    streak: FailureStreak,
    /// The one current credential. Sinks only ever see clones.
    current: Option<Credential>,
    notice: Option<watch::Receiver<u64>>,
    output: watch::Sender<Option<Credential>>,
    cancel: CancellationToken,
}

impl HandlerTask {
    async fn drive(&mut self) -> Result<(), AgentError> {
        let mut state = State::Init;
        loop {
            state = match state {
                State::Init => {
                    self.set_state(HandlerState::Init);
                    self.current = None;
                    self.login_backoff.reset();
                    State::LoggingIn {
                        rejected_before: false,
                    }
                }
                State::LoggingIn { rejected_before } => self.login(rejected_before).await,
                State::Authenticated => self.wait_for_deadline().await,
                State::Renewing => self.renew().await,
                State::Stopping => {
                    self.stop().await;
                    return Ok(());
                }
                State::FailedPermanent(reason) => {
                    self.fail(&reason).await;
                    return Err(AgentError::PermanentAuth(reason));
                }
            };
        }
    }

    async fn login(&mut self, rejected_before: bool) -> State {
        if self.cancel.is_cancelled() {
            return State::Stopping;
        }
        self.set_state(HandlerState::LoggingIn);

        let method = self.handler.method.clone();
        let client = self.handler.client.clone();
        let clock = self.handler.clock.clone();
        let wrap_ttl = self.handler.config.wrap_ttl;
        let attempt = async move {
            let request = method.authenticate().await?;
            let credential = client.authenticate(&request).await?.issued_at(clock.now());
            let credential = match wrap_ttl {
                Some(ttl) => client.wrap(&credential, ttl).await?.issued_at(clock.now()),
                None => credential,
            };
            Ok::<Credential, VaultError>(credential)
        };
        let result = tokio::select! {
            () = self.cancel.cancelled() => return State::Stopping,
            result = attempt => result,
        };

        match result {
            Ok(credential) => {
                self.handler.method.credential_success_ack();
                let failures = self.streak.clear();
                if failures > 0 {
                    info!(failures, "Login recovered");
                }
                self.login_backoff.reset();
                self.renew_backoff.reset();
                if let Some(notice) = self.notice.as_mut() {
                    notice.borrow_and_update();
                }
                info!(
                    lease_secs = credential.lease_duration.as_secs(),
                    renewable = credential.renewable,
                    "Authenticated"
                );
                self.publish(credential.clone());
                self.emit(Event::CredentialAcquired(credential));
                State::Authenticated
            }
            Err(err) => self.login_failed(err, rejected_before).await,
        }
    }

    async fn login_failed(&mut self, err: VaultError, rejected_before: bool) -> State {
        self.handler.status.set_error(err.to_string());

        if self.handler.config.exit_on_err {
            return State::FailedPermanent(format!("login failed with exit_on_err set: {err}"));
        }

        match err.class() {
            ErrorClass::Permanent => State::FailedPermanent(err.to_string()),
            ErrorClass::AuthRejected if rejected_before => {
                State::FailedPermanent(format!("login rejected twice: {err}"))
            }
            ErrorClass::AuthRejected => {
                warn!(error = %err, "Login rejected; retrying once");
                State::LoggingIn {
                    rejected_before: true,
                }
            }
            ErrorClass::Transient => {
                let wait = self.login_backoff.next();
                let key = if err.failure_kind().is_some() {
                    ErrorKey::LoginTransient
                } else {
                    ErrorKey::MethodUnavailable
                };
                let level = self.streak.record(key);
                retry_event!(
                    level,
                    error = %err,
                    backoff_ms = wait.as_millis() as u64,
                    consecutive_failures = self.streak.len(),
                    "Login failed; retrying"
                );
                if sleep_or_cancel(self.handler.clock.as_ref(), &self.cancel, wait).await {
                    State::Stopping
                } else {
                    State::LoggingIn {
                        rejected_before: false,
                    }
                }
            }
        }
    }

    async fn wait_for_deadline(&mut self) -> State {
        self.set_state(HandlerState::Authenticated);
        let Some(credential) = self.current.as_ref() else {
            return State::LoggingIn {
                rejected_before: false,
            };
        };

        let action = if self.handler.config.wrap_ttl.is_some() {
            NextAction::Idle
        } else {
            schedule::plan(credential, self.handler.config.safety_margin, rand::random())
        };
        let clock = self.handler.clock.clone();
        let (mut timer, next) = match action {
            NextAction::Idle => {
                debug!("Nothing to renew; idling");
                (None, State::Authenticated)
            }
            NextAction::Renew(at) => {
                debug!(in_ms = at.saturating_duration_since(clock.now()).as_millis() as u64, "Renewal scheduled");
                (Some(clock.timer_at(at)), State::Renewing)
            }
            NextAction::Relogin(at) => {
                debug!(in_ms = at.saturating_duration_since(clock.now()).as_millis() as u64, "Re-login scheduled");
                (Some(clock.timer_at(at)), State::LoggingIn { rejected_before: false })
            }
        };

        let fired = async {
            match timer.as_mut() {
                Some(timer) => timer.fired().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            () = self.cancel.cancelled() => State::Stopping,
            () = fired => next,
            () = next_notice(&mut self.notice) => {
                info!("New credentials available; re-authenticating");
                self.emit(Event::CredentialLost("new credentials available".into()));
                State::LoggingIn { rejected_before: false }
            }
        }
    }

    async fn renew(&mut self) -> State {
        self.set_state(HandlerState::Renewing);
        let Some(credential) = self.current.clone() else {
            return State::LoggingIn {
                rejected_before: false,
            };
        };
        let increment = self
            .handler
            .config
            .renew_increment
            .unwrap_or(credential.lease_duration);
        let deadline = schedule::renewal_deadline(&credential);
        let clock = self.handler.clock.clone();

        loop {
            let result = tokio::select! {
                () = self.cancel.cancelled() => return State::Stopping,
                () = clock.sleep_until(deadline) => {
                    warn!("Renewal still pending at the give-up point; logging in again");
                    self.emit(Event::CredentialLost("renewal did not complete in time".into()));
                    return State::LoggingIn {
                        rejected_before: false,
                    };
                }
                result = self.handler.client.renew(&credential, increment) => result,
            };

            let err = match result {
                Ok(renewed) if renewed.renewable => {
                    let renewed = renewed.issued_at(clock.now());
                    if renewed.lease_duration < credential.lease_duration {
                        debug!(
                            lease_secs = renewed.lease_duration.as_secs(),
                            previous_secs = credential.lease_duration.as_secs(),
                            "Renewal returned a shorter lease"
                        );
                    }
                    info!(lease_secs = renewed.lease_duration.as_secs(), "Renewed");
                    self.streak.clear();
                    self.renew_backoff.reset();
                    self.publish(renewed.clone());
                    self.emit(Event::CredentialRenewed(renewed));
                    return State::Authenticated;
                }
                Ok(_) => {
                    info!("Credential is no longer renewable; logging in again");
                    self.emit(Event::CredentialLost("credential no longer renewable".into()));
                    return State::LoggingIn {
                        rejected_before: false,
                    };
                }
                Err(err) => err,
            };

            self.handler.status.set_error(err.to_string());
            if !err.is_transient() {
                warn!(error = %err, "Renewal rejected; logging in again");
                self.emit(Event::CredentialLost(format!("renewal rejected: {err}")));
                return State::LoggingIn {
                    rejected_before: false,
                };
            }

            let now = clock.now();
            if now >= deadline || credential.is_expired(now) {
                warn!(error = %err, "Renewal kept failing close to expiry; logging in again");
                self.emit(Event::CredentialLost(format!("renewal failed: {err}")));
                return State::LoggingIn {
                    rejected_before: false,
                };
            }

            let wait = self.renew_backoff.next().min(deadline - now);
            let level = self.streak.record(ErrorKey::RenewTransient);
            retry_event!(
                level,
                error = %err,
                backoff_ms = wait.as_millis() as u64,
                consecutive_failures = self.streak.len(),
                "Renewal failed; retrying"
            );
            if sleep_or_cancel(clock.as_ref(), &self.cancel, wait).await {
                return State::Stopping;
            }
            if clock.now() >= deadline {
                warn!("Renewal window exhausted; logging in again");
                self.emit(Event::CredentialLost("renewal window exhausted".into()));
                return State::LoggingIn {
                    rejected_before: false,
                };
            }
        }
    }

    async fn stop(&mut self) {
        self.set_state(HandlerState::Stopping);
        self.emit(Event::ShutdownRequested);

        if let Some(credential) = self.current.take() {
            if self.should_revoke(&credential) {
                self.revoke(&credential).await;
            }
        }
        self.handler.method.shutdown().await;
        info!("Auth handler stopped");
    }

    fn should_revoke(&self, credential: &Credential) -> bool {
        let config = &self.handler.config;
        // A wrapping token cannot revoke itself.
        if !config.revoke_on_shutdown || config.wrap_ttl.is_some() {
            return false;
        }
        match credential.remaining(self.handler.clock.now()) {
            None => true,
            Some(remaining) if remaining.is_zero() => false,
            Some(remaining) => remaining >= config.revoke_min_remaining,
        }
    }

    async fn revoke(&self, credential: &Credential) {
        let cap = self.handler.config.revoke_timeout;
        tokio::select! {
            result = self.handler.client.revoke(credential) => match result {
                Ok(()) => info!("Credential revoked"),
                Err(err) => warn!(error = %err, "Failed to revoke credential"),
            },
            () = self.handler.clock.sleep(cap) => {
                warn!(timeout_ms = cap.as_millis() as u64, "Revocation timed out");
            }
        }
    }

    async fn fail(&mut self, reason: &str) {
        error!(reason, "Authentication failed permanently");
        self.handler.status.set_error(reason);
        self.set_state(HandlerState::FailedPermanent);
        self.emit(Event::CredentialLost(reason.to_string()));
        self.handler.method.shutdown().await;
    }

    fn publish(&mut self, credential: Credential) {
        self.handler.status.set_credential(&credential);
        self.output.send_replace(Some(credential.clone()));
        self.current = Some(credential);
    }

    fn emit(&self, event: Event) {
        // No subscribers is fine.
        let _ = self.handler.events.send(event);
    }

    fn set_state(&self, state: HandlerState) {
        self.handler.status.set_state(state);
    }
}

/// Resolves on the next notice. A closed channel never resolves again.
async fn next_notice(notice: &mut Option<watch::Receiver<u64>>) {
    let closed = match notice.as_mut() {
        Some(rx) => rx.changed().await.is_err(),
        None => true,
    };
    if closed {
        *notice = None;
        std::future::pending::<()>().await;
    }
}
