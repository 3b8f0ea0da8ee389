use crate::config::{AgentConfig, AgentConfigBuilder};
use crate::error::AgentError;
use crate::handler::{AuthHandler, Event};
use crate::sink::{MemorySink, SinkServer};
use crate::status::{AgentStatus, HandlerState, StatusBoard};
use crate::supervisor::Supervisor;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, Instrument};

const EVENT_CAPACITY: usize = 64;

/// How a supervisor run ended. Cloneable so every waiter can observe it.
#[derive(Debug, Clone)]
enum RunOutcome {
    Completed,
    PermanentAuth(String),
    ExitAfterAuthTimeout(Duration),
    ShutdownTimeout,
    Failed(String),
}

impl RunOutcome {
    fn from_result(result: &Result<(), AgentError>) -> Self {
        match result {
            Ok(()) => RunOutcome::Completed,
            Err(AgentError::PermanentAuth(reason)) => RunOutcome::PermanentAuth(reason.clone()),
            Err(AgentError::ExitAfterAuthTimeout(cap)) => RunOutcome::ExitAfterAuthTimeout(*cap),
            Err(AgentError::ShutdownTimeout) => RunOutcome::ShutdownTimeout,
            Err(other) => RunOutcome::Failed(other.to_string()),
        }
    }

    fn into_result(self) -> Result<(), AgentError> {
        match self {
            RunOutcome::Completed => Ok(()),
            RunOutcome::PermanentAuth(reason) => Err(AgentError::PermanentAuth(reason)),
            RunOutcome::ExitAfterAuthTimeout(cap) => Err(AgentError::ExitAfterAuthTimeout(cap)),
            RunOutcome::ShutdownTimeout => Err(AgentError::ShutdownTimeout),
            RunOutcome::Failed(reason) => Err(AgentError::Internal(reason)),
        }
    }
}

/// The embeddable agent.
///
/// ```no_run
/// # async fn run() -> Result<(), vault_agent::AgentError> {
/// let config = vault_agent::AgentConfig::builder()
///     .file_config(r#"{"auto_auth": {"method": {"type": "token_file",
///         "config": {"token_file_path": "/run/token"}}}}"#.parse()?)
///     .build()?;
/// let agent = vault_agent::Agent::new(config);
/// agent.start().await?;
/// println!("{:?}", agent.status().state);
/// agent.stop().await?;
/// # Ok(())
/// # }
/// ```
pub struct Agent {
    status: StatusBoard,
    events: broadcast::Sender<Event>,
    memory_sinks: HashMap<String, Arc<MemorySink>>,
    pending: Mutex<Option<AgentConfig>>,
    cancel: CancellationToken,
    outcome: Arc<watch::Sender<Option<RunOutcome>>>,
}

impl Agent {
    pub fn new(mut config: AgentConfig) -> Self {
        let status = StatusBoard::new(config.sink_names());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let memory_sinks = std::mem::take(&mut config.memory_sinks);
        let (outcome, _) = watch::channel(None);
        Self {
            status,
            events,
            memory_sinks,
            pending: Mutex::new(Some(config)),
            cancel: CancellationToken::new(),
            outcome: Arc::new(outcome),
        }
    }

    /// Validates `builder` and starts the resulting agent.
    pub async fn start_with(builder: AgentConfigBuilder) -> Result<Self, AgentError> {
        let agent = Agent::new(builder.build()?);
        agent.start().await?;
        Ok(agent)
    }

    /// Starts the supervisor and waits for the first credential.
    ///
    /// Calling it again on a running agent only repeats the wait. Fails with
    /// [`AgentError::PermanentAuth`] if login gives up first, and with
    /// [`AgentError::AlreadyStopped`] after [`stop`](Self::stop).
    pub async fn start(&self) -> Result<(), AgentError> {
        {
            let mut pending = lock(&self.pending);
            if self.cancel.is_cancelled() {
                return Err(AgentError::AlreadyStopped);
            }
            if let Some(config) = pending.take() {
                self.spawn(config);
            }
        }

        let mut status = self.status.subscribe();
        let mut outcome = self.outcome.subscribe();
        tokio::select! {
            seen = status.wait_for(|s| {
                s.credential_issued_at.is_some() || s.state == HandlerState::FailedPermanent
            }) => {
                let Ok(seen) = seen else {
                    return Err(AgentError::Internal("status board closed".into()));
                };
                if seen.state == HandlerState::FailedPermanent {
                    let reason = seen.last_error.clone().unwrap_or_default();
                    return Err(AgentError::PermanentAuth(reason));
                }
                Ok(())
            }
            finished = outcome.wait_for(Option::is_some) => match finished {
                Ok(finished) => finished.clone().map_or(Ok(()), RunOutcome::into_result),
                Err(_) => Err(AgentError::Internal("agent task vanished".into())),
            },
        }
    }

    fn spawn(&self, config: AgentConfig) {
        let method = config.method_name();
        let supervisor = Supervisor {
            handler_grace: config.handler.revoke_timeout + config.shutdown_grace,
            sink_grace: config.shutdown_grace,
            exit_after_auth: config
                .exit_after_auth
                .then_some(config.exit_after_auth_timeout),
            handler: AuthHandler::new(
                config.method,
                config.client.clone(),
                config.clock.clone(),
                config.handler,
                self.status.clone(),
                self.events.clone(),
            ),
            sink_server: SinkServer::new(
                config.sinks,
                config.client,
                config.clock.clone(),
                config.sink_server,
                self.status.clone(),
            ),
            clock: config.clock,
            status: self.status.clone(),
        };

        let status = self.status.clone();
        let outcome = self.outcome.clone();
        let cancel = self.cancel.clone();
        let span = tracing::info_span!("agent", method);
        status.set_running(true);
        info!(parent: &span, "Starting agent");
        tokio::spawn(
            async move {
                let result = supervisor.run(cancel).await;
                status.set_running(false);
                match &result {
                    Ok(()) => info!("Agent stopped"),
                    Err(err) => info!(error = %err, "Agent stopped with error"),
                }
                outcome.send_replace(Some(RunOutcome::from_result(&result)));
            }
            .instrument(span),
        );
    }

    /// Resolves when the agent finishes on its own or after [`stop`](Self::stop).
    pub async fn wait(&self) -> Result<(), AgentError> {
        if lock(&self.pending).is_some() {
            return Err(AgentError::NotStarted);
        }
        let mut outcome = self.outcome.subscribe();
        let finished = outcome
            .wait_for(Option::is_some)
            .await
            .map_err(|_| AgentError::Internal("agent task vanished".into()))?
            .clone();
        finished.map_or(Ok(()), RunOutcome::into_result)
    }

    /// Cancels everything and waits for shutdown. Safe to call repeatedly.
    ///
    /// Only a shutdown that overran its grace period is reported; how the run
    /// itself ended is available from [`wait`](Self::wait).
    pub async fn stop(&self) -> Result<(), AgentError> {
        self.cancel.cancel();
        if lock(&self.pending).take().is_some() {
            self.outcome.send_replace(Some(RunOutcome::Completed));
            return Ok(());
        }
        match self.wait().await {
            Err(AgentError::ShutdownTimeout) => Err(AgentError::ShutdownTimeout),
            _ => Ok(()),
        }
    }

    /// In-memory snapshot; never waits on I/O.
    pub fn status(&self) -> AgentStatus {
        self.status.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// A memory sink declared in the configuration file, by name.
    pub fn memory_sink(&self, name: &str) -> Option<Arc<MemorySink>> {
        self.memory_sinks.get(name).cloned()
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("status", &self.status.snapshot())
            .field("stopped", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
