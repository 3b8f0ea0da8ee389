use crate::clock::Clock;
use crate::error::AgentError;
use crate::handler::AuthHandler;
use crate::sink::SinkServer;
use crate::status::StatusBoard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Extra time granted to the sink server beyond its own flush grace.
const SINK_JOIN_SLACK: Duration = Duration::from_secs(1);

/// Owns the auth handler and the sink server for one agent run.
pub(crate) struct Supervisor {
    pub(crate) handler: AuthHandler,
    pub(crate) sink_server: SinkServer,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) status: StatusBoard,
    /// Cap on waiting for every sink after the first login, when exit-after-auth is on.
    pub(crate) exit_after_auth: Option<Duration>,
    /// Upper bound for the handler to revoke and stop.
    pub(crate) handler_grace: Duration,
    pub(crate) sink_grace: Duration,
}

enum Finished {
    Handler(Result<Result<(), AgentError>, JoinError>),
    ExitAfterAuth(Result<(), AgentError>),
}

impl Supervisor {
    /// Runs until `cancel` fires, the handler fails permanently, or
    /// exit-after-auth completes. Every task has stopped when this returns.
    pub(crate) async fn run(self, cancel: CancellationToken) -> Result<(), AgentError> {
        let (output, input) = watch::channel(None);
        let sinks = self.sink_server.len();
        let delivered = self.sink_server.delivered();
        let status = self.status.subscribe();

        let mut handler_task = tokio::spawn(self.handler.run(output, cancel.clone()));
        let mut sink_task = tokio::spawn(self.sink_server.run(input));

        let first = match self.exit_after_auth {
            Some(cap) => tokio::select! {
                joined = &mut handler_task => Finished::Handler(joined),
                result = wait_for_delivery(self.clock.as_ref(), status, delivered, sinks, cap) => {
                    Finished::ExitAfterAuth(result)
                }
            },
            None => Finished::Handler((&mut handler_task).await),
        };

        let mut result = match first {
            Finished::Handler(joined) => flatten(joined),
            Finished::ExitAfterAuth(result) => {
                match &result {
                    Ok(()) => info!("Credentials delivered to every sink; exiting"),
                    Err(err) => warn!(error = %err, "Exit after auth did not complete"),
                }
                cancel.cancel();
                let joined = join_within(self.clock.as_ref(), &mut handler_task, self.handler_grace).await;
                let stopped = match joined {
                    Some(joined) => flatten(joined),
                    None => Err(AgentError::ShutdownTimeout),
                };
                result.and(stopped)
            }
        };

        // Covers permanent failure, where nobody else cancels.
        cancel.cancel();

        match join_within(self.clock.as_ref(), &mut sink_task, self.sink_grace + SINK_JOIN_SLACK).await {
            Some(Ok(())) => debug!("Sink server stopped"),
            Some(Err(err)) => warn!(error = %err, "Sink server task failed"),
            None => {
                warn!("Sink server did not stop in time; aborting");
                if result.is_ok() {
                    result = Err(AgentError::ShutdownTimeout);
                }
            }
        }
        result
    }
}

/// Waits until the first credential has reached every sink, at most `cap` after the first login.
async fn wait_for_delivery(
    clock: &dyn Clock,
    mut status: watch::Receiver<crate::status::AgentStatus>,
    mut delivered: watch::Receiver<usize>,
    sinks: usize,
    cap: Duration,
) -> Result<(), AgentError> {
    let board_closed = status
        .wait_for(|s| s.credential_issued_at.is_some())
        .await
        .is_err();
    if board_closed {
        std::future::pending::<()>().await;
    }

    tokio::select! {
        closed = async { delivered.wait_for(|count| *count >= sinks).await.is_err() } => {
            if closed {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
        () = clock.sleep(cap) => Err(AgentError::ExitAfterAuthTimeout(cap)),
    }
}

/// Joins `handle` within `grace`, aborting it otherwise.
async fn join_within<T>(
    clock: &dyn Clock,
    handle: &mut JoinHandle<T>,
    grace: Duration,
) -> Option<Result<T, JoinError>> {
    tokio::select! {
        joined = &mut *handle => Some(joined),
        () = clock.sleep(grace) => {
            handle.abort();
            let _ = handle.await;
            None
        }
    }
}

fn flatten(joined: Result<Result<(), AgentError>, JoinError>) -> Result<(), AgentError> {
    joined.map_err(|e| AgentError::Internal(format!("auth handler task: {e}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backoff::BackoffConfig;
    use crate::clock::TokioClock;
    use crate::handler::HandlerConfig;
    use crate::sink::{Sink, SinkServerConfig, SinkSpec};
    use crate::testing::{FakeMethod, OffsetClock, RecordingSink, Reply, ScriptedClient};
    use tokio::sync::broadcast;
    use tokio::time::Instant;

    fn supervisor(
        client: ScriptedClient,
        sinks: &[Arc<RecordingSink>],
        exit_after_auth: Option<Duration>,
    ) -> (Supervisor, Arc<ScriptedClient>) {
        supervisor_with_clock(client, sinks, exit_after_auth, Arc::new(TokioClock))
    }

    fn supervisor_with_clock(
        client: ScriptedClient,
        sinks: &[Arc<RecordingSink>],
        exit_after_auth: Option<Duration>,
        clock: Arc<dyn Clock>,
    ) -> (Supervisor, Arc<ScriptedClient>) {
        let client = Arc::new(client);
        let status = StatusBoard::new(sinks.iter().map(|s| s.name().to_string()));
        let (events, _) = broadcast::channel(16);
        let handler = AuthHandler::new(
            Arc::new(FakeMethod::new()),
            client.clone(),
            clock.clone(),
            HandlerConfig {
                login_backoff: BackoffConfig::new(Duration::from_secs(1), Duration::from_secs(8)),
                ..HandlerConfig::default()
            },
            status.clone(),
            events,
        );
        let specs = sinks
            .iter()
            .map(|s| SinkSpec::new(s.clone() as Arc<dyn Sink>))
            .collect();
        let sink_server = SinkServer::new(
            specs,
            client.clone(),
            clock.clone(),
            SinkServerConfig::default(),
            status.clone(),
        );
        let supervisor = Supervisor {
            handler,
            sink_server,
            clock,
            status,
            exit_after_auth,
            handler_grace: Duration::from_secs(10),
            sink_grace: Duration::from_secs(5),
        };
        (supervisor, client)
    }

    fn assert_send<T: Send>(_: &T) {}

    #[test]
    fn test_run_future_is_send() {
        let sink = Arc::new(RecordingSink::new("s"));
        let (supervisor, _) = supervisor(
            ScriptedClient::new(),
            &[sink],
            Some(Duration::from_secs(1)),
        );
        let run = supervisor.run(CancellationToken::new());
        assert_send(&run);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_after_auth_waits_for_all_sinks() {
        let slow = Arc::new(RecordingSink::new("slow").with_delay(Duration::from_secs(3)));
        let fast = Arc::new(RecordingSink::new("fast"));
        let (supervisor, client) = supervisor(
            ScriptedClient::new(),
            &[slow.clone(), fast.clone()],
            Some(Duration::from_secs(120)),
        );

        let start = Instant::now();
        supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(3));
        assert_eq!(slow.tokens().len(), 1);
        assert_eq!(fast.tokens().len(), 1);
        assert_eq!(client.revoked().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_with_clock_ahead_of_tokio() {
        let sink = Arc::new(RecordingSink::new("s"));
        let (supervisor, _) = supervisor_with_clock(
            ScriptedClient::new(),
            &[sink.clone()],
            Some(Duration::from_secs(120)),
            Arc::new(OffsetClock(Duration::from_secs(3600))),
        );

        let start = Instant::now();
        supervisor.run(CancellationToken::new()).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert_eq!(sink.tokens(), vec!["s.login-0".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_after_auth_cap() {
        let stuck = Arc::new(RecordingSink::new("stuck").failing(u32::MAX));
        let (supervisor, _) = supervisor(
            ScriptedClient::new(),
            &[stuck.clone()],
            Some(Duration::from_secs(120)),
        );

        let start = Instant::now();
        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::ExitAfterAuthTimeout(_))));
        assert!(start.elapsed() >= Duration::from_secs(120));
        assert!(start.elapsed() <= Duration::from_secs(126));
        assert!(stuck.tokens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_failure_stops_everything() {
        let sink = Arc::new(RecordingSink::new("s"));
        let (supervisor, _) = supervisor(
            ScriptedClient::new().with_logins([Reply::Rejected, Reply::Rejected]),
            &[sink.clone()],
            None,
        );

        let result = supervisor.run(CancellationToken::new()).await;
        assert!(matches!(result, Err(AgentError::PermanentAuth(_))));
        assert!(sink.tokens().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_and_no_later_writes() {
        let sink = Arc::new(RecordingSink::new("s"));
        let (supervisor, client) = supervisor(
            ScriptedClient::new().with_login_fallback(Reply::grant(10)),
            &[sink.clone()],
            None,
        );
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor.run(cancel.clone()));

        tokio::time::sleep(Duration::from_secs(30)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let writes = sink.tokens().len();
        assert!(writes >= 2);
        assert_eq!(client.revoked().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(sink.tokens().len(), writes);
    }
}
