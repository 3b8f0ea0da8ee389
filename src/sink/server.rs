use super::SinkSpec;
use crate::backoff::{Backoff, BackoffConfig};
use crate::clock::Clock;
use crate::error::SinkError;
use crate::retry::{retry_event, ErrorKey, FailureStreak};
use crate::status::StatusBoard;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};
use vault_client::{Credential, SessionClient};

const DEFAULT_FLUSH_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy)]
pub struct SinkServerConfig {
    /// Per-sink retry policy.
    pub backoff: BackoffConfig,
    /// How long workers may keep writing after the input closes.
    pub grace: Duration,
}

impl Default for SinkServerConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::SINK,
            grace: DEFAULT_FLUSH_GRACE,
        }
    }
}

/// Fans credentials out to every sink.
///
/// One dispatcher reads the handler's latest-wins slot and forwards into a
/// per-sink slot; one worker per sink drains its slot. A slow or failing sink
/// only ever holds the newest credential, so it may skip intermediate values
/// but never reorders them.
pub struct SinkServer {
    sinks: Vec<SinkSpec>,
    client: Arc<dyn SessionClient>,
    clock: Arc<dyn Clock>,
    config: SinkServerConfig,
    status: StatusBoard,
    delivered: Arc<watch::Sender<usize>>,
}

impl SinkServer {
    pub(crate) fn new(
        sinks: Vec<SinkSpec>,
        client: Arc<dyn SessionClient>,
        clock: Arc<dyn Clock>,
        config: SinkServerConfig,
        status: StatusBoard,
    ) -> Self {
        let (delivered, _) = watch::channel(0);
        Self {
            sinks,
            client,
            clock,
            config,
            status,
            delivered: Arc::new(delivered),
        }
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    /// Number of sinks that have received at least one credential.
    pub(crate) fn delivered(&self) -> watch::Receiver<usize> {
        self.delivered.subscribe()
    }

    /// Runs until `input` closes, then flushes within the grace period.
    ///
    /// Returns only once every worker has finished or been aborted, so no
    /// write happens after this future completes.
    pub(crate) async fn run(self, mut input: watch::Receiver<Option<Credential>>) {
        let mut workers = JoinSet::new();
        let mut feeds = Vec::with_capacity(self.sinks.len());

        for (index, spec) in self.sinks.into_iter().enumerate() {
            let (feed, rx) = watch::channel(None);
            feeds.push(feed);

            let span = spec.span.clone();
            let worker = SinkWorker {
                index,
                spec,
                client: self.client.clone(),
                clock: self.clock.clone(),
                backoff: Backoff::new(self.config.backoff),
                streak: FailureStreak::default(),
                status: self.status.clone(),
                delivered: self.delivered.clone(),
                last_issued: None,
            };
            workers.spawn(worker.run(rx).instrument(span));
        }

        while input.changed().await.is_ok() {
            let latest = input.borrow_and_update().clone();
            if let Some(credential) = latest {
                for feed in &feeds {
                    feed.send_replace(Some(credential.clone()));
                }
            }
        }
        drop(feeds);

        debug!(grace_ms = self.config.grace.as_millis() as u64, "Sink input closed, flushing");
        let flushed = tokio::select! {
            () = async { while workers.join_next().await.is_some() {} } => true,
            () = self.clock.sleep(self.config.grace) => false,
        };
        if !flushed {
            warn!(
                pending = workers.len(),
                "Sink flush did not finish within the grace period; abandoning"
            );
            workers.shutdown().await;
        }
    }
}

struct SinkWorker {
    index: usize,
    spec: SinkSpec,
    client: Arc<dyn SessionClient>,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    streak: FailureStreak,
    status: StatusBoard,
    delivered: Arc<watch::Sender<usize>>,
    last_issued: Option<Instant>,
}

impl SinkWorker {
    async fn run(mut self, mut feed: watch::Receiver<Option<Credential>>) {
        let mut pending: Option<Credential> = None;
        let mut closed = false;

        loop {
            let credential = match pending.take() {
                Some(credential) => credential,
                None => match feed.changed().await {
                    Ok(()) => match feed.borrow_and_update().clone() {
                        Some(credential) => credential,
                        None => continue,
                    },
                    Err(_) => break,
                },
            };

            if !self.accepts(&credential) {
                continue;
            }

            match self.deliver(&credential).await {
                Ok(()) => self.record_success(&credential),
                Err(err) => {
                    let wait = self.record_failure(&err);
                    pending = Some(credential);
                    if closed {
                        self.clock.sleep(wait).await;
                        continue;
                    }
                    tokio::select! {
                        changed = feed.changed() => match changed {
                            Ok(()) => {
                                if let Some(newer) = feed.borrow_and_update().clone() {
                                    pending = Some(newer);
                                }
                            }
                            Err(_) => {
                                closed = true;
                                self.clock.sleep(wait).await;
                            }
                        },
                        () = self.clock.sleep(wait) => {}
                    }
                }
            }
        }
        debug!(sink = %self.spec.name(), "Sink worker finished");
    }

    /// Drops expired credentials and anything older than what the sink already holds.
    fn accepts(&self, credential: &Credential) -> bool {
        if credential.is_expired(self.clock.now()) {
            debug!(sink = %self.spec.name(), "Skipping expired credential");
            return false;
        }
        if self
            .last_issued
            .is_some_and(|last| credential.issued_at < last)
        {
            debug!(sink = %self.spec.name(), "Skipping credential older than the last delivered one");
            return false;
        }
        true
    }

    async fn deliver(&self, credential: &Credential) -> Result<(), SinkError> {
        let prepared = self.spec.prepare(credential, self.client.as_ref()).await?;
        self.spec.sink.write(&prepared).await
    }

    fn record_success(&mut self, credential: &Credential) {
        let first = self.last_issued.is_none();
        self.last_issued = Some(credential.issued_at);

        let failures = self.streak.clear();
        if failures > 0 {
            info!(sink = %self.spec.name(), failures, "Sink recovered");
        }
        self.backoff.reset();

        let now = self.clock.now();
        self.status.update_sink(self.index, |health| {
            health.healthy = true;
            health.delivered += 1;
            health.consecutive_failures = 0;
            health.last_error = None;
            health.last_delivered_at = Some(now);
        });
        if first {
            self.delivered.send_modify(|count| *count += 1);
        }
        debug!(sink = %self.spec.name(), "Credential delivered");
    }

    fn record_failure(&mut self, err: &SinkError) -> Duration {
        let wait = self.backoff.next();
        let level = self.streak.record(ErrorKey::SinkWrite);
        let failures = self.streak.len();
        retry_event!(
            level,
            sink = %self.spec.name(),
            error = %err,
            backoff_ms = wait.as_millis() as u64,
            consecutive_failures = failures,
            "Sink write failed; retrying"
        );

        let message = err.to_string();
        self.status.update_sink(self.index, |health| {
            health.healthy = false;
            health.consecutive_failures = failures;
            health.last_error = Some(message);
        });
        wait
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::sink::Sink;
    use crate::testing::{RecordingSink, ScriptedClient};

    struct Harness {
        input: watch::Sender<Option<Credential>>,
        status: StatusBoard,
        delivered: watch::Receiver<usize>,
        task: tokio::task::JoinHandle<()>,
    }

    fn start(sinks: Vec<Arc<RecordingSink>>, config: SinkServerConfig) -> Harness {
        let specs = sinks
            .iter()
            .map(|s| SinkSpec::new(s.clone() as Arc<dyn Sink>))
            .collect();
        let status = StatusBoard::new(sinks.iter().map(|s| s.name().to_string()));
        let server = SinkServer::new(
            specs,
            Arc::new(ScriptedClient::default()),
            Arc::new(TokioClock),
            config,
            status.clone(),
        );
        let delivered = server.delivered();
        let (input, rx) = watch::channel(None);
        let task = tokio::spawn(server.run(rx));
        Harness {
            input,
            status,
            delivered,
            task,
        }
    }

    fn credential(token: &str, lease: u64) -> Credential {
        Credential::new(token, Duration::from_secs(lease), true)
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_sink_gets_latest_only() {
        let slow = Arc::new(RecordingSink::new("slow").with_delay(Duration::from_secs(20)));
        let fast = Arc::new(RecordingSink::new("fast"));
        let h = start(vec![slow.clone(), fast.clone()], SinkServerConfig::default());

        for (i, token) in ["t0", "t5", "t10"].iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            h.input.send_replace(Some(credential(token, 60)));
        }

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(fast.tokens(), vec!["t0", "t5", "t10"]);
        let slow_tokens = slow.tokens();
        assert_eq!(slow_tokens.last().map(String::as_str), Some("t10"));
        assert!(!slow_tokens.contains(&"t5".to_string()));

        drop(h.input);
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_sink_retries_without_blocking_others() {
        let flaky = Arc::new(RecordingSink::new("flaky").failing(3));
        let good = Arc::new(RecordingSink::new("good"));
        let h = start(vec![flaky.clone(), good.clone()], SinkServerConfig::default());

        h.input.send_replace(Some(credential("t0", 600)));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(good.tokens(), vec!["t0"]);
        assert!(flaky.tokens().is_empty());
        let status = h.status.snapshot();
        assert!(!status.sink_health[0].healthy);
        assert!(status.sink_health[0].last_error.is_some());

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(flaky.tokens(), vec!["t0"]);
        let status = h.status.snapshot();
        assert!(status.sink_health[0].healthy);
        assert_eq!(status.sink_health[0].delivered, 1);
        assert_eq!(*h.delivered.borrow(), 2);

        drop(h.input);
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_credentials_are_not_delivered() {
        let sink = Arc::new(RecordingSink::new("s").with_delay(Duration::from_secs(3)));
        let h = start(vec![sink.clone()], SinkServerConfig::default());

        h.input.send_replace(Some(credential("long", 60)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        // Arrives while the sink is busy and expires before it is free.
        h.input.send_replace(Some(credential("short", 2)));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.tokens(), vec!["long"]);

        drop(h.input);
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_older_credential_is_skipped() {
        let sink = Arc::new(RecordingSink::new("s"));
        let h = start(vec![sink.clone()], SinkServerConfig::default());

        let older = credential("older", 60);
        tokio::time::sleep(Duration::from_secs(1)).await;
        let newer = credential("newer", 60);

        h.input.send_replace(Some(newer));
        tokio::time::sleep(Duration::from_millis(10)).await;
        h.input.send_replace(Some(older));
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(sink.tokens(), vec!["newer"]);
        drop(h.input);
        h.task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_then_abort_after_grace() {
        let stuck = Arc::new(RecordingSink::new("stuck").failing(u32::MAX));
        let h = start(
            vec![stuck.clone()],
            SinkServerConfig {
                grace: Duration::from_secs(5),
                ..SinkServerConfig::default()
            },
        );
        h.input.send_replace(Some(credential("t", 600)));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let closed_at = Instant::now();
        drop(h.input);
        h.task.await.unwrap();
        assert!(closed_at.elapsed() <= Duration::from_secs(6));

        let attempts = stuck.attempts();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(stuck.attempts(), attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_value_flushed_on_close() {
        let sink = Arc::new(RecordingSink::new("s").with_delay(Duration::from_secs(1)));
        let h = start(vec![sink.clone()], SinkServerConfig::default());

        h.input.send_replace(Some(credential("first", 60)));
        tokio::time::sleep(Duration::from_millis(1)).await;
        h.input.send_replace(Some(credential("second", 60)));
        drop(h.input);

        h.task.await.unwrap();
        assert_eq!(sink.tokens(), vec!["first", "second"]);
    }
}
