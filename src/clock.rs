use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::Instant;

/// Monotonic time source.
///
/// Every wait in the agent goes through a `Clock` so tests can run on
/// tokio's paused clock.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Non-decreasing across calls.
    fn now(&self) -> Instant;

    async fn sleep_until(&self, deadline: Instant);

    /// Timer that fires at `deadline`.
    fn timer_at(&self, deadline: Instant) -> Timer;

    async fn sleep(&self, duration: Duration) {
        self.sleep_until(self.now() + duration).await
    }

    fn timer(&self, duration: Duration) -> Timer {
        self.timer_at(self.now() + duration)
    }

    fn since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

type TimerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// One-shot timer. A stopped or dropped timer never fires.
pub struct Timer {
    deadline: Instant,
    fut: Option<TimerFuture>,
}

impl Timer {
    pub fn new(deadline: Instant, fut: impl Future<Output = ()> + Send + 'static) -> Self {
        Self {
            deadline,
            fut: Some(Box::pin(fut)),
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn is_armed(&self) -> bool {
        self.fut.is_some()
    }

    /// Resolves when the deadline passes. Pending forever once stopped.
    pub async fn fired(&mut self) {
        match self.fut.as_mut() {
            Some(fut) => {
                fut.await;
                self.fut = None;
            }
            None => std::future::pending().await,
        }
    }

    pub fn stop(&mut self) {
        self.fut = None;
    }
}

impl fmt::Debug for Timer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("deadline", &self.deadline)
            .field("armed", &self.is_armed())
            .finish()
    }
}

/// [`Clock`] backed by `tokio::time`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep_until(&self, deadline: Instant) {
        tokio::time::sleep_until(deadline).await
    }

    fn timer_at(&self, deadline: Instant) -> Timer {
        Timer::new(deadline, tokio::time::sleep_until(deadline))
    }
}
