//! Shared helpers for the retry loops of the auth handler and the sink workers.

use crate::clock::Clock;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::Level;

/// Failures of one kind in a row that are still logged at WARN.
const LOUD_FAILURES: u32 = 3;

/// Failure categories tracked for log suppression.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ErrorKey {
    MethodUnavailable,
    LoginTransient,
    RenewTransient,
    SinkWrite,
}

/// A run of consecutive failures of the same kind.
///
/// Picks the level each failure is logged at: the first few of a run go out
/// at WARN, the rest at DEBUG so a long outage does not flood the log.
#[derive(Debug)]
pub(crate) struct FailureStreak {
    kind: Option<ErrorKey>,
    len: u32,
    loud: u32,
}

impl FailureStreak {
    pub(crate) fn new(loud: u32) -> Self {
        Self {
            kind: None,
            len: 0,
            loud,
        }
    }

    /// Extends the streak, or starts a new one for a different kind.
    pub(crate) fn record(&mut self, kind: ErrorKey) -> Level {
        if self.kind == Some(kind) {
            self.len = self.len.saturating_add(1);
        } else {
            self.kind = Some(kind);
            self.len = 1;
        }
        if self.len <= self.loud {
            Level::WARN
        } else {
            Level::DEBUG
        }
    }

    /// Ends the streak and returns how many failures it held.
    pub(crate) fn clear(&mut self) -> u32 {
        self.kind = None;
        std::mem::take(&mut self.len)
    }

    pub(crate) fn len(&self) -> u32 {
        self.len
    }
}

impl Default for FailureStreak {
    fn default() -> Self {
        Self::new(LOUD_FAILURES)
    }
}

/// Emits a retry event at a level chosen by [`FailureStreak::record`].
macro_rules! retry_event {
    ($level:expr, $($arg:tt)+) => {
        if $level == ::tracing::Level::WARN {
            ::tracing::warn!($($arg)+)
        } else {
            ::tracing::debug!($($arg)+)
        }
    };
}
pub(crate) use retry_event;

/// Sleeps for `dur` unless `token` is cancelled first. Returns `true` on cancellation.
pub(crate) async fn sleep_or_cancel(
    clock: &dyn Clock,
    token: &CancellationToken,
    dur: Duration,
) -> bool {
    tokio::select! {
        () = token.cancelled() => true,
        () = clock.sleep(dur) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;

    #[test]
    fn test_quiets_down_after_first_failures() {
        let mut streak = FailureStreak::default();
        let levels: Vec<Level> = (0..5)
            .map(|_| streak.record(ErrorKey::LoginTransient))
            .collect();
        assert_eq!(
            levels,
            vec![Level::WARN, Level::WARN, Level::WARN, Level::DEBUG, Level::DEBUG]
        );
        assert_eq!(streak.len(), 5);
    }

    #[test]
    fn test_new_kind_starts_new_streak() {
        let mut streak = FailureStreak::default();
        for _ in 0..4 {
            streak.record(ErrorKey::SinkWrite);
        }
        assert_eq!(streak.record(ErrorKey::RenewTransient), Level::WARN);
        assert_eq!(streak.len(), 1);

        assert_eq!(streak.clear(), 1);
        assert_eq!(streak.len(), 0);
        assert_eq!(streak.record(ErrorKey::RenewTransient), Level::WARN);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_or_cancel() {
        let token = CancellationToken::new();
        assert!(!sleep_or_cancel(&TokioClock, &token, Duration::from_secs(3)).await);

        let child = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            child.cancel();
        });
        let start = tokio::time::Instant::now();
        assert!(sleep_or_cancel(&TokioClock, &token, Duration::from_secs(60)).await);
        assert_eq!(start.elapsed(), Duration::from_secs(1));
    }
}
