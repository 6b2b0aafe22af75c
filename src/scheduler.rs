//! Cancellable timers and retry backoff.
//!
//! Retry waits and scan windows are expressed as data ([`BackoffPolicy`]) and
//! realised with [`Scheduler::after`], so nothing in the crate chains timers
//! or polls.

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// How a [`Timer`] finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerOutcome {
    /// The full duration elapsed.
    Elapsed,
    /// The timer was cancelled first.
    Cancelled,
}

/// A one-shot, cancellable timer.
pub struct Timer {
    sleep: BoxFuture<'static, ()>,
    cancel: CancellationToken,
}

impl Timer {
    /// Create a timer from a sleep future.
    pub fn new(sleep: BoxFuture<'static, ()>) -> Self {
        Self {
            sleep,
            cancel: CancellationToken::new(),
        }
    }

    /// Tie this timer to a parent token: cancelling the parent cancels the timer.
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    /// Cancel the timer. Idempotent.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that cancels this timer.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Wait until the timer elapses or is cancelled.
    pub async fn wait(self) -> TimerOutcome {
        let Timer { sleep, cancel } = self;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => TimerOutcome::Cancelled,
            _ = sleep => TimerOutcome::Elapsed,
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

/// Source of timers.
pub trait Scheduler: Send + Sync {
    /// Create a timer that elapses after `duration`.
    fn after(&self, duration: Duration) -> Timer;
}

/// Scheduler backed by the tokio timer wheel.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn after(&self, duration: Duration) -> Timer {
        Timer::new(Box::pin(tokio::time::sleep(duration)))
    }
}

/// Delays between successive attempts.
///
/// The number of delays is the number of additional attempts allowed after
/// the first one fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    /// Wait before retry `n` (0-based).
    pub delays: Vec<Duration>,
}

impl BackoffPolicy {
    /// Policy that never retries.
    pub fn none() -> Self {
        Self { delays: Vec::new() }
    }

    /// Policy with explicit delays.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self { delays }
    }

    /// `retries` attempts with the same delay.
    pub fn fixed(retries: usize, delay: Duration) -> Self {
        Self {
            delays: vec![delay; retries],
        }
    }

    /// Maximum number of additional attempts.
    pub fn max_retries(&self) -> u32 {
        self.delays.len() as u32
    }

    /// Delay before retry number `retry` (1-based), if allowed.
    pub fn delay_before(&self, retry: u32) -> Option<Duration> {
        retry
            .checked_sub(1)
            .and_then(|i| self.delays.get(i as usize).copied())
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            delays: vec![Duration::from_secs(1), Duration::from_secs(2)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_timer_elapses() {
        let start = tokio::time::Instant::now();
        let outcome = TokioScheduler.after(Duration::from_secs(5)).wait().await;
        assert_eq!(outcome, TimerOutcome::Elapsed);
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_cancelled_by_parent() {
        let parent = CancellationToken::new();
        let timer = TokioScheduler
            .after(Duration::from_secs(60))
            .with_parent(&parent);

        let waiter = tokio::spawn(timer.wait());
        parent.cancel();

        assert_eq!(waiter.await.unwrap(), TimerOutcome::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent() {
        let timer = TokioScheduler.after(Duration::from_secs(60));
        timer.cancel();
        timer.cancel();
        assert_eq!(timer.wait().await, TimerOutcome::Cancelled);
    }

    #[test]
    fn test_backoff_policy() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.delay_before(0), None);
        assert_eq!(policy.delay_before(1), Some(Duration::from_secs(1)));
        assert_eq!(policy.delay_before(2), Some(Duration::from_secs(2)));
        assert_eq!(policy.delay_before(3), None);

        assert_eq!(BackoffPolicy::none().max_retries(), 0);
        assert_eq!(
            BackoffPolicy::fixed(3, Duration::from_millis(10)).delays.len(),
            3
        );
    }
}
