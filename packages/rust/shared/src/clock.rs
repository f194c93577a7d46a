//! Time source abstraction for waits that must be testable without real sleeping.
//!
//! Production code uses [`WallClock`]. Tests use [`ManualClock`], where a
//! sleep advances virtual time instantly and is recorded for assertions.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Clock trait
// ---------------------------------------------------------------------------

/// Monotonic time plus an awaitable sleep.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current instant (monotonic).
    fn now(&self) -> Instant;

    /// Suspend for the given duration.
    async fn sleep(&self, duration: Duration);

    /// Elapsed duration since a previous instant.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Sleep unless cancelled first. Returns `true` when the full duration elapsed.
pub async fn sleep_or_cancel(
    clock: &dyn Clock,
    duration: Duration,
    cancel: &CancellationToken,
) -> bool {
    if cancel.is_cancelled() {
        return false;
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        _ = clock.sleep(duration) => true,
    }
}

// ---------------------------------------------------------------------------
// WallClock
// ---------------------------------------------------------------------------

/// Production clock backed by `Instant::now()` and `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

#[async_trait]
impl Clock for WallClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Virtual clock: sleeping advances time immediately.
#[derive(Debug, Clone)]
pub struct ManualClock {
    anchor: Instant,
    state: Arc<Mutex<ManualState>>,
}

#[derive(Debug, Default)]
struct ManualState {
    elapsed: Duration,
    sleeps: Vec<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            anchor: Instant::now(),
            state: Arc::new(Mutex::new(ManualState::default())),
        }
    }

    /// Advance virtual time without recording a sleep.
    pub fn advance(&self, by: Duration) {
        self.lock().elapsed += by;
    }

    /// Every sleep requested so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.lock().sleeps.clone()
    }

    /// Total virtual time elapsed.
    pub fn elapsed(&self) -> Duration {
        self.lock().elapsed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.anchor + self.lock().elapsed
    }

    async fn sleep(&self, duration: Duration) {
        {
            let mut state = self.lock();
            state.elapsed += duration;
            state.sleeps.push(duration);
        }
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn manual_clock_advances_on_sleep() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.sleep(Duration::from_secs(15)).await;
        clock.sleep(Duration::from_secs(30)).await;
        assert_eq!(clock.elapsed_since(start), Duration::from_secs(45));
        assert_eq!(
            clock.sleeps(),
            vec![Duration::from_secs(15), Duration::from_secs(30)]
        );
    }

    #[tokio::test]
    async fn sleep_or_cancel_completes_when_not_cancelled() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        assert!(sleep_or_cancel(&clock, Duration::from_secs(2), &cancel).await);
        assert_eq!(clock.elapsed(), Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sleep_or_cancel_stops_when_cancelled() {
        let clock = ManualClock::new();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!sleep_or_cancel(&clock, Duration::from_secs(2), &cancel).await);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn wall_clock_sleep_is_interruptible() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let completed = sleep_or_cancel(&WallClock, Duration::from_secs(3600), &cancel).await;
        assert!(!completed);
    }
}
