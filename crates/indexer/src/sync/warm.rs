//! Proactive warm scheduling state.
//!
//! One [`WarmScheduler`] is owned by the engine and shared by handle. Admission
//! is decided synchronously inside [`WarmScheduler::try_begin`], so no other
//! task can interleave between checking and claiming the in-flight flag.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// In-flight flag plus time of the last completed warm run.
#[derive(Debug)]
pub struct WarmScheduler {
    in_flight: AtomicBool,
    /// Milliseconds since `origin` at which the last run completed, 0 = never.
    last_completed_ms: AtomicU64,
    origin: Instant,
    cooldown: Duration,
}

impl WarmScheduler {
    /// Create a scheduler with the given cooldown.
    pub fn new(cooldown: Duration) -> Self {
        Self {
            in_flight: AtomicBool::new(false),
            last_completed_ms: AtomicU64::new(0),
            origin: Instant::now(),
            cooldown,
        }
    }

    /// Cooldown between the end of one run and the start of the next.
    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    fn elapsed_ms(&self) -> u64 {
        // Offset by one so a run completing at the origin instant is not "never".
        self.origin.elapsed().as_millis() as u64 + 1
    }

    /// Claim the right to run a warm.
    ///
    /// Returns `None` when a run is already in flight or the cooldown since the
    /// last completed run has not elapsed. The returned permit records the
    /// completion time and releases the flag when dropped.
    pub fn try_begin(self: &Arc<Self>) -> Option<WarmPermit> {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }

        let last = self.last_completed_ms.load(Ordering::Acquire);
        if last != 0 {
            let since = self.elapsed_ms().saturating_sub(last);
            if since < self.cooldown.as_millis() as u64 {
                self.in_flight.store(false, Ordering::Release);
                return None;
            }
        }

        Some(WarmPermit {
            scheduler: Arc::clone(self),
        })
    }
}

/// Proof that the holder is the single in-flight warm run.
#[derive(Debug)]
pub struct WarmPermit {
    scheduler: Arc<WarmScheduler>,
}

impl Drop for WarmPermit {
    fn drop(&mut self) {
        let now = self.scheduler.elapsed_ms();
        self.scheduler.last_completed_ms.store(now, Ordering::Release);
        self.scheduler.in_flight.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_single_run_in_flight() {
        let scheduler = Arc::new(WarmScheduler::new(Duration::from_secs(60)));

        let permit = scheduler.try_begin();
        assert!(permit.is_some());
        assert!(scheduler.is_running());
        assert!(scheduler.try_begin().is_none());

        drop(permit);
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_after_completion() {
        let scheduler = Arc::new(WarmScheduler::new(Duration::from_secs(60)));

        drop(scheduler.try_begin());
        assert!(scheduler.try_begin().is_none());
        // A rejected attempt leaves the flag clear.
        assert!(!scheduler.is_running());

        tokio::time::advance(Duration::from_secs(59)).await;
        assert!(scheduler.try_begin().is_none());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(scheduler.try_begin().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cooldown_counts_from_completion_not_start() {
        let scheduler = Arc::new(WarmScheduler::new(Duration::from_secs(60)));

        let permit = scheduler.try_begin();
        tokio::time::advance(Duration::from_secs(90)).await;
        drop(permit);

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(scheduler.try_begin().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_run_is_not_delayed() {
        let scheduler = Arc::new(WarmScheduler::new(Duration::from_secs(3600)));
        assert!(scheduler.try_begin().is_some());
    }
}
