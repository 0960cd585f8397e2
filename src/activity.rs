//! Shared clock of the most recent request.
//!
//! Sessions and pools touch the clock for every request. Shutdown paths
//! wait on it until traffic has been quiet for a grace period.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio::time::{self, Duration, Instant};

/// Cheaply cloneable record of when the last request was seen.
#[derive(Clone, Debug)]
pub struct ActivityClock {
    epoch: Instant,
    last_ms: Arc<AtomicU64>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self {
            epoch: Instant::now(),
            last_ms: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl ActivityClock {
    /// Create a clock that considers "now" the last activity.
    #[must_use]
    pub fn new() -> Self { Self::default() }

    /// Record activity now.
    pub fn touch(&self) {
        let elapsed = u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.last_ms.fetch_max(elapsed, Ordering::AcqRel);
    }

    /// Time since the last recorded activity.
    #[must_use]
    pub fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_ms.load(Ordering::Acquire));
        self.epoch.elapsed().saturating_sub(last)
    }

    /// Wait until no activity has been recorded for `grace`.
    pub async fn wait_idle(&self, grace: Duration) {
        loop {
            let idle = self.idle();
            if idle >= grace {
                return;
            }
            time::sleep(grace - idle).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::{self, Duration, Instant};

    use super::ActivityClock;

    #[tokio::test(start_paused = true)]
    async fn wait_idle_extends_with_activity() {
        let clock = ActivityClock::new();
        let start = Instant::now();
        let toucher = {
            let clock = clock.clone();
            tokio::spawn(async move {
                time::sleep(Duration::from_secs(3)).await;
                clock.touch();
            })
        };
        clock.wait_idle(Duration::from_secs(5)).await;
        toucher.await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(8));
        assert!(clock.idle() >= Duration::from_secs(5));
    }
}
