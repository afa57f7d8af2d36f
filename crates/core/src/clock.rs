// Engine wall clock

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Wall clock driven by the tokio timer
///
/// Anchored to `Utc::now()` once and advanced with tokio's monotonic clock,
/// so cursor timestamps and timer sleeps always agree (also under a paused
/// test runtime).
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    wall: DateTime<Utc>,
    mono: tokio::time::Instant,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            wall: Utc::now(),
            mono: tokio::time::Instant::now(),
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.wall + chrono::Duration::from_std(self.mono.elapsed()).unwrap_or_default()
    }

    /// Time left until `at`, zero when already past
    pub fn until(&self, at: DateTime<Utc>) -> Duration {
        (at - self.now()).to_std().unwrap_or(Duration::ZERO)
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_follows_paused_time() {
        let clock = Clock::new();
        let start = clock.now();
        tokio::time::advance(Duration::from_secs(90)).await;
        assert_eq!(clock.now() - start, chrono::Duration::seconds(90));
        assert_eq!(clock.until(start + chrono::Duration::seconds(100)), Duration::from_secs(10));
        assert_eq!(clock.until(start), Duration::ZERO);
    }
}
