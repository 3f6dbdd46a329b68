use std::time::{Duration, Instant};

/// Throttles progress reporting and computes the short-term transfer rate.
pub struct ProgressTracker {
    total: u64,
    interval: Duration,
    start: Instant,
    last_update: Instant,
    last_bytes: u64,
}

impl ProgressTracker {
    pub fn new(total: u64, interval: Duration) -> Self {
        let interval = if interval.is_zero() {
            Duration::from_millis(100)
        } else {
            interval
        };
        let now = Instant::now();
        Self {
            total,
            interval,
            start: now,
            last_update: now,
            last_bytes: 0,
        }
    }

    pub fn total(&self) -> u64 {
        self.total
    }

    /// Returns the bytes-per-second rate when an update is due, or `None`
    /// while inside the minimum spacing window.
    pub fn update(&mut self, transferred: u64) -> Option<f64> {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        if elapsed < self.interval {
            return None;
        }
        let rate = (transferred.saturating_sub(self.last_bytes)) as f64 / elapsed.as_secs_f64();
        self.last_update = now;
        self.last_bytes = transferred;
        Some(rate)
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn updates_are_spaced() {
        let mut tracker = ProgressTracker::new(100, Duration::from_millis(20));
        assert!(tracker.update(10).is_none());
        thread::sleep(Duration::from_millis(25));
        let rate = tracker.update(60).expect("update due");
        assert!(rate > 0.0);
        assert!(tracker.update(70).is_none());
    }
}
