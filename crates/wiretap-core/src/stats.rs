//! Periodic throughput accumulator (spec.md §4.9), mirroring `GorStat`.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// A point-in-time copy of [`Stats`]'s counters, suitable for structured
/// logging (spec.md's `--stats` flag).
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub name: String,
    pub latest: i64,
    pub mean: i64,
    pub max: i64,
    pub count: u64,
}

/// Accumulates per-interval sample counts and reports latest/mean/max.
///
/// Each call to [`Stats::track`] adds to the current interval's running
/// total; [`Stats::tick`] rolls that total into `latest`/`mean`/`max` and
/// resets the counter, the way the reference's background goroutine polls
/// on a fixed-duration ticker.
pub struct Stats {
    name: &'static str,
    current: AtomicI64,
    latest: AtomicI64,
    mean: AtomicI64,
    max: AtomicI64,
    count: AtomicU64,
}

impl Stats {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            current: AtomicI64::new(0),
            latest: AtomicI64::new(0),
            mean: AtomicI64::new(0),
            max: AtomicI64::new(0),
            count: AtomicU64::new(0),
        }
    }

    pub fn track(&self, n: i64) {
        self.current.fetch_add(n, Ordering::Relaxed);
    }

    /// Rolls the current interval's total into the running statistics.
    pub fn tick(&self) {
        let latest = self.current.swap(0, Ordering::Relaxed);
        self.latest.store(latest, Ordering::Relaxed);
        if latest > self.max.load(Ordering::Relaxed) {
            self.max.store(latest, Ordering::Relaxed);
        }
        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        let prev_mean = self.mean.load(Ordering::Relaxed);
        let new_mean = prev_mean + (latest - prev_mean) / count as i64;
        self.mean.store(new_mean, Ordering::Relaxed);
    }

    pub fn latest(&self) -> i64 {
        self.latest.load(Ordering::Relaxed)
    }

    pub fn mean(&self) -> i64 {
        self.mean.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> i64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            name: self.name.to_string(),
            latest: self.latest(),
            mean: self.mean(),
            max: self.max(),
            count: self.count.load(Ordering::Relaxed),
        }
    }

    pub fn report(&self) -> String {
        format!(
            "{}: latest: {}, mean: {}, max: {}, count: {}",
            self.name,
            self.latest(),
            self.mean(),
            self.max(),
            self.count.load(Ordering::Relaxed)
        )
    }
}

/// Interval between `tick()` calls in the emitter's background reporter.
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_latest_mean_and_max() {
        let s = Stats::new("test");
        s.track(10);
        s.tick();
        s.track(20);
        s.tick();
        assert_eq!(s.latest(), 20);
        assert_eq!(s.max(), 20);
        assert_eq!(s.mean(), 15);
    }

    #[test]
    fn empty_interval_reports_zero() {
        let s = Stats::new("idle");
        s.tick();
        assert_eq!(s.latest(), 0);
    }
}
