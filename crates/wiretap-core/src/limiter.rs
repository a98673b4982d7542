//! Rate limiting decorator (spec.md §4.4).
//!
//! Wraps a [`Writer`](crate::plugin::Writer) and either drops writes past a
//! fixed rate, or — in percent mode — scales a shared `SpeedFactor` instead
//! of dropping, which is how `FileInput` throttles replay speed without
//! discarding messages (see `original_source/goreplay/core/limiter.go`).

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::error::PluginError;
use crate::message::Message;
use crate::plugin::Writer;

#[derive(Debug, Clone, Copy)]
pub enum Limit {
    /// Absolute requests-per-second ceiling.
    Absolute(u32),
    /// Percentage of traffic to pass through (0-100).
    Percent(u32),
}

impl std::str::FromStr for Limit {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(pct) = s.strip_suffix('%') {
            let v: u32 = pct.parse().map_err(|_| "invalid percent limit".to_string())?;
            Ok(Limit::Percent(v.min(100)))
        } else {
            let v: u32 = s.parse().map_err(|_| "invalid absolute limit".to_string())?;
            Ok(Limit::Absolute(v))
        }
    }
}

/// Shared knob that `FileInput` replay speed reads; percent-mode limiters
/// write to it instead of dropping messages outright.
#[derive(Clone, Default)]
pub struct SpeedFactor(Arc<AtomicU32>);

impl SpeedFactor {
    pub fn new(initial_percent: u32) -> Self {
        Self(Arc::new(AtomicU32::new(initial_percent)))
    }

    pub fn set(&self, percent: u32) {
        self.0.store(percent, Ordering::Relaxed);
    }

    pub fn get(&self) -> u32 {
        self.0.load(Ordering::Relaxed)
    }
}

struct AbsoluteCounter {
    window_start: Mutex<Instant>,
    count: AtomicI64,
}

/// Rolling one-second request counter for [`Limit::Absolute`].
impl AbsoluteCounter {
    fn new() -> Self {
        Self {
            window_start: Mutex::new(Instant::now()),
            count: AtomicI64::new(0),
        }
    }

    async fn allow(&self, max: u32) -> bool {
        let mut start = self.window_start.lock().await;
        if start.elapsed() >= Duration::from_secs(1) {
            *start = Instant::now();
            self.count.store(0, Ordering::Relaxed);
        }
        if self.count.load(Ordering::Relaxed) >= max as i64 {
            return false;
        }
        self.count.fetch_add(1, Ordering::Relaxed);
        true
    }
}

/// Decorates a [`Writer`], dropping writes according to `limit`.
///
/// When `speed_factor` is set (the `FileInput` replay path) and `limit` is
/// percent-mode, writes are never dropped: the factor is updated instead, and
/// the reader that owns it is expected to honor it when pacing replay.
pub struct RateLimiter<W> {
    inner: W,
    limit: Limit,
    counter: AbsoluteCounter,
    speed_factor: Option<SpeedFactor>,
}

impl<W> RateLimiter<W> {
    pub fn new(inner: W, limit: Limit) -> Self {
        Self {
            inner,
            limit,
            counter: AbsoluteCounter::new(),
            speed_factor: None,
        }
    }

    /// Builds the `FileInput` exception: percent-mode throttling steers
    /// `speed_factor` rather than dropping.
    pub fn with_speed_factor(inner: W, limit: Limit, speed_factor: SpeedFactor) -> Self {
        Self {
            inner,
            limit,
            counter: AbsoluteCounter::new(),
            speed_factor: Some(speed_factor),
        }
    }

    fn allow_percent(percent: u32) -> bool {
        percent >= 100 || (rand::random::<u32>() % 100) < percent
    }
}

#[async_trait]
impl<W: Writer> Writer for RateLimiter<W> {
    async fn write(&self, msg: &Message) -> Result<usize, PluginError> {
        match self.limit {
            Limit::Absolute(max) => {
                if !self.counter.allow(max).await {
                    return Ok(0);
                }
            }
            Limit::Percent(pct) => {
                if let Some(factor) = &self.speed_factor {
                    factor.set(pct);
                } else if !Self::allow_percent(pct) {
                    return Ok(0);
                }
            }
        }
        self.inner.write(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::PayloadType;
    use crate::testutil::TestOutput;

    fn msg() -> Message {
        Message::new(
            crate::proto::payload_header(PayloadType::Request, b"a".repeat(20).leak(), 0, 0),
            b"GET / HTTP/1.1\r\n\r\n".to_vec(),
        )
    }

    #[tokio::test]
    async fn absolute_limit_drops_past_the_window() {
        let out = TestOutput::new();
        let limiter = RateLimiter::new(out.writer(), Limit::Absolute(2));
        assert!(limiter.write(&msg()).await.unwrap() > 0);
        assert!(limiter.write(&msg()).await.unwrap() > 0);
        assert_eq!(limiter.write(&msg()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn percent_limit_with_speed_factor_never_drops() {
        let out = TestOutput::new();
        let factor = SpeedFactor::new(100);
        let limiter = RateLimiter::with_speed_factor(out.writer(), Limit::Percent(10), factor.clone());
        for _ in 0..5 {
            assert!(limiter.write(&msg()).await.unwrap() > 0);
        }
        assert_eq!(factor.get(), 10);
    }

    #[test]
    fn parses_percent_and_absolute() {
        assert!(matches!("50%".parse::<Limit>().unwrap(), Limit::Percent(50)));
        assert!(matches!("200".parse::<Limit>().unwrap(), Limit::Absolute(200)));
    }
}
