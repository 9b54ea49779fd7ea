//! Deterministic clock, sleeper, and random source.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::runtime::{Clock, RandomSource, Sleeper};

/// A clock that only moves when told to (or when a [`VirtualSleeper`]
/// sleeps on it).
#[derive(Debug)]
pub struct ManualClock {
    origin_wall: DateTime<Utc>,
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            origin_wall: Utc::now(),
            now_ms: AtomicU64::new(0),
        }
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn set(&self, ms: u64) {
        self.now_ms.store(ms, Ordering::SeqCst);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn wall_now(&self) -> DateTime<Utc> {
        self.origin_wall + chrono::Duration::milliseconds(self.now_ms() as i64)
    }
}

/// A sleeper that advances its [`ManualClock`] by the requested duration and
/// yields once, so awaiting code observes virtual time instead of real time.
#[derive(Debug)]
pub struct VirtualSleeper {
    clock: Arc<ManualClock>,
}

impl VirtualSleeper {
    pub fn new(clock: Arc<ManualClock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl Sleeper for VirtualSleeper {
    async fn sleep(&self, duration: Duration) {
        self.clock.advance(duration.as_millis() as u64);
        tokio::task::yield_now().await;
    }
}

/// A random source that always answers the same value. `0.5` pins jittered
/// intervals to their midpoint and backoff jitter to zero spread.
#[derive(Debug, Clone, Copy)]
pub struct FixedRandom {
    value: f64,
}

impl FixedRandom {
    pub fn new(value: f64) -> Self {
        Self {
            value: value.clamp(0.0, 0.999_999_999),
        }
    }
}

impl RandomSource for FixedRandom {
    fn next_f64(&self) -> f64 {
        self.value
    }
}
