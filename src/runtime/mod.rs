//! Injectable runtime seams.
//!
//! The schedulers never touch the system clock, timers, or entropy directly;
//! they go through [`Clock`], [`Sleeper`], and [`RandomSource`], bundled in a
//! [`SchedulerEnv`]. Production code uses the system implementations; tests
//! swap in the doubles from [`crate::testing`] for virtual time and
//! deterministic jitter.

pub mod backoff;

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

/// Time source for deadlines and event timestamps.
pub trait Clock: fmt::Debug + Send + Sync {
    /// Milliseconds on a monotonic scale private to this clock. Only
    /// differences are meaningful.
    fn now_ms(&self) -> u64;

    /// Wall-clock timestamp for event envelopes and run metadata.
    fn wall_now(&self) -> DateTime<Utc>;
}

/// Monotonic clock anchored at construction time.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        self.origin.elapsed().as_millis() as u64
    }

    fn wall_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Suspension primitive for poll delays, backoff, and batch ticks.
#[async_trait]
pub trait Sleeper: fmt::Debug + Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production sleeper backed by the tokio timer wheel.
#[derive(Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Entropy for interval jitter and backoff jitter.
pub trait RandomSource: fmt::Debug + Send + Sync {
    /// Uniform value in `[0, 1)`.
    fn next_f64(&self) -> f64;
}

/// Production random source backed by the thread-local generator.
#[derive(Debug, Default)]
pub struct ThreadRandom;

impl RandomSource for ThreadRandom {
    fn next_f64(&self) -> f64 {
        rand::Rng::gen_range(&mut rand::thread_rng(), 0.0..1.0)
    }
}

/// Marker returned when a cancellable sleep was interrupted by its signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SleepInterrupted;

/// The bundle of runtime seams a scheduler runs against.
#[derive(Clone, Debug)]
pub struct SchedulerEnv {
    pub clock: Arc<dyn Clock>,
    pub sleeper: Arc<dyn Sleeper>,
    pub random: Arc<dyn RandomSource>,
}

impl SchedulerEnv {
    /// System clock, tokio sleeper, thread-local random.
    pub fn system() -> Self {
        Self {
            clock: Arc::new(SystemClock::new()),
            sleeper: Arc::new(TokioSleeper),
            random: Arc::new(ThreadRandom),
        }
    }

    pub fn new(
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        Self {
            clock,
            sleeper,
            random,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn with_random(mut self, random: Arc<dyn RandomSource>) -> Self {
        self.random = random;
        self
    }

    /// Sleep that wakes early when the signal fires. Cancellation wins when
    /// both are ready so an aborted caller never waits out a full delay.
    pub async fn sleep_cancellable(
        &self,
        duration: Duration,
        signal: &CancellationToken,
    ) -> Result<(), SleepInterrupted> {
        tokio::select! {
            biased;
            _ = signal.cancelled() => Err(SleepInterrupted),
            _ = self.sleeper.sleep(duration) => Ok(()),
        }
    }
}

impl Default for SchedulerEnv {
    fn default() -> Self {
        Self::system()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancellable_sleep_prefers_cancellation() {
        let env = SchedulerEnv::system();
        let token = CancellationToken::new();
        token.cancel();
        let outcome = env
            .sleep_cancellable(Duration::from_millis(0), &token)
            .await;
        assert_eq!(outcome, Err(SleepInterrupted));
    }

    #[tokio::test]
    async fn cancellable_sleep_completes_without_signal() {
        let env = SchedulerEnv::system();
        let token = CancellationToken::new();
        let outcome = env
            .sleep_cancellable(Duration::from_millis(1), &token)
            .await;
        assert_eq!(outcome, Ok(()));
    }

    #[test]
    fn thread_random_stays_in_unit_interval() {
        let random = ThreadRandom;
        for _ in 0..64 {
            let value = random.next_f64();
            assert!((0.0..1.0).contains(&value));
        }
    }
}
