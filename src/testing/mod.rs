//! Test doubles for the backend and runtime seams.
//!
//! The schedulers only ever talk to traits, so everything here is a plain
//! in-memory implementation: a scriptable [`FakeDom`] tree, a [`ManualClock`]
//! with a [`VirtualSleeper`] for deterministic virtual time, a
//! [`FixedRandom`] source for jitter-free delays, and a
//! [`RecordingTelemetry`] sink that captures every emitted event. The
//! crate's own suites run on these; downstream consumers can too.

mod dom;
mod observers;
mod runtime;

pub use dom::{FakeDom, FakeElement};
pub use observers::RecordingTelemetry;
pub use runtime::{FixedRandom, ManualClock, VirtualSleeper};

use std::sync::Arc;

use crate::runtime::SchedulerEnv;

/// A [`SchedulerEnv`] on virtual time: the clock only advances when the
/// sleeper runs, and jitter is pinned to the interval midpoint.
pub fn virtual_env() -> (SchedulerEnv, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new());
    let env = SchedulerEnv::new(
        clock.clone(),
        Arc::new(VirtualSleeper::new(clock.clone())),
        Arc::new(FixedRandom::new(0.5)),
    );
    (env, clock)
}
