//! Shared fixtures for the integration suites.
#![allow(dead_code)]

use std::sync::Arc;

use arbor::runtime::SchedulerEnv;
use arbor::selector::{SelectorEntry, SelectorMap, SelectorResolver, SelectorTry};
use arbor::telemetry::TelemetryBus;
use arbor::testing::{FakeDom, ManualClock, RecordingTelemetry, virtual_env};
use arbor::wait::Waiter;
use arbor::workflow::WorkflowRunner;

/// A waiter on virtual time over a fake tree, with a recorder attached.
pub struct WaitHarness {
    pub dom: Arc<FakeDom>,
    pub waiter: Waiter,
    pub clock: Arc<ManualClock>,
    pub recorder: Arc<RecordingTelemetry>,
}

pub fn wait_harness(map: SelectorMap) -> WaitHarness {
    let dom = Arc::new(FakeDom::new());
    let resolver = Arc::new(SelectorResolver::new(Arc::new(map), dom.backend()));
    let (env, clock) = virtual_env();
    let telemetry = Arc::new(TelemetryBus::new());
    let recorder = RecordingTelemetry::new();
    recorder.attach(&telemetry);
    let waiter = Waiter::new(resolver)
        .with_env(env)
        .with_telemetry(telemetry);
    WaitHarness {
        dom,
        waiter,
        clock,
        recorder,
    }
}

/// A workflow runner on virtual time over a fake tree, with a recorder and a
/// short telemetry batch interval.
pub struct RunnerHarness {
    pub dom: Arc<FakeDom>,
    pub runner: WorkflowRunner,
    pub clock: Arc<ManualClock>,
    pub env: SchedulerEnv,
    pub recorder: Arc<RecordingTelemetry>,
}

pub fn runner_harness(map: SelectorMap) -> RunnerHarness {
    let dom = Arc::new(FakeDom::new());
    let resolver = Arc::new(SelectorResolver::new(Arc::new(map), dom.backend()));
    let (env, clock) = virtual_env();
    let telemetry = Arc::new(TelemetryBus::new());
    let recorder = RecordingTelemetry::new();
    recorder.attach(&telemetry);
    let runner = WorkflowRunner::new(resolver)
        .with_env(env.clone())
        .with_telemetry(telemetry);
    RunnerHarness {
        dom,
        runner,
        clock,
        env,
        recorder,
    }
}

/// Entry with a single `role` try, so fallback behavior is observable.
pub fn role_map(key: &str, role: &str) -> SelectorMap {
    SelectorMap::new().with_entry(key, SelectorEntry::new(vec![SelectorTry::role(role)]))
}

/// Map with a single CSS-only entry.
pub fn css_map(key: &str, selector: &str) -> SelectorMap {
    SelectorMap::new().with_entry(key, SelectorEntry::new(vec![SelectorTry::css(selector)]))
}
