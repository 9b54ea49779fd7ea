//! Telemetry bus: run, step, and wait event fan-out.
//!
//! Two broadcast surfaces share the bus. Workflow **step** events buffer per
//! run and flush on a short batch tick (or explicitly via [`TelemetryBus::flush`])
//! in timestamp order; **run** phase events and **wait** events are delivered
//! inline. Every payload passes through the structural sanitizer before an
//! observer sees it, and observer failures are logged at debug level; they
//! never propagate into a scheduler.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use crate::runtime::{Sleeper, TokioSleeper};
use crate::sanitize::{SanitizeRule, sanitize_value};
use crate::wait::{IdleSnapshot, WaitPredicateSnapshot};

/// Default batch flush interval for step events, in milliseconds.
pub const DEFAULT_BATCH_INTERVAL_MS: u64 = 16;

/// Lifecycle status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RunStatus {
    Running,
    Success,
    Failed,
    Cancelled,
}

/// Which transition a run event marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunPhase {
    Started,
    CancelRequested,
    Completed,
}

/// Envelope for run lifecycle transitions.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    pub run_id: String,
    pub workflow_id: String,
    pub phase: RunPhase,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub metadata: Value,
}

/// Status of a step event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StepEventStatus {
    Pending,
    Attempt,
    Success,
    Failure,
    Skipped,
}

/// Envelope for one step transition within a run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEvent {
    pub run_id: String,
    pub workflow_id: String,
    pub step_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub step_kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logical_key: Option<String>,
    pub status: StepEventStatus,
    pub attempt: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    /// Emission order tiebreaker for identical timestamps.
    #[serde(skip)]
    pub seq: u64,
}

/// Envelope for wait scheduler and idle gate events, delivered inline.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum WaitEvent {
    #[serde(rename_all = "camelCase")]
    Start {
        key: Option<String>,
        timeout_ms: u64,
        interval_ms: u64,
        started_at: DateTime<Utc>,
        metadata: Value,
    },
    #[serde(rename_all = "camelCase")]
    Attempt {
        key: Option<String>,
        poll_count: u32,
        elapsed_ms: u64,
        strategy_history: Vec<String>,
    },
    #[serde(rename_all = "camelCase")]
    Heartbeat {
        key: Option<String>,
        poll_count: u32,
        elapsed_ms: u64,
        remaining_ms: u64,
        stale_recoveries: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<WaitPredicateSnapshot>,
    },
    #[serde(rename_all = "camelCase")]
    IdleHeartbeat {
        snapshot: IdleSnapshot,
        started_at: DateTime<Utc>,
        timestamp: DateTime<Utc>,
        elapsed_ms: u64,
        idle_remaining_ms: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        window_remaining_ms: Option<u64>,
    },
    #[serde(rename_all = "camelCase")]
    Success {
        key: Option<String>,
        poll_count: u32,
        elapsed_ms: u64,
        stale_recoveries: u32,
        resolved_by: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<WaitPredicateSnapshot>,
    },
    #[serde(rename_all = "camelCase")]
    Failure {
        key: Option<String>,
        code: String,
        message: String,
        poll_count: u32,
        elapsed_ms: u64,
        stale_recoveries: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        snapshot: Option<WaitPredicateSnapshot>,
    },
}

impl WaitEvent {
    /// Terminal events close a wait: exactly one per invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success { .. } | Self::Failure { .. })
    }

    /// Wire name of the phase.
    pub fn phase(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Attempt { .. } => "attempt",
            Self::Heartbeat { .. } => "heartbeat",
            Self::IdleHeartbeat { .. } => "idleHeartbeat",
            Self::Success { .. } => "success",
            Self::Failure { .. } => "failure",
        }
    }
}

/// Observer failure; caught by the bus and logged at debug level.
#[derive(Debug, Clone, thiserror::Error)]
#[error("telemetry observer failure: {0}")]
pub struct TelemetryError(pub String);

/// Receives batched step events for a run.
pub trait StepObserver: Send + Sync {
    fn on_step_events(&self, events: &[StepEvent]) -> Result<(), TelemetryError>;
}

/// Receives run phase transitions.
pub trait RunObserver: Send + Sync {
    fn on_run_event(&self, event: &RunEvent) -> Result<(), TelemetryError>;
}

/// Receives wait scheduler events inline.
pub trait WaitObserver: Send + Sync {
    fn on_wait_event(&self, event: &WaitEvent) -> Result<(), TelemetryError>;
}

#[derive(Default)]
struct StepBuffer {
    events: Vec<StepEvent>,
    flush_scheduled: bool,
}

/// Fan-out hub shared by the wait and workflow cores.
pub struct TelemetryBus {
    run_observers: RwLock<Vec<Arc<dyn RunObserver>>>,
    step_observers: RwLock<Vec<Arc<dyn StepObserver>>>,
    wait_observers: RwLock<Vec<Arc<dyn WaitObserver>>>,
    buffer: Mutex<StepBuffer>,
    batch_interval_ms: u64,
    sanitizer: Option<Arc<dyn SanitizeRule>>,
    sleeper: Arc<dyn Sleeper>,
    seq: AtomicU64,
}

impl std::fmt::Debug for TelemetryBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryBus")
            .field("batch_interval_ms", &self.batch_interval_ms)
            .finish_non_exhaustive()
    }
}

impl Default for TelemetryBus {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryBus {
    pub fn new() -> Self {
        Self {
            run_observers: RwLock::new(Vec::new()),
            step_observers: RwLock::new(Vec::new()),
            wait_observers: RwLock::new(Vec::new()),
            buffer: Mutex::new(StepBuffer::default()),
            batch_interval_ms: DEFAULT_BATCH_INTERVAL_MS,
            sanitizer: None,
            sleeper: Arc::new(TokioSleeper),
            seq: AtomicU64::new(0),
        }
    }

    pub fn with_batch_interval_ms(mut self, batch_interval_ms: u64) -> Self {
        self.batch_interval_ms = batch_interval_ms;
        self
    }

    /// Override the default mask for sensitive fields.
    pub fn with_sanitizer(mut self, sanitizer: Arc<dyn SanitizeRule>) -> Self {
        self.sanitizer = Some(sanitizer);
        self
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn add_run_observer(&self, observer: Arc<dyn RunObserver>) {
        self.run_observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn add_step_observer(&self, observer: Arc<dyn StepObserver>) {
        self.step_observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    pub fn add_wait_observer(&self, observer: Arc<dyn WaitObserver>) {
        self.wait_observers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(observer);
    }

    fn sanitize(&self, value: &Value) -> Value {
        sanitize_value(value, self.sanitizer.as_deref())
    }

    /// Deliver a run phase event inline.
    pub fn emit_run(&self, mut event: RunEvent) {
        event.metadata = self.sanitize(&event.metadata);
        if let Some(error) = &event.error {
            event.error = Some(self.sanitize(error));
        }
        let observers = self
            .run_observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            if let Err(err) = observer.on_run_event(&event) {
                debug!(error = %err, "run observer failed");
            }
        }
    }

    /// Deliver a wait event inline.
    pub fn emit_wait(&self, mut event: WaitEvent) {
        if let WaitEvent::Start { metadata, .. } = &mut event {
            let original = std::mem::take(metadata);
            *metadata = self.sanitize(&original);
        }
        let observers = self
            .wait_observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            if let Err(err) = observer.on_wait_event(&event) {
                debug!(error = %err, "wait observer failed");
            }
        }
    }

    /// Buffer a step event for the next batch tick.
    pub fn emit_step(self: &Arc<Self>, mut event: StepEvent) {
        if let Some(data) = &event.data {
            event.data = Some(self.sanitize(data));
        }
        if let Some(error) = &event.error {
            event.error = Some(self.sanitize(error));
        }
        event.seq = self.seq.fetch_add(1, Ordering::SeqCst);

        let schedule = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.events.push(event);
            if buffer.flush_scheduled {
                false
            } else {
                buffer.flush_scheduled = true;
                true
            }
        };
        if schedule {
            let bus = Arc::clone(self);
            let interval = Duration::from_millis(self.batch_interval_ms);
            tokio::spawn(async move {
                bus.sleeper.sleep(interval).await;
                bus.flush_all();
            });
        }
    }

    /// Flush buffered step events for one run, in timestamp order.
    pub fn flush(&self, run_id: &str) {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            let mut batch = Vec::new();
            let mut index = 0;
            while index < buffer.events.len() {
                if buffer.events[index].run_id == run_id {
                    batch.push(buffer.events.remove(index));
                } else {
                    index += 1;
                }
            }
            batch
        };
        self.deliver_steps(batch);
    }

    /// Flush every buffered step event.
    pub fn flush_all(&self) {
        let batch = {
            let mut buffer = self.buffer.lock().unwrap_or_else(|e| e.into_inner());
            buffer.flush_scheduled = false;
            std::mem::take(&mut buffer.events)
        };
        self.deliver_steps(batch);
    }

    fn deliver_steps(&self, mut events: Vec<StepEvent>) {
        if events.is_empty() {
            return;
        }
        events.sort_by(|a, b| (a.timestamp, a.seq).cmp(&(b.timestamp, b.seq)));
        let observers = self
            .step_observers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for observer in observers {
            if let Err(err) = observer.on_step_events(&events) {
                debug!(error = %err, "step observer failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Failing;
    impl RunObserver for Failing {
        fn on_run_event(&self, _event: &RunEvent) -> Result<(), TelemetryError> {
            Err(TelemetryError("nope".into()))
        }
    }

    struct CountingRuns(Mutex<u32>);
    impl RunObserver for CountingRuns {
        fn on_run_event(&self, _event: &RunEvent) -> Result<(), TelemetryError> {
            *self.0.lock().unwrap_or_else(|e| e.into_inner()) += 1;
            Ok(())
        }
    }

    fn run_event() -> RunEvent {
        RunEvent {
            run_id: "r1".into(),
            workflow_id: "wf".into(),
            phase: RunPhase::Started,
            status: RunStatus::Running,
            started_at: Utc::now(),
            finished_at: None,
            duration_ms: None,
            completed_steps: None,
            error: None,
            metadata: json!({ "authToken": "abcdef", "label": "checkout" }),
        }
    }

    #[tokio::test]
    async fn observer_failures_do_not_block_other_observers() {
        let bus = TelemetryBus::new();
        let counting = Arc::new(CountingRuns(Mutex::new(0)));
        bus.add_run_observer(Arc::new(Failing));
        bus.add_run_observer(counting.clone());
        bus.emit_run(run_event());
        assert_eq!(*counting.0.lock().unwrap_or_else(|e| e.into_inner()), 1);
    }

    struct CapturingRuns(Mutex<Vec<RunEvent>>);
    impl RunObserver for CapturingRuns {
        fn on_run_event(&self, event: &RunEvent) -> Result<(), TelemetryError> {
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn run_metadata_is_sanitized_before_fanout() {
        let bus = TelemetryBus::new();
        let capture = Arc::new(CapturingRuns(Mutex::new(Vec::new())));
        bus.add_run_observer(capture.clone());
        bus.emit_run(run_event());
        let events = capture.0.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(events[0].metadata["authToken"], json!("********"));
        assert_eq!(events[0].metadata["label"], json!("checkout"));
    }

    struct CapturingSteps(Mutex<Vec<StepEvent>>);
    impl StepObserver for CapturingSteps {
        fn on_step_events(&self, events: &[StepEvent]) -> Result<(), TelemetryError> {
            self.0
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .extend_from_slice(events);
            Ok(())
        }
    }

    fn step_event(run_id: &str, status: StepEventStatus, timestamp: DateTime<Utc>) -> StepEvent {
        StepEvent {
            run_id: run_id.into(),
            workflow_id: "wf".into(),
            step_index: 0,
            step_id: None,
            step_kind: "log".into(),
            logical_key: None,
            status,
            attempt: 1,
            timestamp,
            duration_ms: None,
            data: None,
            error: None,
            notes: None,
            seq: 0,
        }
    }

    #[tokio::test]
    async fn flush_is_per_run_and_timestamp_ordered() {
        let bus = Arc::new(TelemetryBus::new().with_batch_interval_ms(10_000));
        let capture = Arc::new(CapturingSteps(Mutex::new(Vec::new())));
        bus.add_step_observer(capture.clone());

        let early = Utc::now();
        let late = early + chrono::Duration::milliseconds(5);
        bus.emit_step(step_event("a", StepEventStatus::Attempt, late));
        bus.emit_step(step_event("b", StepEventStatus::Pending, early));
        bus.emit_step(step_event("a", StepEventStatus::Pending, early));

        bus.flush("a");
        {
            let events = capture.0.lock().unwrap_or_else(|e| e.into_inner());
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].status, StepEventStatus::Pending);
            assert_eq!(events[1].status, StepEventStatus::Attempt);
        }

        bus.flush_all();
        let events = capture.0.lock().unwrap_or_else(|e| e.into_inner());
        assert_eq!(events.len(), 3);
        assert_eq!(events[2].run_id, "b");
    }
}
