//! Recording telemetry sink.

use std::sync::{Arc, Mutex};

use crate::telemetry::{
    RunEvent, RunObserver, StepEvent, StepEventStatus, StepObserver, TelemetryBus, TelemetryError,
    WaitEvent, WaitObserver,
};

/// Captures every run, step, and wait event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingTelemetry {
    wait_events: Mutex<Vec<WaitEvent>>,
    step_events: Mutex<Vec<StepEvent>>,
    run_events: Mutex<Vec<RunEvent>>,
}

impl RecordingTelemetry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register this recorder on all three observer surfaces of a bus.
    pub fn attach(self: &Arc<Self>, bus: &TelemetryBus) {
        bus.add_wait_observer(self.clone());
        bus.add_step_observer(self.clone());
        bus.add_run_observer(self.clone());
    }

    pub fn wait_events(&self) -> Vec<WaitEvent> {
        self.wait_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Phase names of the recorded wait events, in order.
    pub fn wait_phases(&self) -> Vec<&'static str> {
        self.wait_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(WaitEvent::phase)
            .collect()
    }

    pub fn step_events(&self) -> Vec<StepEvent> {
        self.step_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// `(kind, status)` pairs of the recorded step events, in order.
    pub fn step_transitions(&self) -> Vec<(String, StepEventStatus)> {
        self.step_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|event| (event.step_kind.clone(), event.status))
            .collect()
    }

    pub fn run_events(&self) -> Vec<RunEvent> {
        self.run_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl WaitObserver for RecordingTelemetry {
    fn on_wait_event(&self, event: &WaitEvent) -> Result<(), TelemetryError> {
        self.wait_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}

impl StepObserver for RecordingTelemetry {
    fn on_step_events(&self, events: &[StepEvent]) -> Result<(), TelemetryError> {
        self.step_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend_from_slice(events);
        Ok(())
    }
}

impl RunObserver for RecordingTelemetry {
    fn on_run_event(&self, event: &RunEvent) -> Result<(), TelemetryError> {
        self.run_events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
        Ok(())
    }
}
