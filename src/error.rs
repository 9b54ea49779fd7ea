//! Error Handling Module
//!
//! Structured errors for the two scheduler surfaces:
//! - [`WaitError`] for the wait core (polling scheduler + idle gate)
//! - [`StepError`] for the workflow core (step scheduler + resolver bridge)
//!
//! Both carry a stable reason code, a human-readable message, and enough of
//! the scheduler state at failure time to diagnose a run from telemetry
//! alone. Reason codes are part of the public contract; messages are not.

use serde_json::{Value, json};

use crate::selector::{ResolveAttempt, ResolveResult};
use crate::wait::{IdleSnapshot, IdleStatistics, VisibilitySnapshot, WaitPredicateSnapshot};

/// Coarse classification used by retry policies and reporting layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Worth retrying: the condition may clear on a later attempt.
    Transient,
    /// A cooperative cancellation; never retried.
    Cancellation,
}

/// Variant-specific payload of a [`WaitError`].
#[derive(Debug, Clone)]
pub enum WaitErrorKind {
    /// The wait ran past its deadline, or stale recovery was exhausted
    /// (the message distinguishes the two).
    Timeout { timeout_ms: u64 },
    /// No selector strategy produced a node before the deadline.
    ResolverMiss { resolve_result: Box<ResolveResult> },
    /// The idle gate's max window elapsed before the subtree settled.
    IdleWindowExceeded {
        snapshot: IdleSnapshot,
        statistics: IdleStatistics,
    },
    /// Reserved refinement of `timeout` for visibility predicates.
    VisibilityMismatch { snapshot: VisibilitySnapshot },
    /// A cancellation signal aborted the wait.
    Cancelled { reason: Option<String> },
    /// Unclassified failure (backend fault, invalid options).
    Unknown,
}

impl WaitErrorKind {
    /// Stable reason code carried in telemetry and logs.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout { .. } => "timeout",
            Self::ResolverMiss { .. } => "resolver-miss",
            Self::IdleWindowExceeded { .. } => "idle-window-exceeded",
            Self::VisibilityMismatch { .. } => "visibility-mismatch",
            Self::Cancelled { .. } => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

/// Failure of a wait invocation, carrying the scheduler state at the time the
/// terminal `failure` event fired.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct WaitError {
    pub kind: WaitErrorKind,
    pub message: String,
    pub key: Option<String>,
    pub elapsed_ms: u64,
    pub poll_count: u32,
    pub attempts: Vec<ResolveAttempt>,
    pub strategy_history: Vec<String>,
    pub stale_recoveries: u32,
    pub predicate_snapshot: Option<WaitPredicateSnapshot>,
    pub cause: Option<String>,
}

impl WaitError {
    /// Build a bare error with empty scheduler state. The scheduler fills the
    /// counters in before surfacing it.
    pub fn new(kind: WaitErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            key: None,
            elapsed_ms: 0,
            poll_count: 0,
            attempts: Vec::new(),
            strategy_history: Vec::new(),
            stale_recoveries: 0,
            predicate_snapshot: None,
            cause: None,
        }
    }

    /// Error for options that cannot be turned into a runnable wait.
    pub fn invalid_options(message: impl Into<String>) -> Self {
        Self::new(WaitErrorKind::Unknown, message)
    }

    pub fn cancelled(reason: Option<String>) -> Self {
        let message = match &reason {
            Some(reason) => format!("wait cancelled: {reason}"),
            None => "wait cancelled".to_string(),
        };
        Self::new(WaitErrorKind::Cancelled { reason }, message)
    }

    pub fn code(&self) -> &'static str {
        self.kind.code()
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.kind, WaitErrorKind::Cancelled { .. })
    }

    pub fn category(&self) -> ErrorCategory {
        if self.is_cancellation() {
            ErrorCategory::Cancellation
        } else {
            ErrorCategory::Transient
        }
    }

    /// One-line operator guidance for the reason code.
    pub fn guidance(&self) -> &'static str {
        match self.kind {
            WaitErrorKind::Timeout { .. } => {
                "Raise timeoutMs, loosen the predicate, or verify the target key still matches."
            }
            WaitErrorKind::ResolverMiss { .. } => {
                "Check the selector map entry and its fallback strategies against the live tree."
            }
            WaitErrorKind::IdleWindowExceeded { .. } => {
                "Increase idleMs or verify mutation sources before retrying."
            }
            WaitErrorKind::VisibilityMismatch { .. } => {
                "Inspect display/opacity/viewport thresholds for the target element."
            }
            WaitErrorKind::Cancelled { .. } => "The caller aborted this wait; no retry will help.",
            WaitErrorKind::Unknown => "Inspect the cause chain; this failure was not classified.",
        }
    }

    /// Sanitizer-ready payload for the terminal `failure` telemetry event.
    pub fn telemetry_payload(&self) -> Value {
        json!({
            "code": self.code(),
            "message": self.message,
            "key": self.key,
            "elapsedMs": self.elapsed_ms,
            "pollCount": self.poll_count,
            "staleRecoveries": self.stale_recoveries,
            "strategyHistory": self.strategy_history,
        })
    }
}

/// Stable reason codes for workflow step failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepErrorReason {
    Timeout,
    ResolverMiss,
    IdleWindowExceeded,
    VisibilityMismatch,
    Cancelled,
    Unknown,
}

impl StepErrorReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::ResolverMiss => "resolver-miss",
            Self::IdleWindowExceeded => "idle-window-exceeded",
            Self::VisibilityMismatch => "visibility-mismatch",
            Self::Cancelled => "cancelled",
            Self::Unknown => "unknown",
        }
    }
}

/// Failure of a single workflow step attempt.
///
/// Step errors are value objects: the cause chain is flattened to a string so
/// they can be cloned into run metadata and telemetry envelopes.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct StepError {
    pub reason: StepErrorReason,
    pub message: String,
    pub step_id: Option<String>,
    pub key: Option<String>,
    pub data: Option<Value>,
    pub cause: Option<String>,
}

impl StepError {
    pub fn new(reason: StepErrorReason, message: impl Into<String>) -> Self {
        Self {
            reason,
            message: message.into(),
            step_id: None,
            key: None,
            data: None,
            cause: None,
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(StepErrorReason::Timeout, message)
    }

    pub fn resolver_miss(message: impl Into<String>) -> Self {
        Self::new(StepErrorReason::ResolverMiss, message)
    }

    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(StepErrorReason::Cancelled, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(StepErrorReason::Unknown, message)
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_cause(mut self, cause: impl Into<String>) -> Self {
        self.cause = Some(cause.into());
        self
    }

    pub fn is_cancellation(&self) -> bool {
        self.reason == StepErrorReason::Cancelled
    }

    pub fn category(&self) -> ErrorCategory {
        if self.is_cancellation() {
            ErrorCategory::Cancellation
        } else {
            ErrorCategory::Transient
        }
    }

    /// Retries apply to everything except cancellation.
    pub fn is_retryable(&self) -> bool {
        !self.is_cancellation()
    }

    pub fn guidance(&self) -> &'static str {
        match self.reason {
            StepErrorReason::Timeout => {
                "Raise the step timeoutMs or split the step into smaller units."
            }
            StepErrorReason::ResolverMiss => {
                "Check the selector map entry and its fallback strategies against the live tree."
            }
            StepErrorReason::IdleWindowExceeded => {
                "Increase idleMs or verify mutation sources before retrying."
            }
            StepErrorReason::VisibilityMismatch => {
                "Inspect display/opacity/viewport thresholds for the target element."
            }
            StepErrorReason::Cancelled => "The run was cancelled; no retry will help.",
            StepErrorReason::Unknown => "Inspect the cause chain; this failure was not classified.",
        }
    }

    /// Sanitizer-ready payload for `failure` telemetry and run metadata.
    pub fn telemetry_payload(&self) -> Value {
        json!({
            "reason": self.reason.as_str(),
            "message": self.message,
            "stepId": self.step_id,
            "key": self.key,
            "data": self.data,
            "cause": self.cause,
        })
    }
}

impl From<WaitError> for StepError {
    fn from(err: WaitError) -> Self {
        let reason = match err.kind {
            WaitErrorKind::Timeout { .. } => StepErrorReason::Timeout,
            WaitErrorKind::ResolverMiss { .. } => StepErrorReason::ResolverMiss,
            WaitErrorKind::IdleWindowExceeded { .. } => StepErrorReason::IdleWindowExceeded,
            WaitErrorKind::VisibilityMismatch { .. } => StepErrorReason::VisibilityMismatch,
            WaitErrorKind::Cancelled { .. } => StepErrorReason::Cancelled,
            WaitErrorKind::Unknown => StepErrorReason::Unknown,
        };
        let mut step = StepError::new(reason, err.message.clone());
        step.key = err.key.clone();
        step.data = Some(err.telemetry_payload());
        step
    }
}

impl From<crate::context::ContextError> for StepError {
    fn from(err: crate::context::ContextError) -> Self {
        StepError::unknown(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_error_codes_are_stable() {
        assert_eq!(
            WaitError::new(WaitErrorKind::Timeout { timeout_ms: 5 }, "x").code(),
            "timeout"
        );
        assert_eq!(WaitError::cancelled(None).code(), "cancelled");
        assert!(WaitError::cancelled(None).is_cancellation());
    }

    #[test]
    fn step_error_retryability_excludes_cancellation() {
        assert!(StepError::timeout("t").is_retryable());
        assert!(StepError::resolver_miss("m").is_retryable());
        assert!(!StepError::cancelled("c").is_retryable());
        assert_eq!(
            StepError::cancelled("c").category(),
            ErrorCategory::Cancellation
        );
    }

    #[test]
    fn wait_error_converts_to_step_error() {
        let wait = WaitError::new(WaitErrorKind::Timeout { timeout_ms: 100 }, "deadline");
        let step: StepError = wait.into();
        assert_eq!(step.reason, StepErrorReason::Timeout);
        assert_eq!(step.message, "deadline");
    }
}
