//! Step handlers: the execution seam of atomic steps.
//!
//! The scheduler resolves the step's logical key, then hands a
//! [`StepInvocation`] to the handler registered for the step kind. Handlers
//! return a [`StepOutcome`] (context updates, log lines, an optional output
//! value) and never touch the scheduler's retry or telemetry machinery.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::bridge::{BridgeRequest, ResolverBridge};
use super::{TimingConfig, WorkflowStep};
use crate::context::ContextManager;
use crate::dom::{DomElement, DomError, ElementHandle};
use crate::error::StepError;
use crate::selector::ResolveResult;
use crate::wait::Waiter;

/// Severity of a handler log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepLogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// One log line produced by a handler, forwarded to the run logger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLog {
    pub level: StepLogLevel,
    pub message: String,
}

impl StepLog {
    pub fn info(message: impl Into<String>) -> Self {
        Self {
            level: StepLogLevel::Info,
            message: message.into(),
        }
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self {
            level: StepLogLevel::Warn,
            message: message.into(),
        }
    }
}

/// One context write requested by a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextUpdate {
    pub path: String,
    pub value: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_ms: Option<u64>,
}

impl ContextUpdate {
    pub fn set(path: impl Into<String>, value: Value) -> Self {
        Self {
            path: path.into(),
            value,
            ttl_ms: None,
        }
    }

    pub fn set_with_ttl(path: impl Into<String>, value: Value, ttl_ms: u64) -> Self {
        Self {
            path: path.into(),
            value,
            ttl_ms: Some(ttl_ms),
        }
    }
}

/// What a handler produced.
#[derive(Debug, Clone, Default)]
pub struct StepOutcome {
    pub context_updates: Vec<ContextUpdate>,
    pub logs: Vec<StepLog>,
    /// The handler decided the step did not apply.
    pub skipped: bool,
    pub output: Option<Value>,
}

impl StepOutcome {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    pub fn with_update(mut self, update: ContextUpdate) -> Self {
        self.context_updates.push(update);
        self
    }

    pub fn with_log(mut self, log: StepLog) -> Self {
        self.logs.push(log);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Everything a handler may touch for one attempt.
pub struct StepInvocation<'a> {
    pub step: &'a WorkflowStep,
    pub attempt: u32,
    pub retries_remaining: u32,
    pub context: &'a mut ContextManager,
    /// Resolution of the step's logical key, when it has one.
    pub resolve_result: Option<&'a ResolveResult>,
    pub run_id: &'a str,
    pub workflow_id: &'a str,
    pub timing: &'a TimingConfig,
    pub signal: &'a CancellationToken,
    pub bridge: &'a ResolverBridge,
}

impl StepInvocation<'_> {
    /// The resolved element, or a `resolver-miss` error.
    pub fn element(&self) -> Result<&ElementHandle, StepError> {
        self.resolve_result
            .and_then(|result| result.element.as_ref())
            .ok_or_else(|| {
                StepError::resolver_miss(format!(
                    "step '{}' has no resolved element",
                    self.step.base().id.as_deref().unwrap_or(self.step.kind_name())
                ))
            })
    }

    /// Resolve another logical key through the run's bridge cache.
    pub async fn resolve_logical_key(&self, key: &str) -> Result<ResolveResult, StepError> {
        self.bridge
            .resolve(BridgeRequest {
                run_id: self.run_id,
                workflow_id: self.workflow_id,
                step_key: format!(
                    "{}+{}",
                    self.step.kind_name(),
                    self.step.base().id.as_deref().unwrap_or("-")
                ),
                attempt: self.attempt,
                logical_key: key,
                signal: self.signal,
            })
            .await
    }
}

/// The execution seam of atomic steps.
#[async_trait]
pub trait StepHandler: Send + Sync {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError>;
}

/// Handler lookup by step kind (or custom name).
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn StepHandler>>,
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registry with every built-in handler.
    pub fn with_defaults(waiter: Arc<Waiter>) -> Self {
        let mut registry = Self::empty();
        registry.register("click", Arc::new(ClickHandler));
        registry.register("type", Arc::new(TypeHandler));
        registry.register("log", Arc::new(LogHandler));
        registry.register("capture", Arc::new(CaptureHandler));
        registry.register("wait", Arc::new(WaitHandler { waiter }));
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn StepHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn StepHandler>> {
        self.handlers.get(name).cloned()
    }
}

fn dom_step_error(err: DomError, action: &str) -> StepError {
    match err {
        DomError::Detached(detail) => {
            StepError::resolver_miss(format!("{action} hit a detached element: {detail}"))
        }
        other => StepError::unknown(format!("{action} failed: {other}")).with_cause(other.to_string()),
    }
}

/// `click`: native click on the resolved element.
struct ClickHandler;

#[async_trait]
impl StepHandler for ClickHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let element = invocation.element()?;
        element
            .click()
            .await
            .map_err(|err| dom_step_error(err, "click"))?;
        Ok(StepOutcome::ok())
    }
}

/// `type`: write a literal or context-sourced value into the element.
struct TypeHandler;

#[async_trait]
impl StepHandler for TypeHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let WorkflowStep::Type {
            text, from_context, ..
        } = invocation.step
        else {
            return Err(StepError::unknown("type handler invoked for a non-type step"));
        };
        let value = match (text, from_context) {
            (Some(literal), _) => literal.clone(),
            (None, Some(context_key)) => match invocation.context.get(context_key) {
                Some(Value::String(text)) => text,
                Some(other) => other.to_string(),
                None => {
                    return Err(StepError::unknown(format!(
                        "type step found no context value under '{context_key}'"
                    )));
                }
            },
            (None, None) => {
                return Err(StepError::unknown(
                    "type step requires text or fromContext",
                ));
            }
        };
        let element = invocation.element()?;
        element
            .set_value(&value)
            .await
            .map_err(|err| dom_step_error(err, "type"))?;
        Ok(StepOutcome::ok())
    }
}

/// `log`: forward a message to the run logger.
struct LogHandler;

#[async_trait]
impl StepHandler for LogHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let WorkflowStep::Log { message, level, .. } = invocation.step else {
            return Err(StepError::unknown("log handler invoked for a non-log step"));
        };
        Ok(StepOutcome::ok().with_log(StepLog {
            level: level.unwrap_or(StepLogLevel::Info),
            message: message.clone(),
        }))
    }
}

/// `capture`: store the element's text under a context key.
struct CaptureHandler;

#[async_trait]
impl StepHandler for CaptureHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let WorkflowStep::Capture { into, ttl_ms, .. } = invocation.step else {
            return Err(StepError::unknown(
                "capture handler invoked for a non-capture step",
            ));
        };
        let element = invocation.element()?;
        let text = element
            .text_content()
            .await
            .map_err(|err| dom_step_error(err, "capture"))?;
        let update = ContextUpdate {
            path: into.clone(),
            value: Value::String(text.clone()),
            ttl_ms: *ttl_ms,
        };
        Ok(StepOutcome::ok()
            .with_update(update)
            .with_output(Value::String(text)))
    }
}

/// `wait`: run a wait operation inside the step's timeout budget.
struct WaitHandler {
    waiter: Arc<Waiter>,
}

#[async_trait]
impl StepHandler for WaitHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let WorkflowStep::Wait { wait, .. } = invocation.step else {
            return Err(StepError::unknown("wait handler invoked for a non-wait step"));
        };
        let options = wait.to_options(invocation.signal.clone(), invocation.timing, true);
        let wants_text = wait.text_mode.is_some() || wait.text_pattern.is_some();
        let result = if wait.idle.is_some() {
            self.waiter.wait_for_idle(options).await
        } else if wants_text {
            self.waiter.wait_text(options).await
        } else {
            self.waiter.wait_for(options).await
        }
        .map_err(StepError::from)?;

        Ok(StepOutcome::ok().with_output(serde_json::json!({
            "pollCount": result.poll_count,
            "elapsedMs": result.elapsed_ms,
            "resolvedBy": result.resolve_result.resolved_by,
            "staleRecoveries": result.stale_recoveries,
        })))
    }
}
