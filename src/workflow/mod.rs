//! The workflow core: declarative step definitions executed by a scheduler
//! with per-step timeouts, retries, transactional context scopes, and
//! telemetry.
//!
//! A [`WorkflowDefinition`] is a tree of [`WorkflowStep`]s: atomic kinds
//! (`click`, `type`, `log`, `capture`, `wait`, `custom`) plus the
//! control-flow kinds (`if`, `foreach`, `retry`). The [`WorkflowRunner`]
//! executes it branch-by-branch against a [`crate::context::ContextManager`].
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor::workflow::{RunOptions, WorkflowDefinition, WorkflowRunner, WorkflowStep};
//!
//! let definition = WorkflowDefinition::new("checkout")
//!     .with_step(WorkflowStep::click("cart.open"))
//!     .with_step(WorkflowStep::capture("cart.total", "totals.cart"))
//!     .with_step(WorkflowStep::log("captured cart total"));
//!
//! let runner = WorkflowRunner::new(resolver);
//! let outcome = runner.run_workflow(&definition, RunOptions::default()).await?;
//! assert_eq!(outcome.completed_steps, 3);
//! ```

mod bridge;
mod condition;
mod handler;
mod runner;

pub use bridge::{BridgeRequest, ResolverBridge};
pub use condition::Condition;
pub use handler::{
    ContextUpdate, HandlerRegistry, StepHandler, StepInvocation, StepLog, StepLogLevel,
    StepOutcome,
};
pub use runner::{ActiveRunInfo, RunOptions, WorkflowRunner};

pub use crate::telemetry::RunStatus;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::StepError;
use crate::wait::{IdleOptions, TextMode, VisibilityOptions, WaitHints, WaitOptions};

/// Effective timing of a step or run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingConfig {
    pub timeout_ms: u64,
    pub interval_ms: u64,
    /// Additional attempts after the first.
    pub retries: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 8_000,
            interval_ms: 150,
            retries: 0,
            backoff_ms: 250,
            max_backoff_ms: 5_000,
            jitter_ms: 0,
        }
    }
}

impl TimingConfig {
    /// Apply a layer of overrides; set fields win.
    pub fn merged(&self, overrides: &TimingOverrides) -> Self {
        Self {
            timeout_ms: overrides.timeout_ms.unwrap_or(self.timeout_ms),
            interval_ms: overrides.interval_ms.unwrap_or(self.interval_ms),
            retries: overrides.retries.unwrap_or(self.retries),
            backoff_ms: overrides.backoff_ms.unwrap_or(self.backoff_ms),
            max_backoff_ms: overrides.max_backoff_ms.unwrap_or(self.max_backoff_ms),
            jitter_ms: overrides.jitter_ms.unwrap_or(self.jitter_ms),
        }
    }

    /// Delay before the given 1-based attempt under this config.
    pub fn backoff_delay(
        &self,
        attempt: u32,
        random: &dyn crate::runtime::RandomSource,
    ) -> std::time::Duration {
        crate::runtime::backoff::compute_backoff_delay(
            attempt,
            self.backoff_ms,
            self.max_backoff_ms,
            self.jitter_ms,
            random,
        )
    }
}

/// Partial timing, merged defaults → caller → per-step.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_backoff_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jitter_ms: Option<u64>,
}

impl TimingOverrides {
    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = Some(interval_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_backoff_ms(mut self, backoff_ms: u64) -> Self {
        self.backoff_ms = Some(backoff_ms);
        self
    }

    pub fn with_max_backoff_ms(mut self, max_backoff_ms: u64) -> Self {
        self.max_backoff_ms = Some(max_backoff_ms);
        self
    }

    pub fn with_jitter_ms(mut self, jitter_ms: u64) -> Self {
        self.jitter_ms = Some(jitter_ms);
        self
    }
}

/// Fields shared by every step kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepBase {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Logical key resolved before the handler runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(flatten)]
    pub timing: TimingOverrides,
}

/// Serializable wait parameters for `wait` steps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub css: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub xpath: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_pattern: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_mode: Option<TextMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<VisibilityOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle: Option<IdleOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope_key: Option<String>,
    pub hints: WaitHints,
}

impl WaitSpec {
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    /// Expand into full wait options under the given signal and timing.
    pub fn to_options(
        &self,
        signal: tokio_util::sync::CancellationToken,
        timing: &TimingConfig,
        sanitize: bool,
    ) -> WaitOptions {
        let mut options = WaitOptions::new();
        options.key = self.key.clone();
        options.css = self.css.clone();
        options.xpath = self.xpath.clone();
        options.text = self.text.clone();
        options.text_pattern = self.text_pattern.clone();
        options.text_mode = self.text_mode;
        options.visibility = self.visibility.clone();
        options.idle = self.idle.clone();
        options.timeout_ms = self.timeout_ms.unwrap_or(timing.timeout_ms);
        options.interval_ms = self.interval_ms.unwrap_or(timing.interval_ms);
        options.scope_key = self.scope_key.clone();
        options.hints = self.hints.clone();
        options.signal = Some(signal);
        options.sanitize_logs = sanitize;
        options
    }
}

/// One node of a workflow definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum WorkflowStep {
    /// Click the resolved element.
    Click {
        #[serde(flatten)]
        base: StepBase,
    },
    /// Type text (literal or read from context) into the resolved element.
    Type {
        #[serde(flatten)]
        base: StepBase,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        text: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "fromContext")]
        from_context: Option<String>,
    },
    /// Emit a log line through the run's logger.
    Log {
        #[serde(flatten)]
        base: StepBase,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        level: Option<StepLogLevel>,
    },
    /// Capture the resolved element's text into a context key.
    Capture {
        #[serde(flatten)]
        base: StepBase,
        into: String,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "ttlMs")]
        ttl_ms: Option<u64>,
    },
    /// Run a wait operation.
    Wait {
        #[serde(flatten)]
        base: StepBase,
        wait: WaitSpec,
    },
    /// Dispatch to a caller-registered handler by name.
    Custom {
        #[serde(flatten)]
        base: StepBase,
        name: String,
        #[serde(default)]
        params: Value,
    },
    /// Conditional branch; each side runs in a child scope.
    If {
        #[serde(flatten)]
        base: StepBase,
        when: Condition,
        then: Vec<WorkflowStep>,
        #[serde(default, rename = "else", skip_serializing_if = "Vec::is_empty")]
        otherwise: Vec<WorkflowStep>,
    },
    /// Iterate a context list; each item runs in a child scope with the
    /// item bound to `as`.
    Foreach {
        #[serde(flatten)]
        base: StepBase,
        list: String,
        #[serde(rename = "as")]
        bind: String,
        #[serde(default, skip_serializing_if = "Option::is_none", rename = "indexVar")]
        index_var: Option<String>,
        steps: Vec<WorkflowStep>,
    },
    /// Re-run the branch on failure per the merged policy, rolling the
    /// scope back between attempts.
    Retry {
        #[serde(flatten)]
        base: StepBase,
        #[serde(default)]
        policy: TimingOverrides,
        steps: Vec<WorkflowStep>,
    },
}

impl WorkflowStep {
    pub fn click(key: impl Into<String>) -> Self {
        Self::Click {
            base: StepBase {
                key: Some(key.into()),
                ..StepBase::default()
            },
        }
    }

    pub fn type_text(key: impl Into<String>, text: impl Into<String>) -> Self {
        Self::Type {
            base: StepBase {
                key: Some(key.into()),
                ..StepBase::default()
            },
            text: Some(text.into()),
            from_context: None,
        }
    }

    pub fn type_from_context(key: impl Into<String>, context_key: impl Into<String>) -> Self {
        Self::Type {
            base: StepBase {
                key: Some(key.into()),
                ..StepBase::default()
            },
            text: None,
            from_context: Some(context_key.into()),
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::Log {
            base: StepBase::default(),
            message: message.into(),
            level: None,
        }
    }

    pub fn capture(key: impl Into<String>, into: impl Into<String>) -> Self {
        Self::Capture {
            base: StepBase {
                key: Some(key.into()),
                ..StepBase::default()
            },
            into: into.into(),
            ttl_ms: None,
        }
    }

    pub fn wait(spec: WaitSpec) -> Self {
        Self::Wait {
            base: StepBase::default(),
            wait: spec,
        }
    }

    pub fn custom(name: impl Into<String>, params: Value) -> Self {
        Self::Custom {
            base: StepBase::default(),
            name: name.into(),
            params,
        }
    }

    pub fn if_then(when: Condition, then: Vec<WorkflowStep>) -> Self {
        Self::If {
            base: StepBase::default(),
            when,
            then,
            otherwise: Vec::new(),
        }
    }

    pub fn if_else(when: Condition, then: Vec<WorkflowStep>, otherwise: Vec<WorkflowStep>) -> Self {
        Self::If {
            base: StepBase::default(),
            when,
            then,
            otherwise,
        }
    }

    pub fn foreach(
        list: impl Into<String>,
        bind: impl Into<String>,
        steps: Vec<WorkflowStep>,
    ) -> Self {
        Self::Foreach {
            base: StepBase::default(),
            list: list.into(),
            bind: bind.into(),
            index_var: None,
            steps,
        }
    }

    pub fn retry(policy: TimingOverrides, steps: Vec<WorkflowStep>) -> Self {
        Self::Retry {
            base: StepBase::default(),
            policy,
            steps,
        }
    }

    pub fn base(&self) -> &StepBase {
        match self {
            Self::Click { base }
            | Self::Type { base, .. }
            | Self::Log { base, .. }
            | Self::Capture { base, .. }
            | Self::Wait { base, .. }
            | Self::Custom { base, .. }
            | Self::If { base, .. }
            | Self::Foreach { base, .. }
            | Self::Retry { base, .. } => base,
        }
    }

    pub fn base_mut(&mut self) -> &mut StepBase {
        match self {
            Self::Click { base }
            | Self::Type { base, .. }
            | Self::Log { base, .. }
            | Self::Capture { base, .. }
            | Self::Wait { base, .. }
            | Self::Custom { base, .. }
            | Self::If { base, .. }
            | Self::Foreach { base, .. }
            | Self::Retry { base, .. } => base,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.base_mut().id = Some(id.into());
        self
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.base_mut().key = Some(key.into());
        self
    }

    pub fn with_index_var(mut self, var: impl Into<String>) -> Self {
        if let Self::Foreach { index_var, .. } = &mut self {
            *index_var = Some(var.into());
        }
        self
    }

    pub fn with_timing(mut self, timing: TimingOverrides) -> Self {
        self.base_mut().timing = timing;
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.base_mut().timing.timeout_ms = Some(timeout_ms);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.base_mut().timing.retries = Some(retries);
        self
    }

    /// Wire name of the kind, as carried in step events.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Click { .. } => "click",
            Self::Type { .. } => "type",
            Self::Log { .. } => "log",
            Self::Capture { .. } => "capture",
            Self::Wait { .. } => "wait",
            Self::Custom { .. } => "custom",
            Self::If { .. } => "if",
            Self::Foreach { .. } => "foreach",
            Self::Retry { .. } => "retry",
        }
    }

    pub fn is_control_flow(&self) -> bool {
        matches!(
            self,
            Self::If { .. } | Self::Foreach { .. } | Self::Retry { .. }
        )
    }

    /// Handler registry name for atomic kinds.
    pub(crate) fn handler_name(&self) -> Option<&str> {
        match self {
            Self::Click { .. } => Some("click"),
            Self::Type { .. } => Some("type"),
            Self::Log { .. } => Some("log"),
            Self::Capture { .. } => Some("capture"),
            Self::Wait { .. } => Some("wait"),
            Self::Custom { name, .. } => Some(name),
            _ => None,
        }
    }
}

/// A declarative workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowDefinition {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub steps: Vec<WorkflowStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defaults: Option<TimingOverrides>,
}

impl WorkflowDefinition {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            label: None,
            version: None,
            tags: Vec::new(),
            steps: Vec::new(),
            defaults: None,
        }
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_step(mut self, step: WorkflowStep) -> Self {
        self.steps.push(step);
        self
    }

    pub fn with_steps(mut self, steps: Vec<WorkflowStep>) -> Self {
        self.steps = steps;
        self
    }

    pub fn with_defaults(mut self, defaults: TimingOverrides) -> Self {
        self.defaults = Some(defaults);
        self
    }

    pub fn validate(&self) -> Result<(), StepError> {
        if self.id.trim().is_empty() {
            return Err(StepError::unknown("workflow definition id must be non-empty"));
        }
        Ok(())
    }
}

/// Initial and final context snapshots of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSnapshots {
    pub initial: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "final")]
    pub final_snapshot: Option<Map<String, Value>>,
}

/// Mutable record of one run, cloned out to callers on request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    pub id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub completed_steps: u32,
    pub cancel_requested: bool,
    pub timing: TimingConfig,
    pub context_snapshots: ContextSnapshots,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
    pub metadata: Value,
}

/// Terminal result of `run_workflow`.
#[derive(Debug, Clone)]
pub struct WorkflowRunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub completed_steps: u32,
    pub error: Option<StepError>,
    pub context_snapshot: Map<String, Value>,
}
