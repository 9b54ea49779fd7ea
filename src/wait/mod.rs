//! The wait core: polling scheduler, predicates, idle gate, scroll recovery.
//!
//! [`Waiter`] is the facade. It assembles predicates and idle follow-up for
//! the five operations:
//!
//! - [`Waiter::wait_for`]: resolve a target (logical key plus raw
//!   fallbacks), optionally gated by a visibility predicate.
//! - [`Waiter::wait_text`]: additionally require a text match.
//! - [`Waiter::wait_visible`] / [`Waiter::wait_hidden`]: pin the
//!   visibility predicate to one side.
//! - [`Waiter::wait_for_idle`]: after the target settles, require DOM
//!   quiescence via the mutation idle gate.
//!
//! # Example
//!
//! ```rust,ignore
//! use arbor::wait::{WaitOptions, Waiter};
//!
//! let waiter = Waiter::new(resolver);
//! let result = waiter
//!     .wait_for(WaitOptions::for_key("login.submit").with_timeout_ms(5_000))
//!     .await?;
//! println!("resolved by {:?}", result.resolve_result.resolved_by);
//! ```

mod idle;
mod predicate;
mod scheduler;
mod scroll;

pub use idle::{
    IdleOptions, IdleOutcome, IdleSnapshot, IdleStatistics, STATISTICS_DETAIL_CAP, run_idle_gate,
};
pub use predicate::{
    CompositePredicate, PredicateContext, PredicateVerdict, TEXT_MASK, TextMode, TextPredicate,
    TextPredicateConfig, TextSnapshot, VisibilityOptions, VisibilityPredicate, VisibilitySnapshot,
    VisibilityTarget, WaitPredicate, WaitPredicateSnapshot,
};
pub use scheduler::{HEARTBEAT_INTERVAL_MS, MIN_INTERVAL_MS};
pub use scroll::{
    IntegrationContext, IntegrationVerdict, SCROLL_MIN_STEP_PX, SCROLL_SETTLE_DELAY_MS,
    ScheduleIntegration, ScrollRecovery, scroll_attempt_budget,
};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::dom::{DomBackend, ElementHandle, ObserveTarget};
use crate::error::WaitError;
use crate::runtime::SchedulerEnv;
use crate::selector::{ResolveAttempt, ResolveResult, SelectorResolver};
use crate::telemetry::TelemetryBus;
use scheduler::{FallbackSelectors, WaitDeps};

/// Default wait deadline.
pub const DEFAULT_TIMEOUT_MS: u64 = 8_000;
/// Default polling interval.
pub const DEFAULT_INTERVAL_MS: u64 = 150;
/// Default stale-recovery budget.
pub const DEFAULT_MAX_RESOLVER_RETRIES: u32 = 3;

/// Tuning hints for a wait.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WaitHints {
    /// Logical key of a scroll container to advance on misses.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scroller_key: Option<String>,
    /// Consecutive successful polls required before success; also sizes the
    /// scroll attempt budget.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_threshold: Option<u32>,
    /// Overrides `maxResolverRetries` for stale escalation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stale_retry_cap: Option<u32>,
}

/// Options consumed by every wait operation.
#[derive(Debug, Clone)]
pub struct WaitOptions {
    /// Logical key resolved through the selector map.
    pub key: Option<String>,
    /// Raw CSS fallback, tried after the key.
    pub css: Option<String>,
    /// Raw XPath fallback, tried after CSS.
    pub xpath: Option<String>,
    /// Text: a fallback strategy under `wait_for`, the expected value under
    /// `wait_text`.
    pub text: Option<String>,
    /// Regex pattern for `wait_text`.
    pub text_pattern: Option<String>,
    pub text_mode: Option<TextMode>,
    pub visibility: Option<VisibilityOptions>,
    pub idle: Option<IdleOptions>,
    pub timeout_ms: u64,
    pub interval_ms: u64,
    /// Hard cap on poll iterations.
    pub max_attempts: Option<u32>,
    pub max_resolver_retries: u32,
    pub hints: WaitHints,
    /// Logical key of a scope entry; its element becomes the resolve root.
    pub scope_key: Option<String>,
    pub signal: Option<CancellationToken>,
    /// Attached to the `start` telemetry event (sanitized).
    pub telemetry_metadata: Value,
    /// Mask text snapshots and telemetry payloads.
    pub sanitize_logs: bool,
    /// Emit per-poll debug logs.
    pub debug: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            key: None,
            css: None,
            xpath: None,
            text: None,
            text_pattern: None,
            text_mode: None,
            visibility: None,
            idle: None,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            interval_ms: DEFAULT_INTERVAL_MS,
            max_attempts: None,
            max_resolver_retries: DEFAULT_MAX_RESOLVER_RETRIES,
            hints: WaitHints::default(),
            scope_key: None,
            signal: None,
            telemetry_metadata: Value::Null,
            sanitize_logs: true,
            debug: false,
        }
    }
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Self::default()
        }
    }

    pub fn with_css(mut self, css: impl Into<String>) -> Self {
        self.css = Some(css.into());
        self
    }

    pub fn with_xpath(mut self, xpath: impl Into<String>) -> Self {
        self.xpath = Some(xpath.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_text_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.text_pattern = Some(pattern.into());
        self
    }

    pub fn with_text_mode(mut self, mode: TextMode) -> Self {
        self.text_mode = Some(mode);
        self
    }

    pub fn with_visibility(mut self, visibility: VisibilityOptions) -> Self {
        self.visibility = Some(visibility);
        self
    }

    pub fn with_idle(mut self, idle: IdleOptions) -> Self {
        self.idle = Some(idle);
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: u64) -> Self {
        self.interval_ms = interval_ms;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_max_resolver_retries(mut self, retries: u32) -> Self {
        self.max_resolver_retries = retries;
        self
    }

    pub fn with_hints(mut self, hints: WaitHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_scroller_key(mut self, key: impl Into<String>) -> Self {
        self.hints.scroller_key = Some(key.into());
        self
    }

    pub fn with_presence_threshold(mut self, threshold: u32) -> Self {
        self.hints.presence_threshold = Some(threshold);
        self
    }

    pub fn with_scope_key(mut self, scope_key: impl Into<String>) -> Self {
        self.scope_key = Some(scope_key.into());
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    pub fn with_telemetry_metadata(mut self, metadata: Value) -> Self {
        self.telemetry_metadata = metadata;
        self
    }

    pub fn with_sanitize_logs(mut self, sanitize: bool) -> Self {
        self.sanitize_logs = sanitize;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

/// Successful wait outcome.
#[derive(Debug, Clone)]
pub struct WaitResult {
    pub key: Option<String>,
    pub resolve_result: ResolveResult,
    pub target: Option<ElementHandle>,
    pub attempts: Vec<ResolveAttempt>,
    pub poll_count: u32,
    pub elapsed_ms: u64,
    pub strategy_history: Vec<String>,
    pub stale_recoveries: u32,
    pub predicate_snapshot: Option<WaitPredicateSnapshot>,
    pub idle_snapshot: Option<IdleSnapshot>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Facade over the wait scheduler and the idle gate.
#[derive(Debug, Clone)]
pub struct Waiter {
    resolver: Arc<SelectorResolver>,
    dom: Arc<dyn DomBackend>,
    env: SchedulerEnv,
    telemetry: Arc<TelemetryBus>,
}

impl Waiter {
    pub fn new(resolver: Arc<SelectorResolver>) -> Self {
        let dom = resolver.backend().clone();
        Self {
            resolver,
            dom,
            env: SchedulerEnv::system(),
            telemetry: Arc::new(TelemetryBus::new()),
        }
    }

    pub fn with_env(mut self, env: SchedulerEnv) -> Self {
        self.env = env;
        self
    }

    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryBus>) -> Self {
        self.telemetry = telemetry;
        self
    }

    pub fn env(&self) -> &SchedulerEnv {
        &self.env
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBus> {
        &self.telemetry
    }

    pub fn resolver(&self) -> &Arc<SelectorResolver> {
        &self.resolver
    }

    /// Wait for the target to resolve (and satisfy the visibility predicate
    /// when one is configured). The `text` option acts as a raw fallback
    /// strategy here.
    pub async fn wait_for(&self, options: WaitOptions) -> Result<WaitResult, WaitError> {
        let fallbacks = FallbackSelectors {
            css: options.css.clone(),
            xpath: options.xpath.clone(),
            text: options.text.clone(),
            text_exact: options.text_mode == Some(TextMode::Exact),
        };
        let predicate = self.visibility_predicate(&options);
        self.run(options, fallbacks, predicate).await
    }

    /// Wait with a caller-supplied predicate, composed with the visibility
    /// predicate when one is configured.
    pub async fn wait_with_predicate(
        &self,
        options: WaitOptions,
        predicate: Box<dyn WaitPredicate>,
    ) -> Result<WaitResult, WaitError> {
        let fallbacks = FallbackSelectors {
            css: options.css.clone(),
            xpath: options.xpath.clone(),
            text: options.text.clone(),
            text_exact: options.text_mode == Some(TextMode::Exact),
        };
        let predicate = match self.visibility_predicate(&options) {
            Some(visibility) => Box::new(CompositePredicate::new(vec![predicate, visibility]))
                as Box<dyn WaitPredicate>,
            None => predicate,
        };
        self.run(options, fallbacks, Some(predicate)).await
    }

    /// Wait for the target's text to match. Requires `text` or
    /// `textPattern`; the text option feeds the predicate, not the fallback
    /// chain.
    pub async fn wait_text(&self, options: WaitOptions) -> Result<WaitResult, WaitError> {
        if options.text.is_none() && options.text_pattern.is_none() {
            return Err(WaitError::invalid_options(
                "waitText requires text or textPattern",
            ));
        }
        let fallbacks = FallbackSelectors {
            css: options.css.clone(),
            xpath: options.xpath.clone(),
            text: None,
            text_exact: false,
        };
        let mode = options.text_mode.unwrap_or(if options.text_pattern.is_some() {
            TextMode::Regex
        } else {
            TextMode::Contains
        });
        let text_predicate = TextPredicate::new(TextPredicateConfig {
            mode,
            expected: options.text.clone(),
            pattern: options.text_pattern.clone(),
            sanitize: options.sanitize_logs,
        })?;
        let predicate: Box<dyn WaitPredicate> = match self.visibility_predicate(&options) {
            Some(visibility) => Box::new(CompositePredicate::new(vec![
                Box::new(text_predicate),
                visibility,
            ])),
            None => Box::new(text_predicate),
        };
        self.run(options, fallbacks, Some(predicate)).await
    }

    /// Wait until the target is visible.
    pub async fn wait_visible(&self, options: WaitOptions) -> Result<WaitResult, WaitError> {
        self.wait_pinned(options, VisibilityTarget::Visible).await
    }

    /// Wait until the target is hidden.
    pub async fn wait_hidden(&self, options: WaitOptions) -> Result<WaitResult, WaitError> {
        self.wait_pinned(options, VisibilityTarget::Hidden).await
    }

    async fn wait_pinned(
        &self,
        options: WaitOptions,
        target: VisibilityTarget,
    ) -> Result<WaitResult, WaitError> {
        let fallbacks = FallbackSelectors {
            css: options.css.clone(),
            xpath: options.xpath.clone(),
            text: options.text.clone(),
            text_exact: options.text_mode == Some(TextMode::Exact),
        };
        let visibility = options
            .visibility
            .clone()
            .unwrap_or_default()
            .with_target(target);
        let predicate: Box<dyn WaitPredicate> =
            Box::new(VisibilityPredicate::new(visibility, self.dom.viewport()));
        self.run(options, fallbacks, Some(predicate)).await
    }

    /// Wait for the target, then require the surrounding subtree to go
    /// quiet. Requires `idle`; the gate scopes to the resolved target, else
    /// the resolve scope, else the whole document.
    pub async fn wait_for_idle(&self, options: WaitOptions) -> Result<WaitResult, WaitError> {
        let Some(idle) = options.idle.clone() else {
            return Err(WaitError::invalid_options("waitForIdle requires idle options"));
        };
        let signal = options.signal.clone();
        let mut result = self.wait_for(options).await?;

        let target = match (&result.target, &result.resolve_result.scope) {
            (Some(element), _) => ObserveTarget::Elements(vec![element.clone()]),
            (None, Some(scope)) => ObserveTarget::Elements(vec![scope.root.clone()]),
            (None, None) => ObserveTarget::Document,
        };
        let outcome = self
            .idle_gate(&idle, &target, signal.as_ref())
            .await
            .map_err(|mut err| {
                if err.key.is_none() {
                    err.key = result.key.clone();
                }
                err
            })?;
        result.idle_snapshot = Some(outcome.snapshot);
        result.finished_at = outcome.finished_at;
        result.elapsed_ms += outcome.duration_ms;
        Ok(result)
    }

    /// Run the idle gate directly over a subtree.
    pub async fn idle_gate(
        &self,
        options: &IdleOptions,
        target: &ObserveTarget,
        signal: Option<&CancellationToken>,
    ) -> Result<IdleOutcome, WaitError> {
        run_idle_gate(
            &self.dom,
            &self.env,
            options,
            target,
            None,
            signal,
            Some(self.telemetry.as_ref()),
        )
        .await
    }

    fn visibility_predicate(&self, options: &WaitOptions) -> Option<Box<dyn WaitPredicate>> {
        options.visibility.clone().map(|visibility| {
            Box::new(VisibilityPredicate::new(visibility, self.dom.viewport()))
                as Box<dyn WaitPredicate>
        })
    }

    async fn run(
        &self,
        options: WaitOptions,
        fallbacks: FallbackSelectors,
        predicate: Option<Box<dyn WaitPredicate>>,
    ) -> Result<WaitResult, WaitError> {
        let integration: Option<Box<dyn ScheduleIntegration>> =
            options.hints.scroller_key.as_ref().map(|scroller_key| {
                Box::new(ScrollRecovery::new(
                    self.resolver.clone(),
                    self.env.sleeper.clone(),
                    scroller_key.clone(),
                    options.hints.presence_threshold.unwrap_or(1),
                )) as Box<dyn ScheduleIntegration>
            });
        let deps = WaitDeps {
            dom: &self.dom,
            resolver: &self.resolver,
            env: &self.env,
            telemetry: &self.telemetry,
        };
        scheduler::run_wait(&deps, &options, &fallbacks, predicate.as_deref(), integration).await
    }
}
