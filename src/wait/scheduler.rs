//! The polling wait scheduler.
//!
//! One cooperative loop per wait: resolve the target through the selector
//! chain (plus raw fallbacks), consult the schedule integration, escalate
//! stale nodes, evaluate the predicate, and emit inline telemetry, all
//! under a deadline with jittered poll delays.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::debug;

use super::predicate::{PredicateContext, WaitPredicate, WaitPredicateSnapshot};
use super::scroll::{IntegrationContext, IntegrationVerdict, ScheduleIntegration};
use super::{WaitOptions, WaitResult};
use crate::dom::{DomBackend, DomElement, DomError, ElementHandle};
use crate::error::{WaitError, WaitErrorKind};
use crate::runtime::backoff::jittered_interval;
use crate::runtime::{Clock, SchedulerEnv};
use crate::selector::{
    ResolveAttempt, ResolveResult, ResolvedScope, SelectorResolver, text_xpath,
};
use crate::telemetry::{TelemetryBus, WaitEvent};

/// Heartbeat cadence during a wait.
pub const HEARTBEAT_INTERVAL_MS: u64 = 1_000;

/// Floor for the polling interval.
pub const MIN_INTERVAL_MS: u64 = 25;

/// Raw fallback selectors consulted, in order, when the logical key did not
/// resolve. Assembled by the facade; `text` is absent when the text option
/// feeds a predicate instead.
#[derive(Debug, Clone, Default)]
pub(crate) struct FallbackSelectors {
    pub css: Option<String>,
    pub xpath: Option<String>,
    pub text: Option<String>,
    pub text_exact: bool,
}

impl FallbackSelectors {
    fn is_empty(&self) -> bool {
        self.css.is_none() && self.xpath.is_none() && self.text.is_none()
    }
}

/// Shared collaborators of one wait invocation.
pub(crate) struct WaitDeps<'a> {
    pub dom: &'a Arc<dyn DomBackend>,
    pub resolver: &'a Arc<SelectorResolver>,
    pub env: &'a SchedulerEnv,
    pub telemetry: &'a Arc<TelemetryBus>,
}

struct LoopState {
    key: Option<String>,
    started_at: DateTime<Utc>,
    started_ms: u64,
    poll_count: u32,
    stale_recoveries: u32,
    attempts: Vec<ResolveAttempt>,
    strategy_history: Vec<String>,
    last_resolve: Option<ResolveResult>,
    last_snapshot: Option<WaitPredicateSnapshot>,
}

impl LoopState {
    fn snapshot_with_recoveries(&self) -> Option<WaitPredicateSnapshot> {
        let mut snapshot = self.last_snapshot.clone();
        if self.stale_recoveries > 0 {
            snapshot
                .get_or_insert_with(WaitPredicateSnapshot::default)
                .stale_recoveries = Some(self.stale_recoveries);
        }
        snapshot
    }

    fn finalize_error(&self, mut err: WaitError, elapsed_ms: u64) -> WaitError {
        err.key = self.key.clone();
        err.elapsed_ms = elapsed_ms;
        err.poll_count = self.poll_count;
        err.attempts = self.attempts.clone();
        err.strategy_history = self.strategy_history.clone();
        err.stale_recoveries = self.stale_recoveries;
        if err.predicate_snapshot.is_none() {
            err.predicate_snapshot = self.snapshot_with_recoveries();
        }
        err
    }
}

fn fail(deps: &WaitDeps<'_>, state: &LoopState, err: WaitError, elapsed_ms: u64) -> WaitError {
    let err = state.finalize_error(err, elapsed_ms);
    deps.telemetry.emit_wait(WaitEvent::Failure {
        key: state.key.clone(),
        code: err.code().to_string(),
        message: err.message.clone(),
        poll_count: state.poll_count,
        elapsed_ms,
        stale_recoveries: state.stale_recoveries,
        snapshot: err.predicate_snapshot.clone(),
    });
    err
}

/// Run the wait loop to completion.
pub(crate) async fn run_wait(
    deps: &WaitDeps<'_>,
    options: &WaitOptions,
    fallbacks: &FallbackSelectors,
    predicate: Option<&dyn WaitPredicate>,
    mut integration: Option<Box<dyn ScheduleIntegration>>,
) -> Result<WaitResult, WaitError> {
    let clock = &deps.env.clock;
    let timeout_ms = options.timeout_ms;
    let interval_ms = options.interval_ms.max(MIN_INTERVAL_MS);
    let stale_cap = options
        .hints
        .stale_retry_cap
        .unwrap_or(options.max_resolver_retries);
    let presence_goal = options.hints.presence_threshold.unwrap_or(1).max(1);
    let max_attempts = options.max_attempts.map(|value| value.max(1));
    let signal = options.signal.clone().unwrap_or_default();
    let targetless = options.key.is_none() && fallbacks.is_empty();

    let mut state = LoopState {
        key: options.key.clone(),
        started_at: clock.wall_now(),
        started_ms: clock.now_ms(),
        poll_count: 0,
        stale_recoveries: 0,
        attempts: Vec::new(),
        strategy_history: Vec::new(),
        last_resolve: None,
        last_snapshot: None,
    };
    let mut last_heartbeat_ms = state.started_ms;
    let mut presence_streak: u32 = 0;

    deps.telemetry.emit_wait(WaitEvent::Start {
        key: state.key.clone(),
        timeout_ms,
        interval_ms,
        started_at: state.started_at,
        metadata: options.telemetry_metadata.clone(),
    });

    loop {
        if signal.is_cancelled() {
            let elapsed = clock.now_ms().saturating_sub(state.started_ms);
            return Err(fail(deps, &state, WaitError::cancelled(None), elapsed));
        }
        let elapsed = clock.now_ms().saturating_sub(state.started_ms);
        if state.poll_count > 0 && elapsed >= timeout_ms {
            break;
        }
        if let Some(max) = max_attempts {
            if state.poll_count >= max {
                break;
            }
        }
        state.poll_count += 1;
        if options.debug {
            debug!(key = ?state.key, poll = state.poll_count, elapsed, "wait poll");
        }

        // Resolve phase; an integration may ask for same-iteration retries,
        // which coalesce into this iteration's single attempt event.
        let resolve_result = loop {
            if let Some(integration) = integration.as_deref_mut() {
                let cx = IntegrationContext {
                    resolve_result: None,
                    poll_count: state.poll_count,
                    elapsed_ms: clock.now_ms().saturating_sub(state.started_ms),
                };
                integration.before_resolve(&cx).await;
            }
            let result = match resolve_once(deps, options, fallbacks).await {
                Ok(result) => result,
                Err(err) => {
                    let elapsed = clock.now_ms().saturating_sub(state.started_ms);
                    return Err(fail(
                        deps,
                        &state,
                        WaitError::new(
                            WaitErrorKind::Unknown,
                            format!("selector backend failure: {err}"),
                        ),
                        elapsed,
                    ));
                }
            };
            state.attempts.extend(result.attempts.iter().cloned());
            state
                .strategy_history
                .extend(result.attempts.iter().map(|a| a.strategy.clone()));

            match integration.as_deref_mut() {
                Some(integration) => {
                    let cx = IntegrationContext {
                        resolve_result: Some(&result),
                        poll_count: state.poll_count,
                        elapsed_ms: clock.now_ms().saturating_sub(state.started_ms),
                    };
                    match integration.after_resolve(&cx).await {
                        IntegrationVerdict::Retry => continue,
                        IntegrationVerdict::Continue => break result,
                    }
                }
                None => break result,
            }
        };

        let elapsed = clock.now_ms().saturating_sub(state.started_ms);
        deps.telemetry.emit_wait(WaitEvent::Attempt {
            key: state.key.clone(),
            poll_count: state.poll_count,
            elapsed_ms: elapsed,
            strategy_history: state.strategy_history.clone(),
        });

        match resolve_result.element.clone() {
            Some(element) => {
                // Stale node: the backend still answers for it but it fell
                // out of the tree. Recover by re-resolving, bounded by the
                // stale cap.
                if !element.is_connected() {
                    state.stale_recoveries += 1;
                    presence_streak = 0;
                    state.last_resolve = Some(resolve_result);
                    if state.stale_recoveries > stale_cap {
                        let err = WaitError::new(
                            WaitErrorKind::Timeout { timeout_ms },
                            format!(
                                "stale target for {} exhausted {} recovery attempt(s)",
                                describe_key(&state.key),
                                stale_cap
                            ),
                        );
                        let elapsed = clock.now_ms().saturating_sub(state.started_ms);
                        return Err(fail(deps, &state, err, elapsed));
                    }
                } else {
                    let mut satisfied_this_poll = true;
                    if let Some(predicate) = predicate {
                        let verdict = predicate
                            .evaluate(PredicateContext {
                                element: &element,
                                resolve_result: &resolve_result,
                                poll_count: state.poll_count,
                                elapsed_ms: elapsed,
                                signal: &signal,
                            })
                            .await;
                        let verdict = match verdict {
                            Ok(verdict) => verdict,
                            Err(DomError::Detached(_)) => {
                                super::predicate::PredicateVerdict::stale()
                            }
                            Err(err) => {
                                let elapsed = clock.now_ms().saturating_sub(state.started_ms);
                                return Err(fail(
                                    deps,
                                    &state,
                                    WaitError::new(
                                        WaitErrorKind::Unknown,
                                        format!("predicate evaluation failed: {err}"),
                                    ),
                                    elapsed,
                                ));
                            }
                        };
                        if let Some(snapshot) = &verdict.snapshot {
                            state
                                .last_snapshot
                                .get_or_insert_with(WaitPredicateSnapshot::default)
                                .merge_from(snapshot);
                        }
                        if verdict.stale {
                            state.stale_recoveries += 1;
                            presence_streak = 0;
                            state.last_resolve = Some(resolve_result.clone());
                            if state.stale_recoveries > stale_cap {
                                let err = WaitError::new(
                                    WaitErrorKind::Timeout { timeout_ms },
                                    format!(
                                        "stale target for {} exhausted {} recovery attempt(s)",
                                        describe_key(&state.key),
                                        stale_cap
                                    ),
                                );
                                let elapsed = clock.now_ms().saturating_sub(state.started_ms);
                                return Err(fail(deps, &state, err, elapsed));
                            }
                            // fall through to the delay below
                            satisfied_this_poll = false;
                        } else {
                            satisfied_this_poll = verdict.satisfied;
                            state.last_resolve = Some(resolve_result.clone());
                        }
                    } else {
                        state.last_resolve = Some(resolve_result.clone());
                    }

                    if satisfied_this_poll {
                        presence_streak += 1;
                        if presence_streak >= presence_goal {
                            return Ok(build_success(
                                deps, options, &state, resolve_result, element,
                            ));
                        }
                    } else {
                        presence_streak = 0;
                    }
                }
            }
            None => {
                presence_streak = 0;
                state.last_resolve = Some(resolve_result);
                if targetless && predicate.is_none() {
                    // nothing to locate and nothing to check: the wait is a
                    // pure scheduling point (idle gates run on top of it)
                    let result = state
                        .last_resolve
                        .clone()
                        .unwrap_or_else(ResolveResult::anonymous);
                    return Ok(build_targetless_success(deps, &state, result));
                }
            }
        }

        let now = clock.now_ms();
        let elapsed = now.saturating_sub(state.started_ms);
        if now.saturating_sub(last_heartbeat_ms) >= HEARTBEAT_INTERVAL_MS {
            last_heartbeat_ms = now;
            deps.telemetry.emit_wait(WaitEvent::Heartbeat {
                key: state.key.clone(),
                poll_count: state.poll_count,
                elapsed_ms: elapsed,
                remaining_ms: timeout_ms.saturating_sub(elapsed),
                stale_recoveries: state.stale_recoveries,
                snapshot: state.snapshot_with_recoveries(),
            });
        }

        // delay-with-remaining: the jittered interval never overshoots the
        // deadline
        let jittered = jittered_interval(interval_ms, deps.env.random.as_ref()).max(MIN_INTERVAL_MS);
        let remaining = timeout_ms.saturating_sub(elapsed);
        let delay = jittered.min(remaining);
        if delay > 0
            && deps
                .env
                .sleep_cancellable(Duration::from_millis(delay), &signal)
                .await
                .is_err()
        {
            let elapsed = clock.now_ms().saturating_sub(state.started_ms);
            return Err(fail(deps, &state, WaitError::cancelled(None), elapsed));
        }
    }

    // deadline or attempt budget exhausted
    let elapsed = clock.now_ms().saturating_sub(state.started_ms);
    let had_element = state
        .last_resolve
        .as_ref()
        .map(|result| result.element.is_some())
        .unwrap_or(false);
    let err = if had_element {
        WaitError::new(
            WaitErrorKind::Timeout { timeout_ms },
            format!(
                "wait for {} timed out after {elapsed}ms ({} poll(s))",
                describe_key(&state.key),
                state.poll_count
            ),
        )
    } else {
        let resolve_result = state
            .last_resolve
            .clone()
            .unwrap_or_else(ResolveResult::anonymous);
        WaitError::new(
            WaitErrorKind::ResolverMiss {
                resolve_result: Box::new(resolve_result),
            },
            format!(
                "no selector strategy matched {} within {timeout_ms}ms",
                describe_key(&state.key)
            ),
        )
    };
    Err(fail(deps, &state, err, elapsed))
}

fn describe_key(key: &Option<String>) -> String {
    match key {
        Some(key) => format!("'{key}'"),
        None => "anonymous target".to_string(),
    }
}

fn build_success(
    deps: &WaitDeps<'_>,
    options: &WaitOptions,
    state: &LoopState,
    resolve_result: ResolveResult,
    element: ElementHandle,
) -> WaitResult {
    let clock = &deps.env.clock;
    let finished_at = clock.wall_now();
    let elapsed_ms = clock.now_ms().saturating_sub(state.started_ms);
    let snapshot = state.snapshot_with_recoveries();
    deps.telemetry.emit_wait(WaitEvent::Success {
        key: state.key.clone(),
        poll_count: state.poll_count,
        elapsed_ms,
        stale_recoveries: state.stale_recoveries,
        resolved_by: resolve_result.resolved_by.clone(),
        snapshot: snapshot.clone(),
    });
    if options.debug {
        debug!(key = ?state.key, polls = state.poll_count, elapsed_ms, "wait satisfied");
    }
    WaitResult {
        key: state.key.clone(),
        resolve_result,
        target: Some(element),
        attempts: state.attempts.clone(),
        poll_count: state.poll_count,
        elapsed_ms,
        strategy_history: state.strategy_history.clone(),
        stale_recoveries: state.stale_recoveries,
        predicate_snapshot: snapshot,
        idle_snapshot: None,
        started_at: state.started_at,
        finished_at,
    }
}

fn build_targetless_success(
    deps: &WaitDeps<'_>,
    state: &LoopState,
    resolve_result: ResolveResult,
) -> WaitResult {
    let clock = &deps.env.clock;
    let finished_at = clock.wall_now();
    let elapsed_ms = clock.now_ms().saturating_sub(state.started_ms);
    deps.telemetry.emit_wait(WaitEvent::Success {
        key: state.key.clone(),
        poll_count: state.poll_count,
        elapsed_ms,
        stale_recoveries: state.stale_recoveries,
        resolved_by: None,
        snapshot: None,
    });
    WaitResult {
        key: state.key.clone(),
        resolve_result,
        target: None,
        attempts: state.attempts.clone(),
        poll_count: state.poll_count,
        elapsed_ms,
        strategy_history: state.strategy_history.clone(),
        stale_recoveries: state.stale_recoveries,
        predicate_snapshot: None,
        idle_snapshot: None,
        started_at: state.started_at,
        finished_at,
    }
}

/// One resolve pass: scope, then the logical key, then the raw fallbacks in
/// `{css, xpath, text}` order, merged into a single result that prefers the
/// fallback's `resolvedBy` when a fallback won.
async fn resolve_once(
    deps: &WaitDeps<'_>,
    options: &WaitOptions,
    fallbacks: &FallbackSelectors,
) -> Result<ResolveResult, DomError> {
    let mut scope_root: Option<ElementHandle> = None;
    let mut scope_info: Option<ResolvedScope> = None;
    let mut scope_attempts: Vec<ResolveAttempt> = Vec::new();
    if let Some(scope_key) = &options.scope_key {
        let scope_result = deps.resolver.resolve(scope_key, None).await?;
        scope_attempts = scope_result.attempts.clone();
        match scope_result.element {
            Some(scope_element) => {
                scope_info = Some(ResolvedScope {
                    key: scope_key.clone(),
                    root: scope_element.clone(),
                });
                scope_root = Some(scope_element);
            }
            None => {
                // a missing scope means the target cannot match this poll
                let mut result = match &options.key {
                    Some(key) => ResolveResult::for_key(key),
                    None => ResolveResult::anonymous(),
                };
                result.attempts = scope_attempts;
                return Ok(result);
            }
        }
    }

    let mut merged = match &options.key {
        Some(key) => deps.resolver.resolve(key, scope_root.as_ref()).await?,
        None => ResolveResult::anonymous(),
    };
    let mut attempts = scope_attempts;
    attempts.append(&mut merged.attempts);
    merged.attempts = attempts;
    if merged.scope.is_none() {
        merged.scope = scope_info;
    }

    if merged.element.is_none() {
        if let Some(css) = &fallbacks.css {
            let matches = deps.dom.query_selector_all(scope_root.as_ref(), css).await?;
            merged.attempts.push(ResolveAttempt {
                strategy: "css".to_string(),
                success: !matches.is_empty(),
                elements: matches.len(),
            });
            if let Some(element) = matches.into_iter().next() {
                merged.element = Some(element);
                merged.resolved_by = Some("css".to_string());
            }
        }
    }
    if merged.element.is_none() {
        if let Some(xpath) = &fallbacks.xpath {
            let matches = deps.dom.evaluate_xpath(scope_root.as_ref(), xpath).await?;
            merged.attempts.push(ResolveAttempt {
                strategy: "xpath".to_string(),
                success: !matches.is_empty(),
                elements: matches.len(),
            });
            if let Some(element) = matches.into_iter().next() {
                merged.element = Some(element);
                merged.resolved_by = Some("xpath".to_string());
            }
        }
    }
    if merged.element.is_none() {
        if let Some(text) = &fallbacks.text {
            let expression = text_xpath(text, fallbacks.text_exact);
            let matches = deps
                .dom
                .evaluate_xpath(scope_root.as_ref(), &expression)
                .await?;
            merged.attempts.push(ResolveAttempt {
                strategy: "text".to_string(),
                success: !matches.is_empty(),
                elements: matches.len(),
            });
            if let Some(element) = matches.into_iter().next() {
                merged.element = Some(element);
                merged.resolved_by = Some("text".to_string());
            }
        }
    }
    Ok(merged)
}
