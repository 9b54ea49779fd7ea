//! The workflow step scheduler and the process-wide run registry.
//!
//! `run_workflow` drives a definition branch-by-branch: atomic steps go
//! through the retry/timeout loop and their registered handler; control-flow
//! steps (`if`, `foreach`, `retry`) recurse into child branches inside
//! transactional context scopes. Execution failures resolve to an outcome
//! with `status: failed`; only an unrunnable definition rejects outright.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bridge::{BridgeRequest, ResolverBridge};
use super::condition::{self, ConditionScope};
use super::handler::{
    HandlerRegistry, StepHandler, StepInvocation, StepLog, StepLogLevel, StepOutcome,
};
use super::{
    Condition, ContextSnapshots, RunMetadata, StepBase, TimingConfig, TimingOverrides,
    WorkflowDefinition, WorkflowRunOutcome, WorkflowStep,
};
use crate::context::{ContextManager, ContextStore, MemoryContext};
use crate::dom::DomBackend;
use crate::error::StepError;
use crate::runtime::{Clock, SchedulerEnv, Sleeper};
use crate::selector::{ResolveResult, SelectorResolver};
use crate::telemetry::{RunEvent, RunPhase, RunStatus, StepEvent, StepEventStatus, TelemetryBus};
use crate::wait::Waiter;

/// Caller-side options of one run.
#[derive(Debug)]
pub struct RunOptions {
    /// Base context store; a fresh in-memory store when absent.
    pub context: Option<Box<dyn ContextStore>>,
    /// Caller timing overrides, merged over the definition defaults.
    pub timing: TimingOverrides,
    /// Attached to run telemetry and metadata (sanitized on emission).
    pub metadata: Value,
    /// Parent cancellation signal; the run derives a child token from it.
    pub signal: Option<CancellationToken>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            context: None,
            timing: TimingOverrides::default(),
            metadata: Value::Null,
            signal: None,
        }
    }
}

impl RunOptions {
    pub fn with_context(mut self, context: Box<dyn ContextStore>) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_timing(mut self, timing: TimingOverrides) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Summary of one in-flight run.
#[derive(Debug, Clone)]
pub struct ActiveRunInfo {
    pub run_id: String,
    pub workflow_id: String,
    pub status: RunStatus,
    pub cancel_requested: bool,
}

#[derive(Debug)]
struct ActiveRun {
    token: CancellationToken,
    record: Arc<Mutex<RunMetadata>>,
}

/// Executes workflow definitions against the shared resolver fabric.
#[derive(Debug)]
pub struct WorkflowRunner {
    resolver: Arc<SelectorResolver>,
    dom: Arc<dyn DomBackend>,
    bridge: Arc<ResolverBridge>,
    waiter: Arc<Waiter>,
    handlers: HandlerRegistry,
    telemetry: Arc<TelemetryBus>,
    env: SchedulerEnv,
    runs: Mutex<HashMap<String, ActiveRun>>,
}

impl WorkflowRunner {
    pub fn new(resolver: Arc<SelectorResolver>) -> Self {
        let dom = resolver.backend().clone();
        let env = SchedulerEnv::system();
        let telemetry = Arc::new(TelemetryBus::new());
        let waiter = Arc::new(
            Waiter::new(resolver.clone())
                .with_env(env.clone())
                .with_telemetry(telemetry.clone()),
        );
        Self {
            bridge: Arc::new(ResolverBridge::new(resolver.clone())),
            handlers: HandlerRegistry::with_defaults(waiter.clone()),
            resolver,
            dom,
            waiter,
            telemetry,
            env,
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Swap the runtime seams. Call before [`WorkflowRunner::register_handler`]:
    /// the built-in handlers are rebuilt around the new environment.
    pub fn with_env(mut self, env: SchedulerEnv) -> Self {
        self.env = env;
        self.rebuild_waiter();
        self
    }

    /// Swap the telemetry bus. Call before [`WorkflowRunner::register_handler`].
    pub fn with_telemetry(mut self, telemetry: Arc<TelemetryBus>) -> Self {
        self.telemetry = telemetry;
        self.rebuild_waiter();
        self
    }

    fn rebuild_waiter(&mut self) {
        self.waiter = Arc::new(
            Waiter::new(self.resolver.clone())
                .with_env(self.env.clone())
                .with_telemetry(self.telemetry.clone()),
        );
        self.handlers = HandlerRegistry::with_defaults(self.waiter.clone());
    }

    /// Register a custom step handler, dispatched by `custom` steps' `name`.
    pub fn register_handler(
        &mut self,
        name: impl Into<String>,
        handler: Arc<dyn super::StepHandler>,
    ) {
        self.handlers.register(name, handler);
    }

    pub fn telemetry(&self) -> &Arc<TelemetryBus> {
        &self.telemetry
    }

    pub fn waiter(&self) -> &Arc<Waiter> {
        &self.waiter
    }

    pub fn bridge(&self) -> &Arc<ResolverBridge> {
        &self.bridge
    }

    /// Deep clone of an in-flight run's metadata. `None` once the run's
    /// observers have settled and the registry entry is gone.
    pub fn run_metadata(&self, run_id: &str) -> Option<RunMetadata> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(run_id)
            .map(|active| active.record.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    /// In-flight runs, for dashboards and tests.
    pub fn active_runs(&self) -> Vec<ActiveRunInfo> {
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .map(|active| {
                let record = active.record.lock().unwrap_or_else(|e| e.into_inner());
                ActiveRunInfo {
                    run_id: record.id.clone(),
                    workflow_id: record.workflow_id.clone(),
                    status: record.status,
                    cancel_requested: record.cancel_requested,
                }
            })
            .collect()
    }

    /// Request cooperative cancellation of a run. Returns `true` iff the run
    /// was active and not already aborted.
    pub fn cancel_run(&self, run_id: &str) -> bool {
        let (token, event) = {
            let runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
            let Some(active) = runs.get(run_id) else {
                return false;
            };
            if active.token.is_cancelled() {
                return false;
            }
            let mut record = active.record.lock().unwrap_or_else(|e| e.into_inner());
            record.cancel_requested = true;
            let event = RunEvent {
                run_id: record.id.clone(),
                workflow_id: record.workflow_id.clone(),
                phase: RunPhase::CancelRequested,
                status: record.status,
                started_at: record.started_at,
                finished_at: None,
                duration_ms: None,
                completed_steps: Some(record.completed_steps),
                error: None,
                metadata: record.metadata.clone(),
            };
            (active.token.clone(), event)
        };
        self.telemetry.emit_run(event);
        token.cancel();
        info!(run_id, "run cancellation requested");
        true
    }

    /// Run a workflow definition to completion. Step failures resolve into
    /// the outcome (`status: failed`); only an invalid definition rejects.
    pub async fn run_workflow(
        &self,
        definition: &WorkflowDefinition,
        options: RunOptions,
    ) -> Result<WorkflowRunOutcome, StepError> {
        definition.validate()?;

        let run_id = uuid::Uuid::new_v4().to_string();
        let token = match &options.signal {
            Some(signal) => signal.child_token(),
            None => CancellationToken::new(),
        };
        let mut timing = TimingConfig::default();
        if let Some(defaults) = &definition.defaults {
            timing = timing.merged(defaults);
        }
        let timing = timing.merged(&options.timing);

        let base = options
            .context
            .unwrap_or_else(|| Box::new(MemoryContext::new()));
        let mut context = ContextManager::new(base, self.env.clock.clone());
        let started_at = self.env.clock.wall_now();
        let started_ms = self.env.clock.now_ms();
        let initial = context.snapshot();

        let record = Arc::new(Mutex::new(RunMetadata {
            id: run_id.clone(),
            workflow_id: definition.id.clone(),
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            duration_ms: None,
            completed_steps: 0,
            cancel_requested: false,
            timing: timing.clone(),
            context_snapshots: ContextSnapshots {
                initial,
                final_snapshot: None,
            },
            error: None,
            metadata: options.metadata.clone(),
        }));
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                run_id.clone(),
                ActiveRun {
                    token: token.clone(),
                    record: record.clone(),
                },
            );
        self.telemetry.emit_run(RunEvent {
            run_id: run_id.clone(),
            workflow_id: definition.id.clone(),
            phase: RunPhase::Started,
            status: RunStatus::Running,
            started_at,
            finished_at: None,
            duration_ms: None,
            completed_steps: None,
            error: None,
            metadata: options.metadata.clone(),
        });
        info!(run_id, workflow_id = %definition.id, "workflow run started");

        let execution = {
            let mut ctx = ExecCtx {
                run_id: &run_id,
                workflow_id: &definition.id,
                timing: timing.clone(),
                context: &mut context,
                token: token.clone(),
                record: &record,
                step_cursor: 0,
                completed_steps: 0,
            };
            self.execute_branch(&definition.steps, &mut ctx).await
        };

        let finished_at = self.env.clock.wall_now();
        let duration_ms = self.env.clock.now_ms().saturating_sub(started_ms);
        let final_snapshot = context.snapshot();
        let (status, run_error) = match &execution {
            Ok(()) => (RunStatus::Success, None),
            Err(err) if err.is_cancellation() => (RunStatus::Cancelled, Some(err.clone())),
            Err(err) => (RunStatus::Failed, Some(err.clone())),
        };

        let completed_steps = {
            let mut rec = record.lock().unwrap_or_else(|e| e.into_inner());
            rec.status = status;
            rec.finished_at = Some(finished_at);
            rec.duration_ms = Some(duration_ms);
            rec.context_snapshots.final_snapshot = Some(final_snapshot.clone());
            rec.error = run_error.as_ref().map(StepError::telemetry_payload);
            if status == RunStatus::Cancelled {
                rec.cancel_requested = true;
            }
            rec.completed_steps
        };

        self.bridge.clear(&run_id);
        self.telemetry.flush(&run_id);
        self.telemetry.emit_run(RunEvent {
            run_id: run_id.clone(),
            workflow_id: definition.id.clone(),
            phase: RunPhase::Completed,
            status,
            started_at,
            finished_at: Some(finished_at),
            duration_ms: Some(duration_ms),
            completed_steps: Some(completed_steps),
            error: run_error.as_ref().map(StepError::telemetry_payload),
            metadata: options.metadata,
        });
        self.runs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&run_id);

        match status {
            RunStatus::Success => {
                info!(run_id, completed_steps, duration_ms, "workflow run succeeded")
            }
            RunStatus::Cancelled => warn!(run_id, completed_steps, "workflow run cancelled"),
            _ => warn!(
                run_id,
                completed_steps,
                error = run_error.as_ref().map(|e| e.message.as_str()),
                "workflow run failed"
            ),
        }

        Ok(WorkflowRunOutcome {
            run_id,
            status,
            started_at,
            finished_at,
            completed_steps,
            error: run_error,
            context_snapshot: final_snapshot,
        })
    }

    fn execute_branch<'a, 'r: 'a>(
        &'a self,
        steps: &'a [WorkflowStep],
        ctx: &'a mut ExecCtx<'r>,
    ) -> BoxFuture<'a, Result<(), StepError>> {
        async move {
            for step in steps {
                if ctx.token.is_cancelled() {
                    return Err(StepError::cancelled("run cancelled between steps"));
                }
                match step {
                    WorkflowStep::If {
                        base,
                        when,
                        then,
                        otherwise,
                    } => self.execute_if(base, when, then, otherwise, ctx).await?,
                    WorkflowStep::Foreach {
                        base,
                        list,
                        bind,
                        index_var,
                        steps,
                    } => {
                        self.execute_foreach(base, list, bind, index_var.as_deref(), steps, ctx)
                            .await?
                    }
                    WorkflowStep::Retry {
                        base,
                        policy,
                        steps,
                    } => self.execute_retry(base, policy, steps, ctx).await?,
                    atomic => self.execute_atomic(atomic, ctx).await?,
                }
            }
            Ok(())
        }
        .boxed()
    }

    async fn execute_if<'r>(
        &self,
        base: &StepBase,
        when: &Condition,
        then: &[WorkflowStep],
        otherwise: &[WorkflowStep],
        ctx: &mut ExecCtx<'r>,
    ) -> Result<(), StepError> {
        let chosen = {
            let mut scope = ConditionScope {
                context: &mut *ctx.context,
                bridge: &self.bridge,
                dom: &self.dom,
                run_id: ctx.run_id,
                workflow_id: ctx.workflow_id,
                attempt: 1,
                signal: &ctx.token,
            };
            condition::evaluate(when, &mut scope).await?
        };
        debug!(step_id = base.id.as_deref(), chosen, "if condition evaluated");

        let branch = if chosen { then } else { otherwise };
        let scope_id = ctx
            .context
            .push_scope(base.id.as_deref().or(Some("if")));
        match self.execute_branch(branch, ctx).await {
            Ok(()) => {
                ctx.context.commit_scope(scope_id)?;
                Ok(())
            }
            Err(err) => {
                ctx.context.rollback_scope(scope_id)?;
                Err(err)
            }
        }
    }

    async fn execute_foreach<'r>(
        &self,
        base: &StepBase,
        list: &str,
        bind: &str,
        index_var: Option<&str>,
        steps: &[WorkflowStep],
        ctx: &mut ExecCtx<'r>,
    ) -> Result<(), StepError> {
        let items = match ctx.context.get(list) {
            Some(Value::Array(items)) => items,
            Some(_) => {
                return Err(StepError::unknown(format!(
                    "foreach list '{list}' is not an array"
                ))
                .with_step_id(base.id.clone().unwrap_or_else(|| "foreach".into())));
            }
            None => {
                warn!(list, "foreach list missing from context; iterating zero times");
                Vec::new()
            }
        };

        for (index, item) in items.into_iter().enumerate() {
            if ctx.token.is_cancelled() {
                return Err(StepError::cancelled("run cancelled between foreach iterations"));
            }
            let scope_id = ctx
                .context
                .push_scope(base.id.as_deref().or(Some("foreach")));
            ctx.context.set(bind, item);
            if let Some(index_var) = index_var {
                ctx.context.set(index_var, json!(index));
            }
            match self.execute_branch(steps, ctx).await {
                Ok(()) => {
                    // the loop variables live only inside the iteration
                    ctx.context.unset_local(bind);
                    if let Some(index_var) = index_var {
                        ctx.context.unset_local(index_var);
                    }
                    ctx.context.commit_scope(scope_id)?;
                }
                Err(err) => {
                    ctx.context.rollback_scope(scope_id)?;
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn execute_retry<'r>(
        &self,
        base: &StepBase,
        policy: &TimingOverrides,
        steps: &[WorkflowStep],
        ctx: &mut ExecCtx<'r>,
    ) -> Result<(), StepError> {
        let merged = ctx.timing.merged(policy);
        let total_attempts = merged.retries.saturating_add(1);
        let mut last_error: Option<StepError> = None;

        for attempt in 1..=total_attempts {
            if ctx.token.is_cancelled() {
                return Err(StepError::cancelled("run cancelled between retry attempts"));
            }
            let scope_id = ctx
                .context
                .push_scope(base.id.as_deref().or(Some("retry")));
            match self.execute_branch(steps, ctx).await {
                Ok(()) => {
                    ctx.context.commit_scope(scope_id)?;
                    return Ok(());
                }
                Err(err) => {
                    ctx.context.rollback_scope(scope_id)?;
                    if err.is_cancellation() {
                        return Err(err);
                    }
                    if attempt < total_attempts {
                        let delay = merged.backoff_delay(attempt + 1, self.env.random.as_ref());
                        if self
                            .env
                            .sleep_cancellable(delay, &ctx.token)
                            .await
                            .is_err()
                        {
                            return Err(StepError::cancelled("run cancelled during retry backoff"));
                        }
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_error
            .unwrap_or_else(|| StepError::unknown("retry block ended without a result")))
    }

    async fn execute_atomic<'r>(
        &self,
        step: &WorkflowStep,
        ctx: &mut ExecCtx<'r>,
    ) -> Result<(), StepError> {
        let step_index = ctx.step_cursor;
        ctx.step_cursor += 1;
        let timing = ctx.timing.merged(&step.base().timing);
        let step_id = step.base().id.clone();
        let logical_key = step.base().key.clone();

        self.emit_step(ctx, step_index, step, StepEventStatus::Pending, 0, None, None, None);
        if ctx.token.is_cancelled() {
            self.emit_step(ctx, step_index, step, StepEventStatus::Skipped, 0, None, None, None);
            return Err(StepError::cancelled("run cancelled before step").with_step_id(
                step_id.unwrap_or_else(|| step.kind_name().to_string()),
            ));
        }

        let total_attempts = timing.retries.saturating_add(1);
        let mut last_error: Option<StepError> = None;
        for attempt in 1..=total_attempts {
            self.emit_step(ctx, step_index, step, StepEventStatus::Attempt, attempt, None, None, None);
            let attempt_started = self.env.clock.now_ms();

            let result = self
                .run_attempt(step, ctx, &timing, attempt, total_attempts - attempt)
                .await;
            let duration = self.env.clock.now_ms().saturating_sub(attempt_started);

            match result {
                Ok(outcome) => {
                    for update in &outcome.context_updates {
                        ctx.context
                            .set_with_ttl(&update.path, update.value.clone(), update.ttl_ms);
                    }
                    for log in &outcome.logs {
                        forward_log(ctx.run_id, log);
                    }
                    ctx.completed_steps += 1;
                    ctx.record
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .completed_steps = ctx.completed_steps;
                    let status = if outcome.skipped {
                        StepEventStatus::Skipped
                    } else {
                        StepEventStatus::Success
                    };
                    self.emit_step(
                        ctx,
                        step_index,
                        step,
                        status,
                        attempt,
                        Some(duration),
                        outcome.output.clone(),
                        None,
                    );
                    return Ok(());
                }
                Err(mut err) => {
                    if err.step_id.is_none() {
                        err.step_id = step_id.clone();
                    }
                    if err.key.is_none() {
                        err.key = logical_key.clone();
                    }
                    self.emit_step(
                        ctx,
                        step_index,
                        step,
                        StepEventStatus::Failure,
                        attempt,
                        Some(duration),
                        None,
                        Some(err.telemetry_payload()),
                    );
                    if err.is_cancellation() {
                        return Err(err);
                    }
                    if attempt < total_attempts {
                        let delay = timing.backoff_delay(attempt + 1, self.env.random.as_ref());
                        if self
                            .env
                            .sleep_cancellable(delay, &ctx.token)
                            .await
                            .is_err()
                        {
                            return Err(StepError::cancelled("run cancelled during backoff"));
                        }
                        last_error = Some(err);
                        continue;
                    }
                    return Err(err);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| StepError::unknown("step loop ended without a result")))
    }

    async fn run_attempt<'r>(
        &self,
        step: &WorkflowStep,
        ctx: &mut ExecCtx<'r>,
        timing: &TimingConfig,
        attempt: u32,
        retries_remaining: u32,
    ) -> Result<StepOutcome, StepError> {
        let resolve_result: Option<ResolveResult> = match &step.base().key {
            Some(key) => {
                let result = self
                    .bridge
                    .resolve(BridgeRequest {
                        run_id: ctx.run_id,
                        workflow_id: ctx.workflow_id,
                        step_key: step
                            .base()
                            .id
                            .clone()
                            .unwrap_or_else(|| format!("{}+{key}", step.kind_name())),
                        attempt,
                        logical_key: key,
                        signal: &ctx.token,
                    })
                    .await?;
                if result.element.is_none() {
                    return Err(StepError::resolver_miss(format!(
                        "no element resolved for logical key '{key}'"
                    ))
                    .with_key(key.clone()));
                }
                Some(result)
            }
            None => None,
        };

        let Some(handler_name) = step.handler_name() else {
            return Err(StepError::unknown(
                "control-flow step dispatched to the atomic executor",
            ));
        };
        let Some(handler) = self.handlers.get(handler_name) else {
            return Err(StepError::unknown(format!(
                "no handler registered for step kind '{handler_name}'"
            )));
        };

        let invocation = StepInvocation {
            step,
            attempt,
            retries_remaining,
            context: &mut *ctx.context,
            resolve_result: resolve_result.as_ref(),
            run_id: ctx.run_id,
            workflow_id: ctx.workflow_id,
            timing,
            signal: &ctx.token,
            bridge: &self.bridge,
        };

        // handler first: a ready handler always beats the deadline race
        tokio::select! {
            biased;
            result = handler.execute(invocation) => result,
            _ = ctx.token.cancelled() => {
                Err(StepError::cancelled("run cancelled during handler"))
            }
            _ = self.env.sleeper.sleep(Duration::from_millis(timing.timeout_ms)) => {
                Err(StepError::timeout(format!(
                    "step timed out after {}ms",
                    timing.timeout_ms
                )))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn emit_step(
        &self,
        ctx: &ExecCtx<'_>,
        step_index: usize,
        step: &WorkflowStep,
        status: StepEventStatus,
        attempt: u32,
        duration_ms: Option<u64>,
        data: Option<Value>,
        error: Option<Value>,
    ) {
        self.telemetry.emit_step(StepEvent {
            run_id: ctx.run_id.to_string(),
            workflow_id: ctx.workflow_id.to_string(),
            step_index,
            step_id: step.base().id.clone(),
            step_kind: step.kind_name().to_string(),
            logical_key: step.base().key.clone(),
            status,
            attempt,
            timestamp: self.env.clock.wall_now(),
            duration_ms,
            data,
            error,
            notes: None,
            seq: 0,
        });
    }
}

struct ExecCtx<'r> {
    run_id: &'r str,
    workflow_id: &'r str,
    timing: TimingConfig,
    context: &'r mut ContextManager,
    token: CancellationToken,
    record: &'r Arc<Mutex<RunMetadata>>,
    step_cursor: usize,
    completed_steps: u32,
}

fn forward_log(run_id: &str, log: &StepLog) {
    match log.level {
        StepLogLevel::Debug => debug!(run_id, "{}", log.message),
        StepLogLevel::Info => info!(run_id, "{}", log.message),
        StepLogLevel::Warn => warn!(run_id, "{}", log.message),
        StepLogLevel::Error => error!(run_id, "{}", log.message),
    }
}
