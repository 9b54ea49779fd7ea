//! End-to-end workflow runs on virtual time.

mod support;

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use arbor::context::MemoryContext;
use arbor::error::{StepError, StepErrorReason};
use arbor::runtime::Clock;
use arbor::selector::{SelectorEntry, SelectorTry};
use arbor::telemetry::{RunPhase, RunStatus, StepEventStatus};
use arbor::testing::FakeElement;
use arbor::workflow::{
    Condition, ContextUpdate, RunOptions, StepHandler, StepInvocation, StepOutcome,
    TimingOverrides, WaitSpec, WorkflowDefinition, WorkflowStep,
};
use async_trait::async_trait;
use serde_json::{Map, Value, json};
use support::{css_map, runner_harness};

/// Writes `params.path = params.value` into the run context.
struct SetHandler;

#[async_trait]
impl StepHandler for SetHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let WorkflowStep::Custom { params, .. } = invocation.step else {
            return Err(StepError::unknown("set handler needs a custom step"));
        };
        let path = params["path"].as_str().unwrap_or("out").to_string();
        Ok(StepOutcome::ok().with_update(ContextUpdate::set(path, params["value"].clone())))
    }
}

/// Collects the current `item` binding, in call order.
struct CollectHandler {
    seen: Arc<Mutex<Vec<Value>>>,
}

#[async_trait]
impl StepHandler for CollectHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let item = invocation.context.get("item").unwrap_or(Value::Null);
        let index = invocation.context.get("index").unwrap_or(Value::Null);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(json!({ "item": item, "index": index }));
        Ok(StepOutcome::ok())
    }
}

/// Fails until the given attempt, writing a marker each time.
struct FlakyHandler {
    calls: AtomicU32,
    succeed_on: u32,
}

#[async_trait]
impl StepHandler for FlakyHandler {
    async fn execute(&self, invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        invocation
            .context
            .set("attempt.marker", json!(format!("call-{call}")));
        if call < self.succeed_on {
            Err(StepError::unknown(format!("forced failure on call {call}")))
        } else {
            Ok(StepOutcome::ok())
        }
    }
}

/// Fails carrying sensitive data in the error payload.
struct LeakyHandler;

#[async_trait]
impl StepHandler for LeakyHandler {
    async fn execute(&self, _invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        Err(StepError::unknown("capture backend rejected the request").with_data(json!({
            "password": "secret123",
            "field": "checkout.card",
        })))
    }
}

/// Never finishes on its own.
struct StallingHandler;

#[async_trait]
impl StepHandler for StallingHandler {
    async fn execute(&self, _invocation: StepInvocation<'_>) -> Result<StepOutcome, StepError> {
        std::future::pending::<()>().await;
        Ok(StepOutcome::ok())
    }
}

fn seeded_context(entries: &[(&str, Value)]) -> Box<MemoryContext> {
    let mut values = Map::new();
    for (key, value) in entries {
        values.insert((*key).to_string(), value.clone());
    }
    Box::new(MemoryContext::with_values(values))
}

#[tokio::test]
async fn log_step_emits_the_full_event_sequence() {
    let harness = runner_harness(css_map("cta", ".cta"));
    let definition = WorkflowDefinition::new("demo")
        .with_step(WorkflowStep::log("starting up").with_id("hello"));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("runnable definition");

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.completed_steps, 1);
    assert!(outcome.error.is_none());

    let runs = harness.recorder.run_events();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].phase, RunPhase::Started);
    assert_eq!(runs[0].status, RunStatus::Running);
    assert_eq!(runs[1].phase, RunPhase::Completed);
    assert_eq!(runs[1].status, RunStatus::Success);
    assert_eq!(runs[1].completed_steps, Some(1));

    let transitions = harness.recorder.step_transitions();
    assert_eq!(
        transitions,
        vec![
            ("log".to_string(), StepEventStatus::Pending),
            ("log".to_string(), StepEventStatus::Attempt),
            ("log".to_string(), StepEventStatus::Success),
        ]
    );
}

#[tokio::test]
async fn failing_step_sanitizes_error_data_in_telemetry() {
    let mut harness = runner_harness(css_map("cta", ".cta"));
    harness.runner.register_handler("leaky", Arc::new(LeakyHandler));
    let definition = WorkflowDefinition::new("leak-test")
        .with_step(WorkflowStep::custom("leaky", json!({})).with_id("cap"));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("resolves with a failed outcome");

    assert_eq!(outcome.status, RunStatus::Failed);
    let error = outcome.error.expect("error carried on the outcome");
    assert_eq!(error.reason, StepErrorReason::Unknown);

    let failure = harness
        .recorder
        .step_events()
        .into_iter()
        .find(|event| event.status == StepEventStatus::Failure)
        .expect("failure event");
    let payload = failure.error.expect("error payload");
    assert_eq!(payload["data"]["password"], json!("********"));
    assert_eq!(payload["data"]["field"], json!("checkout.card"));

    let completed = &harness.recorder.run_events()[1];
    assert_eq!(completed.status, RunStatus::Failed);
    assert_eq!(completed.error.as_ref().expect("run error")["data"]["password"], json!("********"));
}

#[tokio::test]
async fn missing_element_fails_with_resolver_miss() {
    let harness = runner_harness(css_map("ghost", ".ghost"));
    let definition =
        WorkflowDefinition::new("miss").with_step(WorkflowStep::capture("ghost", "out"));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("failed outcome");
    assert_eq!(outcome.status, RunStatus::Failed);
    assert_eq!(
        outcome.error.expect("error").reason,
        StepErrorReason::ResolverMiss
    );
    assert_eq!(outcome.completed_steps, 0);
}

#[tokio::test]
async fn retries_back_off_exponentially_before_succeeding() {
    let mut harness = runner_harness(css_map("cta", ".cta"));
    harness.runner.register_handler(
        "flaky",
        Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            succeed_on: 3,
        }),
    );
    let definition = WorkflowDefinition::new("flaky-run")
        .with_step(WorkflowStep::custom("flaky", json!({})).with_retries(2));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("succeeds on the third attempt");

    assert_eq!(outcome.status, RunStatus::Success);
    // backoff before attempts 2 and 3: 250·2 + 250·4 on the virtual clock
    assert_eq!(harness.clock.now_ms(), 1_500);

    let statuses: Vec<StepEventStatus> = harness
        .recorder
        .step_events()
        .iter()
        .map(|event| event.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            StepEventStatus::Pending,
            StepEventStatus::Attempt,
            StepEventStatus::Failure,
            StepEventStatus::Attempt,
            StepEventStatus::Failure,
            StepEventStatus::Attempt,
            StepEventStatus::Success,
        ]
    );
    assert_eq!(
        outcome.context_snapshot.get("attempt.marker"),
        Some(&json!("call-3"))
    );
}

#[tokio::test]
async fn if_branches_run_in_a_committed_scope() {
    let mut harness = runner_harness(css_map("cta", ".cta"));
    harness.runner.register_handler("set", Arc::new(SetHandler));
    let definition = WorkflowDefinition::new("branching").with_step(WorkflowStep::if_else(
        Condition::ctx_equals("mode", json!("fast")),
        vec![WorkflowStep::custom(
            "set",
            json!({ "path": "result", "value": "fast-path" }),
        )],
        vec![WorkflowStep::custom(
            "set",
            json!({ "path": "result", "value": "slow-path" }),
        )],
    ));

    let outcome = harness
        .runner
        .run_workflow(
            &definition,
            RunOptions::default().with_context(seeded_context(&[("mode", json!("fast"))])),
        )
        .await
        .expect("branch executes");

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.context_snapshot.get("result"), Some(&json!("fast-path")));

    let outcome = harness
        .runner
        .run_workflow(
            &definition,
            RunOptions::default().with_context(seeded_context(&[("mode", json!("careful"))])),
        )
        .await
        .expect("else branch executes");
    assert_eq!(outcome.context_snapshot.get("result"), Some(&json!("slow-path")));
}

#[tokio::test]
async fn foreach_binds_items_in_child_scopes() {
    let mut harness = runner_harness(css_map("cta", ".cta"));
    let seen = Arc::new(Mutex::new(Vec::new()));
    harness
        .runner
        .register_handler("collect", Arc::new(CollectHandler { seen: seen.clone() }));

    let definition = WorkflowDefinition::new("iterate").with_step(
        WorkflowStep::foreach(
            "cart.items",
            "item",
            vec![WorkflowStep::custom("collect", json!({}))],
        )
        .with_index_var("index"),
    );

    let outcome = harness
        .runner
        .run_workflow(
            &definition,
            RunOptions::default().with_context(seeded_context(&[(
                "cart.items",
                json!(["apples", "bread", "coffee"]),
            )])),
        )
        .await
        .expect("iterates");

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(outcome.completed_steps, 3);
    let seen = seen.lock().unwrap_or_else(|e| e.into_inner());
    assert_eq!(
        *seen,
        vec![
            json!({ "item": "apples", "index": 0 }),
            json!({ "item": "bread", "index": 1 }),
            json!({ "item": "coffee", "index": 2 }),
        ]
    );
    // loop bindings do not leak into the final context
    assert!(!outcome.context_snapshot.contains_key("item"));
    assert!(!outcome.context_snapshot.contains_key("index"));
}

#[tokio::test]
async fn foreach_with_non_array_list_fails() {
    let harness = runner_harness(css_map("cta", ".cta"));
    let definition = WorkflowDefinition::new("bad-list").with_step(WorkflowStep::foreach(
        "cart.items",
        "item",
        vec![WorkflowStep::log("unreachable")],
    ));

    let outcome = harness
        .runner
        .run_workflow(
            &definition,
            RunOptions::default().with_context(seeded_context(&[("cart.items", json!("oops"))])),
        )
        .await
        .expect("failed outcome");
    assert_eq!(outcome.status, RunStatus::Failed);
    assert!(outcome.error.expect("error").message.contains("not an array"));
}

#[tokio::test]
async fn retry_block_rolls_back_between_attempts() {
    let mut harness = runner_harness(css_map("cta", ".cta"));
    harness.runner.register_handler(
        "flaky",
        Arc::new(FlakyHandler {
            calls: AtomicU32::new(0),
            succeed_on: 2,
        }),
    );
    let definition = WorkflowDefinition::new("retry-block").with_step(WorkflowStep::retry(
        TimingOverrides::default().with_retries(2),
        vec![WorkflowStep::custom("flaky", json!({}))],
    ));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("second attempt commits");

    assert_eq!(outcome.status, RunStatus::Success);
    // only the committed attempt's write survives
    assert_eq!(
        outcome.context_snapshot.get("attempt.marker"),
        Some(&json!("call-2"))
    );
}

#[tokio::test]
async fn per_step_timeout_races_the_handler() {
    let mut harness = runner_harness(css_map("cta", ".cta"));
    harness
        .runner
        .register_handler("stall", Arc::new(StallingHandler));
    let definition = WorkflowDefinition::new("stall-run")
        .with_step(WorkflowStep::custom("stall", json!({})).with_timeout_ms(500));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("failed outcome");

    assert_eq!(outcome.status, RunStatus::Failed);
    let error = outcome.error.expect("error");
    assert_eq!(error.reason, StepErrorReason::Timeout);
    assert_eq!(harness.clock.now_ms(), 500);
}

#[tokio::test]
async fn cancel_run_flips_the_run_to_cancelled() {
    // real time: the stalled handler must outlive the cancel request, which
    // a virtual sleeper's instantly-elapsing timeout race would not allow
    use arbor::selector::SelectorResolver;
    use arbor::telemetry::TelemetryBus;
    use arbor::testing::{FakeDom, RecordingTelemetry};
    use arbor::workflow::WorkflowRunner;

    let dom = Arc::new(FakeDom::new());
    let resolver = Arc::new(SelectorResolver::new(
        Arc::new(css_map("cta", ".cta")),
        dom.backend(),
    ));
    let telemetry = Arc::new(TelemetryBus::new());
    let recorder = RecordingTelemetry::new();
    recorder.attach(&telemetry);
    let mut runner = WorkflowRunner::new(resolver).with_telemetry(telemetry);
    runner.register_handler("stall", Arc::new(StallingHandler));
    let runner = Arc::new(runner);
    let definition = WorkflowDefinition::new("cancel-me")
        .with_step(WorkflowStep::log("first"))
        .with_step(WorkflowStep::custom("stall", json!({})).with_timeout_ms(3_600_000));

    let task = tokio::spawn({
        let runner = runner.clone();
        let definition = definition.clone();
        async move { runner.run_workflow(&definition, RunOptions::default()).await }
    });

    // wait for the run to register
    let run_id = loop {
        let active = runner.active_runs();
        if let Some(info) = active.first() {
            break info.run_id.clone();
        }
        tokio::task::yield_now().await;
    };

    let metadata = runner.run_metadata(&run_id).expect("active metadata");
    assert_eq!(metadata.status, RunStatus::Running);
    assert!(!metadata.cancel_requested);

    assert!(runner.cancel_run(&run_id));
    let outcome = task
        .await
        .expect("task join")
        .expect("outcome resolves even when cancelled");

    assert_eq!(outcome.status, RunStatus::Cancelled);
    assert_eq!(outcome.completed_steps, 1);
    assert!(outcome.error.expect("error").is_cancellation());

    // registry entry is gone, repeated cancels are no-ops
    assert!(runner.run_metadata(&run_id).is_none());
    assert!(!runner.cancel_run(&run_id));

    let phases: Vec<RunPhase> = recorder
        .run_events()
        .iter()
        .map(|event| event.phase)
        .collect();
    assert_eq!(
        phases,
        vec![RunPhase::Started, RunPhase::CancelRequested, RunPhase::Completed]
    );
    assert_eq!(recorder.run_events()[2].status, RunStatus::Cancelled);
}

#[tokio::test]
async fn click_and_type_steps_drive_the_tree() {
    let mut map = css_map("cta", ".cta");
    map.insert(
        "form.email",
        SelectorEntry::new(vec![SelectorTry::css("input.email")]),
    );
    let harness = runner_harness(map);
    let button = FakeElement::new("button");
    let field = FakeElement::new("input");
    harness.dom.stub_css(".cta", vec![button.handle()]);
    harness.dom.stub_css("input.email", vec![field.handle()]);

    let definition = WorkflowDefinition::new("fill-form")
        .with_step(WorkflowStep::click("cta"))
        .with_step(WorkflowStep::type_text("form.email", "ada@example.com"))
        .with_step(WorkflowStep::type_from_context("form.email", "user.name"));

    let outcome = harness
        .runner
        .run_workflow(
            &definition,
            RunOptions::default().with_context(seeded_context(&[("user.name", json!("Ada"))])),
        )
        .await
        .expect("drives the tree");

    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(button.clicks(), 1);
    assert_eq!(field.typed(), vec!["ada@example.com".to_string(), "Ada".to_string()]);
}

#[tokio::test]
async fn capture_step_stores_element_text() {
    let harness = runner_harness(css_map("total", ".total"));
    let total = FakeElement::new("span");
    total.set_text("$42.00");
    harness.dom.stub_css(".total", vec![total.handle()]);

    let definition = WorkflowDefinition::new("capture-run")
        .with_step(WorkflowStep::capture("total", "cart.total"));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("captures");
    assert_eq!(outcome.status, RunStatus::Success);
    assert_eq!(
        outcome.context_snapshot.get("cart.total"),
        Some(&json!("$42.00"))
    );

    let success = harness
        .recorder
        .step_events()
        .into_iter()
        .find(|event| event.status == StepEventStatus::Success)
        .expect("success event");
    assert_eq!(success.data, Some(json!("$42.00")));
}

#[tokio::test]
async fn wait_step_runs_inside_the_workflow() {
    let harness = runner_harness(css_map("panel", ".panel"));
    let panel = FakeElement::new("section");
    harness.dom.stub_css(".panel", vec![panel.handle()]);

    let definition = WorkflowDefinition::new("wait-run").with_step(WorkflowStep::wait(
        WaitSpec::for_key("panel"),
    ));

    let outcome = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect("wait succeeds");
    assert_eq!(outcome.status, RunStatus::Success);

    let success = harness
        .recorder
        .step_events()
        .into_iter()
        .find(|event| event.status == StepEventStatus::Success)
        .expect("success event");
    let data = success.data.expect("wait summary");
    assert_eq!(data["pollCount"], json!(1));
}

#[tokio::test]
async fn invalid_definitions_reject_outright() {
    let harness = runner_harness(css_map("cta", ".cta"));
    let definition = WorkflowDefinition::new("");
    let err = harness
        .runner
        .run_workflow(&definition, RunOptions::default())
        .await
        .expect_err("empty id");
    assert_eq!(err.reason, StepErrorReason::Unknown);
}
