//! End-to-end scenarios driving a full engine over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use weft_core::{FunctionRef, InvocationId, TypedValue, WorkflowId};
use weft_engine::backend::memory::MemoryBackend;
use weft_engine::backend::EventBackend;
use weft_engine::config::EngineConfig;
use weft_engine::engine::Engine;
use weft_engine::events::{Aggregate, AggregateKind};
use weft_engine::invocation::{InvocationSpec, InvocationStatus};
use weft_engine::stores::EntityStore;
use weft_engine::workflow::{TaskSpec, WorkflowSpec};

async fn start_engine() -> (Arc<MemoryBackend>, Engine) {
    let backend = Arc::new(MemoryBackend::new());
    let engine = Engine::start(EngineConfig::for_tests(), backend.clone())
        .await
        .expect("engine starts");
    (backend, engine)
}

/// Creates a workflow and waits for the parse loop to mark it Ready.
async fn ready_workflow(engine: &Engine, spec: WorkflowSpec) -> WorkflowId {
    let id = engine.workflow_api().create(spec).await.expect("create");
    let aggregate = Aggregate::workflow(id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let workflow = engine
            .workflows()
            .refresh(&aggregate)
            .await
            .expect("workflow exists");
        if workflow.is_ready() {
            return id;
        }
        assert!(
            workflow.error.is_none(),
            "workflow parse failed: {:?}",
            workflow.error
        );
        assert!(
            tokio::time::Instant::now() < deadline,
            "workflow never became ready"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn noop() -> FunctionRef {
    FunctionRef::new("native", "noop")
}

#[tokio::test]
async fn single_task_invocation_succeeds() {
    let (backend, engine) = start_engine().await;

    let workflow_id = ready_workflow(
        &engine,
        WorkflowSpec::new()
            .task("a", TaskSpec::new(noop()))
            .output_task("a"),
    )
    .await;

    let invocation_id = engine
        .invocation_api()
        .invoke(InvocationSpec::new(workflow_id))
        .await
        .expect("invoke");

    let done = engine
        .await_invocation(invocation_id, Some(Duration::from_secs(5)))
        .await
        .expect("terminal state");

    assert_eq!(done.status, InvocationStatus::Succeeded);
    assert_eq!(done.output, Some(TypedValue::string("ok")));

    let events = backend
        .get(&Aggregate::invocation(invocation_id))
        .await
        .expect("events");
    let names: Vec<&str> = events.iter().map(|e| e.data.name()).collect();
    assert_eq!(
        names,
        vec![
            "invocation_created",
            "task_started",
            "task_succeeded",
            "invocation_completed",
        ]
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn dependency_fan_out_feeds_downstream_inputs() {
    let (_backend, engine) = start_engine().await;

    let workflow_id = ready_workflow(
        &engine,
        WorkflowSpec::new()
            .task("a", TaskSpec::new(noop()))
            .task("b", TaskSpec::new(noop()))
            .task(
                "c",
                TaskSpec::new(FunctionRef::new("native", "compose"))
                    .input("x", TypedValue::expr("$.Tasks.a.Output").unwrap())
                    .input("y", TypedValue::expr("$.Tasks.b.Output").unwrap()),
            )
            .output_task("c"),
    )
    .await;

    let invocation_id = engine
        .invocation_api()
        .invoke(InvocationSpec::new(workflow_id))
        .await
        .expect("invoke");

    let done = engine
        .await_invocation(invocation_id, Some(Duration::from_secs(5)))
        .await
        .expect("terminal state");

    assert_eq!(done.status, InvocationStatus::Succeeded);

    // c saw both upstream outputs as inputs.
    let c = done.task("c").expect("task c");
    assert_eq!(c.inputs.get("x"), Some(&TypedValue::string("ok")));
    assert_eq!(c.inputs.get("y"), Some(&TypedValue::string("ok")));

    // Its composed output became the invocation output.
    let expected = TypedValue::Map(std::collections::BTreeMap::from([
        ("x".to_string(), TypedValue::string("ok")),
        ("y".to_string(), TypedValue::string("ok")),
    ]));
    assert_eq!(done.output, Some(expected));

    engine.shutdown().await;
}

#[tokio::test]
async fn one_failed_task_halts_the_workflow() {
    let (_backend, engine) = start_engine().await;

    let workflow_id = ready_workflow(
        &engine,
        WorkflowSpec::new()
            .task("a", TaskSpec::new(noop()))
            .task(
                "b",
                TaskSpec::new(FunctionRef::new("native", "fail"))
                    .input("message", TypedValue::string("b exploded")),
            )
            .task(
                "c",
                TaskSpec::new(noop()).requires("a").requires("b"),
            ),
    )
    .await;

    let invocation_id = engine
        .invocation_api()
        .invoke(InvocationSpec::new(workflow_id))
        .await
        .expect("invoke");

    let done = engine
        .await_invocation(invocation_id, Some(Duration::from_secs(5)))
        .await
        .expect("terminal state");

    assert_eq!(done.status, InvocationStatus::Failed);
    assert_eq!(
        done.error.as_deref(),
        Some("one or more tasks in the workflow have failed")
    );

    // c never ran.
    let c = done.task("c").expect("task c");
    assert!(c.started_at.is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn invocation_deadline_cancels_in_flight_work() {
    let (_backend, engine) = start_engine().await;

    let workflow_id = ready_workflow(
        &engine,
        WorkflowSpec::new().task(
            "a",
            TaskSpec::new(FunctionRef::new("native", "sleep"))
                .input("duration", TypedValue::Int(2000)),
        ),
    )
    .await;

    let started = std::time::Instant::now();
    let invocation_id = engine
        .invocation_api()
        .invoke(
            InvocationSpec::new(workflow_id)
                .deadline(chrono::Utc::now() + chrono::Duration::milliseconds(150)),
        )
        .await
        .expect("invoke");

    let done = engine
        .await_invocation(invocation_id, Some(Duration::from_secs(5)))
        .await
        .expect("terminal state");

    assert_eq!(done.status, InvocationStatus::Failed);
    assert_eq!(done.error.as_deref(), Some("deadline exceeded"));
    assert!(
        started.elapsed() < Duration::from_millis(1500),
        "invocation was not cut short: {:?}",
        started.elapsed()
    );

    engine.shutdown().await;
}

#[tokio::test]
async fn sub_workflow_inherits_the_parent_scope() {
    let (backend, engine) = start_engine().await;

    // Child: one echo task reading an input through the parent scope.
    let child_workflow = ready_workflow(
        &engine,
        WorkflowSpec::new()
            .task(
                "inner",
                TaskSpec::new(FunctionRef::new("native", "echo")).input(
                    "value",
                    TypedValue::expr("$.Parent.Invocation.Inputs.greeting").unwrap(),
                ),
            )
            .output_task("inner"),
    )
    .await;

    // Parent: one task whose runtime is the sub-workflow runtime.
    let parent_workflow = ready_workflow(
        &engine,
        WorkflowSpec::new()
            .task(
                "t",
                TaskSpec::new(FunctionRef::new("workflow", child_workflow.to_string())),
            )
            .output_task("t"),
    )
    .await;

    let parent_id = engine
        .invocation_api()
        .invoke(
            InvocationSpec::new(parent_workflow)
                .input("greeting", TypedValue::string("hi from the parent")),
        )
        .await
        .expect("invoke parent");

    let done = engine
        .await_invocation(parent_id, Some(Duration::from_secs(10)))
        .await
        .expect("terminal state");

    assert_eq!(done.status, InvocationStatus::Succeeded);
    assert_eq!(done.output, Some(TypedValue::string("hi from the parent")));

    // A child invocation exists and carries the parent link.
    let aggregates = backend.list().await.expect("list");
    let child_aggregate = aggregates
        .iter()
        .find(|a| a.kind == AggregateKind::Invocation && a.id != parent_id.to_string())
        .expect("child invocation aggregate");
    let child_id: InvocationId = child_aggregate.id.parse().expect("child id");
    let child = engine
        .invocations()
        .get(child_id)
        .await
        .expect("child invocation");
    assert_eq!(child.spec.parent_id, Some(parent_id));
    assert_eq!(child.status, InvocationStatus::Succeeded);

    engine.shutdown().await;
}

#[tokio::test]
async fn prewarm_taps_the_dependent_task_exactly_once() {
    let (_backend, engine) = start_engine().await;

    let workflow_id = ready_workflow(
        &engine,
        WorkflowSpec::new()
            .task(
                "a",
                TaskSpec::new(FunctionRef::new("native", "sleep"))
                    .input("duration", TypedValue::Int(400)),
            )
            .task("b", TaskSpec::new(noop()).requires("a"))
            .output_task("b"),
    )
    .await;

    let invocation_id = engine
        .invocation_api()
        .invoke(InvocationSpec::new(workflow_id))
        .await
        .expect("invoke");

    let done = engine
        .await_invocation(invocation_id, Some(Duration::from_secs(5)))
        .await
        .expect("terminal state");
    assert_eq!(done.status, InvocationStatus::Succeeded);

    // b's function (noop) was tapped exactly once, while a was running.
    let noop_taps: Vec<_> = engine
        .native_runtime()
        .taps()
        .into_iter()
        .filter(|(id, _)| id == "noop")
        .collect();
    assert_eq!(noop_taps.len(), 1, "expected exactly one pre-warm tap");

    engine.shutdown().await;
}

#[tokio::test]
async fn empty_workflow_succeeds_with_no_output() {
    let (_backend, engine) = start_engine().await;

    let workflow_id = ready_workflow(&engine, WorkflowSpec::new()).await;
    let invocation_id = engine
        .invocation_api()
        .invoke(InvocationSpec::new(workflow_id))
        .await
        .expect("invoke");

    let done = engine
        .await_invocation(invocation_id, Some(Duration::from_secs(5)))
        .await
        .expect("terminal state");

    assert_eq!(done.status, InvocationStatus::Succeeded);
    assert!(done.output.is_none());

    engine.shutdown().await;
}

#[tokio::test]
async fn canceled_invocation_stays_aborted() {
    let (_backend, engine) = start_engine().await;

    let workflow_id = ready_workflow(
        &engine,
        WorkflowSpec::new().task(
            "a",
            TaskSpec::new(FunctionRef::new("native", "sleep"))
                .input("duration", TypedValue::Int(2000)),
        ),
    )
    .await;

    let invocation_id = engine
        .invocation_api()
        .invoke(InvocationSpec::new(workflow_id))
        .await
        .expect("invoke");

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine
        .invocation_api()
        .cancel(invocation_id)
        .await
        .expect("cancel");

    let done = engine
        .await_invocation(invocation_id, Some(Duration::from_secs(5)))
        .await
        .expect("terminal state");
    assert_eq!(done.status, InvocationStatus::Aborted);

    // Terminality: later refreshes never change the projected status.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = engine
        .invocations()
        .refresh(&Aggregate::invocation(invocation_id))
        .await
        .expect("refresh");
    assert_eq!(after.status, InvocationStatus::Aborted);

    engine.shutdown().await;
}

#[tokio::test]
async fn parse_failure_rejects_invocations() {
    let (_backend, engine) = start_engine().await;

    let workflow_id = engine
        .workflow_api()
        .create(WorkflowSpec::new().task(
            "a",
            TaskSpec::new(FunctionRef::new("native", "no-such-function")),
        ))
        .await
        .expect("create");

    // The parse loop marks the workflow Failed.
    let aggregate = Aggregate::workflow(workflow_id);
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        let workflow = engine.workflows().refresh(&aggregate).await.expect("get");
        if workflow.error.is_some() {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "parse never concluded"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let result = engine
        .invocation_api()
        .invoke(InvocationSpec::new(workflow_id))
        .await;
    assert!(result.is_err(), "invoking a failed workflow must be rejected");

    engine.shutdown().await;
}
