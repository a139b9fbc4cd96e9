//! End-to-end workflow execution through the runtime: layering, reference
//! threading, failure isolation, deadlines.

mod common;

use common::seeded_runtime;
use pml::runtime::{ExecuteInput, ExecuteRequest};
use pml::workflow::executor::ExecuteOptions;
use pml::workflow::{Task, TaskStatus, Workflow};
use serde_json::json;
use tempfile::TempDir;

fn task(id: &str, tool: &str, deps: &[&str]) -> Task {
    Task {
        id: id.into(),
        tool: tool.into(),
        arguments: json!({}),
        depends_on: deps.iter().map(|d| d.to_string()).collect(),
        timeout_ms: None,
        retry: None,
        on_error: Default::default(),
    }
}

fn request(workflow: Workflow) -> ExecuteRequest {
    ExecuteRequest {
        input: ExecuteInput::Workflow { workflow },
        options: ExecuteOptions::default(),
    }
}

#[tokio::test]
async fn read_then_parse_threads_output() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let mut read = task("t1", "fs:read", &[]);
    read.arguments = json!({"path": "/data.json"});
    let mut parse = task("t2", "json:parse", &["t1"]);
    parse.arguments = json!({"json": "$OUTPUT[t1]"});

    let bundle = runtime
        .execute(&request(Workflow {
            tasks: vec![read, parse],
        }))
        .await
        .unwrap();

    assert_eq!(bundle.total_tasks, 2);
    assert_eq!(bundle.succeeded, 2);
    assert_eq!(bundle.parallelization_layers, 2);
    // t2 saw t1's full output in its `json` argument.
    let parsed = &bundle.results["t2"].output;
    assert_eq!(parsed["echo"]["json"]["echo"]["path"], "/data.json");
}

#[tokio::test]
async fn five_task_fan_out_is_one_layer() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let workflow = Workflow {
        tasks: (0..5)
            .map(|i| task(&format!("read{i}"), "sim:sleep", &[]))
            .collect(),
    };
    let started = std::time::Instant::now();
    let bundle = runtime.execute(&request(workflow)).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(bundle.parallelization_layers, 1);
    assert_eq!(bundle.succeeded, 5);
    // Parallel dispatch: well under 1.5 × the slowest task.
    assert!(
        elapsed.as_millis() < 150,
        "fan-out took {}ms",
        elapsed.as_millis()
    );
}

#[tokio::test]
async fn cycle_is_rejected_naming_both_tasks() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let workflow = Workflow {
        tasks: vec![task("t1", "fs:read", &["t2"]), task("t2", "json:parse", &["t1"])],
    };
    let err = runtime.execute(&request(workflow)).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
    let message = err.to_string();
    assert!(message.contains("cycle"));
    assert!(message.contains("t1") && message.contains("t2"));
}

#[tokio::test]
async fn failed_task_skips_dependents_only() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let workflow = Workflow {
        tasks: vec![
            task("bad", "sim:fail", &[]),
            task("downstream", "fs:read", &["bad"]),
            task("independent", "fs:write", &[]),
        ],
    };
    let bundle = runtime.execute(&request(workflow)).await.unwrap();

    assert_eq!(bundle.failed, 1);
    assert_eq!(bundle.skipped, 1);
    assert_eq!(bundle.succeeded, 1);
    assert_eq!(bundle.results["downstream"].status, TaskStatus::Skipped);
    // The upstream payload rides along verbatim.
    assert_eq!(bundle.errors[0].kind, "upstream_failure");
    assert_eq!(
        bundle.errors[0].details.as_ref().unwrap()["reason"],
        "test"
    );
}

#[tokio::test]
async fn single_task_has_one_layer() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let bundle = runtime
        .execute(&request(Workflow {
            tasks: vec![task("only", "fs:read", &[])],
        }))
        .await
        .unwrap();
    assert_eq!(bundle.parallelization_layers, 1);
    assert_eq!(bundle.succeeded, 1);
}

#[tokio::test]
async fn zero_deadline_times_out_every_task() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let request = ExecuteRequest {
        input: ExecuteInput::Workflow {
            workflow: Workflow {
                tasks: vec![task("a", "fs:read", &[]), task("b", "fs:write", &["a"])],
            },
        },
        options: ExecuteOptions {
            deadline_ms: Some(0),
            ..ExecuteOptions::default()
        },
    };
    let bundle = runtime.execute(&request).await.unwrap();
    assert_eq!(bundle.failed, 2);
    assert!(bundle.errors.iter().all(|e| e.kind == "timeout"));
}

#[tokio::test]
async fn unknown_tool_is_rejected_before_dispatch() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let workflow = Workflow {
        tasks: vec![task("a", "ghost:tool", &[])],
    };
    let err = runtime.execute(&request(workflow)).await.unwrap_err();
    assert_eq!(err.kind(), "not_found");
}

#[tokio::test]
async fn intent_execution_plans_and_records_episode() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;
    assert_eq!(runtime.store().episode_count(), 0);

    let bundle = runtime
        .execute(&ExecuteRequest {
            input: ExecuteInput::Intent {
                intent: "read a json file and parse it".into(),
            },
            options: ExecuteOptions::default(),
        })
        .await
        .unwrap();

    // The template planner chained the capability members sequentially.
    assert_eq!(bundle.total_tasks, 2);
    assert_eq!(bundle.succeeded, 2);
    assert_eq!(bundle.parallelization_layers, 2);

    // Success landed in the episodic log and on the capability counters.
    assert_eq!(runtime.store().episode_count(), 1);
    let capability = runtime.graph().capability("cap__read_json_file").unwrap();
    assert_eq!(capability.attempts, 1);
    assert_eq!(capability.successes, 1);
}

#[tokio::test]
async fn execute_request_wire_shapes_parse() {
    // {workflow: ...} and {intent: ...} both deserialize into ExecuteRequest.
    let from_workflow: ExecuteRequest = serde_json::from_value(json!({
        "workflow": {"tasks": [{"id": "t1", "tool": "fs:read", "arguments": {}}]},
        "deadline_ms": 5000
    }))
    .unwrap();
    match from_workflow.input {
        ExecuteInput::Workflow { workflow } => assert_eq!(workflow.tasks.len(), 1),
        _ => panic!("expected workflow input"),
    }
    assert_eq!(from_workflow.options.deadline_ms, Some(5000));

    let from_intent: ExecuteRequest =
        serde_json::from_value(json!({"intent": "read a file"})).unwrap();
    match from_intent.input {
        ExecuteInput::Intent { intent } => assert_eq!(intent, "read a file"),
        _ => panic!("expected intent input"),
    }
}
