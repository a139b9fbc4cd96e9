//! The MCP-facing surface: the two meta-tool handlers and their wire shapes.

mod common;

use common::seeded_runtime;
use pml::retriever::DiscoverOptions;
use pml::runtime::{DiscoverRequest, ExecuteInput, ExecuteRequest};
use pml::server::PmlServer;
use pml::workflow::executor::ExecuteOptions;
use pml::workflow::{Task, Workflow};
use rmcp::handler::server::wrapper::Parameters;
use serde_json::json;
use tempfile::TempDir;

#[tokio::test]
async fn discover_handler_returns_ranked_results() {
    let dir = TempDir::new().unwrap();
    let server = PmlServer::new(seeded_runtime(&dir).await);

    let response = server
        .discover_tool(Parameters(DiscoverRequest {
            intent: "read a file".into(),
            options: DiscoverOptions {
                top_k: 5,
                min_score: 0.0,
                include_explanation: false,
            },
        }))
        .await
        .expect("discover succeeds");

    assert!(!response.0.results.is_empty());
    assert!(response.0.results[0].id.contains("read"));
}

#[tokio::test]
async fn execute_handler_runs_a_workflow() {
    let dir = TempDir::new().unwrap();
    let server = PmlServer::new(seeded_runtime(&dir).await);

    let read = Task {
        id: "t1".into(),
        tool: "fs:read".into(),
        arguments: json!({"path": "/tmp/x"}),
        depends_on: vec![],
        timeout_ms: None,
        retry: None,
        on_error: Default::default(),
    };

    let bundle = server
        .execute_tool(Parameters(ExecuteRequest {
            input: ExecuteInput::Workflow {
                workflow: Workflow { tasks: vec![read] },
            },
            options: ExecuteOptions::default(),
        }))
        .await
        .expect("execute succeeds");

    assert_eq!(bundle.0.succeeded, 1);
    assert_eq!(bundle.0.parallelization_layers, 1);
}

#[tokio::test]
async fn handler_errors_carry_the_wire_taxonomy() {
    let dir = TempDir::new().unwrap();
    let server = PmlServer::new(seeded_runtime(&dir).await);

    let err = server
        .execute_tool(Parameters(ExecuteRequest {
            input: ExecuteInput::Workflow {
                workflow: Workflow {
                    tasks: vec![
                        Task {
                            id: "t1".into(),
                            tool: "fs:read".into(),
                            arguments: json!({}),
                            depends_on: vec!["t2".into()],
                            timeout_ms: None,
                            retry: None,
                            on_error: Default::default(),
                        },
                        Task {
                            id: "t2".into(),
                            tool: "json:parse".into(),
                            arguments: json!({}),
                            depends_on: vec!["t1".into()],
                            timeout_ms: None,
                            retry: None,
                            on_error: Default::default(),
                        },
                    ],
                },
            },
            options: ExecuteOptions::default(),
        }))
        .await
        .map(|_| ())
        .expect_err("cycle should fail");

    let wire: serde_json::Value = serde_json::from_str(&err).expect("structured error payload");
    assert_eq!(wire["kind"], "invalid_argument");
    assert!(wire["message"].as_str().unwrap().contains("cycle"));
}
