//! Shared fixtures: a token-overlap embedding backend (deterministic, no
//! model download), a stub tool invoker, and a runtime builder over a
//! temporary store.

use async_trait::async_trait;
use pml::config::{PmlConfig, Settings};
use pml::embedding::MockEmbeddingBackend;
use pml::error::{PmlError, Result};
use pml::graph::ToolRecord;
use pml::runtime::PmlRuntime;
use pml::workflow::executor::ToolInvoker;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const DIM: usize = 32;

/// Bag-of-words embedding: each lowercased token contributes a stable hash
/// vector. Texts sharing words land close together, which is all the
/// retrieval tests need.
pub fn token_backend() -> Arc<MockEmbeddingBackend> {
    Arc::new(MockEmbeddingBackend::new(DIM, |text| {
        let mut acc = vec![0.0f32; DIM];
        for token in text
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|t| !t.is_empty())
        {
            let mut state: u64 = 0xcbf2_9ce4_8422_2325;
            for byte in token.bytes() {
                state ^= u64::from(byte);
                state = state.wrapping_mul(0x0000_0100_0000_01b3);
            }
            for slot in acc.iter_mut() {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                *slot += ((state >> 11) as f32 / (1u64 << 53) as f32) - 0.5;
            }
        }
        if acc.iter().all(|&x| x == 0.0) {
            acc[0] = 1.0;
        }
        acc
    }))
}

/// Echo invoker that recognizes every `provider:name` id except the `ghost`
/// provider. Tool behaviors are keyed by provider.
pub struct EchoInvoker;

#[async_trait]
impl ToolInvoker for EchoInvoker {
    fn knows_tool(&self, tool_id: &str) -> bool {
        !tool_id.starts_with("ghost:")
    }

    async fn call(&self, tool_id: &str, arguments: Value, _timeout: Duration) -> Result<Value> {
        match tool_id {
            "sim:fail" => Err(PmlError::UpstreamFailure {
                provider: "sim".into(),
                message: "simulated failure".into(),
                payload: Some(json!({"reason": "test"})),
            }),
            "sim:sleep" => {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(json!("slept"))
            }
            _ => Ok(json!({"tool": tool_id, "echo": arguments})),
        }
    }
}

pub fn test_config(dir: &TempDir) -> Arc<PmlConfig> {
    let mut settings = Settings::default();
    settings.db_path = dir.path().join("pml.db");
    settings.embedding_dim = DIM;
    Arc::new(PmlConfig {
        version: "1.0".into(),
        providers: HashMap::new(),
        settings,
    })
}

pub async fn runtime(dir: &TempDir) -> Arc<PmlRuntime> {
    PmlRuntime::with_invoker(test_config(dir), token_backend(), Arc::new(EchoInvoker), None)
        .await
        .expect("runtime bootstrap")
}

pub fn tool(id: &str, description: &str) -> ToolRecord {
    let (provider, name) = ToolRecord::split_id(id).expect("valid tool id");
    ToolRecord {
        id: id.to_string(),
        provider: provider.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        input_schema: json!({"type": "object"}),
        embedding: Vec::new(),
        community: None,
        pagerank: 0.0,
    }
}

/// The standard fixture catalog: file + json + network tools with two
/// capabilities over them.
pub async fn seeded_runtime(dir: &TempDir) -> Arc<PmlRuntime> {
    let runtime = runtime(dir).await;
    for (id, description) in [
        ("fs:read", "Read a file from the local filesystem"),
        ("fs:write", "Write content to a file on disk"),
        ("json:parse", "Parse a JSON string into structured data"),
        ("net:get", "Fetch a URL over HTTP"),
    ] {
        runtime.register_tool(tool(id, description)).expect("register tool");
    }
    runtime
        .register_capability(pml::Capability::leaf(
            "cap__read_json_file",
            "read a json file and parse it",
            vec!["fs:read".into(), "json:parse".into()],
        ))
        .expect("register capability");
    runtime
        .register_capability(pml::Capability::leaf(
            "cap__fetch_url",
            "fetch a url and parse the json response",
            vec!["net:get".into(), "json:parse".into()],
        ))
        .expect("register capability");
    runtime
}
