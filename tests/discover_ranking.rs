//! Hybrid retrieval through the full runtime: ranking quality, determinism,
//! explanation payloads, and registration round-trips.

mod common;

use common::seeded_runtime;
use pml::retriever::{DiscoverKind, DiscoverOptions};
use pml::runtime::DiscoverRequest;
use pml::Capability;
use tempfile::TempDir;

fn request(intent: &str) -> DiscoverRequest {
    DiscoverRequest {
        intent: intent.into(),
        options: DiscoverOptions {
            top_k: 10,
            min_score: 0.0,
            include_explanation: false,
        },
    }
}

#[tokio::test]
async fn file_read_intent_surfaces_read_tooling() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let response = runtime.discover(&request("read a file")).await.unwrap();
    assert!(!response.results.is_empty());
    assert!(
        response.results[0].id.contains("read"),
        "top result was {}",
        response.results[0].id
    );
}

#[tokio::test]
async fn discovery_is_deterministic() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let first = runtime
        .discover(&request("parse json from a file"))
        .await
        .unwrap();
    let second = runtime
        .discover(&request("parse json from a file"))
        .await
        .unwrap();

    assert_eq!(first.model_version, second.model_version);
    assert_eq!(first.results.len(), second.results.len());
    for (a, b) in first.results.iter().zip(&second.results) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.score, b.score);
    }
}

#[tokio::test]
async fn results_are_sorted_and_cut_at_top_k() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let mut shaped = request("read and parse json data from a file");
    shaped.options.top_k = 3;
    let response = runtime.discover(&shaped).await.unwrap();

    assert!(response.results.len() <= 3);
    for pair in response.results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
        if pair[0].score == pair[1].score {
            assert!(pair[0].id < pair[1].id);
        }
    }
}

#[tokio::test]
async fn capabilities_carry_explanations_on_request() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;

    let mut shaped = request("read a json file and parse it");
    shaped.options.include_explanation = true;
    let response = runtime.discover(&shaped).await.unwrap();

    let capability = response
        .results
        .iter()
        .find(|r| r.kind == DiscoverKind::Capability)
        .expect("a capability in the results");
    let explanation = capability.explanation.as_ref().expect("explanation");
    assert_eq!(explanation.attention.len(), 2);
    let total: f32 = explanation.attention.iter().map(|(_, w)| w).sum();
    assert!((total - 1.0).abs() < 1e-4);
}

#[tokio::test]
async fn meta_capability_is_typed_meta() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;
    runtime
        .register_capability(Capability::meta(
            "cap__file_and_web_json",
            "read json from files and fetch json from urls",
            vec!["cap__read_json_file".into(), "cap__fetch_url".into()],
        ))
        .unwrap();

    let response = runtime
        .discover(&request("read json from files and fetch json from urls"))
        .await
        .unwrap();
    let meta = response
        .results
        .iter()
        .find(|r| r.id == "cap__file_and_web_json")
        .expect("meta capability ranked");
    assert_eq!(meta.kind, DiscoverKind::Meta);
}

#[tokio::test]
async fn empty_intent_is_rejected() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;
    let err = runtime.discover(&request("   ")).await.unwrap_err();
    assert_eq!(err.kind(), "invalid_argument");
}

#[tokio::test]
async fn reregistration_restores_scoring() {
    let dir = TempDir::new().unwrap();
    let runtime = seeded_runtime(&dir).await;
    let intent = "read a json file and parse it";

    let before = runtime.discover(&request(intent)).await.unwrap();
    let capability = runtime.graph().capability("cap__read_json_file").unwrap();

    runtime.unregister_capability("cap__read_json_file").unwrap();
    let without = runtime.discover(&request(intent)).await.unwrap();
    assert!(without
        .results
        .iter()
        .all(|r| r.id != "cap__read_json_file"));

    runtime.register_capability(capability).unwrap();
    let after = runtime.discover(&request(intent)).await.unwrap();

    let score_of = |response: &pml::runtime::DiscoverResponse| {
        response
            .results
            .iter()
            .find(|r| r.id == "cap__read_json_file")
            .map(|r| r.score)
            .expect("capability present")
    };
    assert!((score_of(&before) - score_of(&after)).abs() <= 1e-6);
}

#[tokio::test]
async fn empty_catalog_returns_empty() {
    let dir = TempDir::new().unwrap();
    let runtime = common::runtime(&dir).await;
    let response = runtime.discover(&request("read a file")).await.unwrap();
    assert!(response.results.is_empty());
}
