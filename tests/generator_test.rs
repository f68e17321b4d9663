//! HTTP generator against a mock Ollama server.

mod helpers;

use axum::http::StatusCode;
use classroom_insights::analysis::{
    build_transcript, AnalysisScope, AnalysisStores, AnalysisWorker, Generator, GeneratorConfig,
    GeneratorError, JobOutcome, OllamaGenerator, RequestCoordinator, WorkerConfig,
};
use helpers::fakes::FakeConversationStore;
use helpers::message;
use helpers::ollama_mock::{MockOllamaConfig, MockOllamaServer};
use std::sync::Arc;

async fn generator_for(server: &MockOllamaServer, timeout_seconds: u64) -> OllamaGenerator {
    let base_url = server.start().await;
    OllamaGenerator::new(GeneratorConfig {
        base_url,
        model: "llama3.1:8b".to_string(),
        timeout_seconds,
        temperature: 0.2,
    })
    .unwrap()
}

#[tokio::test]
async fn test_summarize_sends_transcript_and_returns_text() {
    let server = MockOllamaServer::new(MockOllamaConfig {
        response: "  Students struggled with unit conversion.\n".to_string(),
        ..Default::default()
    });
    let generator = generator_for(&server, 5).await;
    let transcript = build_transcript(&[
        message("m1", "How many cm in a km?", 0),
        message("m2", "100,000.", 1),
    ]);

    let analysis = generator.summarize(&transcript).await.unwrap();

    assert_eq!(analysis, "Students struggled with unit conversion.");
    assert_eq!(server.request_count(), 1);

    let request = server.last_request().await.unwrap();
    assert_eq!(request["model"], "llama3.1:8b");
    assert_eq!(request["stream"], false);
    let prompt = request["prompt"].as_str().unwrap();
    assert!(prompt.contains("Student: How many cm in a km?"));
    assert!(prompt.contains("Assistant: 100,000."));
}

#[tokio::test]
async fn test_provider_error_status() {
    let server = MockOllamaServer::new(MockOllamaConfig {
        fail_with: Some(StatusCode::INTERNAL_SERVER_ERROR),
        ..Default::default()
    });
    let generator = generator_for(&server, 5).await;

    let err = generator.summarize("transcript").await.unwrap_err();
    assert!(matches!(err, GeneratorError::Provider(msg) if msg.contains("500")));
}

#[tokio::test]
async fn test_incomplete_response_is_malformed() {
    let server = MockOllamaServer::new(MockOllamaConfig {
        incomplete: true,
        ..Default::default()
    });
    let generator = generator_for(&server, 5).await;

    assert!(matches!(
        generator.summarize("transcript").await,
        Err(GeneratorError::MalformedResponse(_))
    ));
}

#[tokio::test]
async fn test_blank_response_is_malformed() {
    let server = MockOllamaServer::new(MockOllamaConfig {
        response: "   ".to_string(),
        ..Default::default()
    });
    let generator = generator_for(&server, 5).await;

    assert!(matches!(
        generator.summarize("transcript").await,
        Err(GeneratorError::MalformedResponse(_))
    ));
}

#[tokio::test]
async fn test_slow_provider_times_out() {
    let server = MockOllamaServer::new(MockOllamaConfig {
        response_delay_ms: Some(2_500),
        ..Default::default()
    });
    let generator = generator_for(&server, 1).await;

    assert!(matches!(
        generator.summarize("transcript").await,
        Err(GeneratorError::Timeout { seconds: 1 })
    ));
}

#[tokio::test]
async fn test_health_check() {
    let server = MockOllamaServer::new(MockOllamaConfig::default());
    let generator = generator_for(&server, 5).await;
    assert!(generator.health_check().await);

    let unreachable = OllamaGenerator::new(GeneratorConfig {
        base_url: "http://127.0.0.1:9".to_string(),
        ..Default::default()
    })
    .unwrap();
    assert!(!unreachable.health_check().await);
}

#[tokio::test]
async fn test_worker_with_http_generator_fills_cache() {
    let server = MockOllamaServer::new(MockOllamaConfig::default());
    let generator = Arc::new(generator_for(&server, 5).await);

    let conversations = Arc::new(FakeConversationStore::default());
    let scope = AnalysisScope::class("hillcrest", "5", "E");
    conversations
        .set_messages(&scope, vec![message("m1", "What is 3/4 + 1/4?", 0)])
        .await;

    let stores = AnalysisStores::in_memory();
    let coordinator = RequestCoordinator::new(conversations.clone(), stores.clone());
    let worker = AnalysisWorker::new(
        conversations,
        generator,
        stores.clone(),
        WorkerConfig::default(),
    );

    coordinator.request_analysis(&scope, false).await.unwrap();
    let job_id = stores.queue.dequeue().await.unwrap().unwrap();
    assert_eq!(
        worker.process_job(job_id).await.unwrap(),
        JobOutcome::Completed
    );

    let record = stores.cache.get(&scope).await.unwrap().unwrap();
    assert_eq!(
        record.analysis_text.as_deref(),
        Some("Students mostly asked about fractions.")
    );
    assert_eq!(server.request_count(), 1);
}
