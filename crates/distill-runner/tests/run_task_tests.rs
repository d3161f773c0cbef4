//! End-to-end task runs against a mocked Gemini API

use distill_llm::{ErrorClass, FailureReason, TaskRequest};
use distill_runner::config::RunnerConfig;
use distill_runner::run::{apply_model_defaults, build_orchestrator};
use mockito::{Matcher, Server};

fn config(base_url: String) -> RunnerConfig {
    let mut config = RunnerConfig {
        api_key: Some("test-key".to_string()),
        base_url: Some(base_url),
        default_model: Some("m1".to_string()),
        fallback_model: Some("m2".to_string()),
        ..Default::default()
    };
    config.orchestrator.retry.initial_delay_ms = 10;
    config.orchestrator.retry.max_delay_ms = 20;
    config.orchestrator.retry.jitter_ms = 0;
    config
}

fn task() -> TaskRequest {
    serde_json::from_str(
        r#"{"task_type": "invoice", "prompt": "Invoice #7: total 12.50 EUR", "system_instruction": "Extract invoice fields"}"#,
    )
    .unwrap()
}

const SUCCESS_BODY: &str = r#"{
    "candidates": [{"content": {"role": "model", "parts": [{"text": "{\"number\": 7, \"total\": 12.5,}"}]}, "finishReason": "STOP"}],
    "usageMetadata": {"promptTokenCount": 20, "candidatesTokenCount": 8, "totalTokenCount": 28}
}"#;

#[tokio::test]
async fn test_primary_server_error_falls_back_to_second_model() {
    let mut server = Server::new_async().await;
    let primary = server
        .mock("POST", Matcher::Regex("^/models/m1:generateContent".to_string()))
        .match_query(Matcher::UrlEncoded("key".into(), "test-key".into()))
        .with_status(500)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"code": 500, "message": "An internal error has occurred", "status": "INTERNAL"}}"#)
        .expect(1)
        .create_async()
        .await;
    let fallback = server
        .mock("POST", Matcher::Regex("^/models/m2:generateContent".to_string()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(SUCCESS_BODY)
        .expect(1)
        .create_async()
        .await;

    let config = config(server.url());
    let mut task = task();
    apply_model_defaults(&mut task, &config);
    let orchestrator = build_orchestrator(&config).await.unwrap();

    let outcome = orchestrator.run(&task).await;

    primary.assert_async().await;
    fallback.assert_async().await;
    assert!(outcome.success, "unexpected failure: {:?}", outcome.failure_detail);
    assert!(outcome.used_fallback);
    assert_eq!(outcome.model_used.as_deref(), Some("m2"));
    assert_eq!(outcome.response_text, r#"{"number": 7, "total": 12.5}"#);
    assert_eq!(outcome.usage.unwrap().total_token_count, 28);
}

#[tokio::test]
async fn test_quota_errors_exhaust_fallback_budget() {
    let mut server = Server::new_async().await;
    let _m = server
        .mock("POST", Matcher::Regex(":generateContent".to_string()))
        .with_status(429)
        .with_header("content-type", "application/json")
        .with_body(r#"{"error": {"code": 429, "message": "Quota exceeded", "status": "RESOURCE_EXHAUSTED"}}"#)
        .expect(4)
        .create_async()
        .await;

    let config = config(server.url());
    let mut task = task();
    apply_model_defaults(&mut task, &config);
    let orchestrator = build_orchestrator(&config).await.unwrap();

    let outcome = orchestrator.run(&task).await;

    assert!(!outcome.success);
    assert!(outcome.used_fallback);
    assert_eq!(outcome.failure_reason, Some(FailureReason::ExhaustedRetries));
    assert_eq!(outcome.attempts, 3);
    assert_eq!(outcome.failure_class, Some(ErrorClass::QuotaExceeded));
}
