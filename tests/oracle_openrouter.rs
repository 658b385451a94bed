use std::time::Duration;

use serde_json::json;
use tailor_harness::oracle::{
    FinishReason, GatewayConfig, GenerationRequest, OpenRouterOracle, Oracle, OracleError,
    OracleGateway,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn request() -> GenerationRequest {
    GenerationRequest::prompt("test/model", "hi", "test")
}

async fn adapter_for(server: &MockServer) -> OpenRouterOracle {
    OpenRouterOracle::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn parses_success_content_and_usage() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "Swap the sneakers for loafers." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 10, "completion_tokens": 20 }
        })))
        .mount(&server)
        .await;

    let oracle = adapter_for(&server).await;
    let resp = oracle.generate(&request()).await.unwrap();

    assert_eq!(resp.text, "Swap the sneakers for loafers.");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 10);
    assert_eq!(resp.output_tokens, 20);
    assert_eq!(resp.total_tokens(), 30);
}

#[tokio::test]
async fn json_mode_requests_json_response_format() {
    let server = MockServer::start().await;

    // The mock only matches when response_format is present in the body.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "{}" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 5, "completion_tokens": 2 }
        })))
        .mount(&server)
        .await;

    let oracle = adapter_for(&server).await;
    let resp = oracle.generate(&request().json()).await.unwrap();
    assert_eq!(resp.text, "{}");
}

#[tokio::test]
async fn refusal_in_content_is_a_permanent_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{
                "message": { "content": "I cannot comply with that request." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 1, "completion_tokens": 1 }
        })))
        .mount(&server)
        .await;

    let oracle = adapter_for(&server).await;
    let err = oracle.generate(&request()).await.unwrap_err();
    assert!(matches!(err, OracleError::Refused { .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn rate_limit_maps_to_retryable_error() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429).set_body_json(json!({
            "error": { "message": "slow down", "code": "rate_limit_exceeded" }
        })))
        .mount(&server)
        .await;

    let oracle = adapter_for(&server).await;
    let err = oracle.generate(&request()).await.unwrap_err();
    assert!(matches!(err, OracleError::RateLimited { .. }));
    assert!(err.is_retryable());
}

#[tokio::test]
async fn gateway_retries_transient_server_errors() {
    let server = MockServer::start().await;

    // First attempt hits a 500, the retry lands on the healthy mock.
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(500).set_body_json(json!({
            "error": { "message": "upstream hiccup" }
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "content": "recovered" }, "finish_reason": "stop" }],
            "usage": { "prompt_tokens": 3, "completion_tokens": 4 }
        })))
        .mount(&server)
        .await;

    let gateway = OracleGateway::with_config(
        adapter_for(&server).await,
        GatewayConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        },
    );

    let resp = gateway.generate(&request()).await.unwrap();
    assert_eq!(resp.text, "recovered");
}

#[tokio::test]
async fn invalid_request_is_not_retried_by_the_gateway() {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model id", "code": "invalid_model" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let gateway = OracleGateway::with_config(
        adapter_for(&server).await,
        GatewayConfig {
            max_retries: 3,
            retry_base_delay: Duration::from_millis(1),
        },
    );

    let err = gateway.generate(&request()).await.unwrap_err();
    assert!(!err.is_retryable());
    // expect(1) on the mock verifies exactly one attempt was made.
}
