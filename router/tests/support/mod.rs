//! 統合テスト用ヘルパー
//!
//! wiremock でOpenAI互換バックエンドを立て、ゲートウェイを組み立てる。

#![allow(dead_code)]

use fleet_router::gateway::Gateway;
use fleet_router_common::{
    config::FleetConfig,
    protocol::{ChatCompletionRequest, ChatMessage},
    types::BackendDescriptor,
};
use serde_json::json;
use std::time::Duration;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

/// 固定の完了レスポンスを返すバックエンド
pub async fn completion_backend(content: &str) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(content)))
        .mount(&server)
        .await;
    server
}

/// 指定ステータスを返すバックエンド
pub async fn failing_backend(status: u16) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(status).set_body_string("model crashed"))
        .mount(&server)
        .await;
    server
}

/// 応答が遅いバックエンド
pub async fn slow_backend(delay: Duration) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("late"))
                .set_delay(delay),
        )
        .mount(&server)
        .await;
    server
}

/// OpenAI形式の完了レスポンス
pub fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "llama",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 4, "completion_tokens": 2, "total_tokens": 6}
    })
}

/// MockServer を指す記述子
pub fn descriptor_for(name: &str, server: &MockServer, model: &str) -> BackendDescriptor {
    let addr = server.address();
    BackendDescriptor::new(name, addr.ip().to_string(), addr.port(), model)
}

/// 接続を受け付けないポートを指す記述子
pub fn refused_descriptor(name: &str, model: &str) -> BackendDescriptor {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    BackendDescriptor::new(name, "127.0.0.1", port, model)
}

/// 短いバックオフのフリート設定
pub fn fleet_config(backends: Vec<BackendDescriptor>) -> FleetConfig {
    let mut config = FleetConfig {
        backends,
        ..FleetConfig::default()
    };
    config.retry.max_attempts = 2;
    config.retry.base_delay_ms = 1;
    config.retry.max_delay_ms = 5;
    config.retry.request_timeout_ms = 2_000;
    config
}

/// ゲートウェイを組み立てる（バックグラウンドタスクは起動しない）
pub async fn gateway(config: FleetConfig) -> Gateway {
    Gateway::new(config).await.unwrap()
}

/// 単一メッセージのリクエスト
pub fn chat_request(model: &str) -> ChatCompletionRequest {
    ChatCompletionRequest {
        model: model.to_string(),
        messages: vec![ChatMessage::user("hello")],
        temperature: None,
        max_tokens: None,
        stream: false,
    }
}
