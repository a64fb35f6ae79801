//! OpenAI互換 推論エンドポイント

use super::InferenceError;
use crate::gateway::InferenceResult;
use crate::AppState;
use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    Json,
};
use fleet_router_common::protocol::{
    ChatChoice, ChatCompletionRequest, ChatCompletionResponse, ChatMessage, Usage,
};
use std::time::Duration;

/// リクエスト単位のタイムアウト指定ヘッダー（ミリ秒）
pub const TIMEOUT_HEADER: &str = "x-request-timeout-ms";
/// 応答したバックエンド名ヘッダー
pub const BACKEND_HEADER: &str = "x-fleet-backend";
/// リクエストIDヘッダー
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, InferenceError> {
    let timeout = request_timeout(&headers).unwrap_or_else(|| state.gateway.request_timeout());
    let model = request.model.clone();

    let result = state
        .gateway
        .handle_inference_request(&model, request, timeout)
        .await?;

    let mut response = Json(to_openai_response(&result)).into_response();
    let response_headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&result.backend) {
        response_headers.insert(BACKEND_HEADER, value);
    }
    if let Ok(value) = HeaderValue::from_str(&result.request_id.to_string()) {
        response_headers.insert(REQUEST_ID_HEADER, value);
    }
    Ok(response)
}

fn request_timeout(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(TIMEOUT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

fn to_openai_response(result: &InferenceResult) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id: Some(format!("chatcmpl-{}", result.request_id.simple())),
        model: Some(result.model.clone()),
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: result.content.clone(),
            },
            finish_reason: result.finish_reason.clone(),
        }],
        usage: Some(Usage {
            prompt_tokens: result.prompt_tokens,
            completion_tokens: result.completion_tokens,
            total_tokens: result.prompt_tokens.saturating_add(result.completion_tokens),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_request_timeout_header() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_timeout(&headers), None);

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("2500"));
        assert_eq!(request_timeout(&headers), Some(Duration::from_millis(2500)));

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("0"));
        assert_eq!(request_timeout(&headers), None);

        headers.insert(TIMEOUT_HEADER, HeaderValue::from_static("soon"));
        assert_eq!(request_timeout(&headers), None);
    }

    #[test]
    fn test_openai_response_shape() {
        let result = InferenceResult {
            request_id: Uuid::new_v4(),
            backend: "gpu-a".into(),
            model: "llama".into(),
            content: "hello".into(),
            finish_reason: Some("stop".into()),
            prompt_tokens: 5,
            completion_tokens: 2,
            latency_ms: 12,
            attempts: 1,
        };

        let response = to_openai_response(&result);
        assert_eq!(response.model.as_deref(), Some("llama"));
        assert_eq!(response.choices[0].message.role, "assistant");
        assert_eq!(response.choices[0].message.content, "hello");
        assert_eq!(response.usage.unwrap().total_tokens, 7);
        assert!(response.id.unwrap().starts_with("chatcmpl-"));
    }

    #[test]
    fn test_total_tokens_saturates() {
        let result = InferenceResult {
            request_id: Uuid::new_v4(),
            backend: "gpu-a".into(),
            model: "llama".into(),
            content: String::new(),
            finish_reason: None,
            prompt_tokens: u32::MAX,
            completion_tokens: 10,
            latency_ms: 1,
            attempts: 1,
        };

        let usage = to_openai_response(&result).usage.unwrap();
        assert_eq!(usage.total_tokens, u32::MAX);
        assert_eq!(usage.prompt_tokens, u32::MAX);
    }
}
