//! 推論クライアント
//!
//! 選択済みバックエンドへ OpenAI 互換の chat completions を1回送信し、
//! 失敗はエラーとして返さず分類済みの [`InferenceOutcome`] にする。
//! 再試行は [`retry`] モジュールの別レイヤーで行う。

pub mod retry;

use crate::monitor::{EventPublisher, FleetEvent};
use crate::registry::{BackendEntry, BackendRegistry};
use fleet_router_common::{
    error::{GatewayError, GatewayResult},
    protocol::{ChatCompletionRequest, ChatCompletionResponse},
    types::{ErrorClass, InferenceOutcome},
};
use reqwest::Client;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// バックエンドエラー本文をメッセージに含める最大文字数
const ERROR_BODY_EXCERPT_CHARS: usize = 256;

/// chat completions エンドポイント
pub const CHAT_COMPLETIONS_PATH: &str = "/v1/chat/completions";

/// reqwest のエラーを分類する
pub fn classify_transport_error(err: &reqwest::Error) -> ErrorClass {
    if err.is_timeout() {
        ErrorClass::Timeout
    } else if err.is_decode() || err.is_body() {
        ErrorClass::MalformedResponse
    } else {
        // 接続確立前後の転送エラーは接続不可として扱う
        ErrorClass::ConnectionRefused
    }
}

/// 推論クライアント
#[derive(Clone)]
pub struct InferenceClient {
    http_client: Client,
    registry: BackendRegistry,
    events: EventPublisher,
}

impl InferenceClient {
    /// 新しいクライアントを作成
    pub fn new(registry: BackendRegistry, events: EventPublisher) -> GatewayResult<Self> {
        let http_client = Client::builder()
            .build()
            .map_err(|e| GatewayError::Http(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self {
            http_client,
            registry,
            events,
        })
    }

    /// 名前で指定したバックエンドへ1回送信する
    pub async fn call(
        &self,
        backend_name: &str,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> InferenceOutcome {
        match self.registry.get(backend_name).await {
            Ok(entry) => self.call_entry(&entry, request, timeout).await,
            Err(e) => InferenceOutcome::failure(
                backend_name,
                &request.model,
                0,
                ErrorClass::UnknownBackend,
                e.to_string(),
            ),
        }
    }

    /// エントリへ1回送信し、カウンタとモニターに結果を記録する
    pub async fn call_entry(
        &self,
        entry: &BackendEntry,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> InferenceOutcome {
        let started = Instant::now();
        let result = tokio::time::timeout(timeout, self.exchange(entry, request, timeout)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let outcome = match result {
            Ok(Ok(response)) => success_outcome(entry, request, response, latency_ms),
            Ok(Err((class, message))) => {
                InferenceOutcome::failure(entry.name(), &request.model, latency_ms, class, message)
            }
            Err(_) => InferenceOutcome::failure(
                entry.name(),
                &request.model,
                latency_ms,
                ErrorClass::Timeout,
                format!("request timed out after {}ms", timeout.as_millis()),
            ),
        };

        entry.state.record_completion(outcome.success, latency_ms);
        if outcome.success {
            debug!(
                backend = %entry.name(),
                latency_ms,
                completion_tokens = outcome.completion_tokens,
                "Inference call succeeded"
            );
        } else {
            warn!(
                backend = %entry.name(),
                latency_ms,
                class = ?outcome.error_class,
                error = outcome.error_message.as_deref().unwrap_or(""),
                "Inference call failed"
            );
        }
        self.events.publish(FleetEvent::Outcome(outcome.clone()));

        outcome
    }

    async fn exchange(
        &self,
        entry: &BackendEntry,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<ChatCompletionResponse, (ErrorClass, String)> {
        let url = format!("{}{}", entry.descriptor.base_url(), CHAT_COMPLETIONS_PATH);
        let mut body = request.clone();
        body.stream = false;

        let response = self
            .http_client
            .post(&url)
            .timeout(timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| (classify_transport_error(&e), e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let excerpt: String = text.chars().take(ERROR_BODY_EXCERPT_CHARS).collect();
            return Err((
                ErrorClass::BackendError,
                format!("backend returned HTTP {}: {}", status, excerpt),
            ));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| (classify_transport_error(&e), e.to_string()))?;
        let parsed: ChatCompletionResponse = serde_json::from_slice(&bytes).map_err(|e| {
            (
                ErrorClass::MalformedResponse,
                format!("failed to parse completion response: {}", e),
            )
        })?;
        if parsed.choices.is_empty() {
            return Err((
                ErrorClass::MalformedResponse,
                "completion response has no choices".to_string(),
            ));
        }
        Ok(parsed)
    }
}

fn success_outcome(
    entry: &BackendEntry,
    request: &ChatCompletionRequest,
    response: ChatCompletionResponse,
    latency_ms: u64,
) -> InferenceOutcome {
    let usage = response.usage.unwrap_or_default();
    let choice = response.choices.into_iter().next();
    InferenceOutcome {
        backend: entry.name().to_string(),
        model: response.model.unwrap_or_else(|| request.model.clone()),
        success: true,
        latency_ms,
        prompt_tokens: usage.prompt_tokens,
        completion_tokens: usage.completion_tokens,
        finish_reason: choice.as_ref().and_then(|c| c.finish_reason.clone()),
        content: choice.map(|c| c.message.content),
        error_class: None,
        error_message: None,
    }
}
