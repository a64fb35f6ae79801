//! REST APIハンドラー
//!
//! 推論プロキシ（OpenAI互換）とフリート操作API

pub mod fleet;
pub mod inference;

use crate::gateway::InferenceFailure;
use crate::AppState;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use fleet_router_common::error::{CommonError, GatewayError};
use serde_json::json;

/// APIルーターを作成
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(fleet::liveness))
        .route("/v1/chat/completions", post(inference::chat_completions))
        .route("/api/fleet", get(fleet::fleet_status))
        .route("/api/fleet/reload", post(fleet::reload_from_file))
        .route("/api/fleet/backends", put(fleet::replace_backends))
        .route("/api/backends/:name/start", post(fleet::start_backend))
        .route("/api/backends/:name/stop", post(fleet::stop_backend))
        .route("/api/backends/:name/restart", post(fleet::restart_backend))
        .with_state(state)
}

/// APIエラー（GatewayError をHTTPレスポンスへ変換）
#[derive(Debug)]
pub struct AppError(GatewayError);

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        AppError(err)
    }
}

impl From<CommonError> for AppError {
    fn from(err: CommonError) -> Self {
        AppError(GatewayError::Common(err))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            GatewayError::Common(_) => StatusCode::BAD_REQUEST,
            GatewayError::BackendNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::NoBackendAvailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Process(_) => StatusCode::CONFLICT,
            GatewayError::StartTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            GatewayError::Http(_) => StatusCode::BAD_GATEWAY,
        };

        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// 推論失敗をHTTPレスポンスへ変換する
#[derive(Debug)]
pub struct InferenceError(InferenceFailure);

impl From<InferenceFailure> for InferenceError {
    fn from(failure: InferenceFailure) -> Self {
        InferenceError(failure)
    }
}

impl IntoResponse for InferenceError {
    fn into_response(self) -> Response {
        let (status, kind, backends) = match &self.0 {
            InferenceFailure::NoBackendAvailable { .. } => {
                (StatusCode::SERVICE_UNAVAILABLE, "no_backend_available", vec![])
            }
            InferenceFailure::BackendError { backend, .. } => {
                (StatusCode::BAD_GATEWAY, "backend_error", vec![backend.clone()])
            }
            InferenceFailure::Timeout { backends } => {
                (StatusCode::GATEWAY_TIMEOUT, "timeout", backends.clone())
            }
            InferenceFailure::MalformedResponse { backends, .. } => {
                (StatusCode::BAD_GATEWAY, "malformed_response", backends.clone())
            }
            InferenceFailure::FleetExhausted { backends, .. } => {
                (StatusCode::BAD_GATEWAY, "fleet_exhausted", backends.clone())
            }
        };

        let payload = json!({
            "error": self.0.to_string(),
            "kind": kind,
            "backends": backends,
        });
        (status, Json(payload)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 1024 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_app_error_status_mapping() {
        let cases = [
            (
                GatewayError::BackendNotFound("gpu-a".into()),
                StatusCode::NOT_FOUND,
            ),
            (
                GatewayError::NoBackendAvailable {
                    model: "llama".into(),
                },
                StatusCode::SERVICE_UNAVAILABLE,
            ),
            (
                GatewayError::config("duplicate backend name: a"),
                StatusCode::BAD_REQUEST,
            ),
            (
                GatewayError::StartTimeout {
                    name: "a".into(),
                    secs: 60,
                },
                StatusCode::GATEWAY_TIMEOUT,
            ),
            (
                GatewayError::Process("process supervision is disabled".into()),
                StatusCode::CONFLICT,
            ),
            (
                GatewayError::Http("Failed to create HTTP client".into()),
                StatusCode::BAD_GATEWAY,
            ),
        ];

        for (error, expected) in cases {
            let message = error.to_string();
            let response = AppError(error).into_response();
            assert_eq!(response.status(), expected);
            assert_eq!(body_json(response).await["error"], message);
        }
    }

    #[tokio::test]
    async fn test_inference_error_payload() {
        let response = InferenceError(InferenceFailure::Timeout {
            backends: vec!["a".into(), "b".into()],
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);

        let body = body_json(response).await;
        assert_eq!(body["kind"], "timeout");
        assert_eq!(body["backends"], json!(["a", "b"]));

        let response = InferenceError(InferenceFailure::NoBackendAvailable {
            model: "llama".into(),
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            body_json(response).await["error"],
            "No available backends for model llama"
        );
    }
}
