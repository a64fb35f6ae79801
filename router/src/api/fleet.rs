//! フリート操作API
//!
//! 状態取得、設定リロード、監視対象プロセスの起動・停止

use super::AppError;
use crate::gateway::FleetStatus;
use crate::registry::ReloadSummary;
use crate::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use fleet_router_common::{error::GatewayError, types::BackendDescriptor};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

/// バックエンド差し替えリクエスト
#[derive(Debug, Deserialize)]
pub struct ReplaceBackendsRequest {
    /// 新しい記述子リスト
    pub backends: Vec<BackendDescriptor>,
}

/// GET /health
pub async fn liveness() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// GET /api/fleet
pub async fn fleet_status(State(state): State<AppState>) -> Json<FleetStatus> {
    Json(state.gateway.fleet_status().await)
}

/// POST /api/fleet/reload
///
/// 起動時の設定ファイルを読み直す。
pub async fn reload_from_file(
    State(state): State<AppState>,
) -> Result<Json<ReloadSummary>, AppError> {
    let path = state.config_path.as_ref().ok_or_else(|| {
        GatewayError::config("no configuration file to reload from")
    })?;
    info!(path = %path.display(), "Reloading fleet configuration");
    Ok(Json(state.gateway.reload_from_file(path).await?))
}

/// PUT /api/fleet/backends
pub async fn replace_backends(
    State(state): State<AppState>,
    Json(request): Json<ReplaceBackendsRequest>,
) -> Result<Json<ReloadSummary>, AppError> {
    Ok(Json(state.gateway.reload(request.backends).await?))
}

/// POST /api/backends/:name/start
pub async fn start_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.gateway.start_backend(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/backends/:name/stop
pub async fn stop_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.gateway.stop_backend(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// POST /api/backends/:name/restart
pub async fn restart_backend(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.gateway.restart_backend(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
