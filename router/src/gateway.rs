//! 推論ゲートウェイ
//!
//! レジストリ・プローバー・ロードバランサー・クライアント・スーパーバイザー・
//! モニターを組み立て、`handle_inference_request` を提供する。
//! 同一バックエンドへの再試行（クライアント層）と別バックエンドへの再選択
//! （この層）は分けて扱う。

use crate::balancer::{BackendLoadSnapshot, LoadBalancer};
use crate::client::{
    retry::{RetryPolicy, RetryingClient},
    InferenceClient,
};
use crate::config::load_fleet_config;
use crate::health::{probe_from_config, BackendProbe, HealthProber};
use crate::monitor::{Alert, BackendMetrics, FleetMonitor};
use crate::registry::{BackendRegistry, ReloadSummary};
use crate::supervisor::{CommandLauncher, CrashLoopAlert, ProcessLauncher, Supervisor};
use chrono::{DateTime, Utc};
use fleet_router_common::{
    config::{FleetConfig, RoutingConfig},
    error::{GatewayError, GatewayResult},
    protocol::ChatCompletionRequest,
    types::{
        BackendDescriptor, ErrorClass, HealthRecord, InferenceOutcome, ProcessInfo,
        SelectionStrategy,
    },
};
use serde::Serialize;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// 推論成功時の結果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InferenceResult {
    /// リクエストID
    pub request_id: Uuid,
    /// 応答したバックエンド
    pub backend: String,
    /// モデルID
    pub model: String,
    /// 生成テキスト
    pub content: String,
    /// 終了理由
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// 入力トークン数
    pub prompt_tokens: u32,
    /// 出力トークン数
    pub completion_tokens: u32,
    /// 最終呼び出しのレイテンシ (ms)
    pub latency_ms: u64,
    /// 全バックエンド合計の試行回数
    pub attempts: u32,
}

/// 推論失敗の分類
#[derive(Debug, Clone, PartialEq)]
pub enum InferenceFailure {
    /// 対象モデルを処理できるバックエンドがない（アドミッション失敗）
    NoBackendAvailable {
        /// モデルID
        model: String,
    },
    /// バックエンドがエラーを報告した（再試行しない）
    BackendError {
        /// バックエンド名
        backend: String,
        /// エラー内容
        message: String,
    },
    /// 全候補がタイムアウトした
    Timeout {
        /// 試したバックエンド
        backends: Vec<String>,
    },
    /// 全候補が解釈できない応答を返した
    MalformedResponse {
        /// 試したバックエンド
        backends: Vec<String>,
        /// 最後のエラー内容
        message: String,
    },
    /// 再選択を含めて全候補が失敗した
    FleetExhausted {
        /// 試したバックエンド
        backends: Vec<String>,
        /// 最後のエラー内容
        message: String,
    },
}

impl fmt::Display for InferenceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InferenceFailure::NoBackendAvailable { model } => {
                write!(f, "No available backends for model {}", model)
            }
            InferenceFailure::BackendError { backend, message } => {
                write!(f, "Backend {} reported an error: {}", backend, message)
            }
            InferenceFailure::Timeout { backends } => {
                write!(f, "Request timed out on backends: {}", backends.join(", "))
            }
            InferenceFailure::MalformedResponse { backends, message } => write!(
                f,
                "Malformed response from backends {}: {}",
                backends.join(", "),
                message
            ),
            InferenceFailure::FleetExhausted { backends, message } => write!(
                f,
                "All eligible backends failed ({}): {}",
                backends.join(", "),
                message
            ),
        }
    }
}

impl std::error::Error for InferenceFailure {}

/// バックエンドごとの状態（可観測性向け）
#[derive(Debug, Clone, Serialize)]
pub struct BackendStatusView {
    /// 負荷状況
    #[serde(flatten)]
    pub load: BackendLoadSnapshot,
    /// ヘルス記録
    pub health: HealthRecord,
    /// ウィンドウ集計
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<BackendMetrics>,
    /// 監視対象プロセス
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<ProcessInfo>,
}

/// フリート全体の状態
#[derive(Debug, Clone, Serialize)]
pub struct FleetStatus {
    /// 生成時刻
    pub generated_at: DateTime<Utc>,
    /// 選択戦略
    pub strategy: SelectionStrategy,
    /// デフォルトモデル
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
    /// バックエンド（設定順）
    pub backends: Vec<BackendStatusView>,
    /// 発報中のアラート
    pub alerts: Vec<Alert>,
    /// クラッシュループ中のバックエンド
    pub crash_loops: Vec<CrashLoopAlert>,
    /// モニターが破棄したイベント数
    pub dropped_events: u64,
}

/// 推論ゲートウェイ
pub struct Gateway {
    registry: BackendRegistry,
    balancer: LoadBalancer,
    client: RetryingClient,
    prober: HealthProber,
    monitor: Arc<FleetMonitor>,
    supervisor: Option<Supervisor>,
    routing: RoutingConfig,
    request_timeout: Duration,
}

impl Gateway {
    /// 設定からゲートウェイを組み立てる
    pub async fn new(config: FleetConfig) -> GatewayResult<Self> {
        let probe = probe_from_config(&config.health);
        Self::with_components(config, probe, Arc::new(CommandLauncher::new())).await
    }

    /// プローブとプロセスランチャーを指定して組み立てる
    pub async fn with_components(
        config: FleetConfig,
        probe: Arc<dyn BackendProbe>,
        launcher: Arc<dyn ProcessLauncher>,
    ) -> GatewayResult<Self> {
        config.validate()?;

        let registry = if config.supervisor.enabled {
            BackendRegistry::supervised()
        } else {
            BackendRegistry::new()
        };
        registry
            .reload_with_default(config.backends.clone(), config.default_model.clone())
            .await?;

        let monitor = Arc::new(FleetMonitor::new(config.monitor.clone(), registry.clone()));
        let events = monitor.publisher();
        let prober = HealthProber::new(registry.clone(), probe, &config.health, events.clone());
        let policy = RetryPolicy::from_config(&config.retry);
        let client = RetryingClient::new(
            InferenceClient::new(registry.clone(), events.clone())?,
            policy.clone(),
        );
        let supervisor = config.supervisor.enabled.then(|| {
            Supervisor::new(
                registry.clone(),
                prober.clone(),
                launcher,
                config.supervisor.clone(),
                policy,
                events,
            )
        });

        Ok(Self {
            balancer: LoadBalancer::new(registry.clone()),
            registry,
            client,
            prober,
            monitor,
            supervisor,
            routing: config.routing.clone(),
            request_timeout: config.retry.request_timeout(),
        })
    }

    /// バックグラウンドタスク（プローブ・モニター・プロセス起動）を開始
    pub async fn start(&self) -> Vec<JoinHandle<()>> {
        let mut handles = vec![self.monitor.clone().start(), self.prober.clone().start()];

        if let Some(supervisor) = self.supervisor.clone() {
            let launchable = self.launchable_descriptors().await;
            info!(count = launchable.len(), "Starting supervised backends");
            handles.push(tokio::spawn(async move {
                supervisor.start_all(launchable).await;
            }));
        }
        handles
    }

    async fn launchable_descriptors(&self) -> Vec<BackendDescriptor> {
        self.registry
            .snapshot()
            .await
            .entries()
            .iter()
            .filter(|entry| entry.descriptor.launch.is_some())
            .map(|entry| (*entry.descriptor).clone())
            .collect()
    }

    /// レジストリ
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// ロードバランサー
    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    /// ヘルスプローバー
    pub fn prober(&self) -> &HealthProber {
        &self.prober
    }

    /// フリートモニター
    pub fn monitor(&self) -> &Arc<FleetMonitor> {
        &self.monitor
    }

    /// スーパーバイザー（無効時は None）
    pub fn supervisor(&self) -> Option<&Supervisor> {
        self.supervisor.as_ref()
    }

    /// 既定のリクエストタイムアウト
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// 推論リクエストを処理する
    ///
    /// `model_id` が空ならデフォルトモデルを使う。タイムアウトと接続不可は
    /// 同一バックエンドで再試行した後、別バックエンドを再選択する。
    pub async fn handle_inference_request(
        &self,
        model_id: &str,
        request: ChatCompletionRequest,
        timeout: Duration,
    ) -> Result<InferenceResult, InferenceFailure> {
        let request_id = Uuid::new_v4();
        let model = self.resolve_model(model_id).await?;
        let mut request = request;
        request.model = model.clone();

        let strategy = self.routing.strategy;
        let max_backends = self.routing.max_reselections as usize + 1;
        let mut tried: Vec<String> = Vec::new();
        let mut failures: Vec<InferenceOutcome> = Vec::new();
        let mut attempts = 0;

        while tried.len() < max_backends {
            let lease = match self
                .balancer
                .select_excluding(&model, strategy, &tried)
                .await
            {
                Ok(lease) => lease,
                Err(GatewayError::NoBackendAvailable { .. }) if tried.is_empty() => {
                    info!(%request_id, model = %model, "Rejected request, no backend available");
                    return Err(InferenceFailure::NoBackendAvailable { model });
                }
                Err(GatewayError::NoBackendAvailable { .. }) => break,
                Err(e) => {
                    warn!(%request_id, model = %model, "Backend selection failed: {}", e);
                    break;
                }
            };

            let backend = lease.name().to_string();
            debug!(%request_id, backend = %backend, "Dispatching inference request");
            let report = self
                .client
                .call_with_retry(lease.entry(), &request, timeout)
                .await;
            drop(lease);
            attempts += report.attempts;

            let outcome = report.outcome;
            if outcome.success {
                info!(
                    %request_id,
                    backend = %backend,
                    latency_ms = outcome.latency_ms,
                    attempts,
                    "Inference request completed"
                );
                return Ok(InferenceResult {
                    request_id,
                    backend,
                    model: outcome.model,
                    content: outcome.content.unwrap_or_default(),
                    finish_reason: outcome.finish_reason,
                    prompt_tokens: outcome.prompt_tokens,
                    completion_tokens: outcome.completion_tokens,
                    latency_ms: outcome.latency_ms,
                    attempts,
                });
            }

            if !should_reselect(&outcome) {
                return Err(InferenceFailure::BackendError {
                    backend,
                    message: outcome.error_message.unwrap_or_default(),
                });
            }

            warn!(
                %request_id,
                backend = %backend,
                class = ?outcome.error_class,
                "Backend failed, selecting another"
            );
            tried.push(backend);
            failures.push(outcome);
        }

        Err(exhausted(model, tried, failures))
    }

    async fn resolve_model(&self, model_id: &str) -> Result<String, InferenceFailure> {
        if !model_id.trim().is_empty() {
            return Ok(model_id.to_string());
        }
        self.registry
            .snapshot()
            .await
            .default_model()
            .map(str::to_string)
            .ok_or(InferenceFailure::NoBackendAvailable {
                model: String::new(),
            })
    }

    /// 記述子リストでレジストリを差し替える
    ///
    /// スーパーバイザー有効時は、追加されたバックエンドを起動し、
    /// 削除されたバックエンドを停止する。
    pub async fn reload(&self, descriptors: Vec<BackendDescriptor>) -> GatewayResult<ReloadSummary> {
        let summary = self.registry.reload(descriptors).await?;
        self.apply_lifecycle(&summary).await;
        Ok(summary)
    }

    /// フリート設定ファイルを読み直してバックエンドを差し替える
    pub async fn reload_from_file(&self, path: &Path) -> GatewayResult<ReloadSummary> {
        let config = load_fleet_config(path)?;
        let summary = self
            .registry
            .reload_with_default(config.backends, config.default_model)
            .await?;
        self.apply_lifecycle(&summary).await;
        Ok(summary)
    }

    async fn apply_lifecycle(&self, summary: &ReloadSummary) {
        for name in &summary.removed {
            self.monitor.forget(name);
        }

        let Some(supervisor) = self.supervisor.clone() else {
            return;
        };

        let supervised = supervisor.supervised();
        let removed: Vec<String> = summary
            .removed
            .iter()
            .filter(|name| supervised.contains(name))
            .cloned()
            .collect();
        if !removed.is_empty() {
            let supervisor = supervisor.clone();
            tokio::spawn(async move {
                for name in removed {
                    supervisor.forget(&name).await;
                }
            });
        }

        let snapshot = self.registry.snapshot().await;
        let added: Vec<BackendDescriptor> = summary
            .added
            .iter()
            .filter_map(|name| snapshot.get(name))
            .filter(|entry| entry.descriptor.launch.is_some())
            .map(|entry| (*entry.descriptor).clone())
            .collect();
        if !added.is_empty() {
            tokio::spawn(async move {
                supervisor.start_all(added).await;
            });
        }
    }

    /// 監視対象バックエンドを手動起動する
    pub async fn start_backend(&self, name: &str) -> GatewayResult<()> {
        let supervisor = self.require_supervisor()?;
        let entry = self.registry.get(name).await?;
        supervisor.start((*entry.descriptor).clone()).await
    }

    /// 監視対象バックエンドを停止する
    pub async fn stop_backend(&self, name: &str) -> GatewayResult<()> {
        self.require_supervisor()?.stop(name).await
    }

    /// 監視対象バックエンドを再起動する
    pub async fn restart_backend(&self, name: &str) -> GatewayResult<()> {
        let supervisor = self.require_supervisor()?;
        self.registry.get(name).await?;
        if supervisor.supervised().iter().any(|n| n == name) {
            supervisor.restart(name).await
        } else {
            self.start_backend(name).await
        }
    }

    fn require_supervisor(&self) -> GatewayResult<&Supervisor> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| GatewayError::Process("process supervision is disabled".to_string()))
    }

    /// フリート全体の状態
    pub async fn fleet_status(&self) -> FleetStatus {
        let snapshot = self.registry.snapshot().await;
        let loads = self.balancer.load_snapshot().await;
        let metrics = self.monitor.metrics();

        let backends = loads
            .into_iter()
            .map(|load| {
                let entry = snapshot.get(&load.name);
                BackendStatusView {
                    health: entry
                        .map(|e| e.state.health())
                        .unwrap_or_else(|| HealthRecord::new(load.status)),
                    process: entry.and_then(|e| e.state.process()),
                    metrics: metrics.iter().find(|m| m.backend == load.name).cloned(),
                    load,
                }
            })
            .collect();

        FleetStatus {
            generated_at: Utc::now(),
            strategy: self.routing.strategy,
            default_model: snapshot.default_model().map(str::to_string),
            backends,
            alerts: self.monitor.active_alerts(),
            crash_loops: self
                .supervisor
                .as_ref()
                .map(Supervisor::alerts)
                .unwrap_or_default(),
            dropped_events: self.monitor.dropped_events(),
        }
    }
}

/// 別バックエンドの再選択で回復し得る失敗か
///
/// バックエンド自身が報告したエラーだけはそのまま返す。
fn should_reselect(outcome: &InferenceOutcome) -> bool {
    outcome.error_class != Some(ErrorClass::BackendError)
}

fn exhausted(model: String, tried: Vec<String>, failures: Vec<InferenceOutcome>) -> InferenceFailure {
    let Some(last) = failures.last() else {
        return InferenceFailure::NoBackendAvailable { model };
    };
    let message = last.error_message.clone().unwrap_or_default();
    let all = |class: ErrorClass| failures.iter().all(|f| f.error_class == Some(class));

    if all(ErrorClass::Timeout) {
        InferenceFailure::Timeout { backends: tried }
    } else if all(ErrorClass::MalformedResponse) {
        InferenceFailure::MalformedResponse {
            backends: tried,
            message,
        }
    } else {
        InferenceFailure::FleetExhausted {
            backends: tried,
            message,
        }
    }
}
