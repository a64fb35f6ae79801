//! 設定管理
//!
//! FleetConfig と各コンポーネントの設定構造体

use crate::error::{CommonError, CommonResult};
use crate::types::{BackendDescriptor, HealthThresholds, SelectionStrategy};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// フリート全体の設定（JSONファイル）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FleetConfig {
    /// デフォルトモデル（指定時は有効なバックエンドが必須）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// バックエンド記述子（順序は選択時のタイブレークに使用）
    #[serde(default)]
    pub backends: Vec<BackendDescriptor>,

    /// ヘルスプローブ設定
    #[serde(default)]
    pub health: HealthConfig,

    /// リトライ設定
    #[serde(default)]
    pub retry: RetryConfig,

    /// プロセス監視設定
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// フリートモニター設定
    #[serde(default)]
    pub monitor: MonitorConfig,

    /// ルーティング設定
    #[serde(default)]
    pub routing: RoutingConfig,
}

impl FleetConfig {
    /// JSON文字列から読み込み、検証する
    pub fn from_json(json: &str) -> CommonResult<Self> {
        let config: FleetConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// 設定全体を検証
    pub fn validate(&self) -> CommonResult<()> {
        validate_descriptors(&self.backends, self.default_model.as_deref())?;
        self.health.validate()?;
        self.retry.validate()?;
        self.monitor.validate()?;
        Ok(())
    }
}

/// 記述子リストを検証（名前重複・必須項目・デフォルトモデル）
pub fn validate_descriptors(
    descriptors: &[BackendDescriptor],
    default_model: Option<&str>,
) -> CommonResult<()> {
    let mut names = HashSet::new();
    for desc in descriptors {
        if desc.name.trim().is_empty() {
            return Err(CommonError::Config("backend name must not be empty".into()));
        }
        if desc.host.trim().is_empty() {
            return Err(CommonError::Config(format!(
                "backend {} has an empty host",
                desc.name
            )));
        }
        if desc.port == 0 {
            return Err(CommonError::Config(format!(
                "backend {} has port 0",
                desc.name
            )));
        }
        if desc.model_id.trim().is_empty() {
            return Err(CommonError::Config(format!(
                "backend {} has an empty model_id",
                desc.name
            )));
        }
        if desc.performance.max_concurrent_requests == Some(0) {
            return Err(CommonError::Config(format!(
                "backend {} has max_concurrent_requests = 0",
                desc.name
            )));
        }
        if !names.insert(desc.name.as_str()) {
            return Err(CommonError::Config(format!(
                "duplicate backend name: {}",
                desc.name
            )));
        }
    }

    if let Some(model) = default_model {
        let served = descriptors
            .iter()
            .any(|desc| desc.enabled && desc.model_id == model);
        if !served {
            return Err(CommonError::Config(format!(
                "no enabled backend serves the default model {}",
                model
            )));
        }
    }

    Ok(())
}

/// ヘルスプローブ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// プローブ間隔（秒）(デフォルト: 30)
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,

    /// プローブタイムアウト（ミリ秒）(デフォルト: 2000)
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,

    /// HEALTHY→DEGRADED の連続失敗回数 (デフォルト: 3)
    #[serde(default = "default_degraded_after")]
    pub degraded_after: u32,

    /// DEGRADED→DOWN の追加連続失敗回数 (デフォルト: 2)
    #[serde(default = "default_down_after")]
    pub down_after: u32,

    /// HTTPレディネスパス（未指定ならTCP接続のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_path: Option<String>,
}

fn default_probe_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_degraded_after() -> u32 {
    3
}

fn default_down_after() -> u32 {
    2
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            degraded_after: default_degraded_after(),
            down_after: default_down_after(),
            readiness_path: None,
        }
    }
}

impl HealthConfig {
    /// 状態遷移閾値
    pub fn thresholds(&self) -> HealthThresholds {
        HealthThresholds {
            degraded_after: self.degraded_after,
            down_after: self.down_after,
        }
    }

    /// プローブ間隔
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    /// プローブタイムアウト
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    fn validate(&self) -> CommonResult<()> {
        if self.interval_secs == 0 {
            return Err(CommonError::Config("health.interval_secs must be > 0".into()));
        }
        if self.degraded_after == 0 || self.down_after == 0 {
            return Err(CommonError::Config(
                "health.degraded_after and health.down_after must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// リトライ設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// 最大試行回数（初回を含む）(デフォルト: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// 初回バックオフ（ミリ秒）(デフォルト: 200)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// バックオフ上限（ミリ秒）(デフォルト: 5000)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// ジッター比率 0.0-1.0 (デフォルト: 0.5)
    #[serde(default = "default_jitter")]
    pub jitter: f64,

    /// リクエストタイムアウト（ミリ秒）(デフォルト: 120000)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    5000
}

fn default_jitter() -> f64 {
    0.5
}

fn default_request_timeout() -> u64 {
    120_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            jitter: default_jitter(),
            request_timeout_ms: default_request_timeout(),
        }
    }
}

impl RetryConfig {
    /// リクエストタイムアウト
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> CommonResult<()> {
        if self.max_attempts == 0 {
            return Err(CommonError::Config("retry.max_attempts must be > 0".into()));
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err(CommonError::Config(
                "retry.jitter must be between 0.0 and 1.0".into(),
            ));
        }
        Ok(())
    }
}

/// プロセス監視設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// launch設定を持つバックエンドを起動時に立ち上げる (デフォルト: false)
    #[serde(default)]
    pub enabled: bool,

    /// 起動確認タイムアウト（秒）(デフォルト: 60)
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// 起動確認のプローブ間隔（ミリ秒）(デフォルト: 1000)
    #[serde(default = "default_startup_poll")]
    pub startup_poll_ms: u64,

    /// クラッシュ計測ウィンドウ（秒）(デフォルト: 600)
    #[serde(default = "default_crash_window")]
    pub crash_window_secs: u64,

    /// ウィンドウ内の自動再起動上限 (デフォルト: 5)
    #[serde(default = "default_max_restarts")]
    pub max_restarts_in_window: u32,
}

fn default_start_timeout() -> u64 {
    60
}

fn default_startup_poll() -> u64 {
    1000
}

fn default_crash_window() -> u64 {
    600
}

fn default_max_restarts() -> u32 {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_timeout_secs: default_start_timeout(),
            startup_poll_ms: default_startup_poll(),
            crash_window_secs: default_crash_window(),
            max_restarts_in_window: default_max_restarts(),
        }
    }
}

/// フリートモニター設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// 集計ウィンドウ（秒）(デフォルト: 300)
    #[serde(default = "default_window")]
    pub window_secs: u64,

    /// イベントバッファ容量 (デフォルト: 1024)
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,

    /// エラー率閾値 0.0-1.0 (デフォルト: 0.5)
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,

    /// p95レイテンシ閾値（ミリ秒）(デフォルト: 30000)
    #[serde(default = "default_latency_threshold")]
    pub latency_p95_threshold_ms: u64,

    /// 処理中リクエスト数閾値 (デフォルト: 64)
    #[serde(default = "default_queue_depth_threshold")]
    pub queue_depth_threshold: u32,

    /// 率・パーセンタイル評価に必要な最小サンプル数 (デフォルト: 10)
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,

    /// 定期評価間隔（秒）(デフォルト: 10)
    #[serde(default = "default_evaluate_interval")]
    pub evaluate_interval_secs: u64,
}

fn default_window() -> u64 {
    300
}

fn default_buffer_capacity() -> usize {
    1024
}

fn default_error_rate_threshold() -> f64 {
    0.5
}

fn default_latency_threshold() -> u64 {
    30_000
}

fn default_queue_depth_threshold() -> u32 {
    64
}

fn default_min_samples() -> usize {
    10
}

fn default_evaluate_interval() -> u64 {
    10
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window(),
            buffer_capacity: default_buffer_capacity(),
            error_rate_threshold: default_error_rate_threshold(),
            latency_p95_threshold_ms: default_latency_threshold(),
            queue_depth_threshold: default_queue_depth_threshold(),
            min_samples: default_min_samples(),
            evaluate_interval_secs: default_evaluate_interval(),
        }
    }
}

impl MonitorConfig {
    fn validate(&self) -> CommonResult<()> {
        if self.buffer_capacity == 0 {
            return Err(CommonError::Config("monitor.buffer_capacity must be > 0".into()));
        }
        if self.window_secs == 0 {
            return Err(CommonError::Config("monitor.window_secs must be > 0".into()));
        }
        Ok(())
    }
}

/// ルーティング設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// 選択戦略 (デフォルト: health_weighted)
    #[serde(default)]
    pub strategy: SelectionStrategy,

    /// 別バックエンドへの再選択回数上限 (デフォルト: 3)
    #[serde(default = "default_max_reselections")]
    pub max_reselections: u32,
}

fn default_max_reselections() -> u32 {
    3
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            strategy: SelectionStrategy::default(),
            max_reselections: default_max_reselections(),
        }
    }
}
