//! 共通型定義
//!
//! BackendDescriptor, ヘルス状態機械, 推論結果等のコアデータ型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// バックエンドの性能・モデル設定
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PerformanceSettings {
    /// 最大コンテキスト長（トークン）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u32>,
    /// 同時処理リクエスト上限（Noneで無制限）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
}

/// 監視対象プロセスの起動方法
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSpec {
    /// 実行ファイル
    pub command: String,
    /// 引数
    #[serde(default)]
    pub args: Vec<String>,
    /// 追加環境変数
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    /// 作業ディレクトリ
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

/// バックエンド記述子（起動時/リロード時に読み込まれる不変値）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BackendDescriptor {
    /// 一意な名前（キー）
    pub name: String,
    /// ホスト名またはIPアドレス
    pub host: String,
    /// ポート番号
    pub port: u16,
    /// 提供モデルID
    pub model_id: String,
    /// 有効フラグ
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 性能設定
    #[serde(default)]
    pub performance: PerformanceSettings,
    /// プロセス起動設定（Supervisor管理時のみ）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub launch: Option<LaunchSpec>,
}

fn default_enabled() -> bool {
    true
}

impl BackendDescriptor {
    /// 最小構成の記述子を生成
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        model_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            model_id: model_id.into(),
            enabled: true,
            performance: PerformanceSettings::default(),
            launch: None,
        }
    }

    /// 同時処理上限を設定
    pub fn with_max_concurrent(mut self, limit: u32) -> Self {
        self.performance.max_concurrent_requests = Some(limit);
        self
    }

    /// `host:port` 形式のアドレス
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// HTTPベースURL
    pub fn base_url(&self) -> String {
        format!("http://{}", self.address())
    }
}

/// バックエンドの状態（タグ付き状態）
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// プロセス停止済み（Supervisor管理下）
    Unregistered,
    /// プロセス起動済み・初回プローブ待ち
    Starting,
    /// 未プローブ
    Unknown,
    /// 正常
    Healthy,
    /// 劣化（連続失敗K回）
    Degraded,
    /// ダウン
    Down,
}

impl BackendStatus {
    /// リクエスト振り分け対象になり得るか
    pub fn is_selectable(self) -> bool {
        matches!(
            self,
            BackendStatus::Unknown | BackendStatus::Healthy | BackendStatus::Degraded
        )
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackendStatus::Unregistered => "unregistered",
            BackendStatus::Starting => "starting",
            BackendStatus::Unknown => "unknown",
            BackendStatus::Healthy => "healthy",
            BackendStatus::Degraded => "degraded",
            BackendStatus::Down => "down",
        };
        f.write_str(s)
    }
}

/// ヘルス状態遷移の閾値
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthThresholds {
    /// HEALTHY→DEGRADED までの連続失敗回数 (K)
    pub degraded_after: u32,
    /// DEGRADED→DOWN までの追加連続失敗回数 (M)
    pub down_after: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            degraded_after: 3,
            down_after: 2,
        }
    }
}

impl HealthThresholds {
    fn down_total(&self) -> u32 {
        self.degraded_after.saturating_add(self.down_after)
    }
}

/// 1回のプローブ結果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeResult {
    /// 接続成功
    Success {
        /// 応答までの時間 (ms)
        latency_ms: u64,
    },
    /// 接続失敗
    Failure {
        /// 失敗理由
        reason: String,
    },
    /// タイムアウト
    Timeout,
}

impl ProbeResult {
    /// 成功かどうか
    pub fn is_success(&self) -> bool {
        matches!(self, ProbeResult::Success { .. })
    }
}

/// 状態遷移
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatusTransition {
    /// 遷移前
    pub from: BackendStatus,
    /// 遷移後
    pub to: BackendStatus,
}

/// バックエンドごとのヘルス記録（状態機械）
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthRecord {
    /// 現在の状態
    pub status: BackendStatus,
    /// 連続成功回数
    pub consecutive_successes: u32,
    /// 連続失敗回数
    pub consecutive_failures: u32,
    /// 最終プローブ時刻
    pub last_probe_at: Option<DateTime<Utc>>,
    /// 直近のプローブエラー
    pub last_error: Option<String>,
}

impl HealthRecord {
    /// 指定状態で初期化
    pub fn new(status: BackendStatus) -> Self {
        Self {
            status,
            consecutive_successes: 0,
            consecutive_failures: 0,
            last_probe_at: None,
            last_error: None,
        }
    }

    /// プローブ結果を反映し、状態が変わった場合は遷移を返す
    pub fn apply(
        &mut self,
        result: &ProbeResult,
        thresholds: &HealthThresholds,
        now: DateTime<Utc>,
    ) -> Option<StatusTransition> {
        self.last_probe_at = Some(now);

        // 停止済みバックエンドはプローブ結果で復帰させない
        if self.status == BackendStatus::Unregistered {
            return None;
        }

        let next = match result {
            ProbeResult::Success { .. } => {
                self.consecutive_failures = 0;
                self.consecutive_successes = self.consecutive_successes.saturating_add(1);
                self.last_error = None;
                BackendStatus::Healthy
            }
            ProbeResult::Failure { .. } | ProbeResult::Timeout => {
                self.consecutive_successes = 0;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.last_error = Some(match result {
                    ProbeResult::Failure { reason } => reason.clone(),
                    _ => "probe timed out".to_string(),
                });
                let failures = self.consecutive_failures;
                match self.status {
                    BackendStatus::Healthy | BackendStatus::Unknown
                        if failures >= thresholds.down_total() =>
                    {
                        BackendStatus::Down
                    }
                    BackendStatus::Healthy | BackendStatus::Unknown
                        if failures >= thresholds.degraded_after =>
                    {
                        BackendStatus::Degraded
                    }
                    BackendStatus::Degraded if failures >= thresholds.down_total() => {
                        BackendStatus::Down
                    }
                    // Starting は Supervisor の起動タイムアウトで判定する
                    other => other,
                }
            }
        };

        self.transition_to(next)
    }

    /// プローブを介さず状態を強制変更（クラッシュ検知・停止時）
    pub fn force(&mut self, status: BackendStatus) -> Option<StatusTransition> {
        self.consecutive_successes = 0;
        if status == BackendStatus::Starting || status == BackendStatus::Unregistered {
            self.consecutive_failures = 0;
        }
        self.transition_to(status)
    }

    fn transition_to(&mut self, next: BackendStatus) -> Option<StatusTransition> {
        if next == self.status {
            return None;
        }
        let transition = StatusTransition {
            from: self.status,
            to: next,
        };
        self.status = next;
        Some(transition)
    }
}

/// バックエンド選択戦略
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    /// ラウンドロビン
    RoundRobin,
    /// 処理中リクエストが最も少ないもの
    LeastLoaded,
    /// HEALTHY を DEGRADED より優先し、同一層では最小負荷
    #[default]
    HealthWeighted,
}

impl FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "least_loaded" => Ok(SelectionStrategy::LeastLoaded),
            "health_weighted" => Ok(SelectionStrategy::HealthWeighted),
            other => Err(format!("unknown selection strategy: {}", other)),
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SelectionStrategy::RoundRobin => "round_robin",
            SelectionStrategy::LeastLoaded => "least_loaded",
            SelectionStrategy::HealthWeighted => "health_weighted",
        };
        f.write_str(s)
    }
}

/// 推論呼び出しエラーの分類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// タイムアウト
    Timeout,
    /// 接続拒否・接続不可
    ConnectionRefused,
    /// バックエンドが応答したがエラーを報告
    BackendError,
    /// 応答を解釈できない
    MalformedResponse,
    /// 送信先がレジストリにない（リロードで削除された等）
    UnknownBackend,
}

impl ErrorClass {
    /// 同一バックエンドへの再試行対象か
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Timeout | ErrorClass::ConnectionRefused)
    }
}

/// 1回の推論呼び出しの結果
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct InferenceOutcome {
    /// バックエンド名
    pub backend: String,
    /// モデルID
    pub model: String,
    /// 成功フラグ
    pub success: bool,
    /// レイテンシ (ms)
    pub latency_ms: u64,
    /// 入力トークン数
    pub prompt_tokens: u32,
    /// 出力トークン数
    pub completion_tokens: u32,
    /// 生成テキスト
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// 終了理由
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    /// エラー分類
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_class: Option<ErrorClass>,
    /// エラーメッセージ
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl InferenceOutcome {
    /// 失敗結果を生成
    pub fn failure(
        backend: impl Into<String>,
        model: impl Into<String>,
        latency_ms: u64,
        class: ErrorClass,
        message: impl Into<String>,
    ) -> Self {
        Self {
            backend: backend.into(),
            model: model.into(),
            success: false,
            latency_ms,
            prompt_tokens: 0,
            completion_tokens: 0,
            content: None,
            finish_reason: None,
            error_class: Some(class),
            error_message: Some(message.into()),
        }
    }

    /// 再試行可能な失敗か
    pub fn is_retryable_failure(&self) -> bool {
        !self.success && self.error_class.map(ErrorClass::is_retryable).unwrap_or(false)
    }
}

/// 監視対象プロセスの状態
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// 実行中
    Running,
    /// 想定外の終了
    Exited,
    /// 停止済み
    Stopped,
}

/// 監視対象プロセス情報
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ProcessInfo {
    /// プロセスID
    pub pid: u32,
    /// 状態
    pub state: ProcessState,
    /// 起動時刻
    pub started_at: DateTime<Utc>,
}

/// アラート種別
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    /// エラー率超過
    ErrorRate,
    /// p95レイテンシ超過
    Latency,
    /// 処理待ち数超過
    QueueDepth,
    /// クラッシュループ（自動再起動停止）
    CrashLoop,
}

/// アラート状態
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// 正常
    #[default]
    Ok,
    /// 発報中
    Alerting,
}
