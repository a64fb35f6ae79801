//! 同一バックエンドへの再試行
//!
//! タイムアウトと接続不可のみを指数バックオフ＋ジッターで再試行する。
//! 別バックエンドへの再選択はゲートウェイ側で行う。

use super::InferenceClient;
use crate::registry::BackendEntry;
use fleet_router_common::{
    config::RetryConfig, protocol::ChatCompletionRequest, types::InferenceOutcome,
};
use rand::Rng;
use std::time::Duration;
use tracing::info;

/// 再試行ポリシー
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// 最大試行回数（初回を含む）
    pub max_attempts: u32,
    /// 初回バックオフ
    pub base_delay: Duration,
    /// バックオフ上限
    pub max_delay: Duration,
    /// ジッター比率 (0.0-1.0)
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// 設定から作成
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            jitter: config.jitter.clamp(0.0, 1.0),
        }
    }

    /// ジッターを含まない `attempt` 回目失敗後のバックオフ（1始まり）
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// `attempt` 回目失敗後の待機時間
    pub fn delay(&self, attempt: u32) -> Duration {
        self.delay_with(attempt, &mut rand::thread_rng())
    }

    /// 乱数源を指定して待機時間を計算
    ///
    /// `base + uniform[0, jitter * base)`。jitter が1以下なら上限に達するまで
    /// 待機時間は単調に増加する。
    pub fn delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_backoff(attempt);
        let spread = base.as_secs_f64() * self.jitter;
        if spread <= 0.0 {
            return base;
        }
        base + Duration::from_secs_f64(rng.gen_range(0.0..spread))
    }
}

/// 再試行の結果
#[derive(Debug, Clone)]
pub struct RetryReport {
    /// 最終結果
    pub outcome: InferenceOutcome,
    /// 試行回数
    pub attempts: u32,
    /// 各試行間の待機時間
    pub delays: Vec<Duration>,
}

/// 再試行付きクライアント
#[derive(Clone)]
pub struct RetryingClient {
    client: InferenceClient,
    policy: RetryPolicy,
}

impl RetryingClient {
    /// 新しい再試行付きクライアント
    pub fn new(client: InferenceClient, policy: RetryPolicy) -> Self {
        Self { client, policy }
    }

    /// 再試行ポリシー
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// 内側のクライアント
    pub fn inner(&self) -> &InferenceClient {
        &self.client
    }

    /// 再試行可能な失敗のみ、同じバックエンドへ再送する
    pub async fn call_with_retry(
        &self,
        entry: &BackendEntry,
        request: &ChatCompletionRequest,
        timeout: Duration,
    ) -> RetryReport {
        let mut delays = Vec::new();
        let mut attempt = 1;
        loop {
            let outcome = self.client.call_entry(entry, request, timeout).await;
            if !outcome.is_retryable_failure() || attempt >= self.policy.max_attempts {
                return RetryReport {
                    outcome,
                    attempts: attempt,
                    delays,
                };
            }

            let delay = self.policy.delay(attempt);
            info!(
                backend = %entry.name(),
                attempt,
                max_attempts = self.policy.max_attempts,
                delay_ms = delay.as_millis() as u64,
                class = ?outcome.error_class,
                "Retrying inference call"
            );
            tokio::time::sleep(delay).await;
            delays.push(delay);
            attempt += 1;
        }
    }
}
