//! ロードバランサーモジュール
//!
//! レジストリのスナップショットから候補を絞り込み、選択戦略を適用して
//! 処理中カウンタを加算（アドミッション）する。
//! 選択結果は [`BackendLease`] として返し、ドロップ時に必ず解放される。

use crate::registry::{BackendEntry, BackendRegistry};
use fleet_router_common::{
    error::{GatewayError, GatewayResult},
    types::{BackendStatus, SelectionStrategy},
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicUsize, Ordering as AtomicOrdering},
    Arc,
};
use tracing::{debug, warn};

/// 同時処理上限との競合で選択をやり直す最大回数
const MAX_ADMISSION_ATTEMPTS: usize = 8;

/// 選択時点の候補情報（戦略関数への入力）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    /// ヘルス状態
    pub status: BackendStatus,
    /// 処理中リクエスト数
    pub in_flight: u32,
}

fn health_tier(status: BackendStatus) -> u8 {
    match status {
        BackendStatus::Healthy | BackendStatus::Unknown => 0,
        BackendStatus::Degraded => 1,
        _ => 2,
    }
}

fn least_loaded_index<'a>(candidates: impl Iterator<Item = (usize, &'a Candidate)>) -> Option<usize> {
    // min_by_key は同値時に先頭を返すのでレジストリ順のタイブレークになる
    candidates
        .min_by_key(|(_, candidate)| candidate.in_flight)
        .map(|(index, _)| index)
}

/// 戦略を適用して候補のインデックスを返す（純粋関数）
///
/// `cursor` はラウンドロビンの現在位置。選択不可能な状態の候補は常に除外する。
pub fn choose(strategy: SelectionStrategy, candidates: &[Candidate], cursor: usize) -> Option<usize> {
    let eligible: Vec<(usize, &Candidate)> = candidates
        .iter()
        .enumerate()
        .filter(|(_, candidate)| candidate.status.is_selectable())
        .collect();
    if eligible.is_empty() {
        return None;
    }

    match strategy {
        SelectionStrategy::RoundRobin => Some(eligible[cursor % eligible.len()].0),
        SelectionStrategy::LeastLoaded => least_loaded_index(eligible.into_iter()),
        SelectionStrategy::HealthWeighted => {
            let best_tier = eligible
                .iter()
                .map(|(_, candidate)| health_tier(candidate.status))
                .min()?;
            least_loaded_index(
                eligible
                    .into_iter()
                    .filter(|(_, candidate)| health_tier(candidate.status) == best_tier),
            )
        }
    }
}

/// バックエンドの負荷状況（可観測性向け）
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendLoadSnapshot {
    /// バックエンド名
    pub name: String,
    /// モデルID
    pub model_id: String,
    /// ヘルス状態
    pub status: BackendStatus,
    /// 処理中リクエスト数
    pub in_flight: u32,
    /// 同時処理上限
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_concurrent_requests: Option<u32>,
    /// 累積リクエスト数
    pub total_requests: u64,
    /// 累積エラー数
    pub total_errors: u64,
    /// 平均レイテンシ (ms)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub average_latency_ms: Option<f64>,
}

/// 選択済みバックエンドの利用権
///
/// ドロップ時に処理中カウンタを1回だけ減算する。
/// キャンセルやパニックによる巻き戻しでも解放される。
#[derive(Debug)]
pub struct BackendLease {
    entry: BackendEntry,
    released: bool,
}

impl BackendLease {
    fn new(entry: BackendEntry) -> Self {
        Self {
            entry,
            released: false,
        }
    }

    /// バックエンド名
    pub fn name(&self) -> &str {
        self.entry.name()
    }

    /// 選択されたエントリ
    pub fn entry(&self) -> &BackendEntry {
        &self.entry
    }

    /// 明示的に解放する（以降のドロップでは何もしない）
    pub fn release(mut self) {
        self.release_once();
    }

    fn release_once(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.entry.state.release() {
            warn!(backend = %self.entry.name(), "Released a backend with no requests in flight");
        }
    }
}

impl Drop for BackendLease {
    fn drop(&mut self) {
        self.release_once();
    }
}

/// ロードバランサー
#[derive(Clone)]
pub struct LoadBalancer {
    registry: BackendRegistry,
    cursor: Arc<AtomicUsize>,
}

impl LoadBalancer {
    /// 新しいロードバランサーを作成
    pub fn new(registry: BackendRegistry) -> Self {
        Self {
            registry,
            cursor: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// 参照しているレジストリ
    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    /// モデルを提供するバックエンドを選択し、アドミッションする
    pub async fn select(
        &self,
        model_id: &str,
        strategy: SelectionStrategy,
    ) -> GatewayResult<BackendLease> {
        self.select_excluding(model_id, strategy, &[]).await
    }

    /// 除外リストに含まれないバックエンドを選択する（再選択用）
    pub async fn select_excluding(
        &self,
        model_id: &str,
        strategy: SelectionStrategy,
        excluded: &[String],
    ) -> GatewayResult<BackendLease> {
        for _ in 0..MAX_ADMISSION_ATTEMPTS {
            let snapshot = self.registry.snapshot().await;
            let entries: Vec<&BackendEntry> = snapshot
                .for_model(model_id)
                .filter(|entry| !excluded.iter().any(|name| name == entry.name()))
                .filter(|entry| !at_capacity(entry))
                .collect();
            let candidates: Vec<Candidate> = entries
                .iter()
                .map(|entry| Candidate {
                    status: entry.state.status(),
                    in_flight: entry.state.in_flight(),
                })
                .collect();

            let cursor = match strategy {
                SelectionStrategy::RoundRobin => self.cursor.fetch_add(1, AtomicOrdering::Relaxed),
                _ => 0,
            };
            let Some(index) = choose(strategy, &candidates, cursor) else {
                debug!(model = %model_id, strategy = %strategy, "No backend available");
                return Err(GatewayError::NoBackendAvailable {
                    model: model_id.to_string(),
                });
            };

            let chosen = entries[index];
            if acquire_entry(chosen) {
                debug!(
                    backend = %chosen.name(),
                    model = %model_id,
                    strategy = %strategy,
                    in_flight = chosen.state.in_flight(),
                    "Selected backend"
                );
                return Ok(BackendLease::new(chosen.clone()));
            }
            // 上限に達した直後に別リクエストに先を越された
        }

        Err(GatewayError::NoBackendAvailable {
            model: model_id.to_string(),
        })
    }

    /// 名前を指定してアドミッションする
    ///
    /// 選択時と同じく、振り分け不可の状態（Down・Starting等）なら拒否する。
    pub async fn acquire(&self, name: &str) -> GatewayResult<BackendLease> {
        let entry = self.registry.get(name).await?;
        if entry.state.status().is_selectable() && acquire_entry(&entry) {
            Ok(BackendLease::new(entry))
        } else {
            Err(GatewayError::NoBackendAvailable {
                model: entry.descriptor.model_id.clone(),
            })
        }
    }

    /// 名前を指定して処理中カウンタを1減らす
    ///
    /// [`BackendLease`] を使わずに `acquire` 相当を行った呼び出し側向け。
    pub async fn release(&self, name: &str) -> GatewayResult<()> {
        let entry = self.registry.get(name).await?;
        if !entry.state.release() {
            warn!(backend = %name, "Released a backend with no requests in flight");
        }
        Ok(())
    }

    /// 全バックエンドの負荷状況（レジストリ順）
    pub async fn load_snapshot(&self) -> Vec<BackendLoadSnapshot> {
        let snapshot = self.registry.snapshot().await;
        snapshot
            .entries()
            .iter()
            .map(|entry| {
                let counters = entry.state.counters();
                BackendLoadSnapshot {
                    name: entry.name().to_string(),
                    model_id: entry.descriptor.model_id.clone(),
                    status: entry.state.status(),
                    in_flight: entry.state.in_flight(),
                    max_concurrent_requests: entry.descriptor.performance.max_concurrent_requests,
                    total_requests: counters.total_requests,
                    total_errors: counters.total_errors,
                    average_latency_ms: counters.average_latency_ms(),
                }
            })
            .collect()
    }
}

fn at_capacity(entry: &BackendEntry) -> bool {
    match entry.descriptor.performance.max_concurrent_requests {
        Some(limit) => entry.state.in_flight() >= limit,
        None => false,
    }
}

fn acquire_entry(entry: &BackendEntry) -> bool {
    entry
        .state
        .try_acquire(entry.descriptor.performance.max_concurrent_requests)
}
