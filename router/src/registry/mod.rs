//! バックエンドレジストリ
//!
//! 記述子と状態の組を不変スナップショットとして保持し、
//! リロード時はスナップショット全体を差し替える。

pub mod state;

pub use state::{BackendCounters, BackendState};

use fleet_router_common::{
    config::validate_descriptors,
    error::{GatewayError, GatewayResult},
    types::{BackendDescriptor, BackendStatus},
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

/// 記述子と状態の組
#[derive(Debug, Clone)]
pub struct BackendEntry {
    /// 不変の記述子
    pub descriptor: Arc<BackendDescriptor>,
    /// 可変状態
    pub state: Arc<BackendState>,
}

impl BackendEntry {
    /// バックエンド名
    pub fn name(&self) -> &str {
        &self.descriptor.name
    }
}

/// レジストリの不変スナップショット
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    entries: Vec<BackendEntry>,
    index: HashMap<String, usize>,
    default_model: Option<String>,
    generation: u64,
}

impl RegistrySnapshot {
    fn build(entries: Vec<BackendEntry>, default_model: Option<String>, generation: u64) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, entry)| (entry.descriptor.name.clone(), i))
            .collect();
        Self {
            entries,
            index,
            default_model,
            generation,
        }
    }

    /// 全エントリ（設定順）
    pub fn entries(&self) -> &[BackendEntry] {
        &self.entries
    }

    /// 名前で取得
    pub fn get(&self, name: &str) -> Option<&BackendEntry> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// 指定モデルを提供するエントリ（設定順）
    pub fn for_model<'a>(&'a self, model_id: &'a str) -> impl Iterator<Item = &'a BackendEntry> {
        self.entries
            .iter()
            .filter(move |entry| entry.descriptor.model_id == model_id)
    }

    /// デフォルトモデル
    pub fn default_model(&self) -> Option<&str> {
        self.default_model.as_deref()
    }

    /// スナップショット世代（差し替えごとに増加）
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// エントリ数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 空かどうか
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// リロード結果
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct ReloadSummary {
    /// 新規追加
    pub added: Vec<String>,
    /// 削除・無効化
    pub removed: Vec<String>,
    /// 状態を引き継いだもの
    pub retained: Vec<String>,
}

/// バックエンドレジストリ
#[derive(Clone)]
pub struct BackendRegistry {
    current: Arc<RwLock<Arc<RegistrySnapshot>>>,
    supervised: bool,
}

impl BackendRegistry {
    /// 空のレジストリを作成
    pub fn new() -> Self {
        Self {
            current: Arc::new(RwLock::new(Arc::new(RegistrySnapshot::default()))),
            supervised: false,
        }
    }

    /// プロセス監視モードのレジストリを作成
    ///
    /// launch設定を持つ新規バックエンドは `Unregistered` で登録され、
    /// Supervisor が起動するまで選択対象にならない。
    pub fn supervised() -> Self {
        Self {
            supervised: true,
            ..Self::new()
        }
    }

    /// 記述子リストから作成
    pub async fn from_descriptors(
        descriptors: Vec<BackendDescriptor>,
        default_model: Option<String>,
    ) -> GatewayResult<Self> {
        let registry = Self::new();
        registry
            .reload_with_default(descriptors, default_model)
            .await?;
        Ok(registry)
    }

    /// 現在のスナップショット
    pub async fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().await.clone()
    }

    /// 指定モデルを提供する有効なエントリ一覧
    pub async fn list(&self, model_id: &str) -> Vec<BackendEntry> {
        self.snapshot().await.for_model(model_id).cloned().collect()
    }

    /// 名前でエントリを取得
    pub async fn get(&self, name: &str) -> GatewayResult<BackendEntry> {
        self.snapshot()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))
    }

    /// 記述子リストで全体を差し替える（デフォルトモデルは維持）
    pub async fn reload(&self, descriptors: Vec<BackendDescriptor>) -> GatewayResult<ReloadSummary> {
        let mut current = self.current.write().await;
        let default_model = current.default_model.clone();
        let (snapshot, summary) = self.rebuild(&current, descriptors, default_model)?;
        *current = Arc::new(snapshot);
        drop(current);

        log_reload(&summary);
        Ok(summary)
    }

    /// 記述子リストとデフォルトモデルで全体を差し替える
    pub async fn reload_with_default(
        &self,
        descriptors: Vec<BackendDescriptor>,
        default_model: Option<String>,
    ) -> GatewayResult<ReloadSummary> {
        let mut current = self.current.write().await;
        let (snapshot, summary) = self.rebuild(&current, descriptors, default_model)?;
        *current = Arc::new(snapshot);
        drop(current);

        log_reload(&summary);
        Ok(summary)
    }

    /// 1件の記述子を追加または置換し、状態を強制設定する
    pub async fn upsert(
        &self,
        descriptor: BackendDescriptor,
        status: BackendStatus,
    ) -> GatewayResult<BackendEntry> {
        let mut current = self.current.write().await;

        let mut descriptors: Vec<BackendDescriptor> = current
            .entries
            .iter()
            .map(|entry| (*entry.descriptor).clone())
            .collect();
        match descriptors.iter_mut().find(|d| d.name == descriptor.name) {
            Some(existing) => *existing = descriptor.clone(),
            None => descriptors.push(descriptor.clone()),
        }

        let default_model = current.default_model.clone();
        let (snapshot, _) = self.rebuild(&current, descriptors, default_model)?;
        let entry = snapshot
            .get(&descriptor.name)
            .cloned()
            .ok_or_else(|| GatewayError::BackendNotFound(descriptor.name.clone()))?;
        entry.state.force_status(status);
        *current = Arc::new(snapshot);

        Ok(entry)
    }

    fn rebuild(
        &self,
        current: &RegistrySnapshot,
        descriptors: Vec<BackendDescriptor>,
        default_model: Option<String>,
    ) -> GatewayResult<(RegistrySnapshot, ReloadSummary)> {
        validate_descriptors(&descriptors, default_model.as_deref())?;

        let mut summary = ReloadSummary::default();
        let mut entries = Vec::with_capacity(descriptors.len());

        for descriptor in descriptors.into_iter().filter(|d| d.enabled) {
            let state = match current.get(&descriptor.name) {
                Some(existing) => {
                    summary.retained.push(descriptor.name.clone());
                    existing.state.clone()
                }
                None => {
                    summary.added.push(descriptor.name.clone());
                    Arc::new(BackendState::new(self.initial_status(&descriptor)))
                }
            };
            entries.push(BackendEntry {
                descriptor: Arc::new(descriptor),
                state,
            });
        }

        for old in &current.entries {
            if !entries.iter().any(|e| e.descriptor.name == old.descriptor.name) {
                summary.removed.push(old.descriptor.name.clone());
            }
        }

        let snapshot =
            RegistrySnapshot::build(entries, default_model, current.generation.wrapping_add(1));
        Ok((snapshot, summary))
    }

    fn initial_status(&self, descriptor: &BackendDescriptor) -> BackendStatus {
        if self.supervised && descriptor.launch.is_some() {
            BackendStatus::Unregistered
        } else {
            BackendStatus::Unknown
        }
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn log_reload(summary: &ReloadSummary) {
    info!(
        added = ?summary.added,
        removed = ?summary.removed,
        retained = summary.retained.len(),
        "Backend registry reloaded"
    );
}
