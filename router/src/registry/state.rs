//! バックエンドごとの可変状態
//!
//! カウンタはアトミック、ヘルス記録はバックエンド単位のMutexで保護する。
//! Mutexは `.await` をまたいで保持しない。

use chrono::Utc;
use fleet_router_common::types::{
    BackendStatus, HealthRecord, HealthThresholds, ProbeResult, ProcessInfo, StatusTransition,
};
use serde::Serialize;
use std::sync::{
    atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
    Mutex, MutexGuard,
};

/// 累積カウンタのスナップショット
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BackendCounters {
    /// 完了リクエスト数
    pub total_requests: u64,
    /// 失敗リクエスト数
    pub total_errors: u64,
    /// 累積レイテンシ (ms)
    pub total_latency_ms: u64,
}

impl BackendCounters {
    /// 平均レイテンシ (ms)
    pub fn average_latency_ms(&self) -> Option<f64> {
        if self.total_requests == 0 {
            None
        } else {
            Some(self.total_latency_ms as f64 / self.total_requests as f64)
        }
    }
}

/// バックエンド状態
#[derive(Debug)]
pub struct BackendState {
    health: Mutex<HealthRecord>,
    in_flight: AtomicU32,
    total_requests: AtomicU64,
    total_errors: AtomicU64,
    total_latency_ms: AtomicU64,
    process: Mutex<Option<ProcessInfo>>,
    probing: AtomicBool,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // 保持中のパニックで中断されても値自体は整合しているため回復する
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl BackendState {
    /// 指定状態で初期化
    pub fn new(status: BackendStatus) -> Self {
        Self {
            health: Mutex::new(HealthRecord::new(status)),
            in_flight: AtomicU32::new(0),
            total_requests: AtomicU64::new(0),
            total_errors: AtomicU64::new(0),
            total_latency_ms: AtomicU64::new(0),
            process: Mutex::new(None),
            probing: AtomicBool::new(false),
        }
    }

    /// 現在のヘルス状態
    pub fn status(&self) -> BackendStatus {
        lock(&self.health).status
    }

    /// ヘルス記録のコピー
    pub fn health(&self) -> HealthRecord {
        lock(&self.health).clone()
    }

    /// プローブ結果を反映
    pub fn apply_probe(
        &self,
        result: &ProbeResult,
        thresholds: &HealthThresholds,
    ) -> Option<StatusTransition> {
        lock(&self.health).apply(result, thresholds, Utc::now())
    }

    /// 状態を強制変更
    pub fn force_status(&self, status: BackendStatus) -> Option<StatusTransition> {
        lock(&self.health).force(status)
    }

    /// 処理中リクエスト数
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 同時処理上限を守って処理中カウンタを1増やす
    pub fn try_acquire(&self, limit: Option<u32>) -> bool {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if let Some(limit) = limit {
                if current >= limit {
                    return false;
                }
            }
            match self.in_flight.compare_exchange_weak(
                current,
                current.saturating_add(1),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// 処理中カウンタを1減らす（0未満にはならない）
    ///
    /// 0から減らそうとした場合は `false` を返す。
    pub fn release(&self) -> bool {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_sub(1)
            })
            .is_ok()
    }

    /// リクエスト完了を記録
    pub fn record_completion(&self, success: bool, latency_ms: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.total_errors.fetch_add(1, Ordering::Relaxed);
        }
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
    }

    /// 累積カウンタ
    pub fn counters(&self) -> BackendCounters {
        BackendCounters {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            total_latency_ms: self.total_latency_ms.load(Ordering::Relaxed),
        }
    }

    /// 定期プローブの実行権を取る（前回のプローブが実行中なら `false`）
    pub fn begin_probe(&self) -> bool {
        !self.probing.swap(true, Ordering::AcqRel)
    }

    /// 定期プローブの実行権を返す
    pub fn end_probe(&self) {
        self.probing.store(false, Ordering::Release);
    }

    /// 監視対象プロセス情報
    pub fn process(&self) -> Option<ProcessInfo> {
        lock(&self.process).clone()
    }

    /// 監視対象プロセス情報を更新
    pub fn set_process(&self, info: Option<ProcessInfo>) {
        *lock(&self.process) = info;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_release_never_goes_negative() {
        let state = BackendState::new(BackendStatus::Healthy);
        assert!(!state.release());
        assert_eq!(state.in_flight(), 0);

        assert!(state.try_acquire(None));
        assert!(state.release());
        assert!(!state.release());
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_try_acquire_respects_limit() {
        let state = BackendState::new(BackendStatus::Healthy);
        assert!(state.try_acquire(Some(2)));
        assert!(state.try_acquire(Some(2)));
        assert!(!state.try_acquire(Some(2)));
        assert_eq!(state.in_flight(), 2);
    }

    #[test]
    fn test_concurrent_acquire_release_returns_to_zero() {
        let state = Arc::new(BackendState::new(BackendStatus::Healthy));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        assert!(state.try_acquire(None));
                        assert!(state.release());
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.in_flight(), 0);
    }

    #[test]
    fn test_record_completion_counters() {
        let state = BackendState::new(BackendStatus::Healthy);
        state.record_completion(true, 100);
        state.record_completion(false, 300);

        let counters = state.counters();
        assert_eq!(counters.total_requests, 2);
        assert_eq!(counters.total_errors, 1);
        assert_eq!(counters.average_latency_ms(), Some(200.0));
    }
}
