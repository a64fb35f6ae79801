//! フリートモニター
//!
//! 推論結果とプローブ結果のイベントを非同期に受け取り、
//! バックエンドごとのスライディングウィンドウ集計とアラート評価を行う。
//! リクエスト経路をブロックしないよう、イベントは broadcast チャネルで受け取り、
//! 追いつけない場合は古いイベントから破棄する。
//! イベント受信時はサンプルを追加するだけで、パーセンタイル計算と
//! アラート判定は `evaluate` の周期でまとめて行う。

use crate::registry::BackendRegistry;
use chrono::{DateTime, Utc};
use fleet_router_common::{
    config::MonitorConfig,
    types::{AlertKind, AlertState, InferenceOutcome, StatusTransition},
};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// アラート遷移履歴の保持件数
const ALERT_HISTORY_CAPACITY: usize = 256;

/// モニターが受け取るイベント
#[derive(Debug, Clone)]
pub enum FleetEvent {
    /// 1回の推論呼び出し結果
    Outcome(InferenceOutcome),
    /// 1回のプローブ結果
    Probe {
        /// バックエンド名
        backend: String,
        /// 成功したか
        success: bool,
        /// 成功時の応答時間
        latency_ms: Option<u64>,
        /// 状態遷移（発生時のみ）
        transition: Option<StatusTransition>,
    },
    /// 自動再起動を停止した
    CrashLoop {
        /// バックエンド名
        backend: String,
        /// ウィンドウ内のクラッシュ回数
        crashes: usize,
    },
    /// プロセスを起動した
    ProcessStarted {
        /// バックエンド名
        backend: String,
        /// プロセスID
        pid: u32,
        /// 手動起動か
        manual: bool,
    },
}

/// イベント送信側（クローンして各コンポーネントに渡す）
#[derive(Clone)]
pub struct EventPublisher {
    tx: broadcast::Sender<FleetEvent>,
}

impl EventPublisher {
    /// 受信者のいない送信側（テスト・モニター無効時）
    pub fn disconnected() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// イベントを送信する（決してブロックしない）
    pub fn publish(&self, event: FleetEvent) {
        // 受信者がいない場合は捨てる
        let _ = self.tx.send(event);
    }
}

/// アラート記録
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Alert {
    /// バックエンド名
    pub backend: String,
    /// 種別
    pub kind: AlertKind,
    /// 状態
    pub state: AlertState,
    /// 状態になった時刻
    pub since: DateTime<Utc>,
    /// 詳細
    pub detail: String,
}

/// バックエンドごとの集計値
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BackendMetrics {
    /// バックエンド名
    pub backend: String,
    /// ウィンドウ内のリクエスト数
    pub requests: usize,
    /// ウィンドウ内のエラー数
    pub errors: usize,
    /// エラー率
    pub error_rate: f64,
    /// p50レイテンシ (ms)
    pub p50_latency_ms: Option<u64>,
    /// p95レイテンシ (ms)
    pub p95_latency_ms: Option<u64>,
    /// スループット (requests/s)
    pub throughput_rps: f64,
    /// 直近プローブの成否
    pub last_probe_success: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
struct Sample {
    at: Instant,
    success: bool,
    latency_ms: u64,
}

#[derive(Debug, Default)]
struct BackendWindow {
    samples: VecDeque<Sample>,
    last_probe_success: Option<bool>,
}

impl BackendWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.samples.front() {
            if now.saturating_duration_since(front.at) > window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn metrics(&self, backend: &str, window: Duration) -> BackendMetrics {
        let requests = self.samples.len();
        let errors = self.samples.iter().filter(|s| !s.success).count();
        let mut latencies: Vec<u64> = self.samples.iter().map(|s| s.latency_ms).collect();
        latencies.sort_unstable();

        BackendMetrics {
            backend: backend.to_string(),
            requests,
            errors,
            error_rate: if requests == 0 {
                0.0
            } else {
                errors as f64 / requests as f64
            },
            p50_latency_ms: percentile(&latencies, 0.50),
            p95_latency_ms: percentile(&latencies, 0.95),
            throughput_rps: requests as f64 / window.as_secs_f64().max(1.0),
            last_probe_success: self.last_probe_success,
        }
    }
}

/// 最近傍順位法によるパーセンタイル（入力はソート済み）
fn percentile(sorted: &[u64], quantile: f64) -> Option<u64> {
    if sorted.is_empty() {
        return None;
    }
    let rank = (quantile * sorted.len() as f64).ceil() as usize;
    let index = rank.clamp(1, sorted.len()) - 1;
    Some(sorted[index])
}

#[derive(Debug, Default)]
struct MonitorState {
    windows: HashMap<String, BackendWindow>,
    alerts: BTreeMap<(String, AlertKind), Alert>,
    history: VecDeque<Alert>,
    dropped_events: u64,
}

impl MonitorState {
    /// アラート状態を設定し、変化した場合は遷移を記録する
    fn set_alert(&mut self, backend: &str, kind: AlertKind, firing: bool, detail: String) {
        let key = (backend.to_string(), kind);
        let next = if firing {
            AlertState::Alerting
        } else {
            AlertState::Ok
        };
        let current = self
            .alerts
            .get(&key)
            .map(|alert| alert.state)
            .unwrap_or_default();
        if current == next {
            return;
        }

        let alert = Alert {
            backend: backend.to_string(),
            kind,
            state: next,
            since: Utc::now(),
            detail,
        };
        match next {
            AlertState::Alerting => warn!(
                backend = %backend,
                kind = ?kind,
                detail = %alert.detail,
                "Alert raised"
            ),
            AlertState::Ok => info!(backend = %backend, kind = ?kind, "Alert cleared"),
        }

        if self.history.len() == ALERT_HISTORY_CAPACITY {
            self.history.pop_front();
        }
        self.history.push_back(alert.clone());
        self.alerts.insert(key, alert);
    }
}

/// フリートモニター
pub struct FleetMonitor {
    config: MonitorConfig,
    registry: BackendRegistry,
    tx: broadcast::Sender<FleetEvent>,
    rx: tokio::sync::Mutex<broadcast::Receiver<FleetEvent>>,
    state: Mutex<MonitorState>,
}

impl FleetMonitor {
    /// 新しいモニターを作成（受信はこの時点から開始される）
    pub fn new(config: MonitorConfig, registry: BackendRegistry) -> Self {
        let (tx, rx) = broadcast::channel(config.buffer_capacity.max(1));
        Self {
            config,
            registry,
            tx,
            rx: tokio::sync::Mutex::new(rx),
            state: Mutex::new(MonitorState::default()),
        }
    }

    /// イベント送信側を取得
    pub fn publisher(&self) -> EventPublisher {
        EventPublisher {
            tx: self.tx.clone(),
        }
    }

    /// バックグラウンドで集計を開始
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        let mut rx = self.rx.lock().await;
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.evaluate_interval_secs.max(1)));

        info!(
            window_secs = self.config.window_secs,
            buffer_capacity = self.config.buffer_capacity,
            "Fleet monitor started"
        );

        loop {
            tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => self.handle_event(event).await,
                    Err(RecvError::Lagged(skipped)) => self.record_dropped(skipped),
                    Err(RecvError::Closed) => break,
                },
                _ = ticker.tick() => self.evaluate().await,
            }
        }
    }

    /// 受信済みのイベントをすべて処理する
    ///
    /// バックグラウンド集計（`start`）が受信側を保持している間は何もせず
    /// `false` を返す。
    pub async fn process_pending(&self) -> bool {
        let Ok(mut rx) = self.rx.try_lock() else {
            debug!("Fleet monitor is running, pending events are handled in the background");
            return false;
        };
        loop {
            match rx.try_recv() {
                Ok(event) => self.handle_event(event).await,
                Err(TryRecvError::Lagged(skipped)) => self.record_dropped(skipped),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record_dropped(&self, skipped: u64) {
        debug!(skipped, "Fleet monitor fell behind, dropped oldest events");
        self.lock_state().dropped_events += skipped;
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_secs)
    }

    /// 1件のイベントを反映
    pub async fn handle_event(&self, event: FleetEvent) {
        let now = Instant::now();
        match event {
            FleetEvent::Outcome(outcome) => {
                let window_len = self.window();
                let mut state = self.lock_state();
                let window = state.windows.entry(outcome.backend).or_default();
                window.prune(now, window_len);
                window.samples.push_back(Sample {
                    at: now,
                    success: outcome.success,
                    latency_ms: outcome.latency_ms,
                });
            }
            FleetEvent::Probe {
                backend,
                success,
                transition,
                ..
            } => {
                let mut state = self.lock_state();
                state.windows.entry(backend.clone()).or_default().last_probe_success =
                    Some(success);
                if let Some(transition) = transition {
                    debug!(
                        backend = %backend,
                        from = %transition.from,
                        to = %transition.to,
                        "Observed health transition"
                    );
                }
            }
            FleetEvent::CrashLoop { backend, crashes } => {
                self.lock_state().set_alert(
                    &backend,
                    AlertKind::CrashLoop,
                    true,
                    format!("{} crashes within the restart window", crashes),
                );
            }
            FleetEvent::ProcessStarted {
                backend, manual, ..
            } => {
                if manual {
                    self.lock_state().set_alert(
                        &backend,
                        AlertKind::CrashLoop,
                        false,
                        "backend started manually".to_string(),
                    );
                }
            }
        }
    }

    /// リロードで削除されたバックエンドの集計とアラートを捨てる
    pub fn forget(&self, backend: &str) {
        let mut state = self.lock_state();
        state.windows.remove(backend);
        state.alerts.retain(|(name, _), _| name != backend);
        debug!(backend = %backend, "Dropped monitor state of removed backend");
    }

    /// 全バックエンドのウィンドウとアラートを再評価
    pub async fn evaluate(&self) {
        let now = Instant::now();
        let mut names: Vec<String> = self.lock_state().windows.keys().cloned().collect();
        for entry in self.registry.snapshot().await.entries() {
            if !names.iter().any(|n| n == entry.name()) {
                names.push(entry.name().to_string());
            }
        }
        for name in names {
            self.evaluate_backend(&name, now).await;
        }
    }

    async fn evaluate_backend(&self, backend: &str, now: Instant) {
        // キュー深さは BackendState を読むだけ
        let in_flight = self
            .registry
            .snapshot()
            .await
            .get(backend)
            .map(|entry| entry.state.in_flight());

        let window = self.window();
        let mut state = self.lock_state();
        let metrics = {
            let entry = state.windows.entry(backend.to_string()).or_default();
            entry.prune(now, window);
            entry.metrics(backend, window)
        };

        let enough = metrics.requests >= self.config.min_samples.max(1);
        let error_firing = enough && metrics.error_rate > self.config.error_rate_threshold;
        state.set_alert(
            backend,
            AlertKind::ErrorRate,
            error_firing,
            format!(
                "error rate {:.2} over {} requests",
                metrics.error_rate, metrics.requests
            ),
        );

        let p95 = metrics.p95_latency_ms.unwrap_or(0);
        let latency_firing = enough && p95 > self.config.latency_p95_threshold_ms;
        state.set_alert(
            backend,
            AlertKind::Latency,
            latency_firing,
            format!("p95 latency {}ms", p95),
        );

        if let Some(depth) = in_flight {
            state.set_alert(
                backend,
                AlertKind::QueueDepth,
                depth > self.config.queue_depth_threshold,
                format!("{} requests in flight", depth),
            );
        }
    }

    /// バックエンドごとの集計値（名前順）
    pub fn metrics(&self) -> Vec<BackendMetrics> {
        let now = Instant::now();
        let window = self.window();
        let mut state = self.lock_state();
        let mut metrics: Vec<BackendMetrics> = state
            .windows
            .iter_mut()
            .map(|(name, entry)| {
                entry.prune(now, window);
                entry.metrics(name, window)
            })
            .collect();
        metrics.sort_by(|a, b| a.backend.cmp(&b.backend));
        metrics
    }

    /// 1バックエンドの集計値
    pub fn backend_metrics(&self, backend: &str) -> Option<BackendMetrics> {
        self.metrics().into_iter().find(|m| m.backend == backend)
    }

    /// 発報中のアラート
    pub fn active_alerts(&self) -> Vec<Alert> {
        self.lock_state()
            .alerts
            .values()
            .filter(|alert| alert.state == AlertState::Alerting)
            .cloned()
            .collect()
    }

    /// アラート遷移履歴（古い順）
    pub fn alert_history(&self) -> Vec<Alert> {
        self.lock_state().history.iter().cloned().collect()
    }

    /// 破棄したイベント数
    pub fn dropped_events(&self) -> u64 {
        self.lock_state().dropped_events
    }
}
