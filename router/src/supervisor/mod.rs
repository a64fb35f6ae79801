//! プロセススーパーバイザー
//!
//! launch設定を持つバックエンドのプロセスを起動・停止・再起動する。
//! 起動直後は `Starting` としてレジストリに登録し、初回プローブ成功まで
//! 振り分け対象にしない。想定外の終了は即座に `Down` とし、
//! バックオフ付きで再起動する。自動再起動の失敗もクラッシュとして数え、
//! ウィンドウ内の再起動が上限に達した後のクラッシュでは自動再起動を止め、
//! アラートを上げる。

pub mod process;

pub use process::{CommandLauncher, ProcessExit, ProcessLauncher};

use crate::client::retry::RetryPolicy;
use crate::health::HealthProber;
use crate::monitor::{EventPublisher, FleetEvent};
use crate::registry::{BackendEntry, BackendRegistry};
use chrono::{DateTime, Utc};
use fleet_router_common::{
    config::SupervisorConfig,
    error::{GatewayError, GatewayResult},
    types::{BackendDescriptor, BackendStatus, ProcessInfo, ProcessState},
};
use futures::future::BoxFuture;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// クラッシュループのアラート
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CrashLoopAlert {
    /// バックエンド名
    pub backend: String,
    /// ウィンドウ内のクラッシュ回数
    pub crashes: usize,
    /// 発報時刻
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug)]
struct SupervisionRecord {
    descriptor: BackendDescriptor,
    /// 起動・停止のたびに増える。古い監視タスクの通知を無視するために使う
    generation: u64,
    crashes: VecDeque<Instant>,
    alert: Option<CrashLoopAlert>,
}

impl SupervisionRecord {
    fn new(descriptor: BackendDescriptor) -> Self {
        Self {
            descriptor,
            generation: 0,
            crashes: VecDeque::new(),
            alert: None,
        }
    }
}

enum CrashAction {
    Restart { attempt: u32 },
    GiveUp { crashes: usize },
}

struct SupervisorInner {
    registry: BackendRegistry,
    prober: HealthProber,
    launcher: Arc<dyn ProcessLauncher>,
    config: SupervisorConfig,
    restart_policy: RetryPolicy,
    events: EventPublisher,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    records: Mutex<HashMap<String, SupervisionRecord>>,
}

/// プロセススーパーバイザー
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Supervisor {
    /// 新しいスーパーバイザーを作成
    pub fn new(
        registry: BackendRegistry,
        prober: HealthProber,
        launcher: Arc<dyn ProcessLauncher>,
        config: SupervisorConfig,
        restart_policy: RetryPolicy,
        events: EventPublisher,
    ) -> Self {
        Self {
            inner: Arc::new(SupervisorInner {
                registry,
                prober,
                launcher,
                config,
                restart_policy,
                events,
                locks: Mutex::new(HashMap::new()),
                records: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lifecycle_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        lock(&self.inner.locks)
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, SupervisionRecord>> {
        lock(&self.inner.records)
    }

    /// バックエンドを起動し、初回の正常プローブまで待つ（手動起動）
    ///
    /// クラッシュ履歴とクラッシュループのアラートはクリアされる。
    pub async fn start(&self, descriptor: BackendDescriptor) -> GatewayResult<()> {
        if descriptor.launch.is_none() {
            return Err(GatewayError::Process(format!(
                "backend {} has no launch configuration",
                descriptor.name
            )));
        }
        let name = descriptor.name.clone();
        let guard = self.lifecycle_lock(&name);
        let _guard = guard.lock().await;

        {
            let mut records = self.records();
            let record = records
                .entry(name.clone())
                .or_insert_with(|| SupervisionRecord::new(descriptor.clone()));
            record.descriptor = descriptor.clone();
            record.crashes.clear();
            if record.alert.take().is_some() {
                info!(backend = %name, "Crash loop alert cleared by manual start");
            }
        }

        self.start_locked(descriptor, true).await
    }

    /// バックエンドを停止し、振り分け対象から外す
    pub async fn stop(&self, name: &str) -> GatewayResult<()> {
        let guard = self.lifecycle_lock(name);
        let _guard = guard.lock().await;
        self.stop_locked(name).await
    }

    /// 停止してから再起動する（手動起動と同様に履歴をクリア）
    ///
    /// レジストリから削除されたバックエンドは再登録しない。
    pub async fn restart(&self, name: &str) -> GatewayResult<()> {
        self.inner.registry.get(name).await?;
        let descriptor = self
            .records()
            .get(name)
            .map(|record| record.descriptor.clone())
            .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;

        {
            let guard = self.lifecycle_lock(name);
            let _guard = guard.lock().await;
            self.stop_locked(name).await?;
        }
        self.start(descriptor).await
    }

    /// 削除されたバックエンドを停止し、監視記録を捨てる
    ///
    /// 以降の `restart` はこのバックエンドを知らないものとして扱う。
    pub async fn forget(&self, name: &str) {
        let guard = self.lifecycle_lock(name);
        let _guard = guard.lock().await;
        if self.records().contains_key(name) {
            if let Err(e) = self.stop_locked(name).await {
                warn!(backend = %name, "Failed to stop removed backend: {}", e);
            }
        }
        if self.records().remove(name).is_some() {
            info!(backend = %name, "Backend removed from supervision");
        }
        lock(&self.inner.locks).remove(name);
    }

    /// 複数バックエンドを並列に起動する
    pub async fn start_all(&self, descriptors: Vec<BackendDescriptor>) {
        let starts = descriptors.into_iter().map(|descriptor| {
            let name = descriptor.name.clone();
            async move {
                if let Err(e) = self.start(descriptor).await {
                    error!(backend = %name, "Failed to start backend: {}", e);
                }
            }
        });
        futures::future::join_all(starts).await;
    }

    /// 監視下のバックエンド名
    pub fn supervised(&self) -> Vec<String> {
        let mut names: Vec<String> = self.records().keys().cloned().collect();
        names.sort();
        names
    }

    /// 発報中のクラッシュループアラート
    pub fn alerts(&self) -> Vec<CrashLoopAlert> {
        let mut alerts: Vec<CrashLoopAlert> = self
            .records()
            .values()
            .filter_map(|record| record.alert.clone())
            .collect();
        alerts.sort_by(|a, b| a.backend.cmp(&b.backend));
        alerts
    }

    /// ウィンドウ内のクラッシュ回数
    pub fn crashes_in_window(&self, name: &str) -> usize {
        let window = Duration::from_secs(self.inner.config.crash_window_secs);
        let now = Instant::now();
        self.records()
            .get(name)
            .map(|record| {
                record
                    .crashes
                    .iter()
                    .filter(|at| now.saturating_duration_since(**at) <= window)
                    .count()
            })
            .unwrap_or(0)
    }

    async fn stop_locked(&self, name: &str) -> GatewayResult<()> {
        {
            let mut records = self.records();
            let record = records
                .get_mut(name)
                .ok_or_else(|| GatewayError::BackendNotFound(name.to_string()))?;
            // 以降の終了は想定内として監視タスクに無視させる
            record.generation += 1;
        }

        self.inner.launcher.stop(name).await?;

        if let Ok(entry) = self.inner.registry.get(name).await {
            entry.state.force_status(BackendStatus::Unregistered);
            if let Some(mut info) = entry.state.process() {
                info.state = ProcessState::Stopped;
                entry.state.set_process(Some(info));
            }
        }
        info!(backend = %name, "Backend stopped");
        Ok(())
    }

    async fn start_locked(&self, descriptor: BackendDescriptor, manual: bool) -> GatewayResult<()> {
        let name = descriptor.name.clone();

        if self.inner.launcher.is_alive(&name).await {
            self.stop_locked(&name).await?;
        }

        let entry = self
            .inner
            .registry
            .upsert(descriptor.clone(), BackendStatus::Starting)
            .await?;

        let pid = match self.inner.launcher.start(&descriptor).await {
            Ok(pid) => pid,
            Err(e) => {
                entry.state.force_status(BackendStatus::Down);
                return Err(e);
            }
        };
        entry.state.set_process(Some(ProcessInfo {
            pid,
            state: ProcessState::Running,
            started_at: Utc::now(),
        }));

        let generation = {
            let mut records = self.records();
            let record = records
                .entry(name.clone())
                .or_insert_with(|| SupervisionRecord::new(descriptor.clone()));
            record.generation += 1;
            record.generation
        };
        tokio::spawn(self.clone().watch_process(name.clone(), generation));

        self.inner.events.publish(FleetEvent::ProcessStarted {
            backend: name.clone(),
            pid,
            manual,
        });
        info!(backend = %name, pid, manual, "Waiting for backend to become healthy");

        let start_timeout = Duration::from_secs(self.inner.config.start_timeout_secs);
        match tokio::time::timeout(start_timeout, self.wait_until_healthy(&entry, generation)).await
        {
            Ok(Ok(())) => {
                info!(backend = %name, pid, "Backend is healthy and eligible for routing");
                Ok(())
            }
            Ok(Err(e)) => {
                // 監視タスクには任せず、呼び出し側が失敗として扱う
                if let Err(stop_err) = self.stop_locked(&name).await {
                    warn!(backend = %name, "Failed to clean up after startup exit: {}", stop_err);
                }
                entry.state.force_status(BackendStatus::Down);
                Err(e)
            }
            Err(_) => {
                warn!(
                    backend = %name,
                    timeout_secs = start_timeout.as_secs(),
                    "Backend did not become healthy in time, stopping it"
                );
                if let Err(e) = self.stop_locked(&name).await {
                    warn!(backend = %name, "Failed to stop backend after start timeout: {}", e);
                }
                entry.state.force_status(BackendStatus::Down);
                Err(GatewayError::StartTimeout {
                    name,
                    secs: start_timeout.as_secs(),
                })
            }
        }
    }

    async fn wait_until_healthy(&self, entry: &BackendEntry, generation: u64) -> GatewayResult<()> {
        let poll = Duration::from_millis(self.inner.config.startup_poll_ms.max(1));
        loop {
            self.inner.prober.probe_backend(entry).await;
            if entry.state.status() == BackendStatus::Healthy {
                return Ok(());
            }
            if self.current_generation(entry.name()) != Some(generation)
                || !self.inner.launcher.is_alive(entry.name()).await
            {
                return Err(GatewayError::Process(format!(
                    "backend {} exited during startup",
                    entry.name()
                )));
            }
            tokio::time::sleep(poll).await;
        }
    }

    fn current_generation(&self, name: &str) -> Option<u64> {
        self.records().get(name).map(|record| record.generation)
    }

    /// プロセス終了を監視し、想定外の終了ならクラッシュとして扱う
    fn watch_process(self, name: String, generation: u64) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let exit = match self.inner.launcher.wait(&name).await {
                Ok(exit) => exit,
                Err(e) => {
                    warn!(backend = %name, "Lost track of backend process: {}", e);
                    ProcessExit { code: None }
                }
            };
            if self.current_generation(&name) != Some(generation) {
                return;
            }
            self.handle_crash(&name, generation, exit).await;
        })
    }

    async fn handle_crash(&self, name: &str, generation: u64, exit: ProcessExit) {
        // 再起動の判断を待たずに即座に Down にする
        if let Ok(entry) = self.inner.registry.get(name).await {
            entry.state.force_status(BackendStatus::Down);
            if let Some(mut info) = entry.state.process() {
                info.state = ProcessState::Exited;
                entry.state.set_process(Some(info));
            }
        }

        let mut generation = generation;
        let mut cause = match exit.code {
            Some(code) => format!("exited with code {}", code),
            None => "terminated".to_string(),
        };
        loop {
            let Some((action, descriptor)) = self.record_crash(name, generation) else {
                return;
            };

            let attempt = match action {
                CrashAction::GiveUp { crashes } => {
                    error!(
                        backend = %name,
                        crashes,
                        window_secs = self.inner.config.crash_window_secs,
                        cause = %cause,
                        "Backend is crash looping, automatic restart disabled until manual start"
                    );
                    self.inner.events.publish(FleetEvent::CrashLoop {
                        backend: name.to_string(),
                        crashes,
                    });
                    return;
                }
                CrashAction::Restart { attempt } => attempt,
            };

            let delay = self.inner.restart_policy.delay(attempt);
            warn!(
                backend = %name,
                cause = %cause,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Backend crashed, scheduling restart"
            );
            tokio::time::sleep(delay).await;

            let guard = self.lifecycle_lock(name);
            let _guard = guard.lock().await;
            // 待機中に手動で停止・起動された場合は何もしない
            if self.current_generation(name) != Some(generation) {
                return;
            }
            match self.start_locked(descriptor, false).await {
                Ok(()) => return,
                Err(e) => {
                    error!(backend = %name, attempt, "Automatic restart failed: {}", e);
                    // 失敗した再起動も次のクラッシュとして数える
                    let Some(current) = self.current_generation(name) else {
                        return;
                    };
                    generation = current;
                    cause = e.to_string();
                }
            }
        }
    }

    /// クラッシュを記録し、次の動作を決める
    ///
    /// 監視記録がない、または世代が変わっている場合は `None`。
    fn record_crash(
        &self,
        name: &str,
        generation: u64,
    ) -> Option<(CrashAction, BackendDescriptor)> {
        let window = Duration::from_secs(self.inner.config.crash_window_secs);
        let max_restarts = self.inner.config.max_restarts_in_window as usize;
        let now = Instant::now();

        let mut records = self.records();
        let record = records.get_mut(name)?;
        if record.generation != generation {
            return None;
        }
        while let Some(front) = record.crashes.front() {
            if now.saturating_duration_since(*front) > window {
                record.crashes.pop_front();
            } else {
                break;
            }
        }
        let restarts = record.crashes.len();
        record.crashes.push_back(now);

        let action = if restarts >= max_restarts {
            record.alert = Some(CrashLoopAlert {
                backend: name.to_string(),
                crashes: record.crashes.len(),
                raised_at: Utc::now(),
            });
            CrashAction::GiveUp {
                crashes: record.crashes.len(),
            }
        } else {
            CrashAction::Restart {
                attempt: record.crashes.len() as u32,
            }
        };
        Some((action, record.descriptor.clone()))
    }
}
