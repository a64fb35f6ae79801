//! ヘルスプローバー
//!
//! 固定間隔でバックエンドごとに独立したプローブタスクを起動し、
//! 結果をヘルス状態機械に反映する。

use crate::monitor::{EventPublisher, FleetEvent};
use crate::registry::{BackendEntry, BackendRegistry};
use async_trait::async_trait;
use fleet_router_common::{
    config::HealthConfig,
    types::{BackendDescriptor, BackendStatus, HealthThresholds, ProbeResult, StatusTransition},
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// プローブ手段
#[async_trait]
pub trait BackendProbe: Send + Sync {
    /// 1回プローブする（タイムアウトは実装側で扱う）
    async fn probe(&self, descriptor: &BackendDescriptor) -> ProbeResult;
}

/// TCP接続のみを確認するプローブ
#[derive(Debug, Clone)]
pub struct TcpProbe {
    timeout: Duration,
}

impl TcpProbe {
    /// 新しいTCPプローブ
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl BackendProbe for TcpProbe {
    async fn probe(&self, descriptor: &BackendDescriptor) -> ProbeResult {
        let started = Instant::now();
        match timeout(self.timeout, TcpStream::connect(descriptor.address())).await {
            Ok(Ok(_stream)) => ProbeResult::Success {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(Err(e)) => ProbeResult::Failure {
                reason: e.to_string(),
            },
            Err(_) => ProbeResult::Timeout,
        }
    }
}

/// HTTPレディネスパスを確認するプローブ
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    /// 新しいHTTPプローブ
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let mut path = path.into();
        if !path.starts_with('/') {
            path.insert(0, '/');
        }
        Ok(Self { client, path })
    }
}

#[async_trait]
impl BackendProbe for HttpProbe {
    async fn probe(&self, descriptor: &BackendDescriptor) -> ProbeResult {
        let started = Instant::now();
        let url = format!("{}{}", descriptor.base_url(), self.path);
        match self.client.get(&url).send().await {
            Ok(response) if response.status().is_success() => ProbeResult::Success {
                latency_ms: started.elapsed().as_millis() as u64,
            },
            Ok(response) => ProbeResult::Failure {
                reason: format!("readiness returned {}", response.status()),
            },
            Err(e) if e.is_timeout() => ProbeResult::Timeout,
            Err(e) => ProbeResult::Failure {
                reason: e.to_string(),
            },
        }
    }
}

/// 設定からプローブを組み立てる
pub fn probe_from_config(config: &HealthConfig) -> Arc<dyn BackendProbe> {
    if let Some(path) = &config.readiness_path {
        match HttpProbe::new(path.clone(), config.probe_timeout()) {
            Ok(probe) => return Arc::new(probe),
            Err(e) => warn!("Failed to build HTTP probe, falling back to TCP: {}", e),
        }
    }
    Arc::new(TcpProbe::new(config.probe_timeout()))
}

/// 定期プローブの実行権（タスク終了・パニック時に返却される）
struct ProbeSlot(BackendEntry);

impl Drop for ProbeSlot {
    fn drop(&mut self) {
        self.0.state.end_probe();
    }
}

/// ヘルスプローバー
#[derive(Clone)]
pub struct HealthProber {
    registry: BackendRegistry,
    probe: Arc<dyn BackendProbe>,
    thresholds: HealthThresholds,
    interval: Duration,
    probe_timeout: Duration,
    events: EventPublisher,
}

impl HealthProber {
    /// 新しいプローバーを作成
    pub fn new(
        registry: BackendRegistry,
        probe: Arc<dyn BackendProbe>,
        config: &HealthConfig,
        events: EventPublisher,
    ) -> Self {
        Self {
            registry,
            probe,
            thresholds: config.thresholds(),
            interval: config.interval(),
            probe_timeout: config.probe_timeout(),
            events,
        }
    }

    /// バックグラウンドでプローブを開始
    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.probe_loop().await;
        })
    }

    async fn probe_loop(&self) {
        let mut timer = interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Health prober started: interval={}s, probe_timeout={}ms, degraded_after={}, down_after={}",
            self.interval.as_secs(),
            self.probe_timeout.as_millis(),
            self.thresholds.degraded_after,
            self.thresholds.down_after
        );

        loop {
            timer.tick().await;
            self.spawn_probes().await;
        }
    }

    /// 全バックエンドへのプローブタスクを起動（完了を待たない）
    ///
    /// 前回のプローブがまだ終わっていないバックエンドは飛ばす。
    /// 起動したタスク数を返す。
    async fn spawn_probes(&self) -> usize {
        let snapshot = self.registry.snapshot().await;
        let mut spawned = 0;
        for entry in snapshot.entries() {
            if entry.state.status() == BackendStatus::Unregistered {
                continue;
            }
            if !entry.state.begin_probe() {
                debug!(backend = %entry.name(), "Previous probe still running, skipping tick");
                continue;
            }
            let prober = self.clone();
            let slot = ProbeSlot(entry.clone());
            tokio::spawn(async move {
                prober.probe_backend(&slot.0).await;
            });
            spawned += 1;
        }
        spawned
    }

    /// 全バックエンドを並列にプローブし、完了を待つ
    pub async fn probe_all(&self) -> Vec<(String, Option<StatusTransition>)> {
        let snapshot = self.registry.snapshot().await;
        let probes = snapshot
            .entries()
            .iter()
            .filter(|entry| entry.state.status() != BackendStatus::Unregistered)
            .map(|entry| async move {
                let transition = self.probe_backend(entry).await;
                (entry.name().to_string(), transition)
            });
        futures::future::join_all(probes).await
    }

    /// 1バックエンドを1回プローブし、状態に反映する
    pub async fn probe_backend(&self, entry: &BackendEntry) -> Option<StatusTransition> {
        let name = entry.name();
        let result = match timeout(self.probe_timeout, self.probe.probe(&entry.descriptor)).await {
            Ok(result) => result,
            Err(_) => ProbeResult::Timeout,
        };

        match &result {
            ProbeResult::Success { latency_ms } => {
                debug!(backend = %name, latency_ms, "Probe succeeded")
            }
            ProbeResult::Failure { reason } => {
                debug!(backend = %name, reason = %reason, "Probe failed")
            }
            ProbeResult::Timeout => debug!(
                backend = %name,
                timeout_ms = self.probe_timeout.as_millis() as u64,
                "Probe timed out"
            ),
        }

        let transition = entry.state.apply_probe(&result, &self.thresholds);
        if let Some(t) = transition {
            if t.to == BackendStatus::Healthy {
                info!(backend = %name, from = %t.from, to = %t.to, "Backend health changed");
            } else {
                warn!(backend = %name, from = %t.from, to = %t.to, "Backend health changed");
            }
        }

        self.events.publish(FleetEvent::Probe {
            backend: name.to_string(),
            success: result.is_success(),
            latency_ms: match result {
                ProbeResult::Success { latency_ms } => Some(latency_ms),
                _ => None,
            },
            transition,
        });

        transition
    }

    /// プローブタイムアウト
    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::net::TcpListener;

    /// バックエンドごとに結果を差し替えられるプローブ
    #[derive(Default)]
    struct ScriptedProbe {
        results: Mutex<HashMap<String, ProbeResult>>,
        delays: Mutex<HashMap<String, Duration>>,
    }

    impl ScriptedProbe {
        fn set(&self, name: &str, result: ProbeResult) {
            self.results.lock().unwrap().insert(name.to_string(), result);
        }

        fn delay(&self, name: &str, delay: Duration) {
            self.delays.lock().unwrap().insert(name.to_string(), delay);
        }
    }

    #[async_trait]
    impl BackendProbe for ScriptedProbe {
        async fn probe(&self, descriptor: &BackendDescriptor) -> ProbeResult {
            let delay = self.delays.lock().unwrap().get(&descriptor.name).copied();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.results
                .lock()
                .unwrap()
                .get(&descriptor.name)
                .cloned()
                .unwrap_or(ProbeResult::Success { latency_ms: 1 })
        }
    }

    fn health_config() -> HealthConfig {
        HealthConfig {
            interval_secs: 1,
            probe_timeout_ms: 200,
            degraded_after: 3,
            down_after: 2,
            readiness_path: None,
        }
    }

    async fn registry_with(names: &[&str]) -> BackendRegistry {
        let descriptors = names
            .iter()
            .map(|n| BackendDescriptor::new(*n, "127.0.0.1", 9, "llama"))
            .collect();
        BackendRegistry::from_descriptors(descriptors, None).await.unwrap()
    }

    #[tokio::test]
    async fn test_degrades_after_exactly_k_probe_failures_and_recovers() {
        let registry = registry_with(&["a"]).await;
        let probe = Arc::new(ScriptedProbe::default());
        let prober = HealthProber::new(
            registry.clone(),
            probe.clone(),
            &health_config(),
            EventPublisher::disconnected(),
        );
        let entry = registry.get("a").await.unwrap();

        prober.probe_backend(&entry).await;
        assert_eq!(entry.state.status(), BackendStatus::Healthy);

        probe.set(
            "a",
            ProbeResult::Failure {
                reason: "refused".into(),
            },
        );
        prober.probe_backend(&entry).await;
        prober.probe_backend(&entry).await;
        assert_eq!(entry.state.status(), BackendStatus::Healthy);
        let transition = prober.probe_backend(&entry).await.unwrap();
        assert_eq!(transition.to, BackendStatus::Degraded);

        prober.probe_backend(&entry).await;
        let transition = prober.probe_backend(&entry).await.unwrap();
        assert_eq!(transition.to, BackendStatus::Down);

        probe.set("a", ProbeResult::Success { latency_ms: 2 });
        let transition = prober.probe_backend(&entry).await.unwrap();
        assert_eq!(transition.from, BackendStatus::Down);
        assert_eq!(transition.to, BackendStatus::Healthy);
    }

    #[tokio::test]
    async fn test_slow_probe_counts_as_timeout() {
        let registry = registry_with(&["slow"]).await;
        let probe = Arc::new(ScriptedProbe::default());
        probe.delay("slow", Duration::from_secs(5));
        let prober = HealthProber::new(
            registry.clone(),
            probe,
            &health_config(),
            EventPublisher::disconnected(),
        );
        let entry = registry.get("slow").await.unwrap();

        prober.probe_backend(&entry).await;
        let health = entry.state.health();
        assert_eq!(health.consecutive_failures, 1);
        assert_eq!(health.last_error.as_deref(), Some("probe timed out"));
    }

    #[tokio::test]
    async fn test_slow_backend_does_not_delay_others() {
        let registry = registry_with(&["slow", "fast"]).await;
        let probe = Arc::new(ScriptedProbe::default());
        probe.delay("slow", Duration::from_secs(5));
        let prober = HealthProber::new(
            registry.clone(),
            probe,
            &health_config(),
            EventPublisher::disconnected(),
        );

        let started = Instant::now();
        let results = prober.probe_all().await;
        // 並列実行なのでプローブタイムアウト程度で終わる
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(results.len(), 2);
        assert_eq!(
            registry.get("fast").await.unwrap().state.status(),
            BackendStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_periodic_probe_skips_backend_still_being_probed() {
        let registry = registry_with(&["slow", "fast"]).await;
        let probe = Arc::new(ScriptedProbe::default());
        probe.delay("slow", Duration::from_millis(150));
        let prober = HealthProber::new(
            registry.clone(),
            probe,
            &health_config(),
            EventPublisher::disconnected(),
        );

        assert_eq!(prober.spawn_probes().await, 2);
        tokio::time::sleep(Duration::from_millis(50)).await;
        // fast は完了済み、slow はまだ実行中
        assert_eq!(prober.spawn_probes().await, 1);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(prober.spawn_probes().await, 2);
        let slow = registry.get("slow").await.unwrap();
        assert_eq!(slow.state.status(), BackendStatus::Healthy);
    }

    #[tokio::test]
    async fn test_unregistered_backends_are_not_probed() {
        let registry = registry_with(&["a"]).await;
        registry
            .get("a")
            .await
            .unwrap()
            .state
            .force_status(BackendStatus::Unregistered);
        let prober = HealthProber::new(
            registry.clone(),
            Arc::new(ScriptedProbe::default()),
            &health_config(),
            EventPublisher::disconnected(),
        );
        assert!(prober.probe_all().await.is_empty());
    }

    #[tokio::test]
    async fn test_tcp_probe_against_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let probe = TcpProbe::new(Duration::from_millis(500));

        let up = BackendDescriptor::new("up", "127.0.0.1", port, "llama");
        assert!(probe.probe(&up).await.is_success());

        drop(listener);
        let result = probe.probe(&up).await;
        assert!(!result.is_success());
    }

    #[tokio::test]
    async fn test_http_probe_checks_readiness_status() {
        use wiremock::matchers::{method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let ready = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&ready)
            .await;
        let loading = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&loading)
            .await;

        let probe = HttpProbe::new("health", Duration::from_millis(500)).unwrap();
        let descriptor = |name: &str, server: &MockServer| {
            let addr = server.address();
            BackendDescriptor::new(name, addr.ip().to_string(), addr.port(), "llama")
        };

        assert!(probe.probe(&descriptor("ready", &ready)).await.is_success());
        match probe.probe(&descriptor("loading", &loading)).await {
            ProbeResult::Failure { reason } => assert!(reason.contains("503")),
            other => panic!("expected failure, got {:?}", other),
        }
    }
}
