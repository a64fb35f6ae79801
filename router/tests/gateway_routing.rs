//! Gateway routing integration tests
//!
//! Backends are wiremock servers; no prober runs, so every backend stays
//! UNKNOWN (selectable) unless a test changes it.

mod support;

use fleet_router::gateway::InferenceFailure;
use fleet_router::monitor::FleetEvent;
use fleet_router_common::types::{BackendStatus, SelectionStrategy};
use std::time::Duration;
use support::*;

const TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_successful_request_reports_backend_and_usage() {
    let server = completion_backend("hi there").await;
    let gateway = gateway(fleet_config(vec![descriptor_for("a", &server, "llama")])).await;

    let result = gateway
        .handle_inference_request("llama", chat_request("llama"), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(result.backend, "a");
    assert_eq!(result.content, "hi there");
    assert_eq!(result.prompt_tokens, 4);
    assert_eq!(result.completion_tokens, 2);
    assert_eq!(result.attempts, 1);

    let loads = gateway.balancer().load_snapshot().await;
    assert_eq!(loads[0].in_flight, 0);
    assert_eq!(loads[0].total_requests, 1);
    assert_eq!(loads[0].total_errors, 0);
}

#[tokio::test]
async fn test_reselects_after_connection_refused() {
    let live = completion_backend("from b").await;
    let gateway = gateway(fleet_config(vec![
        refused_descriptor("a", "llama"),
        descriptor_for("b", &live, "llama"),
    ]))
    .await;

    let result = gateway
        .handle_inference_request("llama", chat_request("llama"), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(result.backend, "b");
    // a で2回（再試行込み）、b で1回
    assert_eq!(result.attempts, 3);

    let loads = gateway.balancer().load_snapshot().await;
    assert_eq!(loads[0].total_errors, 2);
    assert!(loads.iter().all(|load| load.in_flight == 0));
}

#[tokio::test]
async fn test_backend_error_is_surfaced_without_reselection() {
    let broken = failing_backend(500).await;
    let healthy = completion_backend("unused").await;
    let gateway = gateway(fleet_config(vec![
        descriptor_for("a", &broken, "llama"),
        descriptor_for("b", &healthy, "llama"),
    ]))
    .await;

    let failure = gateway
        .handle_inference_request("llama", chat_request("llama"), TIMEOUT)
        .await
        .unwrap_err();

    match failure {
        InferenceFailure::BackendError { backend, message } => {
            assert_eq!(backend, "a");
            assert!(message.contains("500"));
            assert!(message.contains("model crashed"));
        }
        other => panic!("expected BackendError, got {:?}", other),
    }
    assert!(healthy.received_requests().await.unwrap().is_empty());
    assert_eq!(broken.received_requests().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_unknown_model_is_rejected_immediately() {
    let server = completion_backend("hi").await;
    let gateway = gateway(fleet_config(vec![descriptor_for("a", &server, "llama")])).await;

    let failure = gateway
        .handle_inference_request("mistral", chat_request("mistral"), TIMEOUT)
        .await
        .unwrap_err();

    assert_eq!(
        failure,
        InferenceFailure::NoBackendAvailable {
            model: "mistral".to_string()
        }
    );
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_down_backends_are_never_selected() {
    let server = completion_backend("hi").await;
    let gateway = gateway(fleet_config(vec![descriptor_for("a", &server, "llama")])).await;
    let entry = gateway.registry().get("a").await.unwrap();
    entry.state.force_status(BackendStatus::Down);

    let failure = gateway
        .handle_inference_request("llama", chat_request("llama"), TIMEOUT)
        .await
        .unwrap_err();

    assert!(matches!(failure, InferenceFailure::NoBackendAvailable { .. }));
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_all_backends_timing_out_reports_timeout() {
    let slow_a = slow_backend(Duration::from_millis(500)).await;
    let slow_b = slow_backend(Duration::from_millis(500)).await;
    let mut config = fleet_config(vec![
        descriptor_for("a", &slow_a, "llama"),
        descriptor_for("b", &slow_b, "llama"),
    ]);
    config.retry.max_attempts = 1;
    let gateway = gateway(config).await;

    let failure = gateway
        .handle_inference_request("llama", chat_request("llama"), Duration::from_millis(50))
        .await
        .unwrap_err();

    assert_eq!(
        failure,
        InferenceFailure::Timeout {
            backends: vec!["a".to_string(), "b".to_string()]
        }
    );
}

#[tokio::test]
async fn test_reselection_limit_is_respected() {
    let live = completion_backend("never reached").await;
    let mut config = fleet_config(vec![
        refused_descriptor("a", "llama"),
        refused_descriptor("b", "llama"),
        descriptor_for("c", &live, "llama"),
    ]);
    config.retry.max_attempts = 1;
    config.routing.max_reselections = 1;
    let gateway = gateway(config).await;

    let failure = gateway
        .handle_inference_request("llama", chat_request("llama"), TIMEOUT)
        .await
        .unwrap_err();

    match failure {
        InferenceFailure::FleetExhausted { backends, .. } => assert_eq!(backends.len(), 2),
        other => panic!("expected FleetExhausted, got {:?}", other),
    }
}

#[tokio::test]
async fn test_empty_model_uses_default_model() {
    let llama = completion_backend("from llama").await;
    let mistral = completion_backend("from mistral").await;
    let mut config = fleet_config(vec![
        descriptor_for("a", &llama, "llama"),
        descriptor_for("b", &mistral, "mistral"),
    ]);
    config.default_model = Some("mistral".to_string());
    let gateway = gateway(config).await;

    let result = gateway
        .handle_inference_request("", chat_request(""), TIMEOUT)
        .await
        .unwrap();

    assert_eq!(result.backend, "b");
    assert_eq!(result.content, "from mistral");
}

#[tokio::test]
async fn test_least_loaded_spreads_concurrent_requests() {
    let a = slow_backend(Duration::from_millis(100)).await;
    let b = slow_backend(Duration::from_millis(100)).await;
    let mut config = fleet_config(vec![
        descriptor_for("a", &a, "llama"),
        descriptor_for("b", &b, "llama"),
    ]);
    config.routing.strategy = SelectionStrategy::LeastLoaded;
    let gateway = std::sync::Arc::new(gateway(config).await);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let gateway = gateway.clone();
            tokio::spawn(async move {
                gateway
                    .handle_inference_request("llama", chat_request("llama"), TIMEOUT)
                    .await
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.await.unwrap().is_ok());
    }

    let on_a = a.received_requests().await.unwrap().len();
    let on_b = b.received_requests().await.unwrap().len();
    assert_eq!(on_a + on_b, 4);
    assert!(on_a > 0 && on_b > 0);
    let loads = gateway.balancer().load_snapshot().await;
    assert!(loads.iter().all(|load| load.in_flight == 0));
}

#[tokio::test]
async fn test_reload_preserves_counters_of_retained_backends() {
    let a = completion_backend("a").await;
    let b = completion_backend("b").await;
    let gateway = gateway(fleet_config(vec![descriptor_for("a", &a, "llama")])).await;
    gateway
        .handle_inference_request("llama", chat_request("llama"), TIMEOUT)
        .await
        .unwrap();

    let summary = gateway
        .reload(vec![
            descriptor_for("a", &a, "llama"),
            descriptor_for("b", &b, "llama"),
        ])
        .await
        .unwrap();

    assert_eq!(summary.retained, vec!["a".to_string()]);
    assert_eq!(summary.added, vec!["b".to_string()]);
    let loads = gateway.balancer().load_snapshot().await;
    assert_eq!(loads[0].name, "a");
    assert_eq!(loads[0].total_requests, 1);
    assert_eq!(loads[1].total_requests, 0);
}

#[tokio::test]
async fn test_reload_drops_alerts_of_removed_backends() {
    let a = completion_backend("a").await;
    let b = completion_backend("b").await;
    let gateway = gateway(fleet_config(vec![
        descriptor_for("a", &a, "llama"),
        descriptor_for("b", &b, "llama"),
    ]))
    .await;
    gateway
        .monitor()
        .handle_event(FleetEvent::CrashLoop {
            backend: "b".to_string(),
            crashes: 6,
        })
        .await;
    assert_eq!(gateway.fleet_status().await.alerts.len(), 1);

    let summary = gateway
        .reload(vec![descriptor_for("a", &a, "llama")])
        .await
        .unwrap();

    assert_eq!(summary.removed, vec!["b".to_string()]);
    let status = gateway.fleet_status().await;
    assert!(status.alerts.is_empty());
    assert!(gateway.monitor().backend_metrics("b").is_none());
}

#[tokio::test]
async fn test_fleet_status_lists_backends_in_order() {
    let a = completion_backend("a").await;
    let b = completion_backend("b").await;
    let gateway = gateway(fleet_config(vec![
        descriptor_for("a", &a, "llama"),
        descriptor_for("b", &b, "mistral"),
    ]))
    .await;

    let status = gateway.fleet_status().await;
    let names: Vec<_> = status.backends.iter().map(|b| b.load.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b"]);
    assert_eq!(status.backends[1].load.model_id, "mistral");
    assert!(status.alerts.is_empty());
    assert!(status.crash_loops.is_empty());

    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["backends"][0]["name"], "a");
    assert_eq!(json["backends"][0]["status"], "unknown");
}
