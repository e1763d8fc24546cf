//! End-to-end dispatch pipeline tests against local upstreams.

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::{
    body_text, closed_port, dispatcher, get, spawn_silent_upstream, spawn_upstream,
    spawn_upstream_with_status, CountingRegistry,
};
use hyper::StatusCode;
use relay_admin::ControlPlane;
use relay_core::state::keys;
use relay_core::{MemoryStore, ResolutionError, StateStore};
use relay_proxy::health_check::probe_cached_targets;
use relay_proxy::DispatchError;

const BUDGET: Duration = Duration::from_secs(2);

#[tokio::test]
async fn cold_start_pins_the_round_robin_pick() {
    let alpha = spawn_upstream("alpha").await;
    let beta = spawn_upstream("beta").await;
    let registry = CountingRegistry::with("orders", &[alpha, beta]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry.clone(), store.clone(), BUDGET);

    let response = dispatcher.dispatch("orders", get("/orders/1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "beta GET /orders/1");

    let cursor = store.get(&keys::load_balancer("orders")).await.unwrap().unwrap();
    let cursor: serde_json::Value = serde_json::from_str(&cursor).unwrap();
    assert_eq!(cursor["index"], 1);

    // The handle stays pinned even after discovery stops listing beta.
    registry.set("orders", &[alpha]);
    let response = dispatcher.dispatch("orders", get("/orders/2")).await.unwrap();
    assert_eq!(body_text(response).await, "beta GET /orders/2");
    assert_eq!(registry.queries(), 1);
}

#[tokio::test]
async fn open_circuit_fails_fast_without_discovery() {
    let upstream = spawn_upstream("alpha").await;
    let registry = CountingRegistry::with("orders", &[upstream]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry.clone(), store.clone(), BUDGET);
    for _ in 0..5 {
        dispatcher.breaker().record_failure("orders").await.unwrap();
    }

    let err = dispatcher.dispatch("orders", get("/orders")).await.unwrap_err();

    assert!(matches!(err, DispatchError::ServiceUnavailable { .. }));
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(registry.queries(), 0);
    assert_eq!(store.get(&keys::load_balancer("orders")).await.unwrap(), None);
    assert!(dispatcher.proxies().is_empty());
}

#[tokio::test]
async fn cascading_failures_open_the_circuit() {
    let dead = closed_port().await;
    let registry = CountingRegistry::with("billing", &[dead]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry, store, BUDGET);

    for attempt in 1..=5 {
        let err = dispatcher.dispatch("billing", get("/billing")).await.unwrap_err();
        assert!(
            matches!(err, DispatchError::UpstreamForwarding { .. }),
            "attempt {attempt}: {err}"
        );
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
    }
    assert!(dispatcher.breaker().is_open("billing").await.unwrap());

    let started = Instant::now();
    let err = dispatcher.dispatch("billing", get("/billing")).await.unwrap_err();
    assert!(matches!(err, DispatchError::ServiceUnavailable { .. }));
    assert!(started.elapsed() < BUDGET);
}

#[tokio::test]
async fn hung_upstream_times_out() {
    let silent = spawn_silent_upstream().await;
    let registry = CountingRegistry::with("reports", &[silent]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry, store, Duration::from_millis(200));

    let err = dispatcher.dispatch("reports", get("/reports")).await.unwrap_err();

    assert!(matches!(err, DispatchError::UpstreamTimeout { .. }));
    assert_eq!(err.status(), StatusCode::GATEWAY_TIMEOUT);
    assert_eq!(dispatcher.breaker().state("reports").await.unwrap().failure_count, 1);
    assert!(dispatcher.proxies().is_empty());
}

#[tokio::test]
async fn unknown_service_is_a_resolution_failure() {
    let registry = Arc::new(CountingRegistry::default());
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry, store, BUDGET);

    let err = dispatcher.dispatch("ghost", get("/ghost")).await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Resolution(ResolutionError::NoHealthyInstance(ref service)) if service == "ghost"
    ));
    assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(dispatcher.breaker().state("ghost").await.unwrap().failure_count, 1);
}

#[tokio::test]
async fn success_clears_the_failure_count() {
    let upstream = spawn_upstream("alpha").await;
    let registry = CountingRegistry::with("orders", &[upstream]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry, store, BUDGET);
    dispatcher.breaker().record_failure("orders").await.unwrap();
    dispatcher.breaker().record_failure("orders").await.unwrap();

    let response = dispatcher.dispatch("orders", get("/orders")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(dispatcher.breaker().state("orders").await.unwrap().failure_count, 0);
}

#[tokio::test]
async fn upstream_error_statuses_pass_through() {
    let upstream = spawn_upstream_with_status("gamma", StatusCode::INTERNAL_SERVER_ERROR).await;
    let registry = CountingRegistry::with("ledger", &[upstream]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry, store, BUDGET);

    for _ in 0..6 {
        let response = dispatcher.dispatch("ledger", get("/ledger")).await.unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "gamma GET /ledger");
    }
    assert!(!dispatcher.breaker().is_open("ledger").await.unwrap());
}

#[tokio::test]
async fn invalidate_forces_re_resolution() {
    let alpha = spawn_upstream("alpha").await;
    let beta = spawn_upstream("beta").await;
    let registry = CountingRegistry::with("orders", &[alpha]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry.clone(), store, BUDGET);

    let response = dispatcher.dispatch("orders", get("/orders")).await.unwrap();
    assert_eq!(body_text(response).await, "alpha GET /orders");

    registry.set("orders", &[beta]);
    let evicted = dispatcher.invalidate("orders").await.unwrap();
    assert_eq!(evicted.port, alpha.port());

    let response = dispatcher.dispatch("orders", get("/orders")).await.unwrap();
    assert_eq!(body_text(response).await, "beta GET /orders");
    assert_eq!(registry.queries(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_first_requests_share_one_proxy() {
    let upstream = spawn_upstream("alpha").await;
    let registry = CountingRegistry::with("orders", &[upstream]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = Arc::new(dispatcher(registry.clone(), store, BUDGET));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move { dispatcher.proxy_for("orders").await.unwrap() })
        })
        .collect();

    let mut handles = Vec::new();
    for task in tasks {
        handles.push(task.await.unwrap());
    }
    assert!(handles.iter().all(|handle| Arc::ptr_eq(handle, &handles[0])));
    assert_eq!(handles[0].service(), "orders");
    assert_eq!(registry.queries(), 1);
    assert_eq!(dispatcher.proxies().len(), 1);
}

#[tokio::test]
async fn prober_evicts_unreachable_targets() {
    let live = spawn_upstream("alpha").await;
    let dead = closed_port().await;
    let registry = Arc::new(CountingRegistry::default());
    registry.set("orders", &[live]);
    registry.set("billing", &[dead]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry, store, BUDGET);
    dispatcher.proxy_for("orders").await.unwrap();
    dispatcher.proxy_for("billing").await.unwrap();

    let evicted = probe_cached_targets(&dispatcher, Duration::from_millis(500)).await;

    assert_eq!(evicted, 1);
    assert!(dispatcher.proxies().get("orders").is_some());
    assert!(dispatcher.proxies().get("billing").is_none());
}

#[tokio::test]
async fn control_plane_reports_and_resets() {
    let upstream = spawn_upstream("alpha").await;
    let registry = CountingRegistry::with("orders", &[upstream]);
    let store = Arc::new(MemoryStore::new());
    let dispatcher = dispatcher(registry, store, BUDGET);
    dispatcher.proxy_for("orders").await.unwrap();
    for _ in 0..5 {
        dispatcher.breaker().record_failure("orders").await.unwrap();
    }

    let status = ControlPlane::status(&dispatcher, "orders").await.unwrap();
    assert!(status.circuit.is_open);
    assert_eq!(status.proxy_target, Some(upstream.to_string()));

    dispatcher.reset_breaker("orders").await.unwrap();
    let status = ControlPlane::status(&dispatcher, "orders").await.unwrap();
    assert!(!status.circuit.is_open);
    assert_eq!(status.circuit.failure_count, 0);
}
