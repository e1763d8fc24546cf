//! HTTP tests through the gateway listener.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use common::{closed_port, dispatcher, spawn_upstream, CountingRegistry};
use relay_core::MemoryStore;
use relay_proxy::server::{serve, HEALTH_PATH};
use relay_proxy::Dispatcher;
use tokio::net::TcpListener;

async fn start_gateway(dispatcher: Dispatcher) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, Arc::new(dispatcher)));
    addr
}

fn build(registry: Arc<CountingRegistry>) -> Dispatcher {
    dispatcher(registry, Arc::new(MemoryStore::new()), Duration::from_secs(2))
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .no_proxy()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

#[tokio::test]
async fn answers_its_own_health_check() {
    let registry = Arc::new(CountingRegistry::default());
    let gateway = start_gateway(build(registry.clone())).await;

    let response = client()
        .get(format!("http://{gateway}{HEALTH_PATH}"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
    assert_eq!(registry.queries(), 0);
}

#[tokio::test]
async fn proxies_to_the_named_service() {
    let upstream = spawn_upstream("alpha").await;
    let registry = CountingRegistry::with("orders", &[upstream]);
    let gateway = start_gateway(build(registry)).await;

    let response = client()
        .get(format!("http://{gateway}/orders/42?expand=true"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let headers = response.headers();
    assert_eq!(headers["x-upstream"], "alpha");
    assert_eq!(headers["x-seen-host"], upstream.to_string().as_str());
    assert_eq!(headers["x-seen-forwarded-host"], gateway.to_string().as_str());
    assert_eq!(headers["x-seen-forwarded-for"], "127.0.0.1");
    assert_eq!(response.text().await.unwrap(), "alpha GET /orders/42?expand=true");
}

#[tokio::test]
async fn open_circuit_is_a_json_503() {
    let upstream = spawn_upstream("alpha").await;
    let registry = CountingRegistry::with("orders", &[upstream]);
    let dispatcher = build(registry);
    for _ in 0..5 {
        dispatcher.breaker().record_failure("orders").await.unwrap();
    }
    let gateway = start_gateway(dispatcher).await;

    let response = client()
        .get(format!("http://{gateway}/orders"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 503);
    assert_eq!(response.headers()["content-type"], "application/json");
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["error"], "service_unavailable");
}

#[tokio::test]
async fn unreachable_upstream_is_a_502() {
    let dead = closed_port().await;
    let registry = CountingRegistry::with("billing", &[dead]);
    let gateway = start_gateway(build(registry)).await;

    let response = client()
        .get(format!("http://{gateway}/billing/invoices"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 502);
    let body: serde_json::Value = serde_json::from_str(&response.text().await.unwrap()).unwrap();
    assert_eq!(body["error"], "upstream_failed");
}

#[tokio::test]
async fn root_path_names_no_service() {
    let registry = Arc::new(CountingRegistry::default());
    let gateway = start_gateway(build(registry.clone())).await;

    let response = client().get(format!("http://{gateway}/")).send().await.unwrap();

    assert_eq!(response.status(), 404);
    assert_eq!(registry.queries(), 0);
}
