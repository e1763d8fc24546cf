#![allow(dead_code)]

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::HOST;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use relay_core::{
    BreakerConfig, CircuitBreaker, InstanceResolver, MemoryStore, RegistryEntry, RegistryError,
    ResolverConfig, RoundRobin, ServiceRegistry, StateStore, StaticRegistry,
};
use relay_proxy::body::{empty, ProxyBody};
use relay_proxy::{DispatchConfig, Dispatcher};
use tokio::net::TcpListener;

/// A static registry that counts health queries.
#[derive(Default)]
pub struct CountingRegistry {
    pub inner: StaticRegistry,
    pub queries: AtomicUsize,
}

impl CountingRegistry {
    pub fn with(service: &str, addrs: &[SocketAddr]) -> Arc<Self> {
        let registry = Self::default();
        registry.set(service, addrs);
        Arc::new(registry)
    }

    pub fn set(&self, service: &str, addrs: &[SocketAddr]) {
        let entries = addrs
            .iter()
            .map(|addr| RegistryEntry::healthy(addr.ip().to_string(), addr.port()))
            .collect();
        self.inner.set_service(service, entries);
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceRegistry for CountingRegistry {
    async fn query_health(&self, service: &str) -> Result<Vec<RegistryEntry>, RegistryError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.inner.query_health(service).await
    }
}

pub fn dispatcher(
    registry: Arc<CountingRegistry>,
    store: Arc<MemoryStore>,
    upstream_timeout: Duration,
) -> Dispatcher {
    let store: Arc<dyn StateStore> = store;
    Dispatcher::new(
        CircuitBreaker::new(store.clone(), BreakerConfig::default()),
        InstanceResolver::new(registry, store.clone(), ResolverConfig::default()),
        RoundRobin::new(store),
        DispatchConfig {
            upstream_timeout,
            reset_failures_on_success: true,
        },
    )
}

pub fn get(path: &str) -> Request<ProxyBody> {
    Request::get(format!("http://gateway.test{path}"))
        .header(HOST, "gateway.test")
        .body(empty())
        .unwrap()
}

pub async fn body_text(response: Response<Incoming>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

/// An upstream answering `200` with `"{name} {method} {uri}"`.
pub async fn spawn_upstream(name: &'static str) -> SocketAddr {
    spawn_upstream_with_status(name, StatusCode::OK).await
}

/// An upstream answering every request with `status`, echoing what it saw in headers.
pub async fn spawn_upstream_with_status(name: &'static str, status: StatusCode) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| async move {
                    let seen = |name: &str| {
                        req.headers()
                            .get(name)
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string()
                    };
                    let response = Response::builder()
                        .status(status)
                        .header("x-upstream", name)
                        .header("x-seen-host", seen("host"))
                        .header("x-seen-forwarded-for", seen("x-forwarded-for"))
                        .header("x-seen-forwarded-host", seen("x-forwarded-host"))
                        .body(Full::new(Bytes::from(format!(
                            "{name} {} {}",
                            req.method(),
                            req.uri()
                        ))))
                        .unwrap();
                    Ok::<_, Infallible>(response)
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// An upstream that accepts connections and never answers.
pub async fn spawn_silent_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
