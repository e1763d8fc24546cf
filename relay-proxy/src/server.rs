//! Server module for handling incoming connections and routing them to services.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::CONTENT_TYPE;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

use crate::body::{full, ProxyBody};
use crate::dispatcher::Dispatcher;
use crate::proxy::ClientAddr;

/// Path answered by the gateway itself.
pub const HEALTH_PATH: &str = "/__gateway/health";

/// Binds `addr` and serves the gateway on it.
pub async fn start_server(
    addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "gateway listening");
    serve(listener, dispatcher).await
}

/// Accepts connections from `listener` forever.
pub async fn serve(
    listener: TcpListener,
    dispatcher: Arc<Dispatcher>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(err) => {
                error!(error = %err, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };

        let dispatcher = dispatcher.clone();
        tokio::task::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| handle_request(dispatcher.clone(), peer, req));
            if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                debug!(%peer, error = ?err, "error serving connection");
            }
        });
    }
}

/// Routes one inbound request. Dispatch failures become JSON error responses.
async fn handle_request(
    dispatcher: Arc<Dispatcher>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, Infallible> {
    if req.uri().path() == HEALTH_PATH {
        return Ok(plain(StatusCode::OK, "ok"));
    }

    let Some(service) = service_name(req.uri().path()).map(str::to_string) else {
        return Ok(error_response(
            StatusCode::NOT_FOUND,
            "no_service",
            "request path does not name a service",
        ));
    };
    debug!(service = %service, method = %req.method(), uri = %req.uri(), "inbound request");

    let mut req = req.map(|body| body.boxed());
    req.extensions_mut().insert(ClientAddr(peer));

    match dispatcher.dispatch(&service, req).await {
        Ok(response) => Ok(response.map(|body| body.boxed())),
        Err(err) => Ok(error_response(err.status(), err.kind(), &err.to_string())),
    }
}

/// The service named by the first segment of `path`.
pub fn service_name(path: &str) -> Option<&str> {
    path.trim_start_matches('/')
        .split('/')
        .next()
        .filter(|segment| !segment.is_empty())
}

fn plain(status: StatusCode, text: &'static str) -> Response<ProxyBody> {
    let mut response = Response::new(full(text));
    *response.status_mut() = status;
    response
}

fn error_response(status: StatusCode, kind: &str, message: &str) -> Response<ProxyBody> {
    let body = serde_json::json!({ "error": kind, "message": message }).to_string();
    let mut response = Response::new(full(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, hyper::header::HeaderValue::from_static("application/json"));
    response
}
