//! Forwarding handler bound to one upstream instance.

use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION, HOST};
use hyper::{Request, Response, Uri};
use hyper_util::rt::TokioIo;
use relay_core::ServiceInstance;
use tokio::net::TcpStream;
use tracing::debug;

use crate::body::ProxyBody;
use crate::connection_pool::ConnectionPool;
use crate::error::ForwardError;

/// Peer address of the inbound connection, attached to requests by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientAddr(pub SocketAddr);

const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

const HOP_BY_HOP: [&str; 9] = [
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// A ready-to-use reverse proxy for one service, pinned to one instance.
///
/// The target never changes for the life of the handle. Picking up a new
/// topology means dropping the handle from the cache.
#[derive(Debug)]
pub struct ProxyHandle {
    service: String,
    target: ServiceInstance,
    authority: String,
    pool: ConnectionPool,
    timeout: Duration,
}

impl ProxyHandle {
    /// Bind a handle for `service` to `target`.
    pub fn new(
        service: impl Into<String>,
        target: ServiceInstance,
        pool: ConnectionPool,
        timeout: Duration,
    ) -> Self {
        let authority = target.authority();
        Self {
            service: service.into(),
            target,
            authority,
            pool,
            timeout,
        }
    }

    /// Service this handle serves.
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Instance every request is sent to.
    pub fn target(&self) -> &ServiceInstance {
        &self.target
    }

    /// Send `req` to the target and return the upstream response head.
    ///
    /// Connect, handshake, send and the wait for the response head share one
    /// budget. The response body is streamed back afterwards.
    pub async fn forward(&self, req: Request<ProxyBody>) -> Result<Response<Incoming>, ForwardError> {
        match tokio::time::timeout(self.timeout, self.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(ForwardError::Timeout {
                target: self.authority.clone(),
                timeout: self.timeout,
            }),
        }
    }

    async fn send(&self, mut req: Request<ProxyBody>) -> Result<Response<Incoming>, ForwardError> {
        self.rewrite(&mut req)?;

        let mut sender = match self.pool.try_pop(&self.authority) {
            Some(sender) => sender,
            None => self.connect().await?,
        };
        sender.ready().await.map_err(|source| ForwardError::Send {
            target: self.authority.clone(),
            source,
        })?;

        let mut response = sender
            .send_request(req)
            .await
            .map_err(|source| ForwardError::Send {
                target: self.authority.clone(),
                source,
            })?;
        self.pool.push(&self.authority, sender);

        strip_hop_by_hop(response.headers_mut());
        Ok(response)
    }

    async fn connect(&self) -> Result<SendRequest<ProxyBody>, ForwardError> {
        let stream = TcpStream::connect((self.target.address.as_str(), self.target.port))
            .await
            .map_err(|source| ForwardError::Connect {
                target: self.authority.clone(),
                source,
            })?;
        let _ = stream.set_nodelay(true);

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|source| ForwardError::Handshake {
                target: self.authority.clone(),
                source,
            })?;

        let upstream = self.authority.clone();
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                debug!(upstream, error = %err, "upstream connection closed with error");
            }
        });
        debug!(service = %self.service, upstream = %self.authority, "opened upstream connection");
        Ok(sender)
    }

    /// Apply the reverse-proxy adjustments to an inbound request.
    fn rewrite(&self, req: &mut Request<ProxyBody>) -> Result<(), ForwardError> {
        let origin_form: Uri = req
            .uri()
            .path_and_query()
            .map_or("/", |pq| pq.as_str())
            .parse()
            .map_err(|err: hyper::http::uri::InvalidUri| ForwardError::InvalidRequest(err.to_string()))?;
        *req.uri_mut() = origin_form;

        let client = req.extensions().get::<ClientAddr>().copied();
        let headers = req.headers_mut();
        strip_hop_by_hop(headers);

        if let Some(original_host) = headers.remove(HOST) {
            headers.insert(X_FORWARDED_HOST, original_host);
        }
        let host = HeaderValue::from_str(&self.authority)
            .map_err(|err| ForwardError::InvalidRequest(err.to_string()))?;
        headers.insert(HOST, host);
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static("http"));

        if let Some(ClientAddr(peer)) = client {
            let forwarded_for = match headers
                .get(&X_FORWARDED_FOR)
                .and_then(|value| value.to_str().ok())
            {
                Some(prior) => format!("{prior}, {}", peer.ip()),
                None => peer.ip().to_string(),
            };
            let value = HeaderValue::from_str(&forwarded_for)
                .map_err(|err| ForwardError::InvalidRequest(err.to_string()))?;
            headers.insert(X_FORWARDED_FOR, value);
        }
        Ok(())
    }
}

/// Remove hop-by-hop headers, including any named by `Connection`.
fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();
    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}
