//! Relay Admin Control Plane
//!
//! Serves operator commands over a Unix domain socket. Each connection carries
//! newline-delimited JSON: one request per line, one response per line.
//!
//! ```text
//! {"op":"invalidate","service":"orders"}
//! {"op":"reset_breaker","service":"orders"}
//! {"op":"status","service":"orders"}
//! ```

use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use relay_core::CircuitState;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, error, info, warn};

/// Failure of an operator command.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct AdminError(pub String);

/// Snapshot of one service as seen by this gateway process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Service the snapshot describes.
    pub service: String,
    /// Breaker state from the shared store.
    pub circuit: CircuitState,
    /// `host:port` of the cached proxy handle, if one is cached.
    pub proxy_target: Option<String>,
}

/// Operations the control plane can drive.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Drop the cached proxy and instance snapshot of `service`.
    async fn invalidate(&self, service: &str) -> Result<(), AdminError>;

    /// Close the circuit of `service` and forget its failures.
    async fn reset_breaker(&self, service: &str) -> Result<(), AdminError>;

    /// Describe `service`.
    async fn status(&self, service: &str) -> Result<ServiceStatus, AdminError>;
}

/// A single control plane request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum AdminRequest {
    /// Force re-resolution of a service on its next request.
    Invalidate {
        /// Target service.
        service: String,
    },
    /// Close a service's circuit.
    ResetBreaker {
        /// Target service.
        service: String,
    },
    /// Read a service's status.
    Status {
        /// Target service.
        service: String,
    },
}

/// Reply to an [`AdminRequest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdminResponse {
    /// Whether the request succeeded.
    pub ok: bool,
    /// Present on successful `status` requests.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<ServiceStatus>,
    /// Present on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AdminResponse {
    fn done() -> Self {
        Self {
            ok: true,
            status: None,
            error: None,
        }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            status: None,
            error: Some(message.into()),
        }
    }
}

/// Bind `path` and serve control plane connections.
///
/// A stale socket file left by a previous process is removed first.
pub async fn serve(path: impl AsRef<Path>, control: Arc<dyn ControlPlane>) -> io::Result<()> {
    let path = path.as_ref();
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed stale admin socket"),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }

    let listener = UnixListener::bind(path)?;
    info!(path = %path.display(), "admin control plane listening");

    serve_incoming(UnixListenerStream::new(listener), control).await;
    Ok(())
}

/// Serve every connection `incoming` yields. Accept errors are logged and skipped.
async fn serve_incoming<S>(mut incoming: S, control: Arc<dyn ControlPlane>)
where
    S: Stream<Item = io::Result<UnixStream>> + Unpin,
{
    while let Some(stream) = incoming.next().await {
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                error!(error = %err, "admin accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
        };
        let control = control.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, control).await {
                warn!(error = %err, "admin connection failed");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, control: Arc<dyn ControlPlane>) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<AdminRequest>(&line) {
            Ok(request) => execute(control.as_ref(), request).await,
            Err(err) => AdminResponse::failed(format!("invalid request: {err}")),
        };
        let mut encoded = serde_json::to_vec(&response).map_err(io::Error::other)?;
        encoded.push(b'\n');
        writer.write_all(&encoded).await?;
    }
    Ok(())
}

/// Run one request against `control`.
pub async fn execute(control: &dyn ControlPlane, request: AdminRequest) -> AdminResponse {
    info!(?request, "admin request");
    let result = match request {
        AdminRequest::Invalidate { service } => {
            control.invalidate(&service).await.map(|()| AdminResponse::done())
        }
        AdminRequest::ResetBreaker { service } => {
            control.reset_breaker(&service).await.map(|()| AdminResponse::done())
        }
        AdminRequest::Status { service } => control.status(&service).await.map(|status| {
            AdminResponse {
                status: Some(status),
                ..AdminResponse::done()
            }
        }),
    };
    result.unwrap_or_else(|err| AdminResponse::failed(err.0))
}
