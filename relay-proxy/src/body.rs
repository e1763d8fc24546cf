//! Body type flowing through the gateway in both directions.

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Bytes;

/// Type-erased request/response body. Inbound bodies are streamed through unchanged.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// A body holding `chunk` in full.
pub fn full(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

/// A body with no content.
pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}
