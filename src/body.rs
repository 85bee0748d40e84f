//! Buffer-then-replay duplication of single-read HTTP bodies.
//!
//! A hyper body can be polled to completion exactly once. Anything that wants
//! to look at the bytes (the dump renderer) and still hand them on (the
//! upstream client, the downstream connection) drains the body into a
//! [`DuplicatedBody`] and mints a fresh [`ProxyBody`] for every consumer.

use crate::error::ProxyError;
use bytes::Bytes;
use http::{request, response, Request, Response};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Body;

/// Body type flowing through the proxy pipeline.
pub type ProxyBody = BoxBody<Bytes, ProxyError>;

/// Immutable capture of a body's complete content.
#[derive(Debug, Clone, Default)]
pub struct DuplicatedBody {
    bytes: Bytes,
}

impl DuplicatedBody {
    /// Drains `body` to the end. The source is consumed, so it is released
    /// whether the read succeeds or not. A mid-read failure is reported as
    /// [`ProxyError::BodyRead`]; the caller must not forward anything then.
    pub async fn drain<B>(body: B) -> Result<Self, ProxyError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let collected = body
            .collect()
            .await
            .map_err(|e| ProxyError::BodyRead(e.to_string()))?;

        Ok(Self {
            bytes: collected.to_bytes(),
        })
    }

    /// Same as [`drain`](Self::drain) for a body that may be absent.
    #[cfg(test)]
    pub(crate) async fn from_optional<B>(body: Option<B>) -> Result<Self, ProxyError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        match body {
            Some(body) => Self::drain(body).await,
            None => Ok(Self::default()),
        }
    }

    #[cfg(test)]
    pub(crate) fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self { bytes: bytes.into() }
    }

    /// A new single-read body over the captured bytes, starting at offset zero.
    /// Every call returns an independent stream.
    pub fn stream(&self) -> ProxyBody {
        if self.bytes.is_empty() {
            return empty_body();
        }
        Full::new(self.bytes.clone())
            .map_err(|never| match never {})
            .boxed()
    }

    /// Log-only request: method, URI, version and headers cloned from `parts`,
    /// backed by its own stream. Reading it never touches the forwarded copy.
    pub fn request_copy(&self, parts: &request::Parts) -> Request<ProxyBody> {
        let mut copy = Request::new(self.stream());
        *copy.method_mut() = parts.method.clone();
        *copy.uri_mut() = parts.uri.clone();
        *copy.version_mut() = parts.version;
        *copy.headers_mut() = parts.headers.clone();
        copy
    }

    /// Log-only response with the same status, version and headers as `parts`.
    pub fn response_copy(&self, parts: &response::Parts) -> Response<ProxyBody> {
        let mut copy = Response::new(self.stream());
        *copy.status_mut() = parts.status;
        *copy.version_mut() = parts.version;
        *copy.headers_mut() = parts.headers.clone();
        copy
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full_body(bytes: impl Into<Bytes>) -> ProxyBody {
    Full::new(bytes.into())
        .map_err(|never| match never {})
        .boxed()
}
