use crate::body::{DuplicatedBody, ProxyBody};
use crate::dump::{self, Direction, DumpSink, ExchangeRecord};
use crate::error::ProxyError;
use http::Request;
use hyper::body::Body;
use log::{error, info};
use std::net::SocketAddr;
use std::sync::Arc;

/// Dumps client requests exactly as received, before any rewriting.
#[derive(Clone)]
pub struct InboundObserver {
    sink: Arc<DumpSink>,
}

impl InboundObserver {
    pub fn new(sink: Arc<DumpSink>) -> Self {
        Self { sink }
    }

    /// Buffers the client body, dumps a copy and returns the request with an
    /// unread body. A body that cannot be read fails with
    /// [`ProxyError::ClientBodyRead`]; nothing should be forwarded then.
    pub async fn observe<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Result<Request<ProxyBody>, ProxyError>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let (parts, body) = req.into_parts();

        let body = DuplicatedBody::drain(body).await.map_err(|e| {
            error!("Failed to read client request body from {}: {}", remote_addr, e);
            ProxyError::ClientBodyRead(e.to_string())
        })?;

        info!(
            "Received client request: method={} path={} remote_addr={}",
            parts.method,
            parts.uri.path(),
            remote_addr
        );

        match dump::render_request(body.request_copy(&parts)).await {
            Ok(rendered) => {
                let record = ExchangeRecord::new(Direction::ClientRequest, rendered);
                if let Err(e) = self.sink.emit(&record) {
                    error!("Failed to write client request dump: {}", e);
                }
            }
            Err(e) => error!("Failed to dump client request from {}: {}", remote_addr, e),
        }

        Ok(Request::from_parts(parts, body.stream()))
    }
}
