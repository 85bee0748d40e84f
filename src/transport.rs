//! Upstream execution and the observing decorator around it.

use crate::body::{DuplicatedBody, ProxyBody};
use crate::dump::{self, Direction, DumpSink, ExchangeRecord};
use crate::error::ProxyError;
use async_trait::async_trait;
use http::header::HeaderName;
use http::{Request, Response};
use hyper_tls::{native_tls, HttpsConnector};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, error, info};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{timeout_at, Instant as Deadline};

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Executes one outgoing request against the network.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError>;
}

#[async_trait]
impl<T> Transport for Arc<T>
where
    T: Transport + ?Sized,
{
    async fn execute(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        (**self).execute(req).await
    }
}

#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Upper bound for connect plus response headers.
    pub timeout: Duration,
    /// Accept any upstream certificate and host name. Process-wide.
    pub insecure_skip_verify: bool,
    pub pool_max_idle_per_host: usize,
    pub pool_idle_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            insecure_skip_verify: false,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(90),
        }
    }
}

/// The real executor: pooled HTTP/HTTPS client.
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, ProxyBody>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(options: &TransportOptions) -> Result<Self, ProxyError> {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_connect_timeout(Some(options.timeout));

        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(options.insecure_skip_verify)
            .danger_accept_invalid_hostnames(options.insecure_skip_verify)
            .build()
            .map_err(|e| ProxyError::Config(format!("Failed to create TLS connector: {}", e)))?;
        let https = HttpsConnector::from((http, tls.into()));

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(options.pool_max_idle_per_host)
            .pool_idle_timeout(options.pool_idle_timeout)
            .build(https);

        Ok(Self {
            client,
            timeout: options.timeout,
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn execute(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        // One deadline for the whole exchange: connect, head and body.
        let deadline = Deadline::now() + self.timeout;

        let response = timeout_at(deadline, self.client.request(req))
            .await
            .map_err(|_| ProxyError::Transport(format!("no response within {:?}", self.timeout)))?
            .map_err(|e| ProxyError::Transport(error_chain(&e)))?;

        let (parts, body) = response.into_parts();
        let body = timeout_at(deadline, DuplicatedBody::drain(body))
            .await
            .map_err(|_| ProxyError::Transport(format!("response body incomplete after {:?}", self.timeout)))??;

        Ok(Response::from_parts(parts, body.stream()))
    }
}

// The legacy client's Display is just "client error (Connect)"; the useful
// part (refused, DNS, certificate) sits in the source chain.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

/// Decorator that dumps every request it forwards and every response it gets
/// back, without disturbing either body.
pub struct ObservingTransport<T> {
    inner: T,
    sink: Arc<DumpSink>,
}

impl<T: Transport> ObservingTransport<T> {
    pub fn new(inner: T, sink: Arc<DumpSink>) -> Self {
        Self { inner, sink }
    }

    fn emit(&self, record: ExchangeRecord) {
        if let Err(e) = self.sink.emit(&record) {
            error!("Failed to write {} dump: {}", record.direction, e);
        }
    }
}

#[async_trait]
impl<T: Transport> Transport for ObservingTransport<T> {
    async fn execute(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        // Client topology is not disclosed to the upstream.
        parts.headers.remove(&X_FORWARDED_FOR);

        let body = DuplicatedBody::drain(body).await.map_err(|e| {
            error!("Failed to read outgoing request body for {} {}: {}", parts.method, parts.uri, e);
            e
        })?;

        match dump::render_request_out(body.request_copy(&parts)).await {
            Ok(rendered) => {
                info!("Proxy -> upstream request: method={} target={}", parts.method, parts.uri);
                self.emit(ExchangeRecord::new(Direction::OutboundRequest, rendered));
            }
            Err(e) => error!("Failed to dump outgoing request {} {}: {}", parts.method, parts.uri, e),
        }

        let method = parts.method.clone();
        let target = parts.uri.clone();
        let start = Instant::now();
        let result = self.inner.execute(Request::from_parts(parts, body.stream())).await;
        let elapsed = start.elapsed();

        let response = match result {
            Ok(response) => response,
            Err(e) => {
                error!("Upstream request {} {} failed after {:?}: {}", method, target, elapsed, e);
                return Err(e);
            }
        };

        let (parts, body) = response.into_parts();
        let body = DuplicatedBody::drain(body).await.map_err(|e| {
            error!("Failed to read upstream response body for {} {}: {}", method, target, e);
            e
        })?;
        debug!("Buffered {} byte upstream response body for {}", body.len(), target);

        match dump::render_response(body.response_copy(&parts)).await {
            Ok(rendered) => {
                info!("Upstream response: status={} elapsed={:?}", parts.status, elapsed);
                self.emit(ExchangeRecord::new(Direction::InboundResponse, rendered).with_elapsed(elapsed));
            }
            Err(e) => error!("Failed to dump upstream response for {} {}: {}", method, target, e),
        }

        Ok(Response::from_parts(parts, body.stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::full_body;
    use crate::dump::MemoryWriter;
    use bytes::Bytes;
    use futures::stream;
    use http::StatusCode;
    use http_body_util::{BodyExt, StreamBody};
    use hyper::body::Frame;
    use std::sync::Mutex;

    /// Records what reached "the network" and answers with a canned response.
    struct RecordingTransport {
        seen: Mutex<Vec<(http::HeaderMap, Bytes)>>,
        dumps: MemoryWriter,
        dumps_at_execute: Mutex<String>,
        reply: &'static str,
    }

    impl RecordingTransport {
        fn new(dumps: MemoryWriter, reply: &'static str) -> Self {
            Self {
                seen: Mutex::new(Vec::new()),
                dumps,
                dumps_at_execute: Mutex::new(String::new()),
                reply,
            }
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn execute(&self, req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
            *self.dumps_at_execute.lock().unwrap() = self.dumps.contents();
            let (parts, body) = req.into_parts();
            let bytes = body.collect().await.unwrap().to_bytes();
            self.seen.lock().unwrap().push((parts.headers, bytes));

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/xml")
                .body(full_body(self.reply))
                .unwrap())
        }
    }

    struct RefusingTransport;

    #[async_trait]
    impl Transport for RefusingTransport {
        async fn execute(&self, _req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
            Err(ProxyError::Transport("tcp connect error: Connection refused".to_string()))
        }
    }

    struct TruncatingTransport;

    #[async_trait]
    impl Transport for TruncatingTransport {
        async fn execute(&self, _req: Request<ProxyBody>) -> Result<Response<ProxyBody>, ProxyError> {
            let frames = vec![
                Ok(Frame::data(Bytes::from("<xml>po"))),
                Err(ProxyError::BodyRead("connection reset".to_string())),
            ];
            Ok(Response::new(StreamBody::new(stream::iter(frames)).boxed()))
        }
    }

    fn outgoing(body: &'static str) -> Request<ProxyBody> {
        Request::builder()
            .method("POST")
            .uri("https://backend.example/svc")
            .header("host", "backend.example")
            .header("x-forwarded-for", "10.0.0.7")
            .header("x-forwarded-for", "192.168.1.2")
            .body(full_body(body))
            .unwrap()
    }

    #[tokio::test]
    async fn test_bodies_survive_observation() {
        let dumps = MemoryWriter::new();
        let sink = Arc::new(DumpSink::from_writer(dumps.clone(), false));
        let inner = Arc::new(RecordingTransport::new(dumps.clone(), "<xml>pong</xml>"));
        let transport = ObservingTransport::new(inner.clone(), sink);

        let response = transport.execute(outgoing("<xml>ping</xml>")).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("<xml>pong</xml>"));

        let seen = inner.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, Bytes::from("<xml>ping</xml>"));
    }

    #[tokio::test]
    async fn test_forwarded_for_is_stripped() {
        let dumps = MemoryWriter::new();
        let sink = Arc::new(DumpSink::from_writer(dumps.clone(), false));
        let inner = Arc::new(RecordingTransport::new(dumps.clone(), ""));
        let transport = ObservingTransport::new(inner.clone(), sink);

        transport.execute(outgoing("")).await.unwrap();

        let seen = inner.seen.lock().unwrap();
        assert!(seen[0].0.get("x-forwarded-for").is_none());
        assert!(!dumps.contents().contains("X-Forwarded-For"));
    }

    #[tokio::test]
    async fn test_outbound_dump_precedes_execution_and_response_dump() {
        let dumps = MemoryWriter::new();
        let sink = Arc::new(DumpSink::from_writer(dumps.clone(), false));
        let inner = Arc::new(RecordingTransport::new(dumps.clone(), "<xml>pong</xml>"));
        let transport = ObservingTransport::new(inner.clone(), sink);

        transport.execute(outgoing("<xml>ping</xml>")).await.unwrap();

        let at_execute = inner.dumps_at_execute.lock().unwrap().clone();
        assert!(at_execute.contains("[proxy -> upstream request]"));
        assert!(at_execute.contains("<xml>ping</xml>"));
        assert!(!at_execute.contains("[upstream response]"));

        let all = dumps.contents();
        let request_at = all.find("POST /svc HTTP/1.1").unwrap();
        let response_at = all.find("HTTP/1.1 200 OK").unwrap();
        assert!(request_at < response_at);
        assert!(all.contains("Host: backend.example"));
        assert!(all.contains("<xml>pong</xml>"));
    }

    #[tokio::test]
    async fn test_transport_failure_propagates_without_response_dump() {
        let dumps = MemoryWriter::new();
        let sink = Arc::new(DumpSink::from_writer(dumps.clone(), false));
        let transport = ObservingTransport::new(RefusingTransport, sink);

        let err = transport.execute(outgoing("ping")).await.unwrap_err();

        assert!(matches!(err, ProxyError::Transport(ref msg) if msg.contains("Connection refused")));
        let all = dumps.contents();
        assert!(all.contains("[proxy -> upstream request]"));
        assert!(!all.contains("[upstream response]"));
    }

    #[tokio::test]
    async fn test_truncated_response_body_aborts_exchange() {
        let dumps = MemoryWriter::new();
        let sink = Arc::new(DumpSink::from_writer(dumps.clone(), false));
        let transport = ObservingTransport::new(TruncatingTransport, sink);

        let err = transport.execute(outgoing("ping")).await.unwrap_err();

        assert!(matches!(err, ProxyError::BodyRead(_)));
        assert!(!dumps.contents().contains("[upstream response]"));
    }

    struct ClosedStdout;

    impl std::io::Write for ClosedStdout {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_abort_exchange() {
        let sink = Arc::new(DumpSink::from_writer(ClosedStdout, false));
        let inner = Arc::new(RecordingTransport::new(MemoryWriter::new(), "<xml>pong</xml>"));
        let transport = ObservingTransport::new(inner.clone(), sink);

        let response = transport.execute(outgoing("<xml>ping</xml>")).await.unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from("<xml>pong</xml>"));
        assert_eq!(inner.seen.lock().unwrap()[0].1, Bytes::from("<xml>ping</xml>"));
    }

    #[test]
    fn test_error_chain_includes_sources() {
        let plain = ProxyError::Transport("dns error".to_string());
        assert_eq!(error_chain(&plain), "Transport error: dns error");

        let inner = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "Connection refused");
        let outer = ProxyError::Io(inner);
        assert_eq!(error_chain(&outer), "IO error: Connection refused: Connection refused");
    }

    #[tokio::test]
    async fn test_stalled_response_body_hits_timeout() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        // Sends a head promising 100 bytes, delivers 7 and keeps the socket open.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = stream.read(&mut buf).await;
            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\npartial")
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(30)).await;
            drop(stream);
        });

        let transport = HttpTransport::new(&TransportOptions {
            timeout: Duration::from_millis(300),
            ..TransportOptions::default()
        })
        .unwrap();
        let req = Request::builder()
            .uri(format!("http://{}/slow", addr))
            .body(crate::body::empty_body())
            .unwrap();

        let start = Instant::now();
        let err = transport.execute(req).await.unwrap_err();

        assert!(matches!(err, ProxyError::Transport(ref msg) if msg.contains("incomplete")));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_http_transport_builds_in_both_tls_modes() {
        assert!(HttpTransport::new(&TransportOptions::default()).is_ok());

        let insecure = TransportOptions {
            insecure_skip_verify: true,
            ..TransportOptions::default()
        };
        assert!(HttpTransport::new(&insecure).is_ok());
    }
}
