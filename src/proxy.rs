use crate::body::ProxyBody;
use crate::common::{append_forwarded_for, strip_hop_by_hop, ResponseBuilder};
use crate::config::Config;
use crate::director::Director;
use crate::dump::DumpSink;
use crate::error::ProxyError;
use crate::inbound::InboundObserver;
use crate::transport::{HttpTransport, ObservingTransport, Transport};
use futures::FutureExt;
use hyper::body::Body;
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use log::{debug, error, info, warn};
use std::any::Any;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Turns pipeline failures into responses so every client request ends with
/// a well-formed HTTP reply.
pub struct ErrorBoundary;

impl ErrorBoundary {
    pub fn respond(err: &ProxyError) -> Response<ProxyBody> {
        match err {
            ProxyError::ClientBodyRead(_) => {
                error!("Rejecting request with unreadable body: {}", err);
                ResponseBuilder::internal_server_error()
            }
            // Already logged with method, target and elapsed by the observing transport.
            ProxyError::Transport(_) => {
                debug!("Answering 502 for upstream failure: {}", err);
                ResponseBuilder::bad_gateway()
            }
            _ => {
                error!("Error during proxying: {}", err);
                ResponseBuilder::bad_gateway()
            }
        }
    }

    pub fn respond_to_panic(panic: Box<dyn Any + Send>) -> Response<ProxyBody> {
        let message = panic
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| panic.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        error!("Proxy pipeline panicked: {}", message);
        ResponseBuilder::bad_gateway()
    }
}

/// Intercepting proxy: observe the client request, point it at the target,
/// send it through the (observing) transport.
pub struct InterceptProxy {
    addr: SocketAddr,
    director: Director,
    observer: InboundObserver,
    transport: Arc<dyn Transport>,
}

impl InterceptProxy {
    pub fn new(
        addr: SocketAddr,
        director: Director,
        observer: InboundObserver,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            addr,
            director,
            observer,
            transport,
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn director(&self) -> &Director {
        &self.director
    }

    pub async fn run(self) -> Result<(), ProxyError> {
        info!("Binding HTTP listener to: {}", self.addr);
        let listener = TcpListener::bind(self.addr).await.map_err(ProxyError::Io)?;
        self.serve(listener).await
    }

    /// Serves on an already bound listener until the task is dropped.
    pub async fn serve(self, listener: TcpListener) -> Result<(), ProxyError> {
        let local_addr = listener.local_addr().map_err(ProxyError::Io)?;
        info!("Intercepting proxy listening on: http://{}", local_addr);
        info!("Forwarding requests to: {}", self.director.target());

        let proxy = Arc::new(self);

        loop {
            let (stream, remote_addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    continue;
                }
            };
            debug!("Accepted connection from: {}", remote_addr);

            let proxy = proxy.clone();
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |req| {
                    let proxy = proxy.clone();
                    async move { Ok::<_, Infallible>(proxy.handle(req, remote_addr).await) }
                });

                if let Err(e) = ServerBuilder::new()
                    .keep_alive(true)
                    .serve_connection(io, service)
                    .await
                {
                    debug!("Error serving connection from {}: {}", remote_addr, e);
                }
            });
        }
    }

    /// Handles one exchange. Always yields a response.
    pub async fn handle<B>(&self, req: Request<B>, remote_addr: SocketAddr) -> Response<ProxyBody>
    where
        B: Body,
        B::Error: std::fmt::Display,
    {
        let req = match self.observer.observe(req, remote_addr).await {
            Ok(req) => req,
            Err(e) => return ErrorBoundary::respond(&e),
        };

        match AssertUnwindSafe(self.forward(req, remote_addr)).catch_unwind().await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => ErrorBoundary::respond(&e),
            Err(panic) => ErrorBoundary::respond_to_panic(panic),
        }
    }

    async fn forward(&self, req: Request<ProxyBody>, remote_addr: SocketAddr) -> Result<Response<ProxyBody>, ProxyError> {
        let (mut parts, body) = req.into_parts();

        self.director.direct(&mut parts);
        strip_hop_by_hop(&mut parts.headers);
        append_forwarded_for(&mut parts.headers, remote_addr.ip());

        let mut response = self.transport.execute(Request::from_parts(parts, body)).await?;
        strip_hop_by_hop(response.headers_mut());

        Ok(response)
    }
}

pub struct ProxyFactory;

impl ProxyFactory {
    /// Wires the proxy with dumps going to stdout.
    pub fn create_proxy(config: &Config) -> Result<InterceptProxy, ProxyError> {
        let sink = Arc::new(DumpSink::stdout(config.dump.color));
        Self::create_proxy_with_sink(config, sink)
    }

    pub fn create_proxy_with_sink(config: &Config, sink: Arc<DumpSink>) -> Result<InterceptProxy, ProxyError> {
        config.validate()?;
        let target = config.target()?;
        info!("Creating intercepting proxy for target: {}", target);

        let options = config.transport_options();
        debug!(
            "Transport configuration - timeout: {:?}, insecure_skip_verify: {}, pool_max_idle_per_host: {}",
            options.timeout, options.insecure_skip_verify, options.pool_max_idle_per_host
        );
        if options.insecure_skip_verify {
            warn!("TLS certificate verification towards the upstream is disabled");
        }

        let transport = ObservingTransport::new(HttpTransport::new(&options)?, sink.clone());

        Ok(InterceptProxy::new(
            config.listen_addr,
            Director::new(target),
            InboundObserver::new(sink),
            Arc::new(transport),
        ))
    }
}
