//! Shared fixtures: an in-process upstream and a proxy bound to an ephemeral port.

#![allow(dead_code)]

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use wiretap_proxy::config::Config;
use wiretap_proxy::dump::{DumpSink, MemoryWriter};
use wiretap_proxy::proxy::ProxyFactory;

/// What the upstream actually received.
#[derive(Debug, Clone)]
pub struct Received {
    pub method: String,
    pub path_and_query: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub struct Backend {
    pub addr: SocketAddr,
    pub received: Arc<Mutex<Vec<Received>>>,
}

impl Backend {
    pub fn received(&self) -> Vec<Received> {
        self.received.lock().unwrap().clone()
    }
}

/// Starts an upstream answering 200 with `reply`, or echoing the request
/// body when `reply` is `None`.
pub async fn start_backend(reply: Option<&'static str>) -> Backend {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let received = Arc::new(Mutex::new(Vec::new()));
    let log = received.clone();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let log = log.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let log = log.clone();
                    async move {
                        let (parts, body) = req.into_parts();
                        let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();
                        log.lock().unwrap().push(Received {
                            method: parts.method.to_string(),
                            path_and_query: parts
                                .uri
                                .path_and_query()
                                .map(|pq| pq.to_string())
                                .unwrap_or_default(),
                            headers: parts.headers,
                            body: body.clone(),
                        });

                        let reply = match reply {
                            Some(fixed) => Bytes::from(fixed),
                            None => body,
                        };
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(StatusCode::OK)
                                .header("content-type", "text/xml")
                                .body(Full::new(reply))
                                .unwrap(),
                        )
                    }
                });
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    Backend { addr, received }
}

/// Starts the proxy in front of `target`; returns its address and the dump output.
pub async fn start_proxy(target: String) -> (SocketAddr, MemoryWriter) {
    start_proxy_with_timeout(target, 5).await
}

pub async fn start_proxy_with_timeout(target: String, timeout_secs: u64) -> (SocketAddr, MemoryWriter) {
    let mut config = Config::default();
    config.target = Some(target);
    config.listen_addr = "127.0.0.1:0".parse().unwrap();
    config.timeout_secs = Some(timeout_secs);

    let dumps = MemoryWriter::new();
    let sink = Arc::new(DumpSink::from_writer(dumps.clone(), false));
    let proxy = ProxyFactory::create_proxy_with_sink(&config, sink).unwrap();

    let listener = TcpListener::bind(proxy.addr()).await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(proxy.serve(listener));

    (addr, dumps)
}

pub fn client() -> Client<HttpConnector, Full<Bytes>> {
    Client::builder(TokioExecutor::new()).build_http()
}

pub async fn send(
    client: &Client<HttpConnector, Full<Bytes>>,
    method: &str,
    url: String,
    body: impl Into<Bytes>,
) -> (StatusCode, Bytes) {
    let req = Request::builder()
        .method(method)
        .uri(url)
        .body(Full::new(body.into()))
        .unwrap();
    let response = client.request(req).await.unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

/// Splits sink output into framed dumps, in write order.
pub fn frames(output: &str) -> Vec<String> {
    output
        .split("┌--- ")
        .filter(|frame| !frame.is_empty())
        .map(|frame| frame.to_string())
        .collect()
}
