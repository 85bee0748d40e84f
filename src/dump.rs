//! Wire-format dumps of requests and responses and the sink they go to.

use crate::body::{DuplicatedBody, ProxyBody};
use crate::error::ProxyError;
use chrono::{DateTime, Utc};
use http::header::HOST;
use http::{HeaderMap, Request, Response, Version};
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Duration;

const CYAN: &str = "\x1b[36m";
const YELLOW: &str = "\x1b[33m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Request as the client sent it, before any rewriting.
    ClientRequest,
    /// Request as the proxy sends it to the upstream.
    OutboundRequest,
    /// Response as the upstream returned it.
    InboundResponse,
}

impl Direction {
    fn title(&self) -> &'static str {
        match self {
            Direction::ClientRequest => "client request",
            Direction::OutboundRequest => "proxy -> upstream request",
            Direction::InboundResponse => "upstream response",
        }
    }

    fn color(&self) -> &'static str {
        match self {
            Direction::ClientRequest | Direction::OutboundRequest => CYAN,
            Direction::InboundResponse => YELLOW,
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.title())
    }
}

/// One rendered dump. Lives only as long as it takes to write it out.
#[derive(Debug, Clone)]
pub struct ExchangeRecord {
    pub direction: Direction,
    pub dump: Vec<u8>,
    pub timestamp: DateTime<Utc>,
    pub elapsed: Option<Duration>,
}

impl ExchangeRecord {
    pub fn new(direction: Direction, dump: Vec<u8>) -> Self {
        Self {
            direction,
            dump,
            timestamp: Utc::now(),
            elapsed: None,
        }
    }

    pub fn with_elapsed(mut self, elapsed: Duration) -> Self {
        self.elapsed = Some(elapsed);
        self
    }
}

/// Renders a request the way it arrived at the proxy: request line with the
/// request target as received, then headers in order, then the body.
/// Consumes `req`; hand it a log-only copy.
pub async fn render_request(req: Request<ProxyBody>) -> Result<Vec<u8>, ProxyError> {
    let (parts, body) = req.into_parts();
    let body = read_log_body(body).await?;

    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.to_string());

    let mut out = Vec::with_capacity(256 + body.len());
    write_start_line(&mut out, parts.method.as_str(), &target, parts.version);
    write_headers(&mut out, &parts.headers, false);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.bytes());
    Ok(out)
}

/// Renders a request the way it will go out on the wire to the upstream.
/// The URI must be absolute; `Host` is written first, taken from the header
/// if set and from the URI authority otherwise.
pub async fn render_request_out(req: Request<ProxyBody>) -> Result<Vec<u8>, ProxyError> {
    let (parts, body) = req.into_parts();

    let authority = parts
        .uri
        .authority()
        .ok_or_else(|| ProxyError::DumpRender(format!("outgoing URI has no host: {}", parts.uri)))?;
    let host = match parts.headers.get(HOST) {
        Some(value) => value.as_bytes().to_vec(),
        None => authority.as_str().as_bytes().to_vec(),
    };
    let target = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    let body = read_log_body(body).await?;

    let mut out = Vec::with_capacity(256 + body.len());
    write_start_line(&mut out, parts.method.as_str(), &target, parts.version);
    out.extend_from_slice(b"Host: ");
    out.extend_from_slice(&host);
    out.extend_from_slice(b"\r\n");
    write_headers(&mut out, &parts.headers, true);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.bytes());
    Ok(out)
}

/// Renders a response: status line, headers, body. Consumes `resp`.
pub async fn render_response(resp: Response<ProxyBody>) -> Result<Vec<u8>, ProxyError> {
    let (parts, body) = resp.into_parts();
    let body = read_log_body(body).await?;

    let mut out = Vec::with_capacity(256 + body.len());
    out.extend_from_slice(version_str(parts.version).as_bytes());
    out.push(b' ');
    out.extend_from_slice(parts.status.as_str().as_bytes());
    if let Some(reason) = parts.status.canonical_reason() {
        out.push(b' ');
        out.extend_from_slice(reason.as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    write_headers(&mut out, &parts.headers, false);
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body.bytes());
    Ok(out)
}

async fn read_log_body(body: ProxyBody) -> Result<DuplicatedBody, ProxyError> {
    DuplicatedBody::drain(body)
        .await
        .map_err(|e| ProxyError::DumpRender(e.to_string()))
}

fn write_start_line(out: &mut Vec<u8>, method: &str, target: &str, version: Version) {
    out.extend_from_slice(method.as_bytes());
    out.push(b' ');
    out.extend_from_slice(target.as_bytes());
    out.push(b' ');
    out.extend_from_slice(version_str(version).as_bytes());
    out.extend_from_slice(b"\r\n");
}

// HeaderMap iteration yields every value, duplicates in insertion order.
fn write_headers(out: &mut Vec<u8>, headers: &HeaderMap, skip_host: bool) {
    for (name, value) in headers.iter() {
        if skip_host && name == HOST {
            continue;
        }
        out.extend_from_slice(canonical_name(name.as_str()).as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

/// `content-type` -> `Content-Type`. Display only; hyper lowercases names.
fn canonical_name(name: &str) -> String {
    let mut canonical = String::with_capacity(name.len());
    let mut upper = true;
    for c in name.chars() {
        if upper {
            canonical.extend(c.to_uppercase());
        } else {
            canonical.push(c);
        }
        upper = c == '-';
    }
    canonical
}

fn version_str(version: Version) -> &'static str {
    match version {
        Version::HTTP_09 => "HTTP/0.9",
        Version::HTTP_10 => "HTTP/1.0",
        Version::HTTP_2 => "HTTP/2.0",
        Version::HTTP_3 => "HTTP/3.0",
        _ => "HTTP/1.1",
    }
}

/// Console-like output shared by every exchange.
///
/// Safe for concurrent use: a record is framed into one buffer and written
/// with a single `write_all` while the writer lock is held, so two dumps
/// never interleave byte-wise.
pub struct DumpSink {
    writer: Mutex<Box<dyn Write + Send>>,
    color: bool,
}

impl DumpSink {
    pub fn stdout(color: bool) -> Self {
        Self::from_writer(std::io::stdout(), color)
    }

    pub fn from_writer<W>(writer: W, color: bool) -> Self
    where
        W: Write + Send + 'static,
    {
        Self {
            writer: Mutex::new(Box::new(writer)),
            color,
        }
    }

    pub fn emit(&self, record: &ExchangeRecord) -> Result<(), ProxyError> {
        let framed = self.frame(record);

        let mut writer = self
            .writer
            .lock()
            .map_err(|_| ProxyError::DumpRender("dump sink lock poisoned".to_string()))?;
        writer
            .write_all(framed.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| ProxyError::DumpRender(e.to_string()))
    }

    fn frame(&self, record: &ExchangeRecord) -> String {
        let dump = String::from_utf8_lossy(&record.dump);
        let mut header = format!(
            "┌--- [{}] {}",
            record.direction,
            record.timestamp.format("%Y-%m-%dT%H:%M:%S%.3fZ")
        );
        if let Some(elapsed) = record.elapsed {
            header.push_str(&format!(" ({:?})", elapsed));
        }
        header.push_str(" ---");
        let footer = format!("└{}", "-".repeat(header.chars().count().saturating_sub(1)));

        if self.color {
            format!(
                "{}\n{}{}{}\n{}\n",
                header,
                record.direction.color(),
                dump,
                RESET,
                footer
            )
        } else {
            format!("{}\n{}\n{}\n", header, dump, footer)
        }
    }
}

/// In-memory writer for a [`DumpSink`]; clones share the same buffer.
/// Intended for tests that need to read back what was dumped.
#[derive(Clone, Default)]
pub struct MemoryWriter {
    buffer: Arc<Mutex<Vec<u8>>>,
}

impl MemoryWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        match self.buffer.lock() {
            Ok(buffer) => String::from_utf8_lossy(&buffer).into_owned(),
            Err(poisoned) => String::from_utf8_lossy(&poisoned.into_inner()).into_owned(),
        }
    }
}

impl Write for MemoryWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut buffer = self
            .buffer
            .lock()
            .map_err(|_| std::io::Error::other("memory writer lock poisoned"))?;
        buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
