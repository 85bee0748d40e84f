use crate::body::{full_body, ProxyBody};
use http::header::{HeaderMap, HeaderName, HeaderValue, CONNECTION};
use hyper::{Response, StatusCode};
use std::net::IpAddr;

static X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");

/// Headers that describe a single connection and never travel past a proxy.
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

/// Canned responses produced by the proxy itself
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Creates a standard internal server error response
    pub fn internal_server_error() -> Response<ProxyBody> {
        Self::error(StatusCode::INTERNAL_SERVER_ERROR, "Server Error")
    }

    /// Creates a bad gateway response
    pub fn bad_gateway() -> Response<ProxyBody> {
        Self::error(StatusCode::BAD_GATEWAY, "Proxy Error")
    }

    /// Creates a generic error response with custom status and message
    pub fn error(status: StatusCode, message: &str) -> Response<ProxyBody> {
        let mut response = Response::new(full_body(format!("{}\n", message)));
        *response.status_mut() = status;
        response.headers_mut().insert(
            http::header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
        response
    }
}

/// Removes hop-by-hop headers, including any named in `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<HeaderName> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in named {
        headers.remove(&name);
    }
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Appends the client address to `X-Forwarded-For`, joining any prior chain.
pub fn append_forwarded_for(headers: &mut HeaderMap, client_ip: IpAddr) {
    let prior: Vec<&str> = headers
        .get_all(&X_FORWARDED_FOR)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .collect();

    let chain = if prior.is_empty() {
        client_ip.to_string()
    } else {
        format!("{}, {}", prior.join(", "), client_ip)
    };

    if let Ok(value) = HeaderValue::from_str(&chain) {
        headers.insert(X_FORWARDED_FOR.clone(), value);
    }
}
