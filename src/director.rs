use crate::error::ProxyError;
use http::header::HOST;
use http::request::Parts;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderValue, Uri};
use std::sync::Arc;
use url::Url;

/// The fixed upstream every request is sent to. Parsed once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    scheme: Scheme,
    authority: Authority,
    path: String,
    host_header: HeaderValue,
}

impl Target {
    /// Parses an absolute `http`/`https` URL.
    pub fn parse(target_url: &str) -> Result<Self, ProxyError> {
        let url = Url::parse(target_url)
            .map_err(|e| ProxyError::Config(format!("Invalid target URL '{}': {}", target_url, e)))?;

        let scheme = match url.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => {
                return Err(ProxyError::Config(format!(
                    "Unsupported target scheme '{}', expected http or https",
                    other
                )));
            }
        };

        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::Config(format!("Target URL has no host: {}", target_url)))?;
        let authority_str = match url.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        };
        let authority: Authority = authority_str
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProxyError::Uri(e.to_string()))?;
        let host_header = HeaderValue::from_str(authority.as_str())
            .map_err(|e| ProxyError::Config(format!("Invalid target host: {}", e)))?;

        Ok(Self {
            scheme,
            authority,
            path: url.path().to_string(),
            host_header,
        })
    }

    pub fn scheme(&self) -> &Scheme {
        &self.scheme
    }

    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl std::fmt::Display for Target {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}{}", self.scheme, self.authority, self.path)
    }
}

/// Points inbound requests at the [`Target`].
#[derive(Debug, Clone)]
pub struct Director {
    target: Arc<Target>,
}

impl Director {
    pub fn new(target: Target) -> Self {
        Self {
            target: Arc::new(target),
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Replaces scheme, authority and path with the target's and sets `Host`.
    /// The query string, method, other headers and the body are left alone.
    pub fn direct(&self, parts: &mut Parts) {
        parts.uri = self.rewrite_uri(&parts.uri);
        // HTTP/1.1 routes on Host independently of the request line.
        parts.headers.insert(HOST, self.target.host_header.clone());
    }

    fn rewrite_uri(&self, original: &Uri) -> Uri {
        let path = if self.target.path.is_empty() {
            "/"
        } else {
            self.target.path.as_str()
        };
        let path_and_query = match original.query() {
            Some(query) => format!("{}?{}", path, query),
            None => path.to_string(),
        };

        // Path from a parsed URL plus query from a parsed URI: always valid.
        let path_and_query = PathAndQuery::try_from(path_and_query)
            .unwrap_or_else(|_| PathAndQuery::from_static("/"));

        Uri::builder()
            .scheme(self.target.scheme.clone())
            .authority(self.target.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .unwrap_or_else(|_| original.clone())
    }
}
