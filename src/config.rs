use crate::director::Target;
use crate::error::ProxyError;
use crate::transport::TransportOptions;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        LogLevel::Info
    }
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

impl Default for LogFormat {
    fn default() -> Self {
        LogFormat::Text
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    Stderr,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

/// Wire dump rendering options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
    /// Colour dumps with ANSI escapes (cyan requests, yellow responses)
    #[serde(default = "default_true")]
    pub color: bool,
}

impl Default for DumpConfig {
    fn default() -> Self {
        Self { color: true }
    }
}

fn default_true() -> bool {
    true
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
    /// Absolute URL of the single upstream, e.g. `https://example.com/service`
    #[serde(default)]
    pub target: Option<String>,
    /// Skip upstream certificate verification, for self-signed test backends
    #[serde(default)]
    pub insecure_skip_verify: bool,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub pool_max_idle_per_host: Option<usize>,
    #[serde(default)]
    pub pool_idle_timeout_secs: Option<u64>,
    #[serde(default)]
    pub dump: DumpConfig,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            target: None,
            insecure_skip_verify: false,
            timeout_secs: Some(30),
            pool_max_idle_per_host: Some(10),
            pool_idle_timeout_secs: Some(90),
            dump: DumpConfig::default(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Accepts `host:port`, `:port` (all interfaces) or a bare port.
    pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ProxyError> {
        let addr = addr.trim();
        let normalized = if let Some(port) = addr.strip_prefix(':') {
            format!("0.0.0.0:{}", port)
        } else if addr.chars().all(|c| c.is_ascii_digit()) && !addr.is_empty() {
            format!("0.0.0.0:{}", addr)
        } else {
            addr.to_string()
        };

        normalized
            .parse()
            .map_err(|e| ProxyError::Config(format!("Invalid listen address '{}': {}", addr, e)))
    }

    /// The upstream target; a missing or unusable URL is a configuration error.
    pub fn target(&self) -> Result<Target, ProxyError> {
        match self.target.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => Target::parse(url),
            _ => Err(ProxyError::Config("A target URL is required (--target)".to_string())),
        }
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        self.target()?;

        if self.timeout_secs == Some(0) {
            return Err(ProxyError::Config("timeout_secs must be greater than zero".to_string()));
        }

        if let Some(logging) = &self.logging {
            for target in logging.targets.iter().flatten() {
                if target.output_type == LogOutputType::File && target.path.is_none() {
                    return Err(ProxyError::Config("File log target requires a path".to_string()));
                }
            }
        }

        Ok(())
    }

    pub fn transport_options(&self) -> TransportOptions {
        let defaults = TransportOptions::default();
        TransportOptions {
            timeout: self.timeout_secs.map(Duration::from_secs).unwrap_or(defaults.timeout),
            insecure_skip_verify: self.insecure_skip_verify,
            pool_max_idle_per_host: self.pool_max_idle_per_host.unwrap_or(defaults.pool_max_idle_per_host),
            pool_idle_timeout: self
                .pool_idle_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.pool_idle_timeout),
        }
    }
}
