use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("URI error: {0}")]
    Uri(String),

    /// The client's request body could not be read to the end.
    #[error("Client body read error: {0}")]
    ClientBodyRead(String),

    /// A body further down the pipeline (outgoing request or upstream
    /// response) failed mid-read.
    #[error("Body read error: {0}")]
    BodyRead(String),

    /// DNS, connect, TLS, timeout or reset while talking to the upstream.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Dump render error: {0}")]
    DumpRender(String),
}
