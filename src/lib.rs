pub mod body;
pub mod common;
pub mod config;
pub mod director;
pub mod dump;
pub mod error;
pub mod inbound;
pub mod logging;
pub mod proxy;
pub mod transport;

pub use config::Config;
pub use error::ProxyError;
pub use proxy::{InterceptProxy, ProxyFactory};
