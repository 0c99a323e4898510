use std::sync::Arc;
use thiserror::Error;

use crate::dns::wire::WireError;

pub type Result<T> = std::result::Result<T, WardenError>;

/// Unified error type for the Warden DNS proxy.
///
/// The type is `Clone` because resolved results travel through broadcast
/// channels (single-flight) and may be retained by the cache layer; plain
/// `std::io::Error` is therefore wrapped in an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum WardenError {
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("wire format error: {0}")]
    Wire(#[from] WireError),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid upstream: {0}")]
    InvalidUpstream(String),

    #[error("upstream {0} failed: {1}")]
    Upstream(String, String),

    #[error("no upstream answered within the deadline")]
    UpstreamTimeout,

    #[error("request was cancelled")]
    Cancelled,

    #[error("cache error: {0}")]
    Cache(String),

    #[error("redis error: {0}")]
    Redis(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("blocklist error: {0}")]
    Blocklist(String),

    #[error("startup error: {0}")]
    Startup(String),
}

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        WardenError::Io(Arc::new(err))
    }
}
