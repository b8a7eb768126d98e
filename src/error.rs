//! Error types for the crawler-proxy-pool crate.

use crate::inspector::BlockCause;

use thiserror::Error;

/// Errors raised while loading, selecting or invalidating proxies.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// The scheme has no untried proxy left, even after a reload.
    #[error("{scheme} proxies are exhausted")]
    Exhausted { scheme: String },

    /// A response or failure was classified as a blocked proxy.
    #[error("proxy blocked: {cause}")]
    Blocked { cause: BlockCause },

    /// A strategy was paired with a storage it cannot drive.
    #[error("storage {storage} is not supported by strategy {strategy}")]
    StorageUnsupported {
        strategy: &'static str,
        storage: &'static str,
    },

    /// Every scheme is empty after a reload; the session has been stopped.
    #[error("all proxies are depleted")]
    Depleted,

    /// The request was dropped after the exhaustion policy ran.
    #[error("request ignored, {scheme} proxies are exhausted")]
    RequestIgnored { scheme: String },

    /// Proxy handling is disabled by configuration.
    #[error("proxy pool is not enabled")]
    NotConfigured,

    /// A proxy URL that cannot be split into scheme, credentials and host.
    #[error("invalid proxy url {url:?}: {reason}")]
    InvalidProxyUrl { url: String, reason: &'static str },

    /// No encoding is known under this label.
    #[error("unknown credential encoding {0:?}")]
    UnknownEncoding(String),

    /// The credentials contain characters the encoding cannot represent.
    #[error("credentials cannot be encoded as {encoding}")]
    Encoding { encoding: String },

    /// A credential token that is not a valid header value.
    #[error("invalid header value: {0}")]
    Header(#[from] http::header::InvalidHeaderValue),

    /// Rejected by `ProxyPoolConfig::validate` or while parsing it.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The storage was used before `open` or after `close`.
    #[error("proxy storage is not open")]
    NotOpen,

    /// Transport failure talking to the document store.
    #[error("document store request failed: {0}")]
    Store(#[from] reqwest::Error),

    /// The document store answered with something we cannot read.
    #[error("malformed document store payload: {0}")]
    Document(#[from] serde_json::Error),
}

/// Result type alias for proxy pool operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
