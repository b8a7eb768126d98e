//! Request, response and failure as seen by the proxy layer.

use http::header::PROXY_AUTHORIZATION;
use http::{HeaderMap, Method, StatusCode};
use serde_json::Value;
use std::collections::BTreeMap;
use url::Url;

/// The `proxy` slot of a request's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum ProxyMeta {
    /// No proxy decided yet; the pool may assign one.
    #[default]
    Unset,
    /// Explicitly direct; never proxied.
    Disabled,
    /// A proxy URL, possibly carrying credentials until normalized.
    Url(String),
}

impl ProxyMeta {
    pub fn as_url(&self) -> Option<&str> {
        match self {
            Self::Url(url) => Some(url),
            _ => None,
        }
    }
}

/// An outgoing crawl request.
#[derive(Debug, Clone)]
pub struct CrawlRequest {
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub proxy: ProxyMeta,
    /// Scheduling priority; higher runs sooner.
    pub priority: i32,
    /// Lets the scheduler accept the request even if it was seen before.
    pub dont_filter: bool,
    /// Other metadata carried for the host engine.
    pub meta: BTreeMap<String, Value>,
}

impl CrawlRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            proxy: ProxyMeta::Unset,
            priority: 0,
            dont_filter: false,
            meta: BTreeMap::new(),
        }
    }

    /// Parse `url` and build a GET request for it.
    pub fn get(url: &str) -> Result<Self, url::ParseError> {
        Url::parse(url).map(Self::new)
    }

    pub fn with_proxy(mut self, proxy: ProxyMeta) -> Self {
        self.proxy = proxy;
        self
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn host(&self) -> Option<&str> {
        self.url.host_str()
    }

    /// The proxy URL for log lines.
    pub fn proxy_label(&self) -> &str {
        match &self.proxy {
            ProxyMeta::Url(url) => url,
            ProxyMeta::Disabled => "direct",
            ProxyMeta::Unset => "no proxy",
        }
    }

    pub fn has_proxy_authorization(&self) -> bool {
        self.headers.contains_key(PROXY_AUTHORIZATION)
    }
}

/// A completed response.
#[derive(Debug, Clone)]
pub struct CrawlResponse {
    pub url: Url,
    pub status: StatusCode,
    pub headers: HeaderMap,
}

impl CrawlResponse {
    pub fn new(url: Url, status: StatusCode) -> Self {
        Self {
            url,
            status,
            headers: HeaderMap::new(),
        }
    }
}

/// An error raised while downloading, identified by its type name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFailure {
    pub kind: String,
    pub message: String,
}

impl RequestFailure {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Classify a `reqwest` transport error.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_timeout() {
            "TimeoutError"
        } else if err.is_connect() {
            "ConnectionError"
        } else if err.is_redirect() {
            "RedirectError"
        } else if err.is_body() || err.is_decode() {
            "ResponseError"
        } else {
            "RequestError"
        };
        Self::new(kind, err.to_string())
    }
}

impl std::fmt::Display for RequestFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
