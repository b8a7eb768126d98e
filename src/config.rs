//! Configuration for the proxy pool.
//!
//! A configuration is resolved once: explicit defaults from [`Default`],
//! overridden field by field by whatever the caller supplies through
//! [`ProxyPoolConfig::builder`] or [`ProxyPoolConfig::from_json`].

use crate::error::{ProxyError, Result};
use crate::proxy::AuthEncoding;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Where proxies are loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    /// `<scheme>_proxy` and `no_proxy` environment variables.
    #[default]
    Environment,
    /// The static `proxies` mapping of this configuration.
    Settings,
    /// A query against an external document store.
    Document,
}

/// How proxies are invalidated, reloaded and exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    /// Cycle a fixed list, filter out invalidated proxies.
    #[default]
    Default,
    /// Walk a reloadable list once, remove invalidated proxies, reload when exhausted.
    Reloading,
}

/// What happens to a request whose scheme has no proxy left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExhaustionPolicy {
    /// Drop the request, keep crawling.
    SkipRequest,
    /// Drop the request and close the crawl session.
    AbortSession,
}

/// A proxy list, or a single literal such as `"*"` for the `no` scheme.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ProxyList {
    Literal(String),
    List(Vec<String>),
}

impl ProxyList {
    pub fn entries(&self) -> &[String] {
        match self {
            Self::Literal(value) => std::slice::from_ref(value),
            Self::List(values) => values,
        }
    }
}

impl From<Vec<String>> for ProxyList {
    fn from(values: Vec<String>) -> Self {
        Self::List(values)
    }
}

impl From<&str> for ProxyList {
    fn from(value: &str) -> Self {
        Self::Literal(value.to_string())
    }
}

/// Document retrieval parameters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentQuery {
    pub filter: Option<Value>,
    pub projection: Option<Value>,
    pub sort: Option<Value>,
    pub skip: u64,
    /// Zero means no limit.
    pub limit: u64,
}

/// Connection parameters of the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentStoreConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Cluster name, for gateways serving several.
    pub data_source: Option<String>,
    pub database: String,
    pub collection: String,
    /// Defaults to `database`.
    pub auth_source: Option<String>,
    pub query: DocumentQuery,
    pub timeout_secs: u64,
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            tls: false,
            username: None,
            password: None,
            data_source: None,
            database: "proxy_pool".to_string(),
            collection: "proxies".to_string(),
            auth_source: None,
            query: DocumentQuery::default(),
            timeout_secs: 10,
        }
    }
}

impl DocumentStoreConfig {
    pub fn auth_source(&self) -> &str {
        self.auth_source.as_deref().unwrap_or(&self.database)
    }

    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Configuration for the proxy pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyPoolConfig {
    /// Proxy handling is off unless this is set.
    pub enabled: bool,
    /// Text encoding of proxy credentials before base64.
    pub auth_encoding: String,
    pub storage: StorageBackend,
    pub strategy: StrategyKind,
    /// Overrides the strategy's own exhaustion policy.
    pub exhaustion_policy: Option<ExhaustionPolicy>,
    /// Static proxies by scheme; `no` holds bypass suffixes or `*`.
    pub proxies: BTreeMap<String, ProxyList>,
    pub document_store: DocumentStoreConfig,
    /// Number of hosts whose bypass decision is remembered.
    pub bypass_cache_size: usize,
    /// Response statuses that mean the proxy is blocked.
    pub invalidated_status_codes: Vec<u16>,
    /// Failure type names that mean the proxy is blocked.
    pub invalidated_exceptions: Vec<String>,
    /// Signals sent synchronously when a block is detected.
    pub block_signals: Vec<String>,
    /// Signals sent and awaited when a block is detected.
    pub block_signals_deferred: Vec<String>,
    /// Added to the priority of a recycled request.
    pub retry_priority_adjust: i32,
    /// Resubmissions allowed per request by the HTTP middleware.
    pub retry_count: usize,
    /// Per-attempt timeout of the HTTP middleware, in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for ProxyPoolConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            auth_encoding: "latin-1".to_string(),
            storage: StorageBackend::default(),
            strategy: StrategyKind::default(),
            exhaustion_policy: None,
            proxies: BTreeMap::new(),
            document_store: DocumentStoreConfig::default(),
            bypass_cache_size: 1024,
            invalidated_status_codes: Vec::new(),
            invalidated_exceptions: Vec::new(),
            block_signals: Vec::new(),
            block_signals_deferred: Vec::new(),
            retry_priority_adjust: -1,
            retry_count: 3,
            request_timeout_ms: 10_000,
        }
    }
}

impl ProxyPoolConfig {
    /// Create a new configuration builder.
    pub fn builder() -> ProxyPoolConfigBuilder {
        ProxyPoolConfigBuilder::new()
    }

    /// Resolve a JSON document of overrides against the defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| ProxyError::Config(e.to_string()))
    }

    /// Resolve `auth_encoding` to an encoding.
    pub fn auth_encoding(&self) -> Result<AuthEncoding> {
        AuthEncoding::for_label(&self.auth_encoding)
    }

    pub fn bypass_cache_capacity(&self) -> Result<NonZeroUsize> {
        NonZeroUsize::new(self.bypass_cache_size)
            .ok_or_else(|| ProxyError::Config("bypass_cache_size must be positive".to_string()))
    }

    /// Per-attempt timeout of the HTTP middleware.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Check the configuration before a session is built from it.
    pub fn validate(&self) -> Result<()> {
        if !self.enabled {
            return Err(ProxyError::NotConfigured);
        }
        self.auth_encoding()?;
        self.bypass_cache_capacity()?;
        if self.request_timeout_ms == 0 {
            return Err(ProxyError::Config("request_timeout_ms must be positive".to_string()));
        }
        if self.storage == StorageBackend::Document {
            let store = &self.document_store;
            if store.database.is_empty() || store.collection.is_empty() {
                return Err(ProxyError::Config(
                    "document store needs a database and a collection".to_string(),
                ));
            }
            if store.password.is_some() && store.username.is_none() {
                return Err(ProxyError::Config(
                    "document store password given without a username".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Builder for `ProxyPoolConfig`.
pub struct ProxyPoolConfigBuilder {
    config: ProxyPoolConfig,
}

impl ProxyPoolConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self {
            config: ProxyPoolConfig::default(),
        }
    }

    /// Set whether proxy handling is on.
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.enabled = enabled;
        self
    }

    /// Set the text encoding of proxy credentials.
    pub fn auth_encoding(mut self, label: impl Into<String>) -> Self {
        self.config.auth_encoding = label.into();
        self
    }

    /// Set the storage proxies are loaded from.
    pub fn storage(mut self, storage: StorageBackend) -> Self {
        self.config.storage = storage;
        self
    }

    /// Set the invalidation strategy.
    pub fn strategy(mut self, strategy: StrategyKind) -> Self {
        self.config.strategy = strategy;
        self
    }

    /// Override the exhaustion policy of the strategy.
    pub fn exhaustion_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.config.exhaustion_policy = Some(policy);
        self
    }

    /// Set the static proxies of one scheme.
    pub fn proxies(mut self, scheme: impl Into<String>, proxies: Vec<impl Into<String>>) -> Self {
        let proxies = proxies.into_iter().map(Into::into).collect::<Vec<String>>();
        self.config.proxies.insert(scheme.into(), ProxyList::List(proxies));
        self
    }

    /// Set the bypass suffixes (or `*`).
    pub fn no_proxy(mut self, entries: Vec<impl Into<String>>) -> Self {
        let entries = entries.into_iter().map(Into::into).collect::<Vec<String>>();
        self.config.proxies.insert("no".to_string(), ProxyList::List(entries));
        self
    }

    /// Set the document store settings.
    pub fn document_store(mut self, store: DocumentStoreConfig) -> Self {
        self.config.document_store = store;
        self
    }

    /// Set how many hosts keep their bypass decision.
    pub fn bypass_cache_size(mut self, size: usize) -> Self {
        self.config.bypass_cache_size = size;
        self
    }

    /// Set the response statuses that mark a proxy as blocked.
    pub fn invalidated_status_codes(mut self, codes: Vec<u16>) -> Self {
        self.config.invalidated_status_codes = codes;
        self
    }

    /// Set the failure type names that mark a proxy as blocked.
    pub fn invalidated_exceptions(mut self, names: Vec<impl Into<String>>) -> Self {
        self.config.invalidated_exceptions = names.into_iter().map(Into::into).collect();
        self
    }

    /// Set the signals sent when a block is detected.
    pub fn block_signals(mut self, signals: Vec<impl Into<String>>) -> Self {
        self.config.block_signals = signals.into_iter().map(Into::into).collect();
        self
    }

    /// Set the signals sent and awaited when a block is detected.
    pub fn block_signals_deferred(mut self, signals: Vec<impl Into<String>>) -> Self {
        self.config.block_signals_deferred = signals.into_iter().map(Into::into).collect();
        self
    }

    /// Set the priority delta of recycled requests.
    pub fn retry_priority_adjust(mut self, delta: i32) -> Self {
        self.config.retry_priority_adjust = delta;
        self
    }

    /// Set the number of times to resubmit a blocked request.
    pub fn retry_count(mut self, count: usize) -> Self {
        self.config.retry_count = count;
        self
    }

    /// Set the per-attempt request timeout, kept to the millisecond.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> ProxyPoolConfig {
        self.config
    }
}

impl Default for ProxyPoolConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
