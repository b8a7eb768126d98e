//! # crawler-proxy-pool
//!
//! Proxy rotation for crawlers.
//!
//! This library selects an upstream proxy for every outgoing crawl request,
//! attaches its credentials, detects blocked proxies from responses and
//! failures, invalidates them and recycles the request through another
//! proxy. Proxies come from the environment, from the configuration or from
//! a document store, and are reloaded when a scheme runs dry.
//!
//! [`ProxySession`] is the entry point for crawl engines;
//! [`ProxyRotationMiddleware`] plugs the same machinery into a
//! `reqwest-middleware` client.

pub mod bypass;
pub mod config;
pub mod crawler;
pub mod error;
pub mod inspector;
pub mod middleware;
pub mod proxy;
pub mod request;
pub mod selector;
pub mod session;
pub mod signals;
pub mod storage;
pub mod strategy;

pub use bypass::BypassRules;
pub use config::{
    DocumentQuery, DocumentStoreConfig, ExhaustionPolicy, ProxyList, ProxyPoolConfig,
    ProxyPoolConfigBuilder, StorageBackend, StrategyKind,
};
pub use crawler::{CrawlContext, MemoryStats, SessionControl, SessionHandle, StatsCollector};
pub use error::{ProxyError, Result};
pub use inspector::{BlockCause, BlockInspector, Inspection};
pub use middleware::ProxyRotationMiddleware;
pub use proxy::{AuthEncoding, Credential, ProxyEntry, ProxyRecord};
pub use request::{CrawlRequest, CrawlResponse, ProxyMeta, RequestFailure};
pub use selector::{Action, ProxySelector};
pub use session::ProxySession;
pub use signals::{BlockEvent, SignalBus, SignalDispatcher, SignalResult};
pub use storage::{IterationMode, LoadedProxies, ProxyPool, ProxySource};
pub use strategy::{create_strategy, DefaultStrategy, InvalidationReason, ProxyStrategy, ReloadingStrategy};
