//! Invalidation strategies.
//!
//! A strategy decides what invalidating a proxy does to the pool, how the
//! pool is reloaded once a scheme runs dry, and what happens to a request
//! whose scheme stays exhausted. Every strategy declares the storages it can
//! drive; the pairing is checked once, when the selector is built.

mod default;
mod reloading;

pub use default::DefaultStrategy;
pub use reloading::ReloadingStrategy;

use crate::config::{ExhaustionPolicy, StorageBackend, StrategyKind};
use crate::crawler::CrawlContext;
use crate::error::{ProxyError, Result};
use crate::inspector::BlockCause;
use crate::proxy::{ProxyEntry, ProxyRecord};
use crate::request::CrawlRequest;
use crate::storage::ProxyPool;

use async_trait::async_trait;
use log::{debug, error, warn};
use std::fmt;

/// Why a proxy was invalidated; the label ends up in the stats key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// A failure, by type name.
    Exception(String),
    /// A literal reason such as a status code.
    Literal(String),
    Other,
}

impl InvalidationReason {
    pub fn label(&self) -> &str {
        match self {
            Self::Exception(kind) => kind,
            Self::Literal(reason) => reason,
            Self::Other => "other",
        }
    }
}

impl From<&BlockCause> for InvalidationReason {
    fn from(cause: &BlockCause) -> Self {
        match cause {
            BlockCause::Status(code) => Self::Literal(code.to_string()),
            BlockCause::Exception { kind, .. } => Self::Exception(kind.clone()),
        }
    }
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Trait for invalidation strategies
#[async_trait]
pub trait ProxyStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Storages this strategy can drive.
    fn supported_storages(&self) -> &'static [StorageBackend];

    fn supports(&self, backend: StorageBackend) -> bool {
        self.supported_storages().contains(&backend)
    }

    fn exhaustion_policy(&self) -> ExhaustionPolicy;

    /// Take `entry` out of rotation. Returns false if it was already out.
    fn discard(&self, pool: &mut ProxyPool, entry: ProxyEntry) -> bool;

    /// Invalidate `entry` and count it under `proxy/<scheme>/invalidated/<reason>`.
    ///
    /// Invalidating the same entry again changes nothing.
    fn invalidate(
        &self,
        pool: &mut ProxyPool,
        entry: ProxyEntry,
        reason: &InvalidationReason,
        ctx: &CrawlContext,
    ) -> bool {
        let key = format!("proxy/{}/invalidated/{}", entry.scheme, reason.label());
        debug!("Proxy {} is invalidated because of {}", entry, reason);
        if !self.discard(pool, entry) {
            return false;
        }
        ctx.stats.inc_value(&key, 1);
        true
    }

    /// Reload the pool from its source, filtered through the invalidated set.
    ///
    /// Returns false, after stopping the crawl, if no scheme has a usable
    /// proxy left. A failed load leaves the pool untouched.
    async fn reload(&self, pool: &mut ProxyPool, ctx: &CrawlContext) -> Result<bool> {
        let loaded = pool.load().await?;
        pool.replace(loaded);
        debug!("Proxies reloaded by strategy {}: {:?}", self.name(), pool.counts());
        if pool.is_depleted() {
            error!("All proxies are invalidated, stopping the crawl");
            ctx.control.stop();
            return Ok(false);
        }
        Ok(true)
    }

    /// Next proxy for `scheme`, reloading once if the scheme has run dry.
    async fn retrieve(
        &self,
        pool: &mut ProxyPool,
        scheme: &str,
        ctx: &CrawlContext,
    ) -> Result<ProxyRecord> {
        if let Some(record) = pool.retrieve(scheme) {
            return Ok(record);
        }
        debug!("{} proxies ran dry, reloading", scheme);
        if !self.reload(pool, ctx).await? {
            return Err(ProxyError::Depleted);
        }
        pool.retrieve(scheme).ok_or_else(|| ProxyError::Exhausted {
            scheme: scheme.to_string(),
        })
    }

    /// Apply the exhaustion policy to `request`; the request is always dropped.
    fn exhausted(&self, request: &CrawlRequest, scheme: &str, ctx: &CrawlContext) -> ProxyError {
        match self.exhaustion_policy() {
            ExhaustionPolicy::SkipRequest => {
                warn!("Proxy scheme {} is exhausted, ignoring request {}", scheme, request.url);
            }
            ExhaustionPolicy::AbortSession => {
                warn!(
                    "Proxy scheme {} is exhausted, ignoring request {} and closing the session",
                    scheme, request.url
                );
                ctx.control
                    .close_session(&format!("Proxy scheme {} is exhausted", scheme));
            }
        }
        ProxyError::RequestIgnored {
            scheme: scheme.to_string(),
        }
    }
}

/// Create a strategy; `policy` overrides its own exhaustion policy.
pub fn create_strategy(kind: StrategyKind, policy: Option<ExhaustionPolicy>) -> Box<dyn ProxyStrategy> {
    match kind {
        StrategyKind::Default => {
            let mut strategy = DefaultStrategy::new();
            if let Some(policy) = policy {
                strategy = strategy.with_policy(policy);
            }
            Box::new(strategy)
        }
        StrategyKind::Reloading => {
            let mut strategy = ReloadingStrategy::new();
            if let Some(policy) = policy {
                strategy = strategy.with_policy(policy);
            }
            Box::new(strategy)
        }
    }
}

/// Fail unless `strategy` can drive `backend`.
pub fn check_compatibility(strategy: &dyn ProxyStrategy, backend: StorageBackend) -> Result<()> {
    if strategy.supports(backend) {
        return Ok(());
    }
    error!(
        "The storage {} is not supported by strategy {}",
        backend.name(),
        strategy.name()
    );
    Err(ProxyError::StorageUnsupported {
        strategy: strategy.name(),
        storage: backend.name(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::BypassRules;
    use crate::crawler::{MemoryStats, SessionHandle, StatsCollector};
    use crate::storage::tests::{loaded, record, ScriptedSource};
    use std::num::NonZeroUsize;
    use std::sync::Arc;

    pub(super) struct Harness {
        pub ctx: CrawlContext,
        pub stats: Arc<MemoryStats>,
        pub handle: Arc<SessionHandle>,
    }

    pub(super) fn harness() -> Harness {
        let stats = Arc::new(MemoryStats::new());
        let handle = Arc::new(SessionHandle::new());
        let ctx = CrawlContext::new("test", stats.clone(), handle.clone());
        Harness { ctx, stats, handle }
    }

    pub(super) async fn open_pool(
        backend: StorageBackend,
        loads: Vec<Result<crate::storage::LoadedProxies>>,
        ctx: &CrawlContext,
    ) -> ProxyPool {
        let source = ScriptedSource::new(backend, loads);
        let mut pool = ProxyPool::new(Box::new(source), NonZeroUsize::new(8).unwrap());
        pool.open(ctx).await.unwrap();
        pool
    }

    #[test]
    fn test_reason_labels() {
        assert_eq!(InvalidationReason::from(&BlockCause::Status(403)).label(), "403");
        let cause = BlockCause::Exception {
            kind: "TimeoutError".to_string(),
            message: "timed out".to_string(),
        };
        assert_eq!(InvalidationReason::from(&cause).label(), "TimeoutError");
        assert_eq!(InvalidationReason::Other.label(), "other");
    }

    #[test]
    fn test_create_strategy() {
        let strategy = create_strategy(StrategyKind::Default, None);
        assert_eq!(strategy.name(), "default");
        assert_eq!(strategy.exhaustion_policy(), ExhaustionPolicy::SkipRequest);

        let strategy = create_strategy(StrategyKind::Reloading, None);
        assert_eq!(strategy.name(), "reloading");
        assert_eq!(strategy.exhaustion_policy(), ExhaustionPolicy::AbortSession);

        let strategy = create_strategy(StrategyKind::Reloading, Some(ExhaustionPolicy::SkipRequest));
        assert_eq!(strategy.exhaustion_policy(), ExhaustionPolicy::SkipRequest);
    }

    #[test]
    fn test_compatibility() {
        let default = create_strategy(StrategyKind::Default, None);
        assert!(check_compatibility(default.as_ref(), StorageBackend::Environment).is_ok());
        assert!(check_compatibility(default.as_ref(), StorageBackend::Settings).is_ok());
        assert!(matches!(
            check_compatibility(default.as_ref(), StorageBackend::Document),
            Err(ProxyError::StorageUnsupported {
                strategy: "default",
                storage: "document"
            })
        ));

        let reloading = create_strategy(StrategyKind::Reloading, None);
        assert!(check_compatibility(reloading.as_ref(), StorageBackend::Document).is_ok());
        assert!(check_compatibility(reloading.as_ref(), StorageBackend::Settings).is_err());
    }

    #[tokio::test]
    async fn test_invalidate_counts_once() {
        let h = harness();
        let mut pool = open_pool(
            StorageBackend::Settings,
            vec![Ok(loaded(&[("http", &["http://a:1", "http://b:2"])], None))],
            &h.ctx,
        )
        .await;
        let strategy = DefaultStrategy::new();
        let reason = InvalidationReason::Literal("403".to_string());

        assert!(strategy.invalidate(&mut pool, record("http://a:1").entry("http"), &reason, &h.ctx));
        assert!(!strategy.invalidate(&mut pool, record("http://a:1").entry("http"), &reason, &h.ctx));
        assert_eq!(h.stats.get_value("proxy/http/invalidated/403"), Some(1));
    }

    #[tokio::test]
    async fn test_reload_failure_keeps_pool() {
        let h = harness();
        let mut pool = open_pool(
            StorageBackend::Document,
            vec![
                Ok(loaded(&[("http", &["http://a:1"])], None)),
                Err(ProxyError::Config("store went away".to_string())),
            ],
            &h.ctx,
        )
        .await;
        let strategy = ReloadingStrategy::new();

        assert!(strategy.reload(&mut pool, &h.ctx).await.is_err());
        assert_eq!(pool.records("http").len(), 1);
        assert!(!h.handle.is_stopped());
    }

    #[tokio::test]
    async fn test_depletion_stops_crawl() {
        let h = harness();
        let snapshot = loaded(&[("http", &["http://a:1"]), ("https", &["http://b:2"])], Some(BypassRules::All));
        let mut pool = open_pool(StorageBackend::Settings, vec![Ok(snapshot)], &h.ctx).await;
        let strategy = DefaultStrategy::new();

        strategy.invalidate(&mut pool, record("http://a:1").entry("http"), &InvalidationReason::Other, &h.ctx);
        assert!(strategy.reload(&mut pool, &h.ctx).await.unwrap());
        assert!(!h.handle.is_stopped());

        strategy.invalidate(&mut pool, record("http://b:2").entry("https"), &InvalidationReason::Other, &h.ctx);
        assert!(!strategy.reload(&mut pool, &h.ctx).await.unwrap());
        assert!(h.handle.is_stopped());
        assert!(matches!(
            strategy.retrieve(&mut pool, "http", &h.ctx).await,
            Err(ProxyError::Depleted)
        ));
    }

    #[tokio::test]
    async fn test_exhausted_policies() {
        let h = harness();
        let request = CrawlRequest::get("http://example.com").unwrap();

        let skip = DefaultStrategy::new();
        let err = skip.exhausted(&request, "http", &h.ctx);
        assert!(matches!(err, ProxyError::RequestIgnored { ref scheme } if scheme == "http"));
        assert!(!h.handle.is_closing());

        let abort = DefaultStrategy::new().with_policy(ExhaustionPolicy::AbortSession);
        abort.exhausted(&request, "http", &h.ctx);
        assert_eq!(h.handle.close_reason().as_deref(), Some("Proxy scheme http is exhausted"));
    }
}
