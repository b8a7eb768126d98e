//! Block detection and request recycling.
//!
//! The inspector looks at what came back for a request. A response whose
//! status, or a failure whose type, is configured as a block marker is
//! counted, announced to the configured signals, and answered with a
//! recycled copy of the request.

use crate::config::ProxyPoolConfig;
use crate::crawler::CrawlContext;
use crate::request::{CrawlRequest, CrawlResponse, ProxyMeta, RequestFailure};
use crate::signals::{BlockEvent, SignalDispatcher, SignalResult};

use http::header::PROXY_AUTHORIZATION;
use log::{debug, info};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// What marked a proxy as blocked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockCause {
    Status(u16),
    Exception { kind: String, message: String },
}

impl BlockCause {
    /// Short label used in stats keys.
    pub fn label(&self) -> String {
        match self {
            Self::Status(code) => code.to_string(),
            Self::Exception { kind, .. } => kind.clone(),
        }
    }
}

impl fmt::Display for BlockCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(code) => write!(f, "status {}", code),
            Self::Exception { kind, message } => write!(f, "{}: {}", kind, message),
        }
    }
}

/// Outcome of inspecting a response or failure.
#[derive(Debug, Clone)]
pub enum Inspection {
    /// Not a block; hand the response or failure on unchanged.
    Pass,
    /// Blocked; `recycled` should be scheduled in place of the request.
    Blocked {
        cause: BlockCause,
        recycled: CrawlRequest,
    },
}

impl Inspection {
    pub fn is_blocked(&self) -> bool {
        matches!(self, Self::Blocked { .. })
    }
}

/// Detects blocked proxies from responses and failures.
pub struct BlockInspector {
    status_codes: BTreeSet<u16>,
    exceptions: BTreeSet<String>,
    signals: Vec<String>,
    signals_deferred: Vec<String>,
    priority_adjust: i32,
    dispatcher: Arc<dyn SignalDispatcher>,
}

impl BlockInspector {
    /// Build an inspector from the block markers and signals in `config`.
    pub fn new(config: &ProxyPoolConfig, dispatcher: Arc<dyn SignalDispatcher>) -> Self {
        Self {
            status_codes: config.invalidated_status_codes.iter().copied().collect(),
            exceptions: config.invalidated_exceptions.iter().cloned().collect(),
            signals: config.block_signals.clone(),
            signals_deferred: config.block_signals_deferred.clone(),
            priority_adjust: config.retry_priority_adjust,
            dispatcher,
        }
    }

    pub fn open(&self) {
        info!("BlockInspector is opened");
        info!(
            "The following status codes will be reported as proxy invalidated: {:?}",
            self.status_codes
        );
        info!(
            "The following exceptions will be reported as proxy invalidated: {:?}",
            self.exceptions
        );
        if !self.signals.is_empty() {
            info!("The following signals will be sent when block is inspected: {:?}", self.signals);
        }
        if !self.signals_deferred.is_empty() {
            info!(
                "The following signals deferred will be sent when block is inspected: {:?}",
                self.signals_deferred
            );
        }
    }

    /// The block cause of `response`, if its status is a block marker.
    pub fn classify_response(&self, response: &CrawlResponse) -> Option<BlockCause> {
        let code = response.status.as_u16();
        self.status_codes.contains(&code).then_some(BlockCause::Status(code))
    }

    /// The block cause of `failure`, if its type is a block marker.
    pub fn classify_failure(&self, failure: &RequestFailure) -> Option<BlockCause> {
        self.exceptions.contains(&failure.kind).then(|| BlockCause::Exception {
            kind: failure.kind.clone(),
            message: failure.message.clone(),
        })
    }

    pub async fn inspect_response(
        &self,
        request: &CrawlRequest,
        response: &CrawlResponse,
        ctx: &CrawlContext,
    ) -> Inspection {
        match self.classify_response(response) {
            Some(cause) => {
                self.report(request, Some(response), None, &cause, ctx).await;
                Inspection::Blocked {
                    recycled: self.recycle(request),
                    cause,
                }
            }
            None => Inspection::Pass,
        }
    }

    pub async fn inspect_failure(
        &self,
        request: &CrawlRequest,
        failure: &RequestFailure,
        ctx: &CrawlContext,
    ) -> Inspection {
        match self.classify_failure(failure) {
            Some(cause) => {
                self.report(request, None, Some(failure), &cause, ctx).await;
                Inspection::Blocked {
                    recycled: self.recycle(request),
                    cause,
                }
            }
            None => Inspection::Pass,
        }
    }

    /// Count the block and send the configured signals.
    ///
    /// Returns the results of the synchronous and of the deferred signals.
    pub async fn report(
        &self,
        request: &CrawlRequest,
        response: Option<&CrawlResponse>,
        failure: Option<&RequestFailure>,
        cause: &BlockCause,
        ctx: &CrawlContext,
    ) -> (Vec<SignalResult>, Vec<SignalResult>) {
        debug!("Block inspected on {} ({}): {}", request.url, request.proxy_label(), cause);
        ctx.stats.inc_value("block_inspector/block", 1);
        ctx.stats
            .inc_value(&format!("block_inspector/block/{}", cause.label()), 1);

        if self.signals.is_empty() && self.signals_deferred.is_empty() {
            return (Vec::new(), Vec::new());
        }
        let event = BlockEvent {
            request: request.clone(),
            response: response.cloned(),
            failure: failure.cloned(),
            cause: cause.clone(),
            session: ctx.name.clone(),
        };
        let results = self
            .signals
            .iter()
            .flat_map(|signal| self.dispatcher.send(signal, &event))
            .collect();
        let mut results_deferred = Vec::new();
        for signal in &self.signals_deferred {
            results_deferred.extend(self.dispatcher.send_deferred(signal, &event).await);
        }
        (results, results_deferred)
    }

    /// Copy of `request` ready to be scheduled again without its proxy.
    pub fn recycle(&self, request: &CrawlRequest) -> CrawlRequest {
        let mut recycled = request.clone();
        recycled.proxy = ProxyMeta::Unset;
        recycled.headers.remove(PROXY_AUTHORIZATION);
        recycled.dont_filter = true;
        recycled.priority = recycled.priority.saturating_add(self.priority_adjust);
        debug!("Recycled {} with priority {}", recycled.url, recycled.priority);
        recycled
    }
}

impl fmt::Debug for BlockInspector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlockInspector")
            .field("status_codes", &self.status_codes)
            .field("exceptions", &self.exceptions)
            .field("signals", &self.signals)
            .field("signals_deferred", &self.signals_deferred)
            .field("priority_adjust", &self.priority_adjust)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{MemoryStats, StatsCollector};
    use crate::crawler::SessionHandle;
    use crate::signals::SignalBus;
    use futures::FutureExt;
    use http::{HeaderValue, StatusCode};
    use parking_lot::Mutex;
    use serde_json::json;

    fn config() -> ProxyPoolConfig {
        ProxyPoolConfig::builder()
            .enabled(true)
            .invalidated_status_codes(vec![403, 429])
            .invalidated_exceptions(vec!["TimeoutError"])
            .block_signals(vec!["proxy_blocked"])
            .block_signals_deferred(vec!["proxy_blocked_deferred"])
            .retry_priority_adjust(5)
            .build()
    }

    fn context() -> (CrawlContext, Arc<MemoryStats>) {
        let stats = Arc::new(MemoryStats::new());
        (CrawlContext::new("spider", stats.clone(), Arc::new(SessionHandle::new())), stats)
    }

    fn proxied_request() -> CrawlRequest {
        let mut request = CrawlRequest::get("http://example.com/page")
            .unwrap()
            .with_proxy(ProxyMeta::Url("http://proxy:3128".to_string()));
        request
            .headers
            .insert(PROXY_AUTHORIZATION, HeaderValue::from_static("Basic dXNlcjpwYXNz"));
        request.headers.insert("x-trace", HeaderValue::from_static("1"));
        request.priority = 10;
        request.meta.insert("depth".to_string(), json!(2));
        request
    }

    #[test]
    fn test_classify() {
        let inspector = BlockInspector::new(&config(), Arc::new(SignalBus::new()));
        let url = url::Url::parse("http://example.com").unwrap();

        let response = CrawlResponse::new(url.clone(), StatusCode::FORBIDDEN);
        assert_eq!(inspector.classify_response(&response), Some(BlockCause::Status(403)));
        let response = CrawlResponse::new(url, StatusCode::OK);
        assert_eq!(inspector.classify_response(&response), None);

        let failure = RequestFailure::new("TimeoutError", "timed out");
        assert_eq!(inspector.classify_failure(&failure).unwrap().label(), "TimeoutError");
        assert!(inspector
            .classify_failure(&RequestFailure::new("ConnectionError", "refused"))
            .is_none());
    }

    #[test]
    fn test_recycle() {
        let inspector = BlockInspector::new(&config(), Arc::new(SignalBus::new()));
        let request = proxied_request();
        let recycled = inspector.recycle(&request);

        assert_eq!(recycled.proxy, ProxyMeta::Unset);
        assert!(!recycled.has_proxy_authorization());
        assert!(recycled.dont_filter);
        assert_eq!(recycled.priority, 15);
        assert_eq!(recycled.url, request.url);
        assert_eq!(recycled.method, request.method);
        assert_eq!(recycled.headers["x-trace"], "1");
        assert_eq!(recycled.meta, request.meta);

        // The request passed in is untouched.
        assert!(request.has_proxy_authorization());
        assert_eq!(request.priority, 10);

        // Nothing to strip is fine too.
        let bare = CrawlRequest::get("http://example.com").unwrap();
        let recycled = inspector.recycle(&bare);
        assert_eq!(recycled.proxy, ProxyMeta::Unset);
        assert_eq!(recycled.priority, 5);
    }

    #[tokio::test]
    async fn test_blocked_response_is_reported() {
        let bus = Arc::new(SignalBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        bus.connect("proxy_blocked", move |event| {
            sink.lock().push(event.cause.label());
            Ok(())
        });
        let sink = seen.clone();
        bus.connect_deferred("proxy_blocked_deferred", move |event| {
            let sink = sink.clone();
            async move {
                sink.lock().push(format!("deferred {}", event.session));
                Ok(())
            }
            .boxed()
        });

        let inspector = BlockInspector::new(&config(), bus);
        let (ctx, stats) = context();
        let request = proxied_request();
        let response = CrawlResponse::new(request.url.clone(), StatusCode::TOO_MANY_REQUESTS);

        let inspection = inspector.inspect_response(&request, &response, &ctx).await;
        match inspection {
            Inspection::Blocked { cause, recycled } => {
                assert_eq!(cause, BlockCause::Status(429));
                assert_eq!(recycled.proxy, ProxyMeta::Unset);
            }
            Inspection::Pass => panic!("expected a block"),
        }
        assert_eq!(*seen.lock(), ["429", "deferred spider"]);
        assert_eq!(stats.get_value("block_inspector/block"), Some(1));
        assert_eq!(stats.get_value("block_inspector/block/429"), Some(1));
    }

    #[tokio::test]
    async fn test_unlisted_failure_passes() {
        let inspector = BlockInspector::new(&config(), Arc::new(SignalBus::new()));
        let (ctx, stats) = context();
        let request = proxied_request();

        let failure = RequestFailure::new("ConnectionError", "refused");
        assert!(!inspector.inspect_failure(&request, &failure, &ctx).await.is_blocked());
        assert_eq!(stats.get_value("block_inspector/block"), None);

        let failure = RequestFailure::new("TimeoutError", "timed out");
        assert!(inspector.inspect_failure(&request, &failure, &ctx).await.is_blocked());
        assert_eq!(stats.get_value("block_inspector/block/TimeoutError"), Some(1));
    }
}
