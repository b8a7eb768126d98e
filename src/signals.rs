//! Block notifications for external listeners.

use crate::inspector::BlockCause;
use crate::request::{CrawlRequest, CrawlResponse, RequestFailure};

use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use log::warn;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Payload of a block signal.
#[derive(Debug, Clone)]
pub struct BlockEvent {
    pub request: CrawlRequest,
    pub response: Option<CrawlResponse>,
    pub failure: Option<RequestFailure>,
    pub cause: BlockCause,
    /// Name of the crawl session.
    pub session: String,
}

/// What a handler returned.
pub type SignalResult = anyhow::Result<()>;

/// Publishes block events; subscription is up to the implementation.
#[async_trait]
pub trait SignalDispatcher: Send + Sync {
    /// Notify every listener of `signal` and collect their results.
    fn send(&self, signal: &str, event: &BlockEvent) -> Vec<SignalResult>;

    /// Like `send`, but waits for asynchronous listeners too.
    async fn send_deferred(&self, signal: &str, event: &BlockEvent) -> Vec<SignalResult>;
}

type Handler = Arc<dyn Fn(&BlockEvent) -> SignalResult + Send + Sync>;
type DeferredHandler = Arc<dyn Fn(BlockEvent) -> BoxFuture<'static, SignalResult> + Send + Sync>;

/// In-process dispatcher keyed by signal name.
#[derive(Default)]
pub struct SignalBus {
    handlers: RwLock<HashMap<String, Vec<Handler>>>,
    deferred: RwLock<HashMap<String, Vec<DeferredHandler>>>,
}

impl SignalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connect<F>(&self, signal: impl Into<String>, handler: F)
    where
        F: Fn(&BlockEvent) -> SignalResult + Send + Sync + 'static,
    {
        self.handlers
            .write()
            .entry(signal.into())
            .or_default()
            .push(Arc::new(handler));
    }

    /// Register an asynchronous handler; it only runs on `send_deferred`.
    pub fn connect_deferred<F>(&self, signal: impl Into<String>, handler: F)
    where
        F: Fn(BlockEvent) -> BoxFuture<'static, SignalResult> + Send + Sync + 'static,
    {
        self.deferred
            .write()
            .entry(signal.into())
            .or_default()
            .push(Arc::new(handler));
    }

    fn handlers(&self, signal: &str) -> Vec<Handler> {
        self.handlers.read().get(signal).cloned().unwrap_or_default()
    }

    fn deferred_handlers(&self, signal: &str) -> Vec<DeferredHandler> {
        self.deferred.read().get(signal).cloned().unwrap_or_default()
    }
}

fn log_failures(signal: &str, results: &[SignalResult]) {
    for err in results.iter().filter_map(|result| result.as_ref().err()) {
        warn!("Error caught on signal handler of {}: {:#}", signal, err);
    }
}

#[async_trait]
impl SignalDispatcher for SignalBus {
    fn send(&self, signal: &str, event: &BlockEvent) -> Vec<SignalResult> {
        let results: Vec<_> = self.handlers(signal).iter().map(|handler| handler(event)).collect();
        log_failures(signal, &results);
        results
    }

    async fn send_deferred(&self, signal: &str, event: &BlockEvent) -> Vec<SignalResult> {
        let mut results: Vec<_> = self.handlers(signal).iter().map(|handler| handler(event)).collect();
        let pending = self
            .deferred_handlers(signal)
            .into_iter()
            .map(|handler| handler(event.clone()));
        results.extend(join_all(pending).await);
        log_failures(signal, &results);
        results
    }
}

impl std::fmt::Debug for SignalBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalBus")
            .field("signals", &self.handlers.read().keys().collect::<Vec<_>>())
            .field("deferred", &self.deferred.read().keys().collect::<Vec<_>>())
            .finish()
    }
}
