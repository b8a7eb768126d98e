//! Collaborators supplied by the host crawl engine.

use log::{info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Crawl statistics sink.
pub trait StatsCollector: Send + Sync {
    fn set_value(&self, key: &str, value: i64);
    fn inc_value(&self, key: &str, count: i64);
    fn get_value(&self, key: &str) -> Option<i64>;
}

/// Stats kept in memory, for standalone use and tests.
#[derive(Debug, Default)]
pub struct MemoryStats {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of every value recorded so far.
    pub fn snapshot(&self) -> HashMap<String, i64> {
        self.values.lock().clone()
    }
}

impl StatsCollector for MemoryStats {
    fn set_value(&self, key: &str, value: i64) {
        self.values.lock().insert(key.to_string(), value);
    }

    fn inc_value(&self, key: &str, count: i64) {
        *self.values.lock().entry(key.to_string()).or_insert(0) += count;
    }

    fn get_value(&self, key: &str) -> Option<i64> {
        self.values.lock().get(key).copied()
    }
}

/// Control over the running crawl session.
pub trait SessionControl: Send + Sync {
    /// Close the session gracefully, recording `reason`.
    fn close_session(&self, reason: &str);
    /// Stop the whole crawl.
    fn stop(&self);
}

/// Records close/stop requests so the host can poll them.
#[derive(Debug, Default)]
pub struct SessionHandle {
    close_reason: Mutex<Option<String>>,
    stopped: AtomicBool,
}

impl SessionHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close_reason(&self) -> Option<String> {
        self.close_reason.lock().clone()
    }

    pub fn is_closing(&self) -> bool {
        self.close_reason.lock().is_some()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }
}

impl SessionControl for SessionHandle {
    fn close_session(&self, reason: &str) {
        let mut close_reason = self.close_reason.lock();
        if close_reason.is_none() {
            info!("Closing crawl session: {}", reason);
            *close_reason = Some(reason.to_string());
        }
    }

    fn stop(&self) {
        if !self.stopped.swap(true, Ordering::SeqCst) {
            warn!("Stopping crawl");
        }
    }
}

/// Handle on the crawl session the proxy layer serves.
#[derive(Clone)]
pub struct CrawlContext {
    /// Session (spider) name.
    pub name: String,
    pub stats: Arc<dyn StatsCollector>,
    pub control: Arc<dyn SessionControl>,
}

impl CrawlContext {
    pub fn new(
        name: impl Into<String>,
        stats: Arc<dyn StatsCollector>,
        control: Arc<dyn SessionControl>,
    ) -> Self {
        Self {
            name: name.into(),
            stats,
            control,
        }
    }

    /// A context backed by `MemoryStats` and a `SessionHandle`.
    pub fn standalone(name: impl Into<String>) -> Self {
        Self::new(name, Arc::new(MemoryStats::new()), Arc::new(SessionHandle::new()))
    }
}

impl std::fmt::Debug for CrawlContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrawlContext").field("name", &self.name).finish()
    }
}
