use super::ProxyStrategy;
use crate::config::{ExhaustionPolicy, StorageBackend};
use crate::proxy::ProxyEntry;
use crate::storage::ProxyPool;

/// Strategy for fixed proxy lists.
///
/// Invalidated proxies stay in the list and are filtered out on retrieval
/// and on every reload. An exhausted scheme drops the request and the crawl
/// goes on.
#[derive(Debug, Clone)]
pub struct DefaultStrategy {
    policy: ExhaustionPolicy,
}

impl DefaultStrategy {
    pub fn new() -> Self {
        Self {
            policy: ExhaustionPolicy::SkipRequest,
        }
    }

    pub fn with_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for DefaultStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStrategy for DefaultStrategy {
    fn name(&self) -> &'static str {
        "default"
    }

    fn supported_storages(&self) -> &'static [StorageBackend] {
        &[StorageBackend::Environment, StorageBackend::Settings]
    }

    fn exhaustion_policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    fn discard(&self, pool: &mut ProxyPool, entry: ProxyEntry) -> bool {
        pool.mark_invalid(entry)
    }
}
