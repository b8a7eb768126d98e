use super::ProxyStrategy;
use crate::config::{ExhaustionPolicy, StorageBackend};
use crate::proxy::ProxyEntry;
use crate::storage::ProxyPool;

/// Strategy for stores that are queried again whenever a scheme runs dry.
///
/// Each load is handed out once. Invalidated proxies are removed from the
/// active list and stay filtered out of every later load. A scheme that
/// is still empty after a reload closes the session.
#[derive(Debug, Clone)]
pub struct ReloadingStrategy {
    policy: ExhaustionPolicy,
}

impl ReloadingStrategy {
    pub fn new() -> Self {
        Self {
            policy: ExhaustionPolicy::AbortSession,
        }
    }

    pub fn with_policy(mut self, policy: ExhaustionPolicy) -> Self {
        self.policy = policy;
        self
    }
}

impl Default for ReloadingStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyStrategy for ReloadingStrategy {
    fn name(&self) -> &'static str {
        "reloading"
    }

    fn supported_storages(&self) -> &'static [StorageBackend] {
        &[StorageBackend::Document]
    }

    fn exhaustion_policy(&self) -> ExhaustionPolicy {
        self.policy
    }

    fn discard(&self, pool: &mut ProxyPool, entry: ProxyEntry) -> bool {
        pool.remove(entry)
    }
}
