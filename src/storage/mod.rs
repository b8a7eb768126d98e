//! Proxy sources and the per-scheme pool built from them.
//!
//! A [`ProxySource`] only knows how to fetch the current candidates. The
//! [`ProxyPool`] owns what was fetched: the eligible records per scheme, a
//! cursor over each, the set of invalidated entries and the bypass rules.

mod document;
mod environment;
mod settings;

pub use document::{DocumentClient, DocumentSource, HttpDocumentClient, ProxyDocument};
pub use environment::EnvironmentSource;
pub use settings::SettingsSource;

use crate::bypass::{BypassCache, BypassRules};
use crate::config::{ProxyPoolConfig, StorageBackend};
use crate::crawler::CrawlContext;
use crate::error::{ProxyError, Result};
use crate::proxy::{ProxyEntry, ProxyRecord};

use async_trait::async_trait;
use log::{debug, info, warn};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;

/// Reserved scheme holding bypass rules.
pub const NO_PROXY_SCHEME: &str = "no";

/// How a scheme's cursor moves over its records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationMode {
    /// Wrap around forever; used for fixed lists.
    Cyclic,
    /// Hand each record out once; a reload starts a new pass.
    Exhausting,
}

impl StorageBackend {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Environment => "environment",
            Self::Settings => "settings",
            Self::Document => "document",
        }
    }

    pub fn iteration_mode(&self) -> IterationMode {
        match self {
            Self::Environment | Self::Settings => IterationMode::Cyclic,
            Self::Document => IterationMode::Exhausting,
        }
    }
}

/// One snapshot of a source.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoadedProxies {
    pub schemes: BTreeMap<String, Vec<ProxyRecord>>,
    pub bypass: Option<BypassRules>,
}

impl LoadedProxies {
    pub fn push(&mut self, scheme: &str, record: ProxyRecord) {
        self.schemes.entry(scheme.to_string()).or_default().push(record);
    }

    pub fn is_empty(&self) -> bool {
        self.schemes.is_empty() && self.bypass.is_none()
    }
}

/// A backing source of proxies.
#[async_trait]
pub trait ProxySource: Send + Sync {
    fn backend(&self) -> StorageBackend;

    /// Acquire whatever connection `load` needs.
    async fn connect(&mut self, _ctx: &CrawlContext) -> Result<()> {
        Ok(())
    }

    /// Fetch the current candidates. Must not change any state on failure.
    async fn load(&self) -> Result<LoadedProxies>;

    /// Release the connection acquired by `connect`.
    async fn disconnect(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Build the source selected by `config.storage`.
pub fn source_from_config(config: &ProxyPoolConfig) -> Result<Box<dyn ProxySource>> {
    let encoding = config.auth_encoding()?;
    let source: Box<dyn ProxySource> = match config.storage {
        StorageBackend::Environment => Box::new(EnvironmentSource::new(encoding)),
        StorageBackend::Settings => Box::new(SettingsSource::new(config.proxies.clone(), encoding)),
        StorageBackend::Document => {
            let store = &config.document_store;
            let client = HttpDocumentClient::new(store.clone());
            Box::new(DocumentSource::new(Box::new(client), store.query.clone(), encoding))
        }
    };
    Ok(source)
}

/// The proxies of one crawl session.
///
/// Not synchronized: one pool serves one session on one logical timeline.
pub struct ProxyPool {
    source: Box<dyn ProxySource>,
    mode: IterationMode,
    active: BTreeMap<String, Vec<ProxyRecord>>,
    cursors: HashMap<String, usize>,
    invalidated: HashSet<ProxyEntry>,
    bypass: Option<BypassRules>,
    bypass_cache: BypassCache,
    open: bool,
}

impl ProxyPool {
    /// Wrap `source`; nothing is loaded until `open`.
    pub fn new(source: Box<dyn ProxySource>, bypass_cache_size: NonZeroUsize) -> Self {
        let mode = source.backend().iteration_mode();
        Self {
            source,
            mode,
            active: BTreeMap::new(),
            cursors: HashMap::new(),
            invalidated: HashSet::new(),
            bypass: None,
            bypass_cache: BypassCache::new(bypass_cache_size),
            open: false,
        }
    }

    pub fn backend(&self) -> StorageBackend {
        self.source.backend()
    }

    pub fn mode(&self) -> IterationMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Connect the source, load it and publish the per-scheme counts.
    pub async fn open(&mut self, ctx: &CrawlContext) -> Result<()> {
        if self.open {
            return Ok(());
        }
        let name = self.backend().name();
        self.source.connect(ctx).await?;
        let loaded = match self.source.load().await {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("Failed to load proxies from {} storage: {}", name, e);
                if let Err(close_err) = self.source.disconnect().await {
                    warn!("Failed to release {} storage: {}", name, close_err);
                }
                return Err(e);
            }
        };
        self.open = true;
        info!("Proxy storage {} is opened", name);
        self.replace(loaded);
        self.publish(ctx);
        Ok(())
    }

    /// Release the source. Safe to call more than once.
    pub async fn close(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.source.disconnect().await?;
        info!("Proxy storage {} is closed", self.backend().name());
        Ok(())
    }

    /// Fetch a fresh snapshot without touching the pool.
    pub async fn load(&self) -> Result<LoadedProxies> {
        if !self.open {
            return Err(ProxyError::NotOpen);
        }
        self.source.load().await
    }

    /// Install `loaded` minus every invalidated entry and restart all cursors.
    ///
    /// A scheme whose records are all invalidated stays present with no
    /// records, so requests for it keep reporting exhaustion.
    pub fn replace(&mut self, loaded: LoadedProxies) {
        let invalidated = &self.invalidated;
        self.active = loaded
            .schemes
            .into_iter()
            .filter(|(scheme, _)| scheme != NO_PROXY_SCHEME)
            .map(|(scheme, records)| {
                let records = records
                    .into_iter()
                    .filter(|record| !invalidated.contains(&record.entry(&scheme)))
                    .collect();
                (scheme, records)
            })
            .collect();
        self.cursors.clear();
        self.bypass = loaded.bypass;
        self.bypass_cache.clear();
    }

    /// Log and record `proxy/<scheme>` counts.
    pub fn publish(&self, ctx: &CrawlContext) {
        let name = self.backend().name();
        for (scheme, count) in self.counts() {
            info!("Loaded {} {} proxies from {} storage", count, scheme, name);
            ctx.stats.set_value(&format!("proxy/{}", scheme), count as i64);
        }
        if let Some(bypass) = &self.bypass {
            info!("Loaded {} bypass rules from {} storage", bypass.len(), name);
            ctx.stats
                .set_value(&format!("proxy/{}", NO_PROXY_SCHEME), bypass.len() as i64);
        }
    }

    /// Next usable record for `scheme`, or `None` once the cursor runs dry.
    pub fn retrieve(&mut self, scheme: &str) -> Option<ProxyRecord> {
        let records = self.active.get(scheme)?;
        let cursor = self.cursors.entry(scheme.to_string()).or_insert(0);
        let len = records.len();
        match self.mode {
            IterationMode::Cyclic => {
                for _ in 0..len {
                    let record = &records[*cursor % len];
                    *cursor = (*cursor + 1) % len;
                    if !self.invalidated.contains(&record.entry(scheme)) {
                        return Some(record.clone());
                    }
                }
                None
            }
            IterationMode::Exhausting => {
                while *cursor < len {
                    let record = &records[*cursor];
                    *cursor += 1;
                    if !self.invalidated.contains(&record.entry(scheme)) {
                        return Some(record.clone());
                    }
                }
                None
            }
        }
    }

    /// Whether requests to `host` skip the proxy.
    pub fn bypass(&mut self, host: &str) -> bool {
        match &self.bypass {
            Some(rules) => self.bypass_cache.check(rules, host),
            None => false,
        }
    }

    /// Record `entry` as dead; it is skipped from now on. Returns false if already known.
    pub fn mark_invalid(&mut self, entry: ProxyEntry) -> bool {
        self.invalidated.insert(entry)
    }

    /// Record `entry` as dead and drop it from the active list.
    pub fn remove(&mut self, entry: ProxyEntry) -> bool {
        if !self.invalidated.insert(entry.clone()) {
            return false;
        }
        if let Some(records) = self.active.get_mut(&entry.scheme) {
            if let Some(index) = records.iter().position(|record| record.entry(&entry.scheme) == entry) {
                records.remove(index);
                if let Some(cursor) = self.cursors.get_mut(&entry.scheme) {
                    if index < *cursor {
                        *cursor -= 1;
                    }
                }
                debug!("Removed {} from the pool", entry);
            }
        }
        true
    }

    pub fn is_invalidated(&self, entry: &ProxyEntry) -> bool {
        self.invalidated.contains(entry)
    }

    pub fn invalidated(&self) -> &HashSet<ProxyEntry> {
        &self.invalidated
    }

    /// No scheme and no bypass rule was loaded.
    pub fn is_empty(&self) -> bool {
        self.active.is_empty() && self.bypass.is_none()
    }

    /// Whether `scheme` was loaded, even if none of its proxies survive.
    pub fn has_scheme(&self, scheme: &str) -> bool {
        self.active.contains_key(scheme)
    }

    /// Every scheme is out of usable records.
    pub fn is_depleted(&self) -> bool {
        self.active.iter().all(|(scheme, records)| {
            records
                .iter()
                .all(|record| self.invalidated.contains(&record.entry(scheme)))
        })
    }

    /// Active records of `scheme`, in rotation order.
    pub fn records(&self, scheme: &str) -> &[ProxyRecord] {
        self.active.get(scheme).map(Vec::as_slice).unwrap_or_default()
    }

    /// Number of active records by scheme.
    pub fn counts(&self) -> BTreeMap<String, usize> {
        self.active
            .iter()
            .map(|(scheme, records)| (scheme.clone(), records.len()))
            .collect()
    }

    pub fn bypass_rules(&self) -> Option<&BypassRules> {
        self.bypass.as_ref()
    }
}

impl Drop for ProxyPool {
    fn drop(&mut self) {
        if self.open {
            warn!(
                "Proxy storage {} dropped while open, its connection is released without close",
                self.backend().name()
            );
        }
    }
}

impl std::fmt::Debug for ProxyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyPool")
            .field("backend", &self.backend())
            .field("mode", &self.mode)
            .field("counts", &self.counts())
            .field("invalidated", &self.invalidated.len())
            .field("open", &self.open)
            .finish()
    }
}
