//! Bypass rules for the reserved `no` scheme.

use lru::LruCache;
use std::num::NonZeroUsize;

/// Hosts that must be contacted directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassRules {
    /// `*`: every host bypasses the proxy.
    All,
    /// Lower-cased domain suffixes, leading dots removed.
    Suffixes(Vec<String>),
}

impl BypassRules {
    /// Build rules from raw entries; any `*` entry means bypass-all.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut suffixes = Vec::new();
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry == "*" {
                return Self::All;
            }
            let suffix = entry.trim_start_matches('.').to_ascii_lowercase();
            if !suffix.is_empty() {
                suffixes.push(suffix);
            }
        }
        Self::Suffixes(suffixes)
    }

    /// Parse a comma separated `no_proxy` value.
    pub fn from_list(list: &str) -> Self {
        if list.trim() == "*" {
            return Self::All;
        }
        Self::from_entries(list.split(','))
    }

    /// Number of rules, with bypass-all counted as one.
    pub fn len(&self) -> usize {
        match self {
            Self::All => 1,
            Self::Suffixes(suffixes) => suffixes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `host`, with or without its port, matches a rule.
    pub fn matches(&self, host: &str) -> bool {
        let suffixes = match self {
            Self::All => return true,
            Self::Suffixes(suffixes) => suffixes,
        };
        let host = host.to_ascii_lowercase();
        let host_only = strip_port(&host);
        suffixes
            .iter()
            .any(|suffix| suffix_matches(host_only, suffix) || suffix_matches(&host, suffix))
    }
}

/// `suffix` itself or any name ending in `.suffix`.
fn suffix_matches(host: &str, suffix: &str) -> bool {
    match host.strip_suffix(suffix) {
        Some("") => true,
        Some(head) => head.len() > 1 && head.ends_with('.'),
        None => false,
    }
}

/// Drop a trailing `:digits` port.
fn strip_port(host: &str) -> &str {
    match host.rsplit_once(':') {
        Some((name, port)) if port.bytes().all(|b| b.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Per-host memo of bypass decisions, bounded to the most recent hosts.
pub struct BypassCache {
    entries: LruCache<String, bool>,
}

impl BypassCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(capacity),
        }
    }

    /// Look up `host`, evaluating `rules` on a miss.
    pub fn check(&mut self, rules: &BypassRules, host: &str) -> bool {
        if let Some(hit) = self.entries.get(host) {
            return *hit;
        }
        let bypass = rules.matches(host);
        self.entries.put(host.to_string(), bypass);
        bypass
    }

    /// Forget every decision; called whenever the rules change.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for BypassCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BypassCache")
            .field("len", &self.entries.len())
            .field("cap", &self.entries.cap())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard() {
        assert_eq!(BypassRules::from_list("*"), BypassRules::All);
        assert_eq!(BypassRules::from_entries(["other.com", "*"]), BypassRules::All);
        assert!(BypassRules::All.matches("anything.example"));
    }

    #[test]
    fn test_suffix_matching() {
        let rules = BypassRules::from_list("other.com, .NoProxy.com");
        assert!(rules.matches("noproxy.com"));
        assert!(rules.matches("www.noproxy.com"));
        assert!(rules.matches("WWW.NOPROXY.COM"));
        assert!(rules.matches("a.b.other.com"));
        assert!(!rules.matches("notnoproxy.com"));
        assert!(!rules.matches("noproxy.com.evil"));
        assert!(!rules.matches("e.com"));
    }

    #[test]
    fn test_port_is_ignored() {
        let rules = BypassRules::from_entries(["noproxy.com"]);
        assert!(rules.matches("noproxy.com:8080"));
        assert!(rules.matches("api.noproxy.com:443"));
        assert!(!rules.matches("other.com:80"));
    }

    #[test]
    fn test_empty_rules() {
        let rules = BypassRules::from_list("");
        assert!(rules.is_empty());
        assert!(!rules.matches("noproxy.com"));
    }

    #[test]
    fn test_cache_is_bounded() {
        let rules = BypassRules::from_entries(["noproxy.com"]);
        let mut cache = BypassCache::new(NonZeroUsize::new(2).unwrap());
        assert!(cache.check(&rules, "noproxy.com"));
        assert!(!cache.check(&rules, "a.com"));
        assert!(!cache.check(&rules, "b.com"));
        assert_eq!(cache.len(), 2);

        // A cached answer survives until cleared, even if the rules change.
        assert!(!cache.check(&BypassRules::All, "b.com"));
        cache.clear();
        assert!(cache.check(&BypassRules::All, "b.com"));
    }
}
