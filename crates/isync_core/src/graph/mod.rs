//! Per-ticket cache of the workflow transitions currently available on the
//! external tracker. Read-mostly; refreshed on demand and force-invalidated
//! when a resolved transition turns out to be missing from the graph.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

struct CachedGraph {
    transitions: Vec<String>,
    fetched_at: SystemTime,
}

pub struct TransitionGraphCache {
    entries: Mutex<HashMap<String, CachedGraph>>,
    ttl_seconds: u64,
}

impl TransitionGraphCache {
    pub fn new() -> Self {
        Self::with_ttl(60)
    }

    pub fn with_ttl(ttl_seconds: u64) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl_seconds,
        }
    }

    /// Cached transitions for a ticket, unless stale.
    pub fn get(&self, ticket_key: &str) -> Option<Vec<String>> {
        let entries = self.entries.lock().unwrap();
        let cached = entries.get(ticket_key)?;

        let age = SystemTime::now()
            .duration_since(cached.fetched_at)
            .unwrap_or(Duration::from_secs(self.ttl_seconds + 1));
        if age.as_secs() < self.ttl_seconds {
            Some(cached.transitions.clone())
        } else {
            None
        }
    }

    pub fn put(&self, ticket_key: &str, transitions: Vec<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            ticket_key.to_string(),
            CachedGraph {
                transitions,
                fetched_at: SystemTime::now(),
            },
        );
    }

    pub fn invalidate(&self, ticket_key: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(ticket_key);
    }
}

impl Default for TransitionGraphCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hit_within_ttl() {
        let cache = TransitionGraphCache::new();
        cache.put("PROJ-1", vec!["To Do".into(), "Done".into()]);
        assert_eq!(
            cache.get("PROJ-1"),
            Some(vec!["To Do".to_string(), "Done".to_string()])
        );
    }

    #[test]
    fn cache_miss_after_invalidation() {
        let cache = TransitionGraphCache::new();
        cache.put("PROJ-1", vec!["Done".into()]);
        cache.invalidate("PROJ-1");
        assert_eq!(cache.get("PROJ-1"), None);
    }

    #[test]
    fn entries_are_scoped_per_ticket() {
        let cache = TransitionGraphCache::new();
        cache.put("PROJ-1", vec!["Done".into()]);
        assert_eq!(cache.get("PROJ-2"), None);
    }
}
