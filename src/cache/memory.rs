use crate::cache::CachedValue;
use chrono::Utc;
use indexmap::IndexMap;
use std::sync::Mutex;

/// In-process LRU tier. The map's insertion order doubles as the recency
/// order: hits are moved to the back, eviction pops the front.
pub(super) struct MemoryTier {
    entries: Mutex<IndexMap<String, CachedValue>>,
    capacity: usize,
}

impl MemoryTier {
    pub(super) fn new(capacity: usize) -> Self {
        MemoryTier {
            entries: Mutex::new(IndexMap::new()),
            capacity,
        }
    }

    pub(super) fn get(&self, fingerprint: &str) -> Option<CachedValue> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.shift_remove(fingerprint)?;
        if entry.expires_at <= Utc::now() {
            return None;
        }

        entries.insert(fingerprint.to_string(), entry.clone());
        Some(entry)
    }

    pub(super) fn put(&self, fingerprint: &str, mut entry: CachedValue) {
        let mut entries = self.entries.lock().unwrap();

        // A put never shrinks the lifetime of something already cached.
        if let Some(existing) = entries.shift_remove(fingerprint) {
            if existing.expires_at > entry.expires_at {
                entry.expires_at = existing.expires_at;
            }
        }
        entries.insert(fingerprint.to_string(), entry);

        while entries.len() > self.capacity {
            entries.shift_remove_index(0);
        }
    }

    pub(super) fn invalidate(&self, prefix: &str) {
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|key, _| !key.starts_with(prefix));
    }

    pub(super) fn clean_expired(&self) {
        let now = Utc::now();
        let mut entries = self.entries.lock().unwrap();
        entries.retain(|_, entry| entry.expires_at > now);
    }

    #[cfg(test)]
    pub(super) fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryTier;
    use crate::cache::{CachedValue, TtlClass};
    use chrono::{Duration, Utc};

    fn entry(ttl_secs: i64) -> CachedValue {
        CachedValue {
            value: serde_json::json!({"ok": true}),
            origin_api: "contracts".into(),
            ttl_class: TtlClass::Short,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            size_bytes: 12,
        }
    }

    #[test]
    fn test_lru_eviction_order() {
        let tier = MemoryTier::new(2);
        tier.put("contracts:a", entry(60));
        tier.put("contracts:b", entry(60));

        // Touch `a` so `b` becomes the least recently used entry.
        assert!(tier.get("contracts:a").is_some());
        tier.put("contracts:c", entry(60));

        assert_eq!(tier.len(), 2);
        assert!(tier.get("contracts:b").is_none());
        assert!(tier.get("contracts:a").is_some());
        assert!(tier.get("contracts:c").is_some());
    }

    #[test]
    fn test_expired_entries_are_misses() {
        let tier = MemoryTier::new(4);
        tier.put("contracts:a", entry(-1));
        assert!(tier.get("contracts:a").is_none());
    }

    #[test]
    fn test_put_never_shrinks_ttl() {
        let tier = MemoryTier::new(4);
        tier.put("contracts:a", entry(3600));
        tier.put("contracts:a", entry(60));

        let cached = tier.get("contracts:a").unwrap();
        assert!(cached.expires_at > Utc::now() + Duration::seconds(600));
    }

    #[test]
    fn test_prefix_invalidation() {
        let tier = MemoryTier::new(4);
        tier.put("contracts:a", entry(60));
        tier.put("expenses:b", entry(60));

        tier.invalidate("contracts");
        assert!(tier.get("contracts:a").is_none());
        assert!(tier.get("expenses:b").is_some());
    }
}
