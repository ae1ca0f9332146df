use crate::cache::{CachedValue, TtlClass};
use crate::prelude::*;
use chrono::{DateTime, Utc};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Durable tier for long-TTL payloads that must survive restarts. One JSON
/// file per fingerprint under the work directory.
pub(super) struct DiskTier {
    root: PathBuf,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct DiskEntry {
    value: serde_json::Value,
    origin_api: String,
    ttl_class: TtlClass,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    size_bytes: usize,
}

impl DiskTier {
    pub(super) fn new(root: &Path) -> Fallible<Self> {
        fs::create_dir_all(root)?;
        Ok(DiskTier {
            root: root.to_owned(),
        })
    }

    fn path_for(&self, fingerprint: &str) -> PathBuf {
        // Fingerprints are `endpoint:hex`; the separator is not portable in
        // file names.
        self.root
            .join(format!("{}.json", fingerprint.replace(':', "__")))
    }

    pub(super) fn get(&self, fingerprint: &str) -> Fallible<Option<CachedValue>> {
        let path = self.path_for(fingerprint);
        let buffer = match fs::read_to_string(&path) {
            Ok(buffer) => buffer,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let entry: DiskEntry = match serde_json::from_str(&buffer) {
            Ok(entry) => entry,
            Err(err) => {
                // A corrupt cache file is dropped, not propagated.
                warn!("removing unreadable cache file {}: {}", path.display(), err);
                let _ = fs::remove_file(&path);
                return Ok(None);
            }
        };

        if entry.expires_at <= Utc::now() {
            let _ = fs::remove_file(&path);
            return Ok(None);
        }

        Ok(Some(CachedValue {
            value: entry.value,
            origin_api: entry.origin_api,
            ttl_class: entry.ttl_class,
            created_at: entry.created_at,
            expires_at: entry.expires_at,
            size_bytes: entry.size_bytes,
        }))
    }

    pub(super) fn put(&self, fingerprint: &str, entry: &CachedValue) -> Fallible<()> {
        let mut expires_at = entry.expires_at;
        if let Some(existing) = self.get(fingerprint)? {
            if existing.expires_at > expires_at {
                expires_at = existing.expires_at;
            }
        }

        let serialized = serde_json::to_string(&DiskEntry {
            value: entry.value.clone(),
            origin_api: entry.origin_api.clone(),
            ttl_class: entry.ttl_class,
            created_at: entry.created_at,
            expires_at,
            size_bytes: entry.size_bytes,
        })?;

        // Write-then-rename so concurrent readers never see a partial file.
        let path = self.path_for(fingerprint);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serialized)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    pub(super) fn invalidate(&self, prefix: &str) -> Fallible<()> {
        let file_prefix = prefix.replace(':', "__");
        for file in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let file = file?;
            if let Some(name) = file.file_name().to_str() {
                if name.starts_with(&file_prefix) {
                    fs::remove_file(file.path())?;
                }
            }
        }
        Ok(())
    }

    pub(super) fn clean_expired(&self) -> Fallible<usize> {
        let now = Utc::now();
        let mut removed = 0;

        for file in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let file = file?;
            let buffer = match fs::read_to_string(file.path()) {
                Ok(buffer) => buffer,
                Err(_) => continue,
            };

            let expired = serde_json::from_str::<DiskEntry>(&buffer)
                .map(|entry| entry.expires_at <= now)
                .unwrap_or(true);
            if expired {
                fs::remove_file(file.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::DiskTier;
    use crate::cache::{CachedValue, TtlClass};
    use chrono::{Duration, Utc};

    fn entry(ttl_secs: i64) -> CachedValue {
        CachedValue {
            value: serde_json::json!({"municipios": 5570}),
            origin_api: "ibge-municipalities".into(),
            ttl_class: TtlClass::Long,
            created_at: Utc::now(),
            expires_at: Utc::now() + Duration::seconds(ttl_secs),
            size_bytes: 20,
        }
    }

    #[test]
    fn test_roundtrip_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        let tier = DiskTier::new(dir.path()).unwrap();
        tier.put("ibge-municipalities:abc", &entry(3600)).unwrap();
        drop(tier);

        let reopened = DiskTier::new(dir.path()).unwrap();
        let cached = reopened.get("ibge-municipalities:abc").unwrap().unwrap();
        assert_eq!(cached.value["municipios"], 5570);
    }

    #[test]
    fn test_clean_expired_removes_only_stale_files() {
        let dir = tempfile::tempdir().unwrap();
        let tier = DiskTier::new(dir.path()).unwrap();

        tier.put("ibge-municipalities:live", &entry(3600)).unwrap();
        tier.put("ibge-municipalities:dead", &entry(-5)).unwrap();

        assert_eq!(tier.clean_expired().unwrap(), 1);
        assert!(tier.get("ibge-municipalities:live").unwrap().is_some());
        assert!(tier.get("ibge-municipalities:dead").unwrap().is_none());
    }
}
