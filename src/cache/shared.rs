use crate::cache::{CachedValue, TtlClass};
use crate::db::{Database, QueryUtils};
use crate::prelude::*;
use chrono::{DateTime, Utc};

/// SQLite-backed tier shared by every process on the host (server, CLI
/// one-shots, scheduler replicas).
pub(super) struct SqliteTier {
    db: Database,
}

impl SqliteTier {
    pub(super) fn new(db: Database) -> Self {
        SqliteTier { db }
    }

    pub(super) fn get(&self, fingerprint: &str) -> Fallible<Option<CachedValue>> {
        let row = self.db.get_row(
            "SELECT value, origin_api, ttl_class, size_bytes, created_at, expires_at \
             FROM cache WHERE fingerprint = ?1;",
            [fingerprint],
            |r| {
                Ok((
                    r.get::<_, String>("value")?,
                    r.get::<_, String>("origin_api")?,
                    r.get::<_, String>("ttl_class")?,
                    r.get::<_, i64>("size_bytes")?,
                    r.get::<_, DateTime<Utc>>("created_at")?,
                    r.get::<_, DateTime<Utc>>("expires_at")?,
                ))
            },
        )?;

        let Some((value, origin_api, ttl_class, size_bytes, created_at, expires_at)) = row
        else {
            return Ok(None);
        };

        if expires_at <= Utc::now() {
            self.db
                .execute("DELETE FROM cache WHERE fingerprint = ?1;", &[&fingerprint])?;
            return Ok(None);
        }

        Ok(Some(CachedValue {
            value: serde_json::from_str(&value)?,
            origin_api,
            ttl_class: ttl_class.parse::<TtlClass>()?,
            created_at,
            expires_at,
            size_bytes: size_bytes as usize,
        }))
    }

    pub(super) fn put(&self, fingerprint: &str, entry: &CachedValue) -> Fallible<()> {
        let value = serde_json::to_string(&entry.value)?;
        // MAX() on the textual timestamps keeps the later expiry; both sides
        // are RFC 3339 UTC so the lexicographic comparison is chronological.
        self.db.execute(
            "INSERT INTO cache \
                (fingerprint, value, origin_api, ttl_class, size_bytes, created_at, expires_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
             ON CONFLICT (fingerprint) DO UPDATE SET \
                value = excluded.value, \
                origin_api = excluded.origin_api, \
                ttl_class = excluded.ttl_class, \
                size_bytes = excluded.size_bytes, \
                expires_at = MAX(cache.expires_at, excluded.expires_at);",
            &[
                &fingerprint,
                &value,
                &entry.origin_api,
                &entry.ttl_class.to_str(),
                &(entry.size_bytes as i64),
                &entry.created_at,
                &entry.expires_at,
            ],
        )?;
        Ok(())
    }

    pub(super) fn invalidate(&self, prefix: &str) -> Fallible<()> {
        self.db.execute(
            "DELETE FROM cache WHERE fingerprint LIKE ?1 || '%';",
            &[&prefix],
        )?;
        Ok(())
    }

    pub(super) fn clean_expired(&self) -> Fallible<usize> {
        self.db.execute(
            "DELETE FROM cache WHERE expires_at <= ?1;",
            &[&Utc::now()],
        )
    }
}
