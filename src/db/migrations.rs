use crate::prelude::*;
use rusqlite::Connection;
use std::collections::HashSet;

enum MigrationKind {
    SQL(&'static str),
}

fn migrations() -> Vec<(&'static str, MigrationKind)> {
    let mut migrations = Vec::new();

    migrations.push((
        "initial",
        MigrationKind::SQL(
            "
            CREATE TABLE investigations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                session_id TEXT,

                query_text TEXT NOT NULL,
                data_source TEXT,
                filters TEXT NOT NULL DEFAULT '{}',
                requested_workers TEXT NOT NULL DEFAULT '[]',

                status TEXT NOT NULL,
                current_phase TEXT,
                progress REAL NOT NULL DEFAULT 0,

                summary TEXT,
                confidence REAL,
                records_analyzed INTEGER NOT NULL DEFAULT 0,
                findings_count INTEGER NOT NULL DEFAULT 0,

                error_kind TEXT,
                error_message TEXT,
                investigation_metadata TEXT NOT NULL DEFAULT '{}',

                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
                started_at DATETIME,
                completed_at DATETIME
            );

            CREATE INDEX investigations__user_status
            ON investigations (user_id, status);

            CREATE TABLE findings (
                id TEXT PRIMARY KEY,
                investigation_id TEXT NOT NULL,
                position INTEGER NOT NULL,

                kind TEXT NOT NULL,
                severity TEXT NOT NULL,
                confidence REAL NOT NULL,
                description TEXT NOT NULL,
                evidence TEXT NOT NULL DEFAULT '{}',
                produced_by TEXT NOT NULL,
                produced_at DATETIME NOT NULL,

                FOREIGN KEY (investigation_id)
                    REFERENCES investigations(id) ON DELETE CASCADE
            );

            CREATE INDEX findings__investigation
            ON findings (investigation_id, position);
            ",
        ),
    ));

    migrations.push((
        "shared_cache_tier",
        MigrationKind::SQL(
            "
            CREATE TABLE cache (
                fingerprint TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                origin_api TEXT NOT NULL,
                ttl_class TEXT NOT NULL,
                size_bytes INTEGER NOT NULL,
                created_at DATETIME NOT NULL,
                expires_at DATETIME NOT NULL
            );

            CREATE INDEX cache__expires ON cache (expires_at);
            ",
        ),
    ));

    migrations.push((
        "scheduler_state",
        MigrationKind::SQL(
            "
            CREATE TABLE leases (
                name TEXT PRIMARY KEY,
                holder TEXT NOT NULL,
                expires_at DATETIME NOT NULL
            );

            CREATE TABLE scheduled_jobs (
                id TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                payload TEXT,
                interval_secs INTEGER NOT NULL,
                priority TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                last_run_at DATETIME,
                next_run_at DATETIME NOT NULL,
                failure_streak INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX scheduled_jobs__due
            ON scheduled_jobs (enabled, next_run_at);
            ",
        ),
    ));

    migrations
}

pub fn execute(db: &mut Connection) -> Fallible<()> {
    // If the database version is 0, create the migrations table and bump it
    let version: i32 = db.query_row("PRAGMA user_version;", [], |r| r.get(0))?;
    if version == 0 {
        db.execute("CREATE TABLE migrations (name TEXT PRIMARY KEY);", [])?;
        db.execute("PRAGMA user_version = 1;", [])?;
    }

    let executed_migrations = {
        let mut prepared = db.prepare("SELECT name FROM migrations;")?;
        let mut result = HashSet::new();
        for value in prepared.query_map([], |row| row.get::<_, String>(0))? {
            result.insert(value?);
        }

        result
    };

    for &(name, ref migration) in &migrations() {
        if !executed_migrations.contains(name) {
            let t = db.transaction()?;
            match migration {
                MigrationKind::SQL(sql) => t.execute_batch(sql),
            }
            .with_context(|| format!("error running migration: {name}"))?;

            t.execute("INSERT INTO migrations (name) VALUES (?1)", [&name])?;
            t.commit()?;

            info!("executed migration: {}", name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::db::{Database, QueryUtils};

    #[test]
    fn test_migrations_are_idempotent() {
        let db = Database::temp().unwrap();

        // Reopening against the same file must not re-run anything; the
        // temp database is dropped here, so just check the tables exist.
        assert!(db
            .exists("SELECT 1 FROM sqlite_master WHERE name = 'investigations';", &[])
            .unwrap());
        assert!(db
            .exists("SELECT 1 FROM sqlite_master WHERE name = 'findings';", &[])
            .unwrap());
        assert!(db
            .exists("SELECT 1 FROM sqlite_master WHERE name = 'cache';", &[])
            .unwrap());
        assert!(db
            .exists("SELECT 1 FROM sqlite_master WHERE name = 'leases';", &[])
            .unwrap());
    }
}
