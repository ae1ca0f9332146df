use crate::db::{Database, QueryUtils};
use crate::investigations::Principal;
use crate::orchestrator::Pipeline;
use crate::prelude::*;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::Row;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

string_enum!(pub enum JobPriority {
    Critical => "critical",
    High => "high",
    Default => "default",
    Low => "low",
    Background => "background",
});

impl JobPriority {
    fn rank(&self) -> u8 {
        match self {
            JobPriority::Critical => 0,
            JobPriority::High => 1,
            JobPriority::Default => 2,
            JobPriority::Low => 3,
            JobPriority::Background => 4,
        }
    }
}

string_enum!(pub enum JobKind {
    ScanNewData => "scan-new-data",
    ReanalyzeStale => "reanalyze-stale",
    UpstreamHealth => "upstream-health",
    CacheMaintenance => "cache-maintenance",
    AdHocQuery => "ad-hoc-query",
});

/// Retries with exponential backoff before a run is marked failed and the
/// regular schedule resumes.
const MAX_JOB_RETRIES: u32 = 3;
const RETRY_BASE_SECS: i64 = 30;

const LEASE_NAME: &str = "scheduler";

/// Standing queries the scan job re-runs autonomously; they flow through the
/// same pipeline as user submissions.
static AUTONOMOUS_QUERIES: &[&str] = &[
    "analisar contratos federais do ano corrente",
    "investigar fornecedores sancionados em contratos vigentes",
];

#[derive(Clone, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScheduledJob {
    pub id: String,
    pub kind: JobKind,
    pub payload: Option<String>,
    pub interval_secs: i64,
    pub priority: JobPriority,
    pub enabled: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: DateTime<Utc>,
    pub failure_streak: u32,
}

impl ScheduledJob {
    fn from_row(row: &Row) -> rusqlite::Result<RawJob> {
        Ok(RawJob {
            id: row.get("id")?,
            kind: row.get("kind")?,
            payload: row.get("payload")?,
            interval_secs: row.get("interval_secs")?,
            priority: row.get("priority")?,
            enabled: row.get("enabled")?,
            last_run_at: row.get("last_run_at")?,
            next_run_at: row.get("next_run_at")?,
            failure_streak: row.get("failure_streak")?,
        })
    }
}

struct RawJob {
    id: String,
    kind: String,
    payload: Option<String>,
    interval_secs: i64,
    priority: String,
    enabled: bool,
    last_run_at: Option<DateTime<Utc>>,
    next_run_at: DateTime<Utc>,
    failure_streak: u32,
}

impl RawJob {
    fn into_job(self) -> Fallible<ScheduledJob> {
        Ok(ScheduledJob {
            id: self.id,
            kind: self.kind.parse()?,
            payload: self.payload,
            interval_secs: self.interval_secs,
            priority: self.priority.parse()?,
            enabled: self.enabled,
            last_run_at: self.last_run_at,
            next_run_at: self.next_run_at,
            failure_streak: self.failure_streak,
        })
    }
}

/// Periodic autonomous jobs over a leader lease: any number of replicas may
/// run, exactly one fires jobs at a time. Standbys take over when the lease
/// expires.
pub struct Scheduler {
    db: Database,
    pipeline: Arc<Pipeline>,
    instance_id: String,
    shutdown: Arc<AtomicBool>,
}

impl Scheduler {
    pub fn new(pipeline: Arc<Pipeline>, shutdown: Arc<AtomicBool>) -> Self {
        Scheduler {
            db: pipeline.db.clone(),
            pipeline,
            instance_id: crate::utils::random_id("sched"),
            shutdown,
        }
    }

    /// Registers the built-in job catalog, keeping any rows that already
    /// exist (their schedule state survives restarts).
    pub fn seed_default_jobs(&self) -> Fallible<()> {
        let defaults = [
            (JobKind::ScanNewData, 6 * 3600, JobPriority::Default),
            (JobKind::ReanalyzeStale, 24 * 3600, JobPriority::Background),
            (JobKind::UpstreamHealth, 300, JobPriority::High),
            (JobKind::CacheMaintenance, 3600, JobPriority::Low),
        ];

        for (kind, interval_secs, priority) in defaults {
            self.register(&ScheduledJob {
                id: kind.to_string(),
                kind,
                payload: None,
                interval_secs,
                priority,
                enabled: true,
                last_run_at: None,
                next_run_at: Utc::now(),
                failure_streak: 0,
            })?;
        }
        Ok(())
    }

    pub fn register(&self, job: &ScheduledJob) -> Fallible<()> {
        self.db.execute(
            "INSERT OR IGNORE INTO scheduled_jobs \
                (id, kind, payload, interval_secs, priority, enabled, next_run_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7);",
            &[
                &job.id,
                &job.kind.to_str(),
                &job.payload,
                &job.interval_secs,
                &job.priority.to_str(),
                &job.enabled,
                &job.next_run_at,
            ],
        )?;
        Ok(())
    }

    /// Queues a one-shot task at the given priority; it fires on the next
    /// leader tick and then disables itself.
    pub fn enqueue(&self, query_text: &str, priority: JobPriority) -> Fallible<String> {
        let id = crate::utils::random_id("job");
        self.db.execute(
            "INSERT INTO scheduled_jobs \
                (id, kind, payload, interval_secs, priority, enabled, next_run_at) \
             VALUES (?1, ?2, ?3, 0, ?4, 1, ?5);",
            &[
                &id,
                &JobKind::AdHocQuery.to_str(),
                &query_text,
                &priority.to_str(),
                &Utc::now(),
            ],
        )?;
        Ok(id)
    }

    /// The blocking scheduler loop; run on a dedicated thread.
    pub fn worker_loop(&self) {
        info!("scheduler {} started", self.instance_id);
        while !self.shutdown.load(Ordering::SeqCst) {
            if let Err(err) = self.tick() {
                crate::utils::report_failure(&err);
            }
            std::thread::sleep(Duration::from_secs(
                self.pipeline.config.scheduler.tick_secs.max(1),
            ));
        }

        if let Err(err) = self.release_lease() {
            warn!("scheduler {} failed to release lease: {}", self.instance_id, err);
        }
        info!("scheduler {} stopped", self.instance_id);
    }

    /// One scheduling round: acquire (or keep) the lease, fire due jobs in
    /// priority order. Standbys return immediately.
    pub fn tick(&self) -> Fallible<()> {
        if !self.try_acquire_lease()? {
            return Ok(());
        }

        let mut due = self.due_jobs()?;
        due.sort_by_key(|job| (job.priority.rank(), job.next_run_at));

        for job in due {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            // Losing the lease mid-tick aborts dispatch; in-flight
            // investigations keep running under their orchestrator.
            if !self.holds_lease()? {
                debug!("scheduler {} lost the lease mid-tick", self.instance_id);
                break;
            }

            // Advancing the schedule before firing makes a crash-then-
            // takeover under-deliver (at most once) instead of double-fire,
            // and coalesces any missed firings into this single run.
            self.advance(&job)?;
            match self.run_job(&job) {
                Ok(()) => {
                    self.record_success(&job)?;
                    self.pipeline
                        .metrics
                        .record_scheduler_run(job.kind.to_str(), "ok");
                }
                Err(err) => {
                    warn!("scheduled job {} failed: {}", job.id, err);
                    self.record_failure(&job)?;
                }
            }
        }

        Ok(())
    }

    fn due_jobs(&self) -> Fallible<Vec<ScheduledJob>> {
        let raw = self.db.query(
            "SELECT * FROM scheduled_jobs WHERE enabled = 1 AND next_run_at <= ?1;",
            [Utc::now()],
            ScheduledJob::from_row,
        )?;
        raw.into_iter().map(|raw| raw.into_job()).collect()
    }

    fn advance(&self, job: &ScheduledJob) -> Fallible<()> {
        if job.interval_secs <= 0 {
            // One-shot tasks retire after a single firing.
            self.db.execute(
                "UPDATE scheduled_jobs SET enabled = 0 WHERE id = ?1;",
                &[&job.id],
            )?;
        } else {
            self.db.execute(
                "UPDATE scheduled_jobs SET next_run_at = ?2 WHERE id = ?1;",
                &[
                    &job.id,
                    &(Utc::now() + ChronoDuration::seconds(job.interval_secs)),
                ],
            )?;
        }
        Ok(())
    }

    fn record_success(&self, job: &ScheduledJob) -> Fallible<()> {
        self.db.execute(
            "UPDATE scheduled_jobs SET last_run_at = ?2, failure_streak = 0 WHERE id = ?1;",
            &[&job.id, &Utc::now()],
        )?;
        Ok(())
    }

    fn record_failure(&self, job: &ScheduledJob) -> Fallible<()> {
        let streak = job.failure_streak + 1;
        if streak <= MAX_JOB_RETRIES && job.interval_secs > 0 {
            // Pull the next firing forward for a capped-backoff retry.
            let backoff = (RETRY_BASE_SECS << (streak - 1).min(8)).min(job.interval_secs);
            self.db.execute(
                "UPDATE scheduled_jobs SET failure_streak = ?2, next_run_at = ?3 \
                 WHERE id = ?1;",
                &[
                    &job.id,
                    &streak,
                    &(Utc::now() + ChronoDuration::seconds(backoff)),
                ],
            )?;
            self.pipeline
                .metrics
                .record_scheduler_run(job.kind.to_str(), "retry");
        } else {
            // Retries exhausted: the run is failed, the schedule continues.
            self.db.execute(
                "UPDATE scheduled_jobs SET failure_streak = 0 WHERE id = ?1;",
                &[&job.id],
            )?;
            self.pipeline
                .metrics
                .record_scheduler_run(job.kind.to_str(), "failed");
        }
        Ok(())
    }

    fn run_job(&self, job: &ScheduledJob) -> Fallible<()> {
        let principal = Principal::Service("scheduler".into());
        match job.kind {
            JobKind::ScanNewData => {
                for query in AUTONOMOUS_QUERIES {
                    self.pipeline
                        .submit_query(&principal, query, None, None, None)
                        .map_err(|err| anyhow!("submitting scan query: {err}"))?;
                }
                Ok(())
            }
            JobKind::ReanalyzeStale => {
                let cutoff = Utc::now()
                    - ChronoDuration::days(self.pipeline.config.scheduler.reanalyze_after_days);
                for stale in self.pipeline.store.stale_completed(cutoff, 3)? {
                    self.pipeline
                        .submit_query(
                            &principal,
                            &stale.query_text,
                            stale.session_id.clone(),
                            stale.data_source.clone(),
                            Some(stale.filters.clone()),
                        )
                        .map_err(|err| anyhow!("resubmitting {}: {err}", stale.id))?;
                }
                Ok(())
            }
            JobKind::UpstreamHealth => {
                // A probe through the ordinary federated path: result lands
                // in the breaker state the readiness endpoint reports.
                let hints = crate::federation::FetchHints::new(
                    std::time::Instant::now() + Duration::from_secs(5),
                    &format!("health-{}", self.instance_id),
                    crate::utils::cancel::CancelToken::new(),
                );
                match self.pipeline.federator.fetch("ibge-states", &[], &hints) {
                    Ok(_) => Ok(()),
                    Err(err) => Err(anyhow!("upstream probe failed: {err}")),
                }
            }
            JobKind::CacheMaintenance => {
                let removed = self.pipeline.cache.clean_expired()?;
                debug!("cache maintenance removed {} expired entries", removed);
                Ok(())
            }
            JobKind::AdHocQuery => {
                let query = job
                    .payload
                    .as_deref()
                    .ok_or_else(|| anyhow!("ad-hoc job {} has no query", job.id))?;
                self.pipeline
                    .submit_query(&principal, query, None, None, None)
                    .map_err(|err| anyhow!("submitting ad-hoc query: {err}"))?;
                Ok(())
            }
        }
    }

    fn try_acquire_lease(&self) -> Fallible<bool> {
        let now = Utc::now();
        let ttl = ChronoDuration::seconds(
            self.pipeline.config.scheduler.leader_lease_ttl_secs as i64,
        );

        self.db.transaction(true, |trans| {
            let current = trans.get_row(
                "SELECT holder, expires_at FROM leases WHERE name = ?1;",
                [LEASE_NAME],
                |r| {
                    Ok((
                        r.get::<_, String>("holder")?,
                        r.get::<_, DateTime<Utc>>("expires_at")?,
                    ))
                },
            )?;

            let may_take = match &current {
                None => true,
                Some((holder, _)) if *holder == self.instance_id => true,
                Some((_, expires_at)) => *expires_at <= now,
            };
            if !may_take {
                return Ok(false);
            }

            trans.execute(
                "INSERT INTO leases (name, holder, expires_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT (name) DO UPDATE SET \
                    holder = excluded.holder, expires_at = excluded.expires_at;",
                &[&LEASE_NAME, &self.instance_id.as_str(), &(now + ttl)],
            )?;
            Ok(true)
        })
    }

    fn holds_lease(&self) -> Fallible<bool> {
        Ok(self
            .db
            .get_row(
                "SELECT holder FROM leases WHERE name = ?1 AND expires_at > ?2;",
                rusqlite::params![LEASE_NAME, Utc::now()],
                |r| r.get::<_, String>("holder"),
            )?
            .map(|holder| holder == self.instance_id)
            .unwrap_or(false))
    }

    fn release_lease(&self) -> Fallible<()> {
        self.db.execute(
            "DELETE FROM leases WHERE name = ?1 AND holder = ?2;",
            &[&LEASE_NAME, &self.instance_id.as_str()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{JobKind, JobPriority, ScheduledJob, Scheduler};
    use crate::db::QueryUtils;
    use crate::investigations::{ListFilters, Principal};
    use crate::orchestrator::Pipeline;
    use chrono::{Duration as ChronoDuration, Utc};
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn scheduler(pipeline: &Arc<Pipeline>) -> Scheduler {
        // Point every endpoint at a local stub so scheduler-driven
        // investigations never leave the machine.
        let (url, _) = crate::utils::stub::stub_upstream(200, "[]");
        for endpoint in crate::registry::all() {
            pipeline.federator.override_base_url(endpoint.id, &url);
        }
        Scheduler::new(pipeline.clone(), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn test_exactly_one_leader() {
        let pipeline = Arc::new(Pipeline::test().unwrap());
        let first = scheduler(&pipeline);
        let second = scheduler(&pipeline);

        assert!(first.try_acquire_lease().unwrap());
        assert!(!second.try_acquire_lease().unwrap());
        // Re-acquiring one's own lease refreshes it.
        assert!(first.try_acquire_lease().unwrap());

        first.release_lease().unwrap();
        assert!(second.try_acquire_lease().unwrap());
    }

    #[test]
    fn test_jobs_fire_only_when_due_and_only_once() {
        let pipeline = Arc::new(Pipeline::test().unwrap());
        let leader = scheduler(&pipeline);
        let standby = scheduler(&pipeline);

        leader
            .register(&ScheduledJob {
                id: "future".into(),
                kind: JobKind::CacheMaintenance,
                payload: None,
                interval_secs: 3600,
                priority: JobPriority::Default,
                enabled: true,
                last_run_at: None,
                next_run_at: Utc::now() + ChronoDuration::hours(1),
                failure_streak: 0,
            })
            .unwrap();
        leader.enqueue("investigar contratos de 2024", JobPriority::High).unwrap();

        leader.tick().unwrap();
        standby.tick().unwrap();

        // The ad-hoc job fired exactly once (one investigation), the future
        // job not at all.
        let service = Principal::Service("test".into());
        let investigations = pipeline
            .store
            .list(&service, &ListFilters::default())
            .unwrap();
        assert_eq!(investigations.len(), 1);
        assert_eq!(investigations[0].user_id, "scheduler");

        let future_last_run: Option<String> = pipeline
            .db
            .get_row(
                "SELECT last_run_at FROM scheduled_jobs WHERE id = 'future';",
                [],
                |r| r.get("last_run_at"),
            )
            .unwrap()
            .unwrap();
        assert!(future_last_run.is_none());
    }

    #[test]
    fn test_missed_firings_coalesce() {
        let pipeline = Arc::new(Pipeline::test().unwrap());
        let leader = scheduler(&pipeline);

        // Overdue by many intervals: a single catch-up run, then the next
        // firing lands one interval from now.
        leader
            .register(&ScheduledJob {
                id: "overdue".into(),
                kind: JobKind::CacheMaintenance,
                payload: None,
                interval_secs: 600,
                priority: JobPriority::Low,
                enabled: true,
                last_run_at: None,
                next_run_at: Utc::now() - ChronoDuration::hours(10),
                failure_streak: 0,
            })
            .unwrap();

        leader.tick().unwrap();

        let (last_run, next_run): (Option<String>, chrono::DateTime<Utc>) = pipeline
            .db
            .get_row(
                "SELECT last_run_at, next_run_at FROM scheduled_jobs WHERE id = 'overdue';",
                [],
                |r| Ok((r.get("last_run_at")?, r.get("next_run_at")?)),
            )
            .unwrap()
            .unwrap();
        assert!(last_run.is_some());

        let delta = next_run - Utc::now();
        assert!(delta > ChronoDuration::seconds(500) && delta <= ChronoDuration::seconds(600));
    }

    #[test]
    fn test_failed_job_retries_with_backoff() {
        let pipeline = Arc::new(Pipeline::test().unwrap());
        let leader = scheduler(&pipeline);

        // An ad-hoc job with no payload always fails its run.
        pipeline
            .db
            .execute(
                "INSERT INTO scheduled_jobs \
                    (id, kind, payload, interval_secs, priority, enabled, next_run_at) \
                 VALUES ('broken', 'ad-hoc-query', NULL, 600, 'default', 1, ?1);",
                &[&Utc::now()],
            )
            .unwrap();

        leader.tick().unwrap();

        let (streak, next_run): (u32, chrono::DateTime<Utc>) = pipeline
            .db
            .get_row(
                "SELECT failure_streak, next_run_at FROM scheduled_jobs WHERE id = 'broken';",
                [],
                |r| Ok((r.get("failure_streak")?, r.get("next_run_at")?)),
            )
            .unwrap()
            .unwrap();
        assert_eq!(streak, 1);

        // First retry lands ~30s out, well before the 600s interval.
        let delta = next_run - Utc::now();
        assert!(delta <= ChronoDuration::seconds(35));
    }
}
