use crate::db::{Database, QueryUtils};
use crate::errors::ErrorKind;
use crate::prelude::*;
use crate::workers::WorkerKind;
use chrono::{DateTime, Utc};
use rusqlite::Row;

string_enum!(pub enum Status {
    Pending => "pending",
    Processing => "processing",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Completed | Status::Failed | Status::Cancelled)
    }
}

string_enum!(pub enum Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
    Critical => "critical",
});

/// One atomic analytical output (an anomaly, a pattern, a violation).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: String,
    pub kind: String,
    pub severity: Severity,
    pub confidence: f64,
    pub description: String,
    pub evidence: serde_json::Value,
    pub produced_by: WorkerKind,
    pub produced_at: DateTime<Utc>,
}

impl Finding {
    pub fn new(
        kind: &str,
        severity: Severity,
        confidence: f64,
        description: String,
        evidence: serde_json::Value,
        produced_by: WorkerKind,
    ) -> Self {
        Finding {
            id: crate::utils::random_id("fnd"),
            kind: kind.to_string(),
            severity,
            confidence: confidence.clamp(0.0, 1.0),
            description,
            evidence,
            produced_by,
            produced_at: Utc::now(),
        }
    }
}

/// Who is asking. Users see only their own investigations; service
/// principals (scheduler, ops tooling) see everything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    User(String),
    Service(String),
}

impl Principal {
    pub fn user_id(&self) -> &str {
        match self {
            Principal::User(id) => id,
            Principal::Service(name) => name,
        }
    }

    fn can_see(&self, owner: &str) -> bool {
        match self {
            Principal::User(id) => id == owner,
            Principal::Service(_) => true,
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Investigation {
    pub id: String,
    pub user_id: String,
    pub session_id: Option<String>,

    pub query_text: String,
    pub data_source: Option<String>,
    pub filters: serde_json::Value,
    pub requested_workers: Vec<WorkerKind>,

    pub status: Status,
    pub current_phase: Option<String>,
    pub progress: f64,

    pub summary: Option<String>,
    pub confidence: Option<f64>,
    pub records_analyzed: i64,
    pub findings_count: i64,

    pub error_kind: Option<String>,
    pub error_message: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

pub struct NewInvestigation {
    pub user_id: String,
    pub session_id: Option<String>,
    pub query_text: String,
    pub data_source: Option<String>,
    pub filters: serde_json::Value,
    pub requested_workers: Vec<WorkerKind>,
}

#[derive(Default)]
pub struct ListFilters {
    pub user_id: Option<String>,
    pub status: Option<Status>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Serialize)]
pub struct Stats {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
    pub cancelled: i64,
    pub avg_confidence: Option<f64>,
    pub total_findings: i64,
}

/// Durable CRUD for investigations, with per-row access control and a
/// monotonic-progress guard enforced in SQL.
#[derive(Clone)]
pub struct InvestigationStore {
    db: Database,
}

impl InvestigationStore {
    pub fn new(db: Database) -> Self {
        InvestigationStore { db }
    }

    pub fn create(&self, new: NewInvestigation) -> Fallible<Investigation> {
        let now = Utc::now();
        let investigation = Investigation {
            id: crate::utils::random_id("inv"),
            user_id: new.user_id,
            session_id: new.session_id,
            query_text: new.query_text,
            data_source: new.data_source,
            filters: new.filters,
            requested_workers: new.requested_workers,
            status: Status::Pending,
            current_phase: None,
            progress: 0.0,
            summary: None,
            confidence: None,
            records_analyzed: 0,
            findings_count: 0,
            error_kind: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        };

        self.db.execute(
            "INSERT INTO investigations \
                (id, user_id, session_id, query_text, data_source, filters, \
                 requested_workers, status, progress, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 0, ?9, ?9);",
            &[
                &investigation.id,
                &investigation.user_id,
                &investigation.session_id,
                &investigation.query_text,
                &investigation.data_source,
                &serde_json::to_string(&investigation.filters)?,
                &serde_json::to_string(&investigation.requested_workers)?,
                &investigation.status.to_str(),
                &now,
            ],
        )?;

        Ok(investigation)
    }

    pub fn get(&self, principal: &Principal, id: &str) -> Result<Investigation, ErrorKind> {
        let record = self
            .db
            .get_row(
                "SELECT * FROM investigations WHERE id = ?1;",
                [id],
                InvestigationDBRecord::from_row,
            )
            .map_err(internal)?
            .ok_or_else(|| ErrorKind::NotFound(format!("investigation {id}")))?;

        let investigation = record.into_investigation().map_err(internal)?;
        if !principal.can_see(&investigation.user_id) {
            // Leaking existence to other users is as bad as leaking content.
            return Err(ErrorKind::NotFound(format!("investigation {id}")));
        }
        Ok(investigation)
    }

    pub fn list(
        &self,
        principal: &Principal,
        filters: &ListFilters,
    ) -> Fallible<Vec<Investigation>> {
        let owner = match principal {
            Principal::User(id) => Some(id.clone()),
            Principal::Service(_) => filters.user_id.clone(),
        };
        let limit = if filters.limit <= 0 { 50 } else { filters.limit };

        let records = self.db.query(
            "SELECT * FROM investigations \
             WHERE (?1 IS NULL OR user_id = ?1) \
               AND (?2 IS NULL OR status = ?2) \
             ORDER BY created_at DESC, id \
             LIMIT ?3 OFFSET ?4;",
            rusqlite::params![
                owner,
                filters.status.map(|s| s.to_str()),
                limit,
                filters.offset.max(0),
            ],
            InvestigationDBRecord::from_row,
        )?;

        records
            .into_iter()
            .map(|record| record.into_investigation())
            .collect()
    }

    /// Marks the investigation as started. Pending is the only valid
    /// starting point; anything else (a cancel racing the queue) is reported
    /// back to the caller as `false`.
    pub fn start(&self, id: &str) -> Fallible<bool> {
        let now = Utc::now();
        let changed = self.db.execute(
            "UPDATE investigations \
             SET status = 'processing', started_at = ?2, updated_at = ?2 \
             WHERE id = ?1 AND status = 'pending';",
            &[&id, &now],
        )?;
        Ok(changed == 1)
    }

    /// Progress is monotonically non-decreasing; the guard lives in the SQL
    /// so concurrent writers cannot interleave a regression.
    pub fn record_progress(&self, id: &str, progress: f64, phase: &str) -> Result<(), ErrorKind> {
        let now = Utc::now();
        let changed = self
            .db
            .execute(
                "UPDATE investigations \
                 SET progress = ?2, current_phase = ?3, updated_at = ?4 \
                 WHERE id = ?1 AND progress <= ?2 AND status = 'processing';",
                &[&id, &progress, &phase, &now],
            )
            .map_err(internal)?;

        if changed == 1 {
            Ok(())
        } else if self
            .db
            .exists("SELECT 1 FROM investigations WHERE id = ?1;", &[&id])
            .map_err(internal)?
        {
            Err(ErrorKind::Validation(format!(
                "progress update for {id} rejected (regression or terminal status)"
            )))
        } else {
            Err(ErrorKind::NotFound(format!("investigation {id}")))
        }
    }

    pub fn add_findings(&self, id: &str, findings: &[Finding]) -> Fallible<()> {
        if findings.is_empty() {
            return Ok(());
        }

        self.db.transaction(true, |trans| {
            let base: i64 = trans
                .get_row(
                    "SELECT COALESCE(MAX(position), -1) AS position \
                     FROM findings WHERE investigation_id = ?1;",
                    [id],
                    |r| r.get("position"),
                )?
                .unwrap_or(-1);

            for (offset, finding) in findings.iter().enumerate() {
                trans.execute(
                    "INSERT INTO findings \
                        (id, investigation_id, position, kind, severity, confidence, \
                         description, evidence, produced_by, produced_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10);",
                    &[
                        &finding.id,
                        &id,
                        &(base + 1 + offset as i64),
                        &finding.kind,
                        &finding.severity.to_str(),
                        &finding.confidence,
                        &finding.description,
                        &serde_json::to_string(&finding.evidence)?,
                        &finding.produced_by.to_str(),
                        &finding.produced_at,
                    ],
                )?;
            }

            trans.execute(
                "UPDATE investigations SET \
                    findings_count = (SELECT COUNT(*) FROM findings WHERE investigation_id = ?1), \
                    updated_at = ?2 \
                 WHERE id = ?1;",
                &[&id, &Utc::now()],
            )?;

            Ok(())
        })
    }

    pub fn findings(&self, id: &str) -> Fallible<Vec<Finding>> {
        let rows = self.db.query(
            "SELECT * FROM findings WHERE investigation_id = ?1 ORDER BY position;",
            [id],
            |r| {
                Ok((
                    r.get::<_, String>("id")?,
                    r.get::<_, String>("kind")?,
                    r.get::<_, String>("severity")?,
                    r.get::<_, f64>("confidence")?,
                    r.get::<_, String>("description")?,
                    r.get::<_, String>("evidence")?,
                    r.get::<_, String>("produced_by")?,
                    r.get::<_, DateTime<Utc>>("produced_at")?,
                ))
            },
        )?;

        rows.into_iter()
            .map(
                |(id, kind, severity, confidence, description, evidence, produced_by, produced_at)| {
                    Ok(Finding {
                        id,
                        kind,
                        severity: severity.parse()?,
                        confidence,
                        description,
                        evidence: serde_json::from_str(&evidence)?,
                        produced_by: produced_by.parse()?,
                        produced_at,
                    })
                },
            )
            .collect()
    }

    pub fn add_records_analyzed(&self, id: &str, records: i64) -> Fallible<()> {
        self.db.execute(
            "UPDATE investigations \
             SET records_analyzed = records_analyzed + ?2, updated_at = ?3 \
             WHERE id = ?1;",
            &[&id, &records, &Utc::now()],
        )?;
        Ok(())
    }

    pub fn complete(
        &self,
        id: &str,
        summary: Option<&str>,
        confidence: f64,
    ) -> Fallible<()> {
        let now = Utc::now();
        self.db.execute(
            "UPDATE investigations \
             SET status = 'completed', progress = 1.0, summary = ?2, confidence = ?3, \
                 current_phase = NULL, completed_at = ?4, updated_at = ?4 \
             WHERE id = ?1 AND status = 'processing';",
            &[&id, &summary, &confidence, &now],
        )?;
        Ok(())
    }

    /// A failed investigation always carries its error kind and message;
    /// findings produced before the failure are preserved.
    pub fn fail(&self, id: &str, error: &ErrorKind) -> Fallible<()> {
        let now = Utc::now();
        self.db.execute(
            "UPDATE investigations \
             SET status = 'failed', error_kind = ?2, error_message = ?3, \
                 completed_at = ?4, updated_at = ?4 \
             WHERE id = ?1 AND status IN ('pending', 'processing');",
            &[&id, &error.label(), &error.to_string(), &now],
        )?;
        Ok(())
    }

    /// Flips a non-terminal investigation to cancelled. Returns the record
    /// either way: cancelling a terminal investigation is a no-op that
    /// reports the terminal state.
    pub fn cancel(&self, principal: &Principal, id: &str) -> Result<Investigation, ErrorKind> {
        // Access check first; hides other users' records entirely.
        let current = self.get(principal, id)?;

        if current.status.is_terminal() {
            return Ok(current);
        }

        let now = Utc::now();
        self.db
            .execute(
                "UPDATE investigations \
                 SET status = 'cancelled', completed_at = ?2, updated_at = ?2 \
                 WHERE id = ?1 AND status IN ('pending', 'processing');",
                &[&id, &now],
            )
            .map_err(internal)?;

        self.get(principal, id)
    }

    pub fn stats(&self, principal: &Principal, user_id: Option<&str>) -> Fallible<Stats> {
        let owner = match principal {
            Principal::User(id) => Some(id.as_str()),
            Principal::Service(_) => user_id,
        };

        let row = self
            .db
            .get_row(
                "SELECT COUNT(*) AS total, \
                        SUM(status = 'pending') AS pending, \
                        SUM(status = 'processing') AS processing, \
                        SUM(status = 'completed') AS completed, \
                        SUM(status = 'failed') AS failed, \
                        SUM(status = 'cancelled') AS cancelled, \
                        AVG(confidence) AS avg_confidence, \
                        SUM(findings_count) AS total_findings \
                 FROM investigations WHERE (?1 IS NULL OR user_id = ?1);",
                [owner],
                |r| {
                    Ok(Stats {
                        total: r.get("total")?,
                        pending: r.get::<_, Option<i64>>("pending")?.unwrap_or(0),
                        processing: r.get::<_, Option<i64>>("processing")?.unwrap_or(0),
                        completed: r.get::<_, Option<i64>>("completed")?.unwrap_or(0),
                        failed: r.get::<_, Option<i64>>("failed")?.unwrap_or(0),
                        cancelled: r.get::<_, Option<i64>>("cancelled")?.unwrap_or(0),
                        avg_confidence: r.get("avg_confidence")?,
                        total_findings: r.get::<_, Option<i64>>("total_findings")?.unwrap_or(0),
                    })
                },
            )?
            .ok_or_else(|| anyhow!("stats query returned no row"))?;

        Ok(row)
    }

    /// Completed investigations whose results predate the cutoff, for the
    /// reanalyze-stale scheduled job.
    pub fn stale_completed(&self, cutoff: DateTime<Utc>, limit: i64) -> Fallible<Vec<Investigation>> {
        let records = self.db.query(
            "SELECT * FROM investigations \
             WHERE status = 'completed' AND completed_at < ?1 \
             ORDER BY completed_at LIMIT ?2;",
            rusqlite::params![cutoff, limit],
            InvestigationDBRecord::from_row,
        )?;
        records
            .into_iter()
            .map(|record| record.into_investigation())
            .collect()
    }
}

fn internal(err: anyhow::Error) -> ErrorKind {
    ErrorKind::Internal(err.to_string())
}

struct InvestigationDBRecord {
    id: String,
    user_id: String,
    session_id: Option<String>,
    query_text: String,
    data_source: Option<String>,
    filters: String,
    requested_workers: String,
    status: String,
    current_phase: Option<String>,
    progress: f64,
    summary: Option<String>,
    confidence: Option<f64>,
    records_analyzed: i64,
    findings_count: i64,
    error_kind: Option<String>,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl InvestigationDBRecord {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        Ok(InvestigationDBRecord {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            session_id: row.get("session_id")?,
            query_text: row.get("query_text")?,
            data_source: row.get("data_source")?,
            filters: row.get("filters")?,
            requested_workers: row.get("requested_workers")?,
            status: row.get("status")?,
            current_phase: row.get("current_phase")?,
            progress: row.get("progress")?,
            summary: row.get("summary")?,
            confidence: row.get("confidence")?,
            records_analyzed: row.get("records_analyzed")?,
            findings_count: row.get("findings_count")?,
            error_kind: row.get("error_kind")?,
            error_message: row.get("error_message")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    fn into_investigation(self) -> Fallible<Investigation> {
        Ok(Investigation {
            id: self.id,
            user_id: self.user_id,
            session_id: self.session_id,
            query_text: self.query_text,
            data_source: self.data_source,
            filters: serde_json::from_str(&self.filters)?,
            requested_workers: serde_json::from_str(&self.requested_workers)?,
            status: self.status.parse()?,
            current_phase: self.current_phase,
            progress: self.progress,
            summary: self.summary,
            confidence: self.confidence,
            records_analyzed: self.records_analyzed,
            findings_count: self.findings_count,
            error_kind: self.error_kind,
            error_message: self.error_message,
            created_at: self.created_at,
            updated_at: self.updated_at,
            started_at: self.started_at,
            completed_at: self.completed_at,
        })
    }
}
