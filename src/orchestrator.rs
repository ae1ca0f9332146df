use crate::config::Config;
use crate::errors::ErrorKind;
use crate::events::{Event, EventBus};
use crate::federation::Federator;
use crate::investigations::{Finding, Investigation, InvestigationStore, Principal};
use crate::llm::LlmClient;
use crate::planner::{Composition, Plan, Step};
use crate::prelude::*;
use crate::router::Intent;
use crate::server::metrics::Metrics;
use crate::utils::cancel::CancelToken;
use crate::workers::{
    runtime::WorkerRuntime, ResponseStatus, WorkerContext, WorkerKind, WorkerMessage,
    WorkerResponse, REPORT_FINDING_KIND,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// A planned investigation waiting for an executor thread.
pub struct Job {
    pub investigation: Investigation,
    pub plan: Plan,
    pub intent: Intent,
}

/// Executes plans against the worker runtime, tracking progress in the
/// store and streaming events to the bus. Work arrives through a bounded
/// queue; a full queue sheds load instead of growing a backlog.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
    queue: crossbeam_channel::Sender<Job>,
}

struct Inner {
    store: InvestigationStore,
    bus: Arc<EventBus>,
    runtime: WorkerRuntime,
    federator: Arc<Federator>,
    llm: Arc<LlmClient>,
    config: Config,
    metrics: Metrics,
    cancels: Mutex<HashMap<String, CancelToken>>,
    queue_depth: AtomicI64,
}

enum Outcome {
    Completed {
        summary: Option<String>,
        confidence: f64,
    },
    Failed(ErrorKind),
    Cancelled,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: InvestigationStore,
        bus: Arc<EventBus>,
        runtime: WorkerRuntime,
        federator: Arc<Federator>,
        llm: Arc<LlmClient>,
        config: Config,
        metrics: Metrics,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<Job>(config.orchestrator.queue_size);
        let inner = Arc::new(Inner {
            store,
            bus,
            runtime,
            federator,
            llm,
            config: config.clone(),
            metrics,
            cancels: Mutex::new(HashMap::new()),
            queue_depth: AtomicI64::new(0),
        });

        for index in 0..config.orchestrator.executor_threads.max(1) {
            let inner = inner.clone();
            let rx = rx.clone();
            std::thread::Builder::new()
                .name(format!("executor-{index}"))
                .spawn(move || {
                    while let Ok(job) = rx.recv() {
                        let depth = inner.queue_depth.fetch_sub(1, Ordering::SeqCst) - 1;
                        inner.metrics.record_queue_depth(depth);

                        // A panicking investigation must not take the
                        // executor down with it.
                        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(
                            || inner.execute(job),
                        ));
                        if let Err(panic) = result {
                            crate::utils::report_panic(&*panic);
                        }
                    }
                })
                .expect("failed to spawn executor thread");
        }

        Orchestrator { inner, queue: tx }
    }

    /// Queues a planned investigation. Emits `created`; a full queue fails
    /// the investigation immediately so its record never dangles in
    /// `pending`.
    pub fn submit(&self, job: Job) -> Result<(), ErrorKind> {
        let id = job.investigation.id.clone();
        self.inner
            .bus
            .publish(Event::created(&job.investigation));

        match self.queue.try_send(job) {
            Ok(()) => {
                let depth = self.inner.queue_depth.fetch_add(1, Ordering::SeqCst) + 1;
                self.inner.metrics.record_queue_depth(depth);
                Ok(())
            }
            Err(crossbeam_channel::TrySendError::Full(_)) => {
                self.inner.metrics.record_bounced_submission();
                let error = ErrorKind::PoolExhausted("orchestrator queue".into());
                if let Err(err) = self.inner.store.fail(&id, &error) {
                    error!("[{}] failed to record shed submission: {}", id, err);
                }
                if let Ok(investigation) = self
                    .inner
                    .store
                    .get(&Principal::Service("orchestrator".into()), &id)
                {
                    self.inner.bus.publish(Event::failed(&investigation));
                }
                Err(error)
            }
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => {
                Err(ErrorKind::Internal("orchestrator queue closed".into()))
            }
        }
    }

    /// External cancellation: flips the stored status, signals the in-flight
    /// token and emits `cancelled`. Cancelling a terminal investigation is a
    /// no-op returning the terminal record.
    pub fn cancel(
        &self,
        principal: &Principal,
        id: &str,
    ) -> Result<Investigation, ErrorKind> {
        let before = self.inner.store.get(principal, id)?;
        let after = self.inner.store.cancel(principal, id)?;

        if !before.status.is_terminal() {
            if let Some(token) = self.inner.cancels.lock().unwrap().get(id) {
                token.cancel();
            }
            self.inner.bus.publish(Event::cancelled(id));
            info!("[{}] investigation cancelled", id);
        }

        Ok(after)
    }
}

impl Inner {
    fn execute(&self, job: Job) {
        let id = job.investigation.id.clone();
        let started = Instant::now();

        let cancel = CancelToken::new();
        self.cancels.lock().unwrap().insert(id.clone(), cancel.clone());

        let outcome = self.run_plan(&job, &cancel, started);

        self.cancels.lock().unwrap().remove(&id);

        match outcome {
            Outcome::Completed {
                summary,
                confidence,
            } => {
                if let Err(err) = self.store.complete(&id, summary.as_deref(), confidence) {
                    error!("[{}] failed to persist completion: {}", id, err);
                }
                match self.store.get(&self.service_principal(), &id) {
                    Ok(investigation) => {
                        self.bus
                            .publish(Event::progress(&id, 1.0, "completed"));
                        self.bus.publish(Event::completed(&investigation));
                        self.metrics.record_investigation("completed", started);
                        info!(
                            "[{}] investigation completed with {} finding(s), confidence {:.2}",
                            id, investigation.findings_count, confidence
                        );
                    }
                    Err(err) => error!("[{}] completed but unreadable: {}", id, err),
                }
            }
            Outcome::Failed(error) => {
                if let Err(err) = self.store.fail(&id, &error) {
                    error!("[{}] failed to persist failure: {}", id, err);
                }
                if let Ok(investigation) = self.store.get(&self.service_principal(), &id) {
                    self.bus.publish(Event::failed(&investigation));
                }
                self.metrics.record_investigation("failed", started);
                self.metrics.record_error("orchestrator", error.label());
                warn!("[{}] investigation failed: {}", id, error);
            }
            Outcome::Cancelled => {
                // The cancel entry point already flipped the status and
                // emitted the event; just account for it.
                self.metrics.record_investigation("cancelled", started);
            }
        }
    }

    fn run_plan(&self, job: &Job, cancel: &CancelToken, started: Instant) -> Outcome {
        let id = &job.investigation.id;

        // Cancelled while still queued: nothing to run.
        match self.store.start(id) {
            Ok(true) => {}
            Ok(false) => return Outcome::Cancelled,
            Err(err) => return Outcome::Failed(ErrorKind::Internal(err.to_string())),
        }

        let deadline = started
            + Duration::from_secs(self.config.orchestrator.investigation_timeout_secs);
        let total_required = job.plan.required_steps().max(1);

        let mut completed_required = 0usize;
        let mut findings: Vec<Finding> = Vec::new();
        let mut quality_scores: Vec<f64> = Vec::new();
        let mut summary: Option<String> = None;
        let mut compensatable: Vec<&Step> = Vec::new();

        for group in &job.plan.groups {
            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            let steps: Vec<&Step> = group.steps.iter().map(|&i| &job.plan.steps[i]).collect();
            let results: Vec<(usize, Result<WorkerResponse, ErrorKind>)> =
                match group.composition {
                    Composition::Parallel => std::thread::scope(|scope| {
                        let handles: Vec<_> = steps
                            .iter()
                            .enumerate()
                            .map(|(offset, step)| {
                                let findings = &findings;
                                scope.spawn(move || {
                                    (offset, self.run_step(job, step, findings, cancel, deadline))
                                })
                            })
                            .collect();
                        handles
                            .into_iter()
                            .map(|handle| handle.join().expect("step thread panicked"))
                            .collect()
                    }),
                    Composition::Sequential | Composition::Saga => {
                        let mut results = Vec::new();
                        let mut aborted = false;
                        for (offset, step) in steps.iter().enumerate() {
                            if aborted || cancel.is_cancelled() {
                                break;
                            }
                            let result =
                                self.run_step(job, step, &findings, cancel, deadline);
                            // Earlier failure short-circuits iff the step is
                            // required.
                            aborted = step.required && step_failed(&result);
                            results.push((offset, result));
                        }
                        results
                    }
                };

            if cancel.is_cancelled() {
                return Outcome::Cancelled;
            }

            // Fold results in step order so aggregation stays deterministic.
            for (offset, result) in results {
                let step = steps[offset];
                match result {
                    Ok(response) => {
                        let failed = response.status == ResponseStatus::Failed;
                        if failed && step.required {
                            let error = ErrorKind::Internal(
                                response
                                    .error
                                    .unwrap_or_else(|| format!("step {} failed", step.id)),
                            );
                            self.compensate(job, &compensatable, cancel);
                            return Outcome::Failed(error);
                        }
                        if failed {
                            debug!("[{}] optional step {} failed", id, step.id);
                            continue;
                        }

                        let mut new_findings = Vec::new();
                        for finding in response.findings {
                            if finding.kind == REPORT_FINDING_KIND {
                                summary = Some(finding.description.clone());
                            } else {
                                new_findings.push(finding);
                            }
                        }

                        if !new_findings.is_empty() {
                            if let Err(err) = self.store.add_findings(id, &new_findings) {
                                error!("[{}] failed to store findings: {}", id, err);
                            }
                            self.bus.publish(Event::chunk(
                                id,
                                serde_json::json!({
                                    "step": step.id,
                                    "findings": &new_findings,
                                }),
                            ));
                            findings.extend(new_findings);
                        }
                        if response.metrics.records_analyzed > 0 {
                            if let Err(err) = self.store.add_records_analyzed(
                                id,
                                response.metrics.records_analyzed as i64,
                            ) {
                                error!("[{}] failed to record volume: {}", id, err);
                            }
                        }

                        if step.compensation.is_some() {
                            compensatable.push(step);
                        }
                        if step.required {
                            quality_scores.push(response.quality_score);
                            completed_required += 1;
                            let progress =
                                completed_required as f64 / total_required as f64;
                            match self.store.record_progress(id, progress, &step.id) {
                                Ok(()) => {
                                    self.bus.publish(Event::progress(id, progress, &step.id));
                                }
                                Err(err) if cancel.is_cancelled() => {
                                    debug!("[{}] progress after cancel ignored: {}", id, err)
                                }
                                Err(err) => {
                                    error!("[{}] progress update rejected: {}", id, err)
                                }
                            }
                        }
                    }
                    Err(ErrorKind::Cancelled) => return Outcome::Cancelled,
                    Err(error) if step.required => {
                        if group.composition == Composition::Saga {
                            self.compensate(job, &compensatable, cancel);
                        }
                        return Outcome::Failed(error);
                    }
                    Err(error) => {
                        debug!("[{}] optional step {} degraded: {}", id, step.id, error);
                    }
                }
            }
        }

        // Aggregate confidence is the weakest required link.
        let confidence = quality_scores
            .iter()
            .copied()
            .fold(f64::INFINITY, f64::min);
        Outcome::Completed {
            summary,
            confidence: if confidence.is_finite() { confidence } else { 0.0 },
        }
    }

    fn run_step(
        &self,
        job: &Job,
        step: &Step,
        findings: &[Finding],
        cancel: &CancelToken,
        investigation_deadline: Instant,
    ) -> Result<WorkerResponse, ErrorKind> {
        let id = &job.investigation.id;

        // The plan root is the orchestrator itself; nothing to invoke.
        if step.worker_kind == WorkerKind::OrchestratorMaster {
            return Ok(WorkerResponse {
                correlation_id: id.clone(),
                status: ResponseStatus::Ok,
                findings: Vec::new(),
                metrics: Default::default(),
                error: None,
                quality_score: 1.0,
            });
        }

        // Deadlines shrink as they descend: investigation >= step.
        let deadline =
            (Instant::now() + Duration::from_secs(step.timeout_secs)).min(investigation_deadline);
        let ctx = WorkerContext {
            federator: self.federator.clone(),
            llm: self.llm.clone(),
            config: self.config.clone(),
            metrics: self.metrics.clone(),
            deadline,
            cancel: cancel.clone(),
        };

        let payload = serde_json::json!({
            "query": job.investigation.query_text,
            "intent": job.intent.kind,
            "filters": job.investigation.filters,
            "data_source": job.investigation.data_source,
            "findings": findings,
        });
        let message = WorkerMessage::process(id, "orchestrator", step.worker_kind, payload);

        self.runtime.invoke(message, &ctx)
    }

    /// Saga unwinding: compensations of completed steps, in reverse
    /// completion order, best effort.
    fn compensate(&self, job: &Job, completed: &[&Step], cancel: &CancelToken) {
        for step in completed.iter().rev() {
            let Some(action) = &step.compensation else { continue };
            let id = &job.investigation.id;
            info!("[{}] compensating step {}", id, step.id);

            let deadline = Instant::now() + Duration::from_secs(step.timeout_secs);
            let ctx = WorkerContext {
                federator: self.federator.clone(),
                llm: self.llm.clone(),
                config: self.config.clone(),
                metrics: self.metrics.clone(),
                deadline,
                cancel: cancel.clone(),
            };
            let mut message = WorkerMessage::process(
                id,
                "orchestrator",
                step.worker_kind,
                serde_json::json!({ "step": step.id }),
            );
            message.action = action.clone();

            if let Err(err) = self.runtime.invoke(message, &ctx) {
                warn!("[{}] compensation for {} failed: {}", id, step.id, err);
            }
        }
    }

    fn service_principal(&self) -> Principal {
        Principal::Service("orchestrator".into())
    }
}

fn step_failed(result: &Result<WorkerResponse, ErrorKind>) -> bool {
    match result {
        Ok(response) => response.status == ResponseStatus::Failed,
        Err(_) => true,
    }
}

/// Everything needed to run investigations; shared by the HTTP server, the
/// CLI one-shot path and the scheduler.
pub struct Pipeline {
    pub db: crate::db::Database,
    pub store: InvestigationStore,
    pub bus: Arc<EventBus>,
    pub orchestrator: Orchestrator,
    pub config: Config,
    pub metrics: Metrics,
    pub federator: Arc<Federator>,
    pub cache: Arc<crate::cache::CacheHierarchy>,
    pub pool: Arc<crate::workers::WorkerPool>,
}

impl Pipeline {
    /// Init order: config → cache → db → federator → pool → orchestrator.
    pub fn new(config: Config, secrets: crate::config::Secrets) -> Fallible<Self> {
        let metrics = Metrics::new()?;
        let db = crate::db::Database::open(config.db.pool_size)?;
        let cache = Arc::new(crate::cache::CacheHierarchy::new(
            db.clone(),
            config.clone(),
            metrics.clone(),
        )?);
        let federator = Arc::new(Federator::new(
            cache.clone(),
            config.clone(),
            secrets.clone(),
            metrics.clone(),
        ));
        let llm = Arc::new(LlmClient::new(
            config.clone(),
            secrets,
            metrics.clone(),
        ));
        let store = InvestigationStore::new(db.clone());
        let bus = Arc::new(EventBus::new(metrics.clone()));
        let pool = crate::workers::WorkerPool::new(metrics.clone());
        let runtime = WorkerRuntime::new(pool.clone(), config.clone(), metrics.clone());
        let orchestrator = Orchestrator::new(
            store.clone(),
            bus.clone(),
            runtime,
            federator.clone(),
            llm,
            config.clone(),
            metrics.clone(),
        );

        Ok(Pipeline {
            db,
            store,
            bus,
            orchestrator,
            config,
            metrics,
            federator,
            cache,
            pool,
        })
    }

    #[cfg(test)]
    pub fn test() -> Fallible<Self> {
        let config = Config::default();
        let metrics = Metrics::shared();
        let db = crate::db::Database::temp()?;
        let cache = Arc::new(crate::cache::CacheHierarchy::temp(
            db.clone(),
            config.clone(),
        )?);
        let federator = Arc::new(Federator::new(
            cache.clone(),
            config.clone(),
            crate::config::Secrets::default(),
            metrics.clone(),
        ));
        let llm = Arc::new(LlmClient::new(
            config.clone(),
            crate::config::Secrets::default(),
            metrics.clone(),
        ));
        let store = InvestigationStore::new(db.clone());
        let bus = Arc::new(EventBus::new(metrics.clone()));
        let pool = crate::workers::WorkerPool::new(metrics.clone());
        let runtime = WorkerRuntime::new(pool.clone(), config.clone(), metrics.clone());
        let orchestrator = Orchestrator::new(
            store.clone(),
            bus.clone(),
            runtime,
            federator.clone(),
            llm,
            config.clone(),
            metrics.clone(),
        );

        Ok(Pipeline {
            db,
            store,
            bus,
            orchestrator,
            config,
            metrics,
            federator,
            cache,
            pool,
        })
    }

    /// The one code path every submission uses, scheduler and HTTP alike.
    pub fn submit_query(
        &self,
        principal: &Principal,
        query_text: &str,
        session_id: Option<String>,
        data_source: Option<String>,
        extra_filters: Option<serde_json::Value>,
    ) -> Result<Investigation, ErrorKind> {
        if query_text.trim().is_empty() {
            return Err(ErrorKind::Validation("query text must not be empty".into()));
        }

        let intent = crate::router::classify(query_text);
        let entities = crate::router::extract_entities(query_text);
        let workers = crate::router::select_workers(&intent, &entities);

        let mut filters = crate::planner::filters_from_entities(&entities);
        if let Some(serde_json::Value::Object(extra)) = extra_filters {
            let merged = filters.as_object_mut().unwrap();
            for (key, value) in extra {
                merged.insert(key, value);
            }
        }

        let plan = crate::planner::plan(
            &intent,
            &entities,
            &workers,
            self.config.orchestrator.investigation_timeout_secs,
        );
        plan.validate().map_err(|err| {
            ErrorKind::Internal(format!("planner produced an invalid plan: {err}"))
        })?;

        let investigation = self
            .store
            .create(crate::investigations::NewInvestigation {
                user_id: principal.user_id().to_string(),
                session_id,
                query_text: query_text.to_string(),
                data_source,
                filters,
                requested_workers: workers,
            })
            .map_err(|err| ErrorKind::Internal(err.to_string()))?;

        info!(
            "[{}] submitted by {}: intent={} confidence={:.2} workers={}",
            investigation.id,
            principal.user_id(),
            intent.kind,
            intent.confidence,
            investigation.requested_workers.len()
        );

        self.orchestrator.submit(Job {
            investigation: investigation.clone(),
            plan,
            intent,
        })?;

        Ok(investigation)
    }

    /// Blocks until the investigation reaches a terminal status (CLI path).
    pub fn wait_for(&self, id: &str, timeout: Duration) -> Result<Investigation, ErrorKind> {
        let deadline = Instant::now() + timeout;
        let principal = Principal::Service("cli".into());
        loop {
            let investigation = self.store.get(&principal, id)?;
            if investigation.status.is_terminal() {
                return Ok(investigation);
            }
            if Instant::now() >= deadline {
                return Err(ErrorKind::Timeout(format!("waiting for investigation {id}")));
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Pipeline;
    use crate::errors::ErrorKind;
    use crate::events::EventKind;
    use crate::investigations::{Principal, Status};
    use crate::utils::stub::stub_upstream;
    use std::time::Duration;

    fn override_all(pipeline: &Pipeline, url: &str) {
        for endpoint in crate::registry::all() {
            pipeline.federator.override_base_url(endpoint.id, url);
        }
    }

    #[test]
    fn test_happy_path_investigation() {
        let pipeline = Pipeline::test().unwrap();
        let body = r#"[
            {"valorInicial": 100000, "cnpjFornecedor": "111", "dataAssinatura": "2024-01-10"},
            {"valorInicial": 105000, "cnpjFornecedor": "222", "dataAssinatura": "2024-01-11"},
            {"valorInicial": 95000, "cnpjFornecedor": "333", "dataAssinatura": "2024-01-12"},
            {"valorInicial": 102000, "cnpjFornecedor": "444", "dataAssinatura": "2024-01-13"},
            {"valorInicial": 98000, "cnpjFornecedor": "555", "dataAssinatura": "2024-01-14"},
            {"valorInicial": 101000, "cnpjFornecedor": "666", "dataAssinatura": "2024-01-15"},
            {"valorInicial": 99000, "cnpjFornecedor": "777", "dataAssinatura": "2024-01-16"},
            {"valorInicial": 103000, "cnpjFornecedor": "888", "dataAssinatura": "2024-01-17"},
            {"valorInicial": 97000, "cnpjFornecedor": "999", "dataAssinatura": "2024-01-18"},
            {"valorInicial": 104000, "cnpjFornecedor": "101", "dataAssinatura": "2024-01-19"},
            {"valorInicial": 890000, "cnpjFornecedor": "bad", "dataAssinatura": "2024-01-20"}
        ]"#;
        let (url, _) = stub_upstream(200, body);
        override_all(&pipeline, &url);

        let maria = Principal::User("maria".into());
        let (_, mut rx) = pipeline.bus.subscribe("");
        let submitted = pipeline
            .submit_query(&maria, "analisar contratos de 2024 acima de 1 milhão", None, None, None)
            .unwrap();

        let done = pipeline
            .wait_for(&submitted.id, Duration::from_secs(30))
            .unwrap();
        assert_eq!(done.status, Status::Completed);
        assert_eq!(done.progress, 1.0);
        assert!(done.confidence.unwrap() > 0.0);
        assert!(done.summary.is_some());
        assert!(done.records_analyzed > 0);

        // created -> progress* (non-decreasing) -> completed, in order.
        let mut kinds = Vec::new();
        let mut progress_values = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if event.investigation_id != submitted.id {
                continue;
            }
            if event.kind == EventKind::Progress {
                progress_values.push(event.data["progress"].as_f64().unwrap());
            }
            kinds.push(event.kind);
        }
        assert_eq!(kinds.first(), Some(&EventKind::Created));
        assert_eq!(kinds.last(), Some(&EventKind::Completed));
        assert!(progress_values.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(progress_values.last(), Some(&1.0));
    }

    #[test]
    fn test_restricted_upstream_still_completes() {
        let pipeline = Pipeline::test().unwrap();
        let (url, _) = stub_upstream(403, r#"{"message": "blocked"}"#);
        override_all(&pipeline, &url);

        let maria = Principal::User("maria".into());
        let submitted = pipeline
            .submit_query(&maria, "analisar despesas de 2024", None, None, None)
            .unwrap();

        let done = pipeline
            .wait_for(&submitted.id, Duration::from_secs(60))
            .unwrap();
        assert_eq!(done.status, Status::Completed);

        // Degraded coverage shows up as lowered confidence plus annotated
        // findings.
        assert!(done.confidence.unwrap() < 0.8);
        let findings = pipeline.store.findings(&submitted.id).unwrap();
        assert!(findings
            .iter()
            .any(|f| f.kind == "source_restricted"
                && f.evidence["source_restricted"] == true));
    }

    #[test]
    fn test_cancellation_mid_flight() {
        let pipeline = Pipeline::test().unwrap();
        // Slow upstream keeps the investigation in flight while we cancel.
        let (url, _) =
            crate::utils::stub::stub_upstream_with_delay(200, "[]", Duration::from_millis(400));
        override_all(&pipeline, &url);

        let maria = Principal::User("maria".into());
        let submitted = pipeline
            .submit_query(&maria, "investigar contratos de 2024 em MG", None, None, None)
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        let cancelled = pipeline
            .orchestrator
            .cancel(&maria, &submitted.id)
            .unwrap();
        assert_eq!(cancelled.status, Status::Cancelled);

        // The executor settles without flipping the terminal status.
        let done = pipeline
            .wait_for(&submitted.id, Duration::from_secs(30))
            .unwrap();
        assert_eq!(done.status, Status::Cancelled);

        // Worker-pool slots all released once the in-flight steps unwind.
        let drained_by = std::time::Instant::now() + Duration::from_secs(10);
        loop {
            if pipeline.pool.stats().iter().all(|s| s.active == 0) {
                break;
            }
            assert!(std::time::Instant::now() < drained_by, "pool never drained");
            std::thread::sleep(Duration::from_millis(50));
        }
    }

    #[test]
    fn test_cancel_completed_is_noop() {
        let pipeline = Pipeline::test().unwrap();
        let (url, _) = stub_upstream(200, "[]");
        override_all(&pipeline, &url);

        let maria = Principal::User("maria".into());
        let submitted = pipeline
            .submit_query(&maria, "bom dia", None, None, None)
            .unwrap();
        let done = pipeline
            .wait_for(&submitted.id, Duration::from_secs(10))
            .unwrap();
        assert_eq!(done.status, Status::Completed);

        let after = pipeline
            .orchestrator
            .cancel(&maria, &submitted.id)
            .unwrap();
        assert_eq!(after.status, Status::Completed);
    }

    #[test]
    fn test_empty_query_is_rejected() {
        let pipeline = Pipeline::test().unwrap();
        let maria = Principal::User("maria".into());
        assert!(matches!(
            pipeline.submit_query(&maria, "  ", None, None, None),
            Err(ErrorKind::Validation(_))
        ));
    }
}
