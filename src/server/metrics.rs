use crate::prelude::*;
use prometheus::{
    Histogram, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
};
use std::time::Instant;

/// Every boundary increments a request counter and observes a latency
/// histogram; errors are counted by taxonomy kind. One instance is created at
/// boot and shared by every component.
#[derive(Clone)]
pub struct Metrics {
    requests: IntCounterVec,
    request_duration: HistogramVec,
    errors: IntCounterVec,

    cache_requests: IntCounterVec,
    upstream_calls: IntCounterVec,
    circuit_transitions: IntCounterVec,
    rate_limited_waits: IntCounter,

    investigations_total: IntCounterVec,
    investigation_duration: Histogram,
    queue_depth: IntGauge,
    bounced_submissions: IntCounter,

    workers_active: IntGaugeVec,
    reflection_iterations: Histogram,

    events_published: IntCounterVec,
    events_dropped: IntCounter,

    scheduler_runs: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Fallible<Self> {
        let requests = prometheus::register_int_counter_vec!(
            prometheus::opts!("lupa_requests_total", "requests per component operation"),
            &["component", "operation"]
        )?;
        let request_duration = prometheus::register_histogram_vec!(
            prometheus::histogram_opts!(
                "lupa_request_duration_seconds",
                "request latency per component operation"
            ),
            &["component", "operation"]
        )?;
        let errors = prometheus::register_int_counter_vec!(
            prometheus::opts!("lupa_errors_total", "errors per component and kind"),
            &["component", "kind"]
        )?;
        let cache_requests = prometheus::register_int_counter_vec!(
            prometheus::opts!("lupa_cache_requests_total", "cache lookups per tier"),
            &["tier", "outcome"]
        )?;
        let upstream_calls = prometheus::register_int_counter_vec!(
            prometheus::opts!("lupa_upstream_calls_total", "outbound calls per endpoint"),
            &["endpoint", "outcome"]
        )?;
        let circuit_transitions = prometheus::register_int_counter_vec!(
            prometheus::opts!(
                "lupa_circuit_transitions_total",
                "circuit breaker state transitions"
            ),
            &["endpoint", "state"]
        )?;
        let rate_limited_waits = prometheus::register_int_counter!(
            "lupa_rate_limited_waits_total",
            "calls that waited on a token bucket"
        )?;
        let investigations_total = prometheus::register_int_counter_vec!(
            prometheus::opts!(
                "lupa_investigations_total",
                "investigations reaching a terminal status"
            ),
            &["status"]
        )?;
        let investigation_duration = prometheus::register_histogram!(
            "lupa_investigation_duration_seconds",
            "wall time from submission to terminal status",
            vec![0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0]
        )?;
        let queue_depth = prometheus::register_int_gauge!(
            "lupa_orchestrator_queue_depth",
            "investigations waiting for an executor"
        )?;
        let bounced_submissions = prometheus::register_int_counter!(
            "lupa_bounced_submissions_total",
            "submissions shed because the queue was full"
        )?;
        let workers_active = prometheus::register_int_gauge_vec!(
            prometheus::opts!("lupa_workers_active", "live worker instances per kind"),
            &["kind"]
        )?;
        let reflection_iterations = prometheus::register_histogram!(
            "lupa_reflection_iterations",
            "process calls needed to reach the quality threshold",
            vec![1.0, 2.0, 3.0, 4.0, 5.0]
        )?;
        let events_published = prometheus::register_int_counter_vec!(
            prometheus::opts!("lupa_events_published_total", "events put on the bus"),
            &["kind"]
        )?;
        let events_dropped = prometheus::register_int_counter!(
            "lupa_events_dropped_total",
            "events lost to lagging subscribers"
        )?;
        let scheduler_runs = prometheus::register_int_counter_vec!(
            prometheus::opts!("lupa_scheduler_runs_total", "job firings per outcome"),
            &["job", "outcome"]
        )?;

        Ok(Metrics {
            requests,
            request_duration,
            errors,
            cache_requests,
            upstream_calls,
            circuit_transitions,
            rate_limited_waits,
            investigations_total,
            investigation_duration,
            queue_depth,
            bounced_submissions,
            workers_active,
            reflection_iterations,
            events_published,
            events_dropped,
            scheduler_runs,
        })
    }

    /// Shared instance for tests: the prometheus default registry rejects
    /// duplicate registrations, so every test uses the same one.
    #[cfg(test)]
    pub fn shared() -> Metrics {
        lazy_static! {
            static ref METRICS: Metrics = Metrics::new().unwrap();
        }
        METRICS.clone()
    }

    pub fn record_request(&self, component: &str, operation: &str, start: Instant) {
        self.requests
            .with_label_values(&[component, operation])
            .inc();
        self.request_duration
            .with_label_values(&[component, operation])
            .observe(start.elapsed().as_secs_f64());
    }

    pub fn record_error(&self, component: &str, kind: &str) {
        self.errors.with_label_values(&[component, kind]).inc();
    }

    pub fn record_cache(&self, tier: &str, hit: bool) {
        self.cache_requests
            .with_label_values(&[tier, if hit { "hit" } else { "miss" }])
            .inc();
    }

    pub fn record_upstream(&self, endpoint: &str, outcome: &str) {
        self.upstream_calls
            .with_label_values(&[endpoint, outcome])
            .inc();
    }

    pub fn record_circuit_transition(&self, endpoint: &str, state: &str) {
        self.circuit_transitions
            .with_label_values(&[endpoint, state])
            .inc();
    }

    pub fn record_rate_limited_wait(&self) {
        self.rate_limited_waits.inc();
    }

    pub fn record_investigation(&self, status: &str, started: Instant) {
        self.investigations_total.with_label_values(&[status]).inc();
        self.investigation_duration
            .observe(started.elapsed().as_secs_f64());
    }

    pub fn record_queue_depth(&self, depth: i64) {
        self.queue_depth.set(depth);
    }

    pub fn record_bounced_submission(&self) {
        self.bounced_submissions.inc();
    }

    pub fn worker_started(&self, kind: &str) {
        self.workers_active.with_label_values(&[kind]).inc();
    }

    pub fn worker_stopped(&self, kind: &str) {
        self.workers_active.with_label_values(&[kind]).dec();
    }

    pub fn record_reflection_iterations(&self, iterations: u32) {
        self.reflection_iterations.observe(f64::from(iterations));
    }

    pub fn record_event(&self, kind: &str) {
        self.events_published.with_label_values(&[kind]).inc();
    }

    pub fn record_dropped_events(&self, count: u64) {
        self.events_dropped.inc_by(count);
    }

    pub fn record_scheduler_run(&self, job: &str, outcome: &str) {
        self.scheduler_runs.with_label_values(&[job, outcome]).inc();
    }
}

#[cfg(test)]
mod tests {
    use super::Metrics;

    #[test]
    fn test_metrics_register_once() {
        let first = Metrics::shared();
        let second = Metrics::shared();

        first.record_cache("l1", true);
        second.record_cache("l1", false);
        first.record_error("federation", "timeout");

        // Both clones write to the same underlying registry without panicking.
        let families = prometheus::gather();
        assert!(families
            .iter()
            .any(|fam| fam.get_name() == "lupa_cache_requests_total"));
    }
}
