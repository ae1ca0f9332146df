use crate::errors::ErrorKind;
use crate::investigations::{Finding, Severity};
use crate::prelude::*;
use crate::workers::{
    Reflection, ResponseMetrics, ResponseStatus, Worker, WorkerContext, WorkerKind,
    WorkerMessage, WorkerResponse, ACTION_COMPENSATE,
};
use std::collections::BTreeMap;
use std::time::Instant;

/// Consolidates the findings produced upstream in the plan: deduplicates,
/// tallies by severity and emits one roll-up finding the report writer and
/// the investigation record both consume.
#[derive(Default)]
pub(super) struct Aggregator;

impl Worker for Aggregator {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Aggregator
    }

    fn process(
        &mut self,
        msg: &WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        let started = Instant::now();
        ctx.cancel.check()?;

        if msg.action == ACTION_COMPENSATE {
            return Ok(WorkerResponse {
                correlation_id: msg.correlation_id.clone(),
                status: ResponseStatus::Ok,
                findings: Vec::new(),
                metrics: ResponseMetrics::default(),
                error: None,
                quality_score: 1.0,
            });
        }

        let incoming: Vec<Finding> =
            serde_json::from_value(msg.payload["findings"].clone()).unwrap_or_default();

        // Dedupe on (kind, description): independent workers reading the
        // same sources may flag the same fact.
        let mut deduped: Vec<Finding> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for finding in incoming {
            if seen.insert((finding.kind.clone(), finding.description.clone())) {
                deduped.push(finding);
            }
        }

        let mut by_severity: BTreeMap<&'static str, u32> = BTreeMap::new();
        let mut confidence_sum = 0.0;
        let mut restricted_sources = 0u32;
        for finding in &deduped {
            *by_severity.entry(finding.severity.to_str()).or_default() += 1;
            confidence_sum += finding.confidence;
            if finding.kind == "source_restricted" {
                restricted_sources += 1;
            }
        }

        let severity = if by_severity.contains_key("critical") {
            Severity::Critical
        } else if by_severity.contains_key("high") {
            Severity::High
        } else {
            Severity::Low
        };

        let summary = Finding::new(
            "aggregate_summary",
            severity,
            if deduped.is_empty() {
                0.5
            } else {
                confidence_sum / deduped.len() as f64
            },
            format!(
                "{} achado(s) consolidados ({})",
                deduped.len(),
                by_severity
                    .iter()
                    .map(|(severity, count)| format!("{count} {severity}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
            serde_json::json!({
                "por-severidade": by_severity
                    .iter()
                    .map(|(k, v)| (k.to_string(), *v))
                    .collect::<BTreeMap<String, u32>>(),
                "fontes-restritas": restricted_sources,
                "total": deduped.len(),
            }),
            self.kind(),
        );

        let metrics = ResponseMetrics {
            records_analyzed: deduped.len() as u64,
            upstream_calls: 0,
            restricted_sources,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        Ok(WorkerResponse {
            correlation_id: msg.correlation_id.clone(),
            status: ResponseStatus::Ok,
            findings: vec![summary],
            metrics,
            error: None,
            quality_score: 0.9,
        })
    }

    fn reflect(
        &mut self,
        response: &WorkerResponse,
        _msg: &WorkerMessage,
        _ctx: &WorkerContext,
    ) -> Fallible<Reflection> {
        // Aggregation is deterministic over its input; re-running cannot help.
        Ok(Reflection {
            quality_score: response.quality_score,
            improvement_hint: None,
        })
    }
}
