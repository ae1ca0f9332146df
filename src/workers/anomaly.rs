use crate::errors::ErrorKind;
use crate::investigations::{Finding, Severity};
use crate::prelude::*;
use crate::workers::{
    coverage_quality, fetch_source, filter_params, number_field, restricted_finding,
    Reflection, ResponseMetrics, ResponseStatus, Worker, WorkerContext, WorkerKind,
    WorkerMessage, WorkerResponse, ACTION_COMPENSATE,
};
use std::time::Instant;

const VALUE_KEYS: &[&str] = &[
    "valorInicial",
    "valorContratado",
    "valorDocumento",
    "valor",
    "valorTotal",
];

/// Z-score cutoffs for outlier severity.
const OUTLIER_CUTOFF: f64 = 2.5;
const HIGH_CUTOFF: f64 = 3.0;
const CRITICAL_CUTOFF: f64 = 4.0;

/// Hint the reflection step uses to widen the evidence base.
const HINT_EXPAND_SOURCES: &str = "expand-data-sources";

/// Flags spending records whose values sit far outside the distribution of
/// their peers, plus suspicious exact-value repetition.
#[derive(Default)]
pub(super) struct AnomalyDetector {
    last_records: usize,
}

impl Worker for AnomalyDetector {
    fn kind(&self) -> WorkerKind {
        WorkerKind::AnomalyDetector
    }

    fn process(
        &mut self,
        msg: &WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        let started = Instant::now();
        if msg.action == ACTION_COMPENSATE {
            return Ok(compensated(msg));
        }

        let params = filter_params(&msg.payload);
        let mut endpoints = vec!["contracts"];
        if msg.reflection_hints().contains(&HINT_EXPAND_SOURCES) {
            endpoints.push("expenses");
        }

        let mut findings = Vec::new();
        let mut values: Vec<(f64, serde_json::Value)> = Vec::new();
        let mut metrics = ResponseMetrics::default();
        let mut sources_ok = 0;

        for endpoint in &endpoints {
            let source = fetch_source(ctx, &msg.correlation_id, endpoint, &params)?;
            metrics.upstream_calls += 1;

            if source.restricted {
                metrics.restricted_sources += 1;
                findings.push(restricted_finding(endpoint, self.kind()));
                continue;
            }
            if let Some(reason) = &source.failed {
                debug!(
                    "[{}] anomaly-detector skipping {}: {}",
                    msg.correlation_id, endpoint, reason
                );
                continue;
            }

            sources_ok += 1;
            metrics.records_analyzed += source.records.len() as u64;
            for record in &source.records {
                if let Some(value) = number_field(record, VALUE_KEYS) {
                    values.push((value, record.clone()));
                }
            }
        }

        findings.extend(outliers(&values, self.kind()));
        findings.extend(repeated_amounts(&values, self.kind()));

        self.last_records = values.len();

        let quality = coverage_quality(sources_ok, endpoints.len(), values.len());
        metrics.duration_ms = started.elapsed().as_millis() as u64;

        let degraded = metrics.restricted_sources > 0 || sources_ok < endpoints.len();
        Ok(WorkerResponse {
            correlation_id: msg.correlation_id.clone(),
            status: if degraded {
                ResponseStatus::Degraded
            } else {
                ResponseStatus::Ok
            },
            findings,
            metrics,
            error: None,
            quality_score: quality,
        })
    }

    fn reflect(
        &mut self,
        response: &WorkerResponse,
        msg: &WorkerMessage,
        _ctx: &WorkerContext,
    ) -> Fallible<Reflection> {
        // Widening the evidence base is the only lever this worker has; once
        // used, give up rather than loop on a restricted upstream.
        let already_expanded = msg.reflection_hints().contains(&HINT_EXPAND_SOURCES);
        let hint = if !already_expanded && self.last_records < 10 {
            Some(HINT_EXPAND_SOURCES.to_string())
        } else {
            None
        };

        Ok(Reflection {
            quality_score: response.quality_score,
            improvement_hint: hint,
        })
    }
}

fn compensated(msg: &WorkerMessage) -> WorkerResponse {
    WorkerResponse {
        correlation_id: msg.correlation_id.clone(),
        status: ResponseStatus::Ok,
        findings: Vec::new(),
        metrics: ResponseMetrics::default(),
        error: None,
        quality_score: 1.0,
    }
}

fn outliers(values: &[(f64, serde_json::Value)], produced_by: WorkerKind) -> Vec<Finding> {
    use rayon::prelude::*;

    if values.len() < 4 {
        return Vec::new();
    }

    let n = values.len() as f64;
    let mean = values.iter().map(|(v, _)| v).sum::<f64>() / n;
    let variance = values.iter().map(|(v, _)| (v - mean).powi(2)).sum::<f64>() / n;
    let std_dev = variance.sqrt();
    if std_dev == 0.0 {
        return Vec::new();
    }

    // Record sets can reach hundreds of thousands of rows; scoring them is
    // pure CPU and must stay off the I/O paths.
    values
        .par_iter()
        .filter_map(|(value, record)| {
            let z = (value - mean) / std_dev;
            if z < OUTLIER_CUTOFF {
                return None;
            }

            let severity = if z >= CRITICAL_CUTOFF {
                Severity::Critical
            } else if z >= HIGH_CUTOFF {
                Severity::High
            } else {
                Severity::Medium
            };
            Some(Finding::new(
                "price_outlier",
                severity,
                (0.5 + z / 10.0).min(0.95),
                format!(
                    "valor de R$ {value:.2} está {z:.1} desvios-padrão acima da média (R$ {mean:.2})"
                ),
                serde_json::json!({
                    "valor": value,
                    "media": mean,
                    "desvio-padrao": std_dev,
                    "z-score": z,
                    "registro": record,
                }),
                produced_by,
            ))
        })
        .collect()
}

fn repeated_amounts(values: &[(f64, serde_json::Value)], produced_by: WorkerKind) -> Vec<Finding> {
    use std::collections::HashMap;

    let mut counts: HashMap<u64, u32> = HashMap::new();
    for (value, _) in values {
        // Bucket by centavo so float noise does not split counts.
        *counts.entry((value * 100.0).round() as u64).or_default() += 1;
    }

    let mut findings: Vec<Finding> = counts
        .into_iter()
        .filter(|&(cents, count)| count >= 3 && cents > 0)
        .map(|(cents, count)| {
            let value = cents as f64 / 100.0;
            Finding::new(
                "repeated_amount",
                Severity::Medium,
                0.7,
                format!("{count} registros com o valor exato de R$ {value:.2}"),
                serde_json::json!({ "valor": value, "ocorrencias": count }),
                produced_by,
            )
        })
        .collect();
    findings.sort_by(|a, b| a.description.cmp(&b.description));
    findings
}

#[cfg(test)]
mod tests {
    use super::AnomalyDetector;
    use crate::utils::stub::stub_upstream;
    use crate::workers::{
        test_context, ResponseStatus, Worker, WorkerKind, WorkerMessage,
    };
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn message() -> WorkerMessage {
        WorkerMessage::process(
            "corr-anomaly",
            "orchestrator",
            WorkerKind::AnomalyDetector,
            json!({"filters": {"ano": "2024", "codigoOrgao": "26000"}}),
        )
    }

    #[test]
    fn test_flags_outliers_and_repeats() {
        let body = r#"[
            {"valorInicial": 100000}, {"valorInicial": 110000},
            {"valorInicial": 95000}, {"valorInicial": 105000},
            {"valorInicial": 98000}, {"valorInicial": 102000},
            {"valorInicial": 99000}, {"valorInicial": 101000},
            {"valorInicial": 103000}, {"valorInicial": 97000},
            {"valorInicial": 42000}, {"valorInicial": 42000},
            {"valorInicial": 42000}, {"valorInicial": 900000}
        ]"#;
        let (url, _) = stub_upstream(200, body);
        let ctx = test_context(Instant::now() + Duration::from_secs(10));
        ctx.federator.override_base_url("contracts", &url);

        let mut worker = AnomalyDetector::default();
        let response = worker.process(&message(), &ctx).unwrap();

        assert_eq!(response.status, ResponseStatus::Ok);
        assert!(response
            .findings
            .iter()
            .any(|f| f.kind == "price_outlier" && f.evidence["valor"] == 900000.0));
        assert!(response
            .findings
            .iter()
            .any(|f| f.kind == "repeated_amount" && f.evidence["ocorrencias"] == 3));
        assert_eq!(response.metrics.records_analyzed, 14);
        assert!(response.quality_score >= 0.8);
    }

    #[test]
    fn test_restricted_source_degrades_with_annotation() {
        let (url, _) = stub_upstream(403, r#"{"message": "blocked"}"#);
        let ctx = test_context(Instant::now() + Duration::from_secs(10));
        ctx.federator.override_base_url("contracts", &url);
        ctx.federator.override_base_url("expenses", &url);

        let mut worker = AnomalyDetector::default();
        let response = worker.process(&message(), &ctx).unwrap();

        assert_eq!(response.status, ResponseStatus::Degraded);
        assert!(response.quality_score < 0.8);
        let restricted = response
            .findings
            .iter()
            .find(|f| f.kind == "source_restricted")
            .unwrap();
        assert_eq!(restricted.evidence["source_restricted"], true);
    }

    #[test]
    fn test_reflect_expands_then_gives_up() {
        let (url, _) = stub_upstream(403, "{}");
        let ctx = test_context(Instant::now() + Duration::from_secs(10));
        ctx.federator.override_base_url("contracts", &url);
        ctx.federator.override_base_url("expenses", &url);

        let mut worker = AnomalyDetector::default();
        let mut msg = message();
        let response = worker.process(&msg, &ctx).unwrap();

        let first = worker.reflect(&response, &msg, &ctx).unwrap();
        let hint = first.improvement_hint.unwrap();
        msg.push_reflection_hint(&hint);

        let response = worker.process(&msg, &ctx).unwrap();
        let second = worker.reflect(&response, &msg, &ctx).unwrap();
        assert!(second.improvement_hint.is_none());
    }
}
