use crate::errors::ErrorKind;
use crate::investigations::{Finding, Severity};
use crate::prelude::*;
use crate::workers::{
    coverage_quality, fetch_source, filter_params, number_field, restricted_finding,
    string_field, Reflection, ResponseMetrics, ResponseStatus, Worker, WorkerContext,
    WorkerKind, WorkerMessage, WorkerResponse, ACTION_COMPENSATE,
};
use std::collections::HashMap;
use std::time::Instant;

const SUPPLIER_KEYS: &[&str] = &["nomeFornecedor", "fornecedor", "nomeRazaoSocialFornecedor", "nome"];
const SUPPLIER_ID_KEYS: &[&str] = &["cnpjFornecedor", "cpfCnpj", "cnpj"];
const VALUE_KEYS: &[&str] = &["valorInicial", "valor", "valorTotal", "valorContratado"];
const DATE_KEYS: &[&str] = &["dataAssinatura", "dataPublicacao", "data", "dataAbertura"];

/// One supplier taking more than this share of total value is concentration.
const CONCENTRATION_SHARE: f64 = 0.4;

/// Direct-award ceiling (dispensa de licitação); clusters of awards just
/// under it suggest contract splitting.
const DIRECT_AWARD_CEILING: f64 = 17_600.0;

const HINT_WIDEN_SAMPLE: &str = "widen-procurement-sample";

/// Looks for structural patterns in procurement: vendor concentration,
/// split awards under the direct-award ceiling, and same-day bursts.
#[derive(Default)]
pub(super) struct PatternAnalyzer {
    last_records: usize,
}

impl Worker for PatternAnalyzer {
    fn kind(&self) -> WorkerKind {
        WorkerKind::PatternAnalyzer
    }

    fn process(
        &mut self,
        msg: &WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        let started = Instant::now();
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

        let mut params = filter_params(&msg.payload);
        if msg.reflection_hints().contains(&HINT_WIDEN_SAMPLE) {
            params.push(("tamanhoPagina".to_string(), "500".to_string()));
        }

        let mut metrics = ResponseMetrics::default();
        let mut findings = Vec::new();

        let source = fetch_source(ctx, &msg.correlation_id, "procurement", &params)?;
        metrics.upstream_calls += 1;

        let mut sources_ok = 0;
        if source.restricted {
            metrics.restricted_sources += 1;
            findings.push(restricted_finding(&source.endpoint, self.kind()));
        } else if source.failed.is_none() {
            sources_ok = 1;
        }

        metrics.records_analyzed = source.records.len() as u64;
        self.last_records = source.records.len();

        findings.extend(vendor_concentration(&source.records, self.kind()));
        findings.extend(split_awards(&source.records, self.kind()));
        findings.extend(same_day_bursts(&source.records, self.kind()));

        metrics.duration_ms = started.elapsed().as_millis() as u64;
        let quality = coverage_quality(sources_ok, 1, source.records.len());

        Ok(WorkerResponse {
            correlation_id: msg.correlation_id.clone(),
            status: if sources_ok == 1 {
                ResponseStatus::Ok
            } else {
                ResponseStatus::Degraded
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
        let already_widened = msg.reflection_hints().contains(&HINT_WIDEN_SAMPLE);
        let hint = if !already_widened && self.last_records < 10 {
            Some(HINT_WIDEN_SAMPLE.to_string())
        } else {
            None
        };
        Ok(Reflection {
            quality_score: response.quality_score,
            improvement_hint: hint,
        })
    }
}

fn supplier_of(record: &serde_json::Value) -> Option<String> {
    string_field(record, SUPPLIER_ID_KEYS)
        .or_else(|| string_field(record, SUPPLIER_KEYS))
        .map(|s| s.to_string())
}

fn vendor_concentration(records: &[serde_json::Value], produced_by: WorkerKind) -> Vec<Finding> {
    if records.len() < 5 {
        return Vec::new();
    }

    let mut totals: HashMap<String, (f64, u32)> = HashMap::new();
    let mut grand_total = 0.0;
    for record in records {
        let Some(supplier) = supplier_of(record) else { continue };
        let value = number_field(record, VALUE_KEYS).unwrap_or(0.0);
        let entry = totals.entry(supplier).or_default();
        entry.0 += value;
        entry.1 += 1;
        grand_total += value;
    }
    if grand_total <= 0.0 {
        return Vec::new();
    }

    let mut findings: Vec<Finding> = totals
        .into_iter()
        .filter(|(_, (total, count))| *count >= 2 && total / grand_total > CONCENTRATION_SHARE)
        .map(|(supplier, (total, count))| {
            let share = total / grand_total;
            Finding::new(
                "vendor_concentration",
                Severity::High,
                (0.55 + share / 2.0).min(0.9),
                format!(
                    "fornecedor {supplier} concentra {:.0}% do valor em {count} registros",
                    share * 100.0
                ),
                serde_json::json!({
                    "fornecedor": supplier,
                    "participacao": share,
                    "valor-total": total,
                    "registros": count,
                }),
                produced_by,
            )
        })
        .collect();
    findings.sort_by(|a, b| a.description.cmp(&b.description));
    findings
}

fn split_awards(records: &[serde_json::Value], produced_by: WorkerKind) -> Vec<Finding> {
    let mut near_ceiling: HashMap<String, u32> = HashMap::new();
    for record in records {
        let Some(value) = number_field(record, VALUE_KEYS) else { continue };
        if value >= DIRECT_AWARD_CEILING * 0.85 && value < DIRECT_AWARD_CEILING {
            if let Some(supplier) = supplier_of(record) {
                *near_ceiling.entry(supplier).or_default() += 1;
            }
        }
    }

    let mut findings: Vec<Finding> = near_ceiling
        .into_iter()
        .filter(|(_, count)| *count >= 3)
        .map(|(supplier, count)| {
            Finding::new(
                "split_contracts",
                Severity::High,
                0.75,
                format!(
                    "fornecedor {supplier} tem {count} contratações logo abaixo do teto \
                     de dispensa (R$ {DIRECT_AWARD_CEILING:.2})"
                ),
                serde_json::json!({
                    "fornecedor": supplier,
                    "ocorrencias": count,
                    "teto": DIRECT_AWARD_CEILING,
                }),
                produced_by,
            )
        })
        .collect();
    findings.sort_by(|a, b| a.description.cmp(&b.description));
    findings
}

fn same_day_bursts(records: &[serde_json::Value], produced_by: WorkerKind) -> Vec<Finding> {
    let mut by_day: HashMap<String, u32> = HashMap::new();
    for record in records {
        if let Some(date) = string_field(record, DATE_KEYS) {
            let day = date.split('T').next().unwrap_or(date);
            *by_day.entry(day.to_string()).or_default() += 1;
        }
    }

    let mut findings: Vec<Finding> = by_day
        .into_iter()
        .filter(|(_, count)| *count >= 10)
        .map(|(day, count)| {
            Finding::new(
                "temporal_cluster",
                Severity::Medium,
                0.6,
                format!("{count} registros publicados no mesmo dia ({day})"),
                serde_json::json!({ "data": day, "ocorrencias": count }),
                produced_by,
            )
        })
        .collect();
    findings.sort_by(|a, b| a.description.cmp(&b.description));
    findings
}

#[cfg(test)]
mod tests {
    use super::PatternAnalyzer;
    use crate::utils::stub::stub_upstream;
    use crate::workers::{test_context, Worker, WorkerKind, WorkerMessage};
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[test]
    fn test_detects_concentration_and_splits() {
        let mut records = Vec::new();
        for i in 0..6 {
            records.push(json!({
                "cnpjFornecedor": "00000000000191",
                "valorInicial": 500_000,
                "dataAssinatura": format!("2024-03-{:02}", i + 1),
            }));
        }
        for i in 0..4 {
            records.push(json!({
                "cnpjFornecedor": "11222333000144",
                "valorInicial": 16_900,
                "dataAssinatura": format!("2024-04-{:02}", i + 1),
            }));
        }
        let body = Box::leak(serde_json::to_string(&records).unwrap().into_boxed_str());
        let (url, _) = stub_upstream(200, body);

        let ctx = test_context(Instant::now() + Duration::from_secs(10));
        ctx.federator.override_base_url("procurement", &url);

        let mut worker = PatternAnalyzer::default();
        let msg = WorkerMessage::process(
            "corr-patterns",
            "orchestrator",
            WorkerKind::PatternAnalyzer,
            json!({"filters": {"ano": "2024"}}),
        );
        let response = worker.process(&msg, &ctx).unwrap();

        let concentration = response
            .findings
            .iter()
            .find(|f| f.kind == "vendor_concentration")
            .unwrap();
        assert_eq!(concentration.evidence["fornecedor"], "00000000000191");

        let split = response
            .findings
            .iter()
            .find(|f| f.kind == "split_contracts")
            .unwrap();
        assert_eq!(split.evidence["fornecedor"], "11222333000144");
        assert_eq!(split.evidence["ocorrencias"], 4);
    }
}
