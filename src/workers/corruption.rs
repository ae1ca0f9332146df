use crate::errors::ErrorKind;
use crate::investigations::{Finding, Severity};
use crate::prelude::*;
use crate::workers::{
    coverage_quality, fetch_source, filter_params, restricted_finding, string_field,
    Reflection, ResponseMetrics, ResponseStatus, Worker, WorkerContext, WorkerKind,
    WorkerMessage, WorkerResponse, ACTION_COMPENSATE,
};
use std::collections::{HashMap, HashSet};
use std::time::Instant;

const SANCTIONED_ID_KEYS: &[&str] = &["cnpjFormatado", "cpfFormatado", "cnpj", "codigoFormatado"];
const SANCTIONED_NAME_KEYS: &[&str] = &["nomeInformadoOrgaoSancionador", "razaoSocial", "nome"];
const CONTRACT_SUPPLIER_KEYS: &[&str] = &["cnpjFornecedor", "cpfCnpj", "cnpj"];

const HINT_INCLUDE_CNEP: &str = "cross-check-cnep";

/// Cross-references contract suppliers against the federal sanction
/// registers (CEIS, and CNEP after a reflection pass).
#[derive(Default)]
pub(super) struct CorruptionDetector;

impl Worker for CorruptionDetector {
    fn kind(&self) -> WorkerKind {
        WorkerKind::CorruptionDetector
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

        let params = filter_params(&msg.payload);
        let mut registers = vec!["sanctioned-companies"];
        if msg.reflection_hints().contains(&HINT_INCLUDE_CNEP) {
            registers.push("punished-companies");
        }

        let mut metrics = ResponseMetrics::default();
        let mut findings = Vec::new();
        let mut sanctioned: HashMap<String, String> = HashMap::new();
        let mut sources_ok = 0;
        let sources_total = registers.len() + 1;

        for register in &registers {
            let source = fetch_source(ctx, &msg.correlation_id, register, &[])?;
            metrics.upstream_calls += 1;
            if source.restricted {
                metrics.restricted_sources += 1;
                findings.push(restricted_finding(register, self.kind()));
                continue;
            }
            if source.failed.is_some() {
                continue;
            }

            sources_ok += 1;
            metrics.records_analyzed += source.records.len() as u64;
            for record in &source.records {
                if let Some(id) = string_field(record, SANCTIONED_ID_KEYS) {
                    let name = string_field(record, SANCTIONED_NAME_KEYS).unwrap_or("");
                    sanctioned.insert(normalize_id(id), name.to_string());
                }
            }
        }
        let contracts = fetch_source(ctx, &msg.correlation_id, "contracts", &params)?;
        metrics.upstream_calls += 1;
        if contracts.restricted {
            metrics.restricted_sources += 1;
            findings.push(restricted_finding("contracts", self.kind()));
        } else if contracts.failed.is_none() {
            sources_ok += 1;
            metrics.records_analyzed += contracts.records.len() as u64;

            let mut flagged: HashSet<String> = HashSet::new();
            for record in &contracts.records {
                let Some(supplier) = string_field(record, CONTRACT_SUPPLIER_KEYS) else {
                    continue;
                };
                let id = normalize_id(supplier);
                if let Some(name) = sanctioned.get(&id) {
                    if flagged.insert(id.clone()) {
                        findings.push(Finding::new(
                            "sanctioned_vendor_contract",
                            Severity::Critical,
                            0.95,
                            format!(
                                "fornecedor sancionado {supplier} ({name}) aparece em \
                                 contrato vigente"
                            ),
                            serde_json::json!({
                                "fornecedor": supplier,
                                "sancionado": name,
                                "registro": record,
                            }),
                            self.kind(),
                        ));
                    }
                }
            }
        }

        metrics.duration_ms = started.elapsed().as_millis() as u64;
        let quality = coverage_quality(
            sources_ok,
            sources_total,
            metrics.records_analyzed as usize,
        );

        Ok(WorkerResponse {
            correlation_id: msg.correlation_id.clone(),
            status: if sources_ok == sources_total {
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
        let already = msg.reflection_hints().contains(&HINT_INCLUDE_CNEP);
        let hint = if !already {
            Some(HINT_INCLUDE_CNEP.to_string())
        } else {
            None
        };
        Ok(Reflection {
            quality_score: response.quality_score,
            improvement_hint: hint,
        })
    }
}

fn normalize_id(id: &str) -> String {
    id.chars().filter(|c| c.is_ascii_digit()).collect()
}

#[cfg(test)]
mod tests {
    use super::{normalize_id, CorruptionDetector};
    use crate::utils::stub::stub_upstream;
    use crate::workers::{test_context, Worker, WorkerKind, WorkerMessage};
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[test]
    fn test_normalize_strips_formatting() {
        assert_eq!(normalize_id("11.222.333/0001-44"), "11222333000144");
        assert_eq!(normalize_id("11222333000144"), "11222333000144");
    }

    #[test]
    fn test_matches_sanctioned_suppliers() {
        let sanctions = r#"[{"cnpjFormatado": "11.222.333/0001-44", "razaoSocial": "Fantasma LTDA"}]"#;
        let contracts = r#"[
            {"cnpjFornecedor": "11222333000144", "valorInicial": 100000},
            {"cnpjFornecedor": "99888777000166", "valorInicial": 90000}
        ]"#;
        let (sanctions_url, _) = stub_upstream(200, sanctions);
        let (contracts_url, _) = stub_upstream(200, contracts);

        let ctx = test_context(Instant::now() + Duration::from_secs(10));
        ctx.federator
            .override_base_url("sanctioned-companies", &sanctions_url);
        ctx.federator.override_base_url("contracts", &contracts_url);

        let mut worker = CorruptionDetector::default();
        let msg = WorkerMessage::process(
            "corr-integrity",
            "orchestrator",
            WorkerKind::CorruptionDetector,
            json!({"filters": {"ano": "2024"}}),
        );
        let response = worker.process(&msg, &ctx).unwrap();

        let hit = response
            .findings
            .iter()
            .find(|f| f.kind == "sanctioned_vendor_contract")
            .unwrap();
        assert!(hit.description.contains("Fantasma"));
    }
}
