use crate::errors::ErrorKind;
use crate::investigations::{Finding, Severity};
use crate::prelude::*;
use crate::workers::{
    coverage_quality, fetch_source, restricted_finding, string_field, Reflection,
    ResponseMetrics, ResponseStatus, Worker, WorkerContext, WorkerKind, WorkerMessage,
    WorkerResponse, ACTION_COMPENSATE,
};
use std::time::Instant;

const TEXT_KEYS: &[&str] = &["excerpt", "excerpts", "txt", "texto", "ementa"];

/// Terms that historically correlate with irregular procurement when they
/// cluster in official gazettes.
const RISK_TERMS: &[&str] = &[
    "dispensa de licitação",
    "inexigibilidade",
    "emergencial",
    "aditivo contratual",
    "fracionamento",
    "ratificação",
];

const HINT_SEARCH_LEGISLATIVE: &str = "search-legislative-sources";

/// Scans official gazettes (and, after reflection, legislative records) for
/// risk-term clusters around the investigated subject.
#[derive(Default)]
pub(super) struct TextualAnalyzer {
    last_documents: usize,
}

impl Worker for TextualAnalyzer {
    fn kind(&self) -> WorkerKind {
        WorkerKind::TextualAnalyzer
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

        let query = msg.payload["query"].as_str().unwrap_or("");
        let mut params = vec![("querystring".to_string(), query.to_string())];
        if let Some(uf) = msg.payload["filters"]["uf"].as_str() {
            params.push(("territory_ids".to_string(), uf.to_string()));
        }

        let mut endpoints = vec!["official-gazettes"];
        if msg.reflection_hints().contains(&HINT_SEARCH_LEGISLATIVE) {
            endpoints.push("camara-proposals");
        }

        let mut metrics = ResponseMetrics::default();
        let mut findings = Vec::new();
        let mut sources_ok = 0;
        let mut documents = 0usize;

        for endpoint in &endpoints {
            let source = fetch_source(ctx, &msg.correlation_id, endpoint, &params)?;
            metrics.upstream_calls += 1;
            if source.restricted {
                metrics.restricted_sources += 1;
                findings.push(restricted_finding(endpoint, self.kind()));
                continue;
            }
            if source.failed.is_some() {
                continue;
            }
            sources_ok += 1;

            for record in &source.records {
                documents += 1;
                let text = document_text(record).to_lowercase();
                let hits: Vec<&str> = RISK_TERMS
                    .iter()
                    .copied()
                    .filter(|term| text.contains(term))
                    .collect();
                if hits.is_empty() {
                    continue;
                }

                let source_name = string_field(record, &["territory_name", "siglaTipo", "fonte"])
                    .unwrap_or(endpoint)
                    .to_string();
                findings.push(Finding::new(
                    "keyword_flag",
                    if hits.len() >= 2 {
                        Severity::Medium
                    } else {
                        Severity::Low
                    },
                    (0.5 + 0.1 * hits.len() as f64).min(0.8),
                    format!(
                        "documento de {source_name} menciona {} termo(s) de risco: {}",
                        hits.len(),
                        hits.join(", ")
                    ),
                    serde_json::json!({
                        "termos": hits,
                        "fonte": endpoint,
                        "documento": record,
                    }),
                    self.kind(),
                ));
            }
        }

        metrics.records_analyzed = documents as u64;
        metrics.duration_ms = started.elapsed().as_millis() as u64;
        self.last_documents = documents;

        let quality = coverage_quality(sources_ok, endpoints.len(), documents);
        Ok(WorkerResponse {
            correlation_id: msg.correlation_id.clone(),
            status: if sources_ok == endpoints.len() {
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
        let already = msg.reflection_hints().contains(&HINT_SEARCH_LEGISLATIVE);
        let hint = if !already && self.last_documents < 5 {
            Some(HINT_SEARCH_LEGISLATIVE.to_string())
        } else {
            None
        };
        Ok(Reflection {
            quality_score: response.quality_score,
            improvement_hint: hint,
        })
    }
}

fn document_text(record: &serde_json::Value) -> String {
    for key in TEXT_KEYS {
        match &record[*key] {
            serde_json::Value::String(text) => return text.clone(),
            serde_json::Value::Array(parts) => {
                return parts
                    .iter()
                    .filter_map(|p| p.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
            }
            _ => {}
        }
    }
    String::new()
}
