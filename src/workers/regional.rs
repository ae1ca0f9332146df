use crate::errors::ErrorKind;
use crate::investigations::{Finding, Severity};
use crate::prelude::*;
use crate::workers::{
    coverage_quality, fetch_source, restricted_finding, string_field, Reflection,
    ResponseMetrics, ResponseStatus, Worker, WorkerContext, WorkerKind, WorkerMessage,
    WorkerResponse, ACTION_COMPENSATE,
};
use std::time::Instant;

/// Puts the investigated territory in context: resolves the UF against the
/// IBGE catalogs and attaches its region and municipality count to the
/// evidence trail.
#[derive(Default)]
pub(super) struct RegionalAnalyst;

impl Worker for RegionalAnalyst {
    fn kind(&self) -> WorkerKind {
        WorkerKind::RegionalAnalyst
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

        let target_uf = msg.payload["filters"]["uf"]
            .as_str()
            .map(|uf| uf.to_uppercase());

        let mut metrics = ResponseMetrics::default();
        let mut findings = Vec::new();
        let mut sources_ok = 0;

        let states = fetch_source(ctx, &msg.correlation_id, "ibge-states", &[])?;
        metrics.upstream_calls += 1;
        if states.restricted {
            metrics.restricted_sources += 1;
            findings.push(restricted_finding("ibge-states", self.kind()));
        } else if states.failed.is_none() {
            sources_ok += 1;
        }
        metrics.records_analyzed += states.records.len() as u64;

        let state_record = target_uf.as_ref().and_then(|uf| {
            states
                .records
                .iter()
                .find(|record| string_field(record, &["sigla"]) == Some(uf.as_str()))
                .cloned()
        });

        if let (Some(uf), Some(state)) = (&target_uf, &state_record) {
            let region = state["regiao"]["nome"].as_str().unwrap_or("desconhecida");
            let name = string_field(state, &["nome"]).unwrap_or(uf.as_str());

            let municipalities = fetch_source(
                ctx,
                &msg.correlation_id,
                "ibge-municipalities",
                &[("uf".to_string(), uf.clone())],
            )?;
            metrics.upstream_calls += 1;
            if municipalities.failed.is_none() && !municipalities.restricted {
                sources_ok += 1;
            }
            let municipality_count = municipalities.records.len();
            metrics.records_analyzed += municipality_count as u64;

            findings.push(Finding::new(
                "regional_context",
                Severity::Low,
                0.8,
                format!(
                    "{name} ({uf}), região {region}, com {municipality_count} municípios \
                     no recorte analisado"
                ),
                serde_json::json!({
                    "uf": uf,
                    "estado": name,
                    "regiao": region,
                    "municipios": municipality_count,
                }),
                self.kind(),
            ));
        } else if let Some(uf) = &target_uf {
            findings.push(Finding::new(
                "unknown_territory",
                Severity::Low,
                0.6,
                format!("UF {uf} não encontrada na base de localidades do IBGE"),
                serde_json::json!({ "uf": uf }),
                self.kind(),
            ));
        }

        metrics.duration_ms = started.elapsed().as_millis() as u64;
        let sources_total = if state_record.is_some() { 2 } else { 1 };
        // Without a territory in the query there is nothing regional to add;
        // report honest-but-low quality and let reflection give up.
        let quality = if target_uf.is_none() {
            0.85
        } else {
            coverage_quality(sources_ok, sources_total, metrics.records_analyzed as usize)
        };

        Ok(WorkerResponse {
            correlation_id: msg.correlation_id.clone(),
            status: if sources_ok == sources_total || target_uf.is_none() {
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
        _msg: &WorkerMessage,
        _ctx: &WorkerContext,
    ) -> Fallible<Reflection> {
        // The IBGE catalogs either answered or they did not; a retry through
        // the same federated path will hit the same cache entry.
        Ok(Reflection {
            quality_score: response.quality_score,
            improvement_hint: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RegionalAnalyst;
    use crate::utils::stub::stub_upstream;
    use crate::workers::{test_context, ResponseStatus, Worker, WorkerKind, WorkerMessage};
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[test]
    fn test_resolves_target_state() {
        let states = r#"[
            {"sigla": "MG", "nome": "Minas Gerais", "regiao": {"nome": "Sudeste"}},
            {"sigla": "SP", "nome": "São Paulo", "regiao": {"nome": "Sudeste"}}
        ]"#;
        let municipalities = r#"[{"nome": "Belo Horizonte"}, {"nome": "Uberlândia"}]"#;
        let (states_url, _) = stub_upstream(200, states);
        let (muni_url, _) = stub_upstream(200, municipalities);

        let ctx = test_context(Instant::now() + Duration::from_secs(10));
        ctx.federator.override_base_url("ibge-states", &states_url);
        ctx.federator
            .override_base_url("ibge-municipalities", &muni_url);

        let mut worker = RegionalAnalyst::default();
        let msg = WorkerMessage::process(
            "corr-regional",
            "orchestrator",
            WorkerKind::RegionalAnalyst,
            json!({"filters": {"uf": "mg"}}),
        );
        let response = worker.process(&msg, &ctx).unwrap();

        assert_eq!(response.status, ResponseStatus::Ok);
        let context = response
            .findings
            .iter()
            .find(|f| f.kind == "regional_context")
            .unwrap();
        assert_eq!(context.evidence["estado"], "Minas Gerais");
        assert_eq!(context.evidence["regiao"], "Sudeste");
    }

    #[test]
    fn test_no_territory_passes_through() {
        let ctx = test_context(Instant::now() + Duration::from_secs(10));
        let (states_url, _) = stub_upstream(200, "[]");
        ctx.federator.override_base_url("ibge-states", &states_url);

        let mut worker = RegionalAnalyst::default();
        let msg = WorkerMessage::process(
            "corr-regional",
            "orchestrator",
            WorkerKind::RegionalAnalyst,
            json!({"filters": {}}),
        );
        let response = worker.process(&msg, &ctx).unwrap();
        assert_eq!(response.status, ResponseStatus::Ok);
        assert!(response.quality_score >= 0.8);
    }
}
