use crate::errors::ErrorKind;
use crate::investigations::{Finding, Severity};
use crate::prelude::*;
use crate::workers::{
    report::REPORT_FINDING_KIND, Reflection, ResponseMetrics, ResponseStatus, Worker,
    WorkerContext, WorkerKind, WorkerMessage, WorkerResponse,
};

/// Answers conversational intents (help, greetings, "what is this") and is
/// the fallback when no analytical worker matches the query.
#[derive(Default)]
pub(super) struct Communicator;

impl Worker for Communicator {
    fn kind(&self) -> WorkerKind {
        WorkerKind::Communicator
    }

    fn process(
        &mut self,
        msg: &WorkerMessage,
        _ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind> {
        let intent = msg.payload["intent"].as_str().unwrap_or("help");

        let text = match intent {
            "greet" => {
                "Olá! Posso investigar dados públicos brasileiros: contratos, despesas, \
                 convênios, licitações, sanções e mais. Descreva o que quer analisar."
            }
            "about" => {
                "Plataforma de investigação sobre dados de transparência do governo \
                 federal: Portal da Transparência, IBGE, Compras.gov e outras fontes \
                 abertas, analisados por um conjunto de trabalhadores especializados."
            }
            _ => {
                "Exemplos do que posso fazer:\n\
                 - \"analisar contratos de saúde em MG em 2024\"\n\
                 - \"investigar fornecedores sancionados no órgão 26000\"\n\
                 - \"padrões de licitação acima de 1 milhão em 2023\"\n\
                 Inclua ano, estado ou órgão para focar a investigação."
            }
        };

        Ok(WorkerResponse {
            correlation_id: msg.correlation_id.clone(),
            status: ResponseStatus::Ok,
            findings: vec![Finding::new(
                REPORT_FINDING_KIND,
                Severity::Low,
                1.0,
                text.to_string(),
                serde_json::json!({ "intent": intent }),
                self.kind(),
            )],
            metrics: ResponseMetrics::default(),
            error: None,
            quality_score: 1.0,
        })
    }

    fn reflect(
        &mut self,
        response: &WorkerResponse,
        _msg: &WorkerMessage,
        _ctx: &WorkerContext,
    ) -> Fallible<Reflection> {
        Ok(Reflection {
            quality_score: response.quality_score,
            improvement_hint: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::Communicator;
    use crate::workers::{test_context, Worker, WorkerKind, WorkerMessage};
    use serde_json::json;
    use std::time::{Duration, Instant};

    #[test]
    fn test_help_response() {
        let ctx = test_context(Instant::now() + Duration::from_secs(5));
        let msg = WorkerMessage::process(
            "corr-help",
            "router",
            WorkerKind::Communicator,
            json!({ "intent": "help" }),
        );

        let response = Communicator.process(&msg, &ctx).unwrap();
        assert_eq!(response.quality_score, 1.0);
        assert!(response.findings[0].description.contains("analisar contratos"));
    }
}
