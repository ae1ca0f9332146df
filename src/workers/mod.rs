mod aggregator;
mod anomaly;
mod communicator;
mod corruption;
mod patterns;
mod pool;
mod regional;
mod report;
pub mod registry;
pub mod runtime;
mod textual;

pub use pool::{PoolStats, WorkerHandle, WorkerPool};
pub use report::REPORT_FINDING_KIND;

use crate::config::Config;
use crate::errors::ErrorKind;
use crate::federation::Federator;
use crate::investigations::Finding;
use crate::llm::LlmClient;
use crate::prelude::*;
use crate::server::metrics::Metrics;
use crate::utils::cancel::CancelToken;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Instant;

string_enum!(pub enum WorkerKind {
    AnomalyDetector => "anomaly-detector",
    PatternAnalyzer => "pattern-analyzer",
    CorruptionDetector => "corruption-detector",
    RegionalAnalyst => "regional-analyst",
    TextualAnalyzer => "textual-analyzer",
    Aggregator => "aggregator",
    ReportWriter => "report-writer",
    Communicator => "communicator",
    OrchestratorMaster => "orchestrator-master",
});

string_enum!(pub enum ResponseStatus {
    Ok => "ok",
    Degraded => "degraded",
    Failed => "failed",
});

/// Worker call lifecycle. State transitions are the only place the runtime
/// logs or counts anything about an in-flight call.
string_enum!(pub enum WorkerState {
    Idle => "idle",
    Thinking => "thinking",
    Acting => "acting",
    Waiting => "waiting",
    Completed => "completed",
    Error => "error",
});

pub const ACTION_PROCESS: &str = "process";
pub const ACTION_COMPENSATE: &str = "compensate";

/// Payload key the reflection loop merges improvement hints under.
pub const REFLECTION_HINT_KEY: &str = "reflection_hint";

/// Inter-component message envelope. The correlation id propagates through
/// every downstream call and log line.
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerMessage {
    pub id: String,
    pub correlation_id: String,
    pub sender: String,
    pub recipient: WorkerKind,
    pub action: String,
    pub payload: serde_json::Value,
    pub deadline: Option<DateTime<Utc>>,
    pub priority: u8,
}

impl WorkerMessage {
    pub fn process(
        correlation_id: &str,
        sender: &str,
        recipient: WorkerKind,
        payload: serde_json::Value,
    ) -> Self {
        WorkerMessage {
            id: crate::utils::random_id("msg"),
            correlation_id: correlation_id.to_string(),
            sender: sender.to_string(),
            recipient,
            action: ACTION_PROCESS.to_string(),
            payload,
            deadline: None,
            priority: 5,
        }
    }

    pub fn reflection_hints(&self) -> Vec<&str> {
        self.payload[REFLECTION_HINT_KEY]
            .as_array()
            .map(|hints| hints.iter().filter_map(|h| h.as_str()).collect())
            .unwrap_or_default()
    }

    pub fn push_reflection_hint(&mut self, hint: &str) {
        if !self.payload.is_object() {
            self.payload = serde_json::json!({});
        }
        let hints = self.payload[REFLECTION_HINT_KEY]
            .as_array()
            .cloned()
            .unwrap_or_default();
        let mut hints = hints;
        hints.push(serde_json::Value::String(hint.to_string()));
        self.payload[REFLECTION_HINT_KEY] = serde_json::Value::Array(hints);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResponseMetrics {
    pub records_analyzed: u64,
    pub upstream_calls: u32,
    pub restricted_sources: u32,
    pub duration_ms: u64,
}

/// Result envelope returned by every worker call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct WorkerResponse {
    pub correlation_id: String,
    pub status: ResponseStatus,
    pub findings: Vec<Finding>,
    pub metrics: ResponseMetrics,
    pub error: Option<String>,
    pub quality_score: f64,
}

impl WorkerResponse {
    pub fn failed(correlation_id: &str, error: String) -> Self {
        WorkerResponse {
            correlation_id: correlation_id.to_string(),
            status: ResponseStatus::Failed,
            findings: Vec::new(),
            metrics: ResponseMetrics::default(),
            error: Some(error),
            quality_score: 0.0,
        }
    }
}

/// Outcome of a `reflect` call. A missing hint means the worker sees no way
/// to improve and the loop should stop where it is.
pub struct Reflection {
    pub quality_score: f64,
    pub improvement_hint: Option<String>,
}

/// Shared resources plus the per-call deadline and cancellation signal.
pub struct WorkerContext {
    pub federator: Arc<Federator>,
    pub llm: Arc<LlmClient>,
    pub config: Config,
    pub metrics: Metrics,
    pub deadline: Instant,
    pub cancel: CancelToken,
}

impl WorkerContext {
    pub fn fetch_hints(&self, correlation_id: &str) -> crate::federation::FetchHints {
        crate::federation::FetchHints::new(self.deadline, correlation_id, self.cancel.clone())
    }
}

/// The capability set every worker implements. Reflection metadata (quality
/// threshold, iteration bound) lives on the registry descriptor, not on the
/// instance.
pub trait Worker: Send {
    fn kind(&self) -> WorkerKind;

    fn initialize(&mut self) -> Fallible<()> {
        Ok(())
    }

    fn process(
        &mut self,
        msg: &WorkerMessage,
        ctx: &WorkerContext,
    ) -> Result<WorkerResponse, ErrorKind>;

    fn reflect(
        &mut self,
        response: &WorkerResponse,
        msg: &WorkerMessage,
        ctx: &WorkerContext,
    ) -> Fallible<Reflection>;

    fn shutdown(&mut self) -> Fallible<()> {
        Ok(())
    }
}

/// Flattens the opaque upstream body into a list of records. The federation
/// layer stores bodies verbatim; decoding is the workers' responsibility.
pub(crate) fn as_records(value: &serde_json::Value) -> Vec<serde_json::Value> {
    match value {
        serde_json::Value::Array(items) => items.clone(),
        serde_json::Value::Object(map) => {
            for key in ["items", "data", "dados", "resultado"] {
                if let Some(serde_json::Value::Array(items)) = map.get(key) {
                    return items.clone();
                }
            }
            vec![value.clone()]
        }
        serde_json::Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

/// Extracts a numeric field trying several upstream naming conventions.
pub(crate) fn number_field(record: &serde_json::Value, keys: &[&str]) -> Option<f64> {
    for key in keys {
        let value = &record[*key];
        if let Some(number) = value.as_f64() {
            return Some(number);
        }
        if let Some(text) = value.as_str() {
            // Brazilian decimal notation: "1.234.567,89"
            let normalized = text.replace('.', "").replace(',', ".");
            if let Ok(number) = normalized.parse::<f64>() {
                return Some(number);
            }
        }
    }
    None
}

pub(crate) fn string_field<'a>(
    record: &'a serde_json::Value,
    keys: &[&str],
) -> Option<&'a str> {
    for key in keys {
        if let Some(text) = record[*key].as_str() {
            if !text.is_empty() {
                return Some(text);
            }
        }
    }
    None
}

/// One upstream source as seen by a worker: either records, a restriction
/// marker, or a soft failure the step degrades over. Only cancellation and
/// deadline expiry abort the call.
pub(crate) struct SourceFetch {
    pub endpoint: String,
    pub records: Vec<serde_json::Value>,
    pub restricted: bool,
    pub failed: Option<String>,
}

pub(crate) fn fetch_source(
    ctx: &WorkerContext,
    correlation_id: &str,
    endpoint: &str,
    params: &[(String, String)],
) -> Result<SourceFetch, ErrorKind> {
    use crate::federation::FetchError;

    match ctx.federator.fetch(endpoint, params, &ctx.fetch_hints(correlation_id)) {
        Ok(payload) => Ok(SourceFetch {
            endpoint: endpoint.to_string(),
            records: if payload.restricted {
                Vec::new()
            } else {
                as_records(&payload.value)
            },
            restricted: payload.restricted,
            failed: None,
        }),
        Err(FetchError::Cancelled) => Err(ErrorKind::Cancelled),
        Err(err @ FetchError::Timeout { .. }) => Err(err.into()),
        // Circuit open, upstream errors, rate limits: the step degrades and
        // the investigation carries on.
        Err(err) => Ok(SourceFetch {
            endpoint: endpoint.to_string(),
            records: Vec::new(),
            restricted: false,
            failed: Some(err.to_string()),
        }),
    }
}

/// Query parameters from the message's filter map, values stringified.
pub(crate) fn filter_params(payload: &serde_json::Value) -> Vec<(String, String)> {
    let Some(filters) = payload["filters"].as_object() else {
        return Vec::new();
    };
    filters
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                serde_json::Value::String(s) => s.clone(),
                serde_json::Value::Number(n) => n.to_string(),
                serde_json::Value::Bool(b) => b.to_string(),
                _ => return None,
            };
            Some((key.clone(), value))
        })
        .collect()
}

/// Finding emitted for a blocked upstream, annotated so readers can tell
/// missing evidence from clean evidence.
pub(crate) fn restricted_finding(endpoint: &str, produced_by: WorkerKind) -> Finding {
    Finding::new(
        "source_restricted",
        crate::investigations::Severity::Low,
        1.0,
        format!("fonte {endpoint} recusou acesso (403/404); resultados parciais"),
        serde_json::json!({ "source_restricted": true, "endpoint": endpoint }),
        produced_by,
    )
}

/// Shared quality heuristic: how much of the requested evidence actually got
/// looked at. Reaching the default 0.8 threshold requires every source to
/// answer and a non-trivial record sample.
pub(crate) fn coverage_quality(sources_ok: usize, sources_total: usize, records: usize) -> f64 {
    if sources_total == 0 {
        return 0.9;
    }
    let source_share = sources_ok as f64 / sources_total as f64;
    let record_share = (records as f64 / 10.0).min(1.0);
    0.25 + 0.5 * source_share + 0.25 * record_share
}

/// Context against a throwaway database with no LLM configured; workers fall
/// back to their deterministic paths.
#[cfg(test)]
pub(crate) fn test_context(deadline: Instant) -> WorkerContext {
    use crate::cache::CacheHierarchy;
    use crate::config::Secrets;
    use crate::db::Database;

    let config = Config::default();
    let cache = Arc::new(
        CacheHierarchy::temp(Database::temp().unwrap(), config.clone()).unwrap(),
    );
    let federator = Arc::new(Federator::new(
        cache,
        config.clone(),
        Secrets::default(),
        Metrics::shared(),
    ));
    let llm = Arc::new(LlmClient::new(
        config.clone(),
        Secrets::default(),
        Metrics::shared(),
    ));

    WorkerContext {
        federator,
        llm,
        config,
        metrics: Metrics::shared(),
        deadline,
        cancel: CancelToken::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::{as_records, number_field, WorkerKind, WorkerMessage};
    use serde_json::json;

    #[test]
    fn test_message_hint_accumulation() {
        let mut msg = WorkerMessage::process(
            "corr-1",
            "orchestrator",
            WorkerKind::AnomalyDetector,
            json!({"ano": "2024"}),
        );
        assert!(msg.reflection_hints().is_empty());

        msg.push_reflection_hint("expand-data-sources");
        msg.push_reflection_hint("lower-outlier-cutoff");
        assert_eq!(
            msg.reflection_hints(),
            vec!["expand-data-sources", "lower-outlier-cutoff"]
        );
        // The original payload keys survive the merge.
        assert_eq!(msg.payload["ano"], "2024");
    }

    #[test]
    fn test_record_flattening() {
        assert_eq!(as_records(&json!([1, 2])).len(), 2);
        assert_eq!(as_records(&json!({"items": [1, 2, 3]})).len(), 3);
        assert_eq!(as_records(&json!({"dados": []})).len(), 0);
        assert_eq!(as_records(&json!({"total": 5})).len(), 1);
        assert_eq!(as_records(&serde_json::Value::Null).len(), 0);
    }

    #[test]
    fn test_number_field_parses_brazilian_decimals() {
        let record = json!({"valorInicial": "1.234.567,89"});
        let value = number_field(&record, &["valor", "valorInicial"]).unwrap();
        assert!((value - 1_234_567.89).abs() < 0.01);

        assert_eq!(number_field(&json!({"valor": 42.5}), &["valor"]), Some(42.5));
        assert_eq!(number_field(&json!({}), &["valor"]), None);
    }
}
