use crate::investigations::Investigation;
use crate::prelude::*;
use crate::server::metrics::Metrics;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

string_enum!(pub enum EventKind {
    Created => "created",
    Progress => "progress",
    Chunk => "chunk",
    Completed => "completed",
    Failed => "failed",
    Cancelled => "cancelled",
});

/// Bounded replay so a client that reconnects quickly does not miss the
/// beginning of its investigation.
const HISTORY_EVENTS: usize = 1000;
const HISTORY_AGE: Duration = Duration::from_secs(300);

/// Subscriber buffer; slow consumers past this lag see dropped events (and a
/// metric), never unbounded memory.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Clone, Serialize)]
pub struct Event {
    #[serde(skip)]
    pub investigation_id: String,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    fn new(investigation_id: &str, kind: EventKind, data: serde_json::Value) -> Self {
        Event {
            investigation_id: investigation_id.to_string(),
            kind,
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn created(investigation: &Investigation) -> Self {
        Event::new(
            &investigation.id,
            EventKind::Created,
            serde_json::json!({
                "investigation_id": investigation.id,
                "status": investigation.status,
                "query_text": investigation.query_text,
            }),
        )
    }

    pub fn progress(investigation_id: &str, progress: f64, phase: &str) -> Self {
        Event::new(
            investigation_id,
            EventKind::Progress,
            serde_json::json!({ "progress": progress, "current_phase": phase }),
        )
    }

    /// Incremental findings produced by one step.
    pub fn chunk(investigation_id: &str, data: serde_json::Value) -> Self {
        Event::new(investigation_id, EventKind::Chunk, data)
    }

    pub fn completed(investigation: &Investigation) -> Self {
        Event::new(
            &investigation.id,
            EventKind::Completed,
            serde_json::json!({
                "status": investigation.status,
                "progress": 1.0,
                "findings_count": investigation.findings_count,
                "confidence": investigation.confidence,
                "summary": investigation.summary,
            }),
        )
    }

    pub fn failed(investigation: &Investigation) -> Self {
        Event::new(
            &investigation.id,
            EventKind::Failed,
            serde_json::json!({
                "status": investigation.status,
                "error_kind": investigation.error_kind,
                "error_message": investigation.error_message,
                "findings_count": investigation.findings_count,
            }),
        )
    }

    pub fn cancelled(investigation_id: &str) -> Self {
        Event::new(
            investigation_id,
            EventKind::Cancelled,
            serde_json::json!({ "status": "cancelled" }),
        )
    }
}

/// Topic-per-investigation pub/sub over one broadcast channel, with a
/// bounded in-memory history window for replay. Delivery is in publish
/// order; terminal events are durable in the investigation store, so a
/// subscriber that lags past the buffer can always recover state.
pub struct EventBus {
    tx: broadcast::Sender<Event>,
    history: Mutex<VecDeque<(Instant, Event)>>,
    metrics: Metrics,
}

impl EventBus {
    pub fn new(metrics: Metrics) -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        EventBus {
            tx,
            history: Mutex::new(VecDeque::new()),
            metrics,
        }
    }

    pub fn publish(&self, event: Event) {
        self.metrics.record_event(event.kind.to_str());

        {
            let mut history = self.history.lock().unwrap();
            history.push_back((Instant::now(), event.clone()));
            while history.len() > HISTORY_EVENTS {
                history.pop_front();
            }
            while let Some((at, _)) = history.front() {
                if at.elapsed() > HISTORY_AGE {
                    history.pop_front();
                } else {
                    break;
                }
            }
        }

        // No live subscribers is fine; the history covers late joiners.
        let _ = self.tx.send(event);
    }

    /// Replay of the buffered history for one investigation plus a live
    /// receiver. Callers filter the receiver by investigation id.
    pub fn subscribe(&self, investigation_id: &str) -> (Vec<Event>, broadcast::Receiver<Event>) {
        // Subscribing before reading history closes the gap between the two.
        let receiver = self.tx.subscribe();
        let replay = self
            .history
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, event)| event.investigation_id == investigation_id)
            .map(|(_, event)| event.clone())
            .collect();
        (replay, receiver)
    }

    pub fn record_dropped(&self, count: u64) {
        self.metrics.record_dropped_events(count);
    }
}
