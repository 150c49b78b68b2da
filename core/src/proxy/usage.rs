//! Usage accounting channel
//!
//! A lazily-spawned background worker receives per-request usage
//! payloads over message passing, aggregates and persists them, and
//! republishes summary events process-wide. The request path only ever
//! does a non-blocking send; bookkeeping never sits on the critical
//! path.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

use crate::store::ConfigStore;

/// KV key the aggregated summary is persisted under.
pub const USAGE_SUMMARY_KEY: &str = "usage_summary";

/// How long shutdown waits for the worker to flush before aborting it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const EVENT_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Per-request usage record. Ownership moves into the channel on
/// dispatch; the sender must not touch it afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsagePayload {
    pub id: String,
    pub account_id: Option<String>,
    pub email: Option<String>,
    pub model: Option<String>,
    pub agent_id: Option<String>,
    pub usage: TokenUsage,
    pub latency_ms: u64,
    pub timestamp: DateTime<Utc>,
}

impl UsagePayload {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModelTotals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Running aggregate, persisted after every absorbed payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UsageSummary {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub per_model: HashMap<String, ModelTotals>,
}

impl UsageSummary {
    fn absorb(&mut self, payload: &UsagePayload) {
        self.requests += 1;
        self.input_tokens += payload.usage.input_tokens;
        self.output_tokens += payload.usage.output_tokens;

        let model = payload.model.clone().unwrap_or_else(|| "unknown".to_string());
        let totals = self.per_model.entry(model).or_default();
        totals.requests += 1;
        totals.input_tokens += payload.usage.input_tokens;
        totals.output_tokens += payload.usage.output_tokens;
    }
}

/// Events republished to the rest of the process (dashboards etc.).
#[derive(Debug, Clone)]
pub enum UsageEvent {
    Payload(UsagePayload),
    Summary(UsageSummary),
}

enum WorkerMessage {
    Payload(UsagePayload),
    Shutdown(oneshot::Sender<()>),
}

struct Worker {
    tx: mpsc::UnboundedSender<WorkerMessage>,
    handle: JoinHandle<()>,
}

/// Owner of the usage worker. Spawns the worker lazily on first
/// dispatch, tears it down via `shutdown`.
pub struct UsageChannel {
    store: Arc<dyn ConfigStore>,
    events: broadcast::Sender<UsageEvent>,
    worker: Mutex<Option<Worker>>,
}

impl UsageChannel {
    pub fn new(store: Arc<dyn ConfigStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            store,
            events,
            worker: Mutex::new(None),
        }
    }

    /// One-way send of a usage payload. Non-blocking; never awaited.
    pub fn dispatch(&self, payload: UsagePayload) {
        let mut guard = self.worker.lock().expect("usage channel lock poisoned");
        let worker = guard.get_or_insert_with(|| self.spawn_worker());
        if let Err(e) = worker.tx.send(WorkerMessage::Payload(payload)) {
            tracing::warn!("Usage worker unavailable, dropping payload: {}", e);
        }
    }

    /// Subscribe to usage events. Subscribers joining later only see
    /// events from that point on.
    pub fn subscribe(&self) -> broadcast::Receiver<UsageEvent> {
        self.events.subscribe()
    }

    /// Stream view of the event feed.
    pub fn event_stream(&self) -> BroadcastStream<UsageEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Flush and tear down the worker. Waits a bounded grace period for
    /// the flush acknowledgment before aborting. No-op when already
    /// torn down.
    pub async fn shutdown(&self) {
        let worker = {
            let mut guard = self.worker.lock().expect("usage channel lock poisoned");
            guard.take()
        };
        let Some(worker) = worker else {
            return;
        };

        let (ack_tx, ack_rx) = oneshot::channel();
        if worker.tx.send(WorkerMessage::Shutdown(ack_tx)).is_err() {
            worker.handle.abort();
            return;
        }

        match tokio::time::timeout(SHUTDOWN_GRACE, ack_rx).await {
            Ok(_) => {
                let _ = tokio::time::timeout(SHUTDOWN_GRACE, worker.handle).await;
                tracing::info!("Usage worker stopped");
            }
            Err(_) => {
                tracing::warn!("Usage worker did not flush within grace period, aborting");
                worker.handle.abort();
            }
        }
    }

    fn spawn_worker(&self) -> Worker {
        let (tx, mut rx) = mpsc::unbounded_channel::<WorkerMessage>();
        let store = self.store.clone();
        let events = self.events.clone();

        let handle = tokio::spawn(async move {
            // Resume from the persisted summary, if any.
            let mut summary = store
                .kv_get(USAGE_SUMMARY_KEY)
                .and_then(|raw| serde_json::from_str::<UsageSummary>(&raw).ok())
                .unwrap_or_default();

            while let Some(message) = rx.recv().await {
                match message {
                    WorkerMessage::Payload(payload) => {
                        summary.absorb(&payload);
                        let _ = events.send(UsageEvent::Payload(payload));
                        let _ = events.send(UsageEvent::Summary(summary.clone()));
                        persist(store.as_ref(), &summary);
                    }
                    WorkerMessage::Shutdown(ack) => {
                        persist(store.as_ref(), &summary);
                        let _ = ack.send(());
                        break;
                    }
                }
            }
        });

        Worker { tx, handle }
    }
}

fn persist(store: &dyn ConfigStore, summary: &UsageSummary) {
    match serde_json::to_string(summary) {
        Ok(raw) => {
            if let Err(e) = store.kv_set(USAGE_SUMMARY_KEY, &raw) {
                tracing::warn!("Failed to persist usage summary: {}", e);
            }
        }
        Err(e) => tracing::warn!("Failed to serialize usage summary: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn payload(model: &str, input: u64, output: u64) -> UsagePayload {
        UsagePayload {
            id: UsagePayload::new_id(),
            account_id: Some("acct-1".to_string()),
            email: Some("a@example.com".to_string()),
            model: Some(model.to_string()),
            agent_id: None,
            usage: TokenUsage {
                input_tokens: input,
                output_tokens: output,
            },
            latency_ms: 12,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn payload_serializes_with_timestamp() {
        let raw = serde_json::to_string(&payload("base-v1", 1, 2)).unwrap();
        assert!(raw.contains("\"timestamp\""));
        let back: UsagePayload = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.usage.input_tokens, 1);
    }

    #[tokio::test]
    async fn dispatch_aggregates_and_emits_events() {
        let store = Arc::new(MemoryStore::new());
        let channel = UsageChannel::new(store.clone());
        let mut events = channel.subscribe();

        channel.dispatch(payload("base-v1", 10, 5));

        let first = events.recv().await.unwrap();
        assert!(matches!(first, UsageEvent::Payload(_)));
        let second = events.recv().await.unwrap();
        let UsageEvent::Summary(summary) = second else {
            panic!("expected summary event");
        };
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.input_tokens, 10);
        assert_eq!(summary.output_tokens, 5);
        assert_eq!(summary.per_model["base-v1"].requests, 1);
    }

    #[tokio::test]
    async fn shutdown_flushes_and_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let channel = UsageChannel::new(store.clone());

        channel.dispatch(payload("base-v1", 3, 4));
        channel.dispatch(payload("fast-v2", 1, 2));
        channel.shutdown().await;

        let raw = store.kv_get(USAGE_SUMMARY_KEY).unwrap();
        let summary: UsageSummary = serde_json::from_str(&raw).unwrap();
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.input_tokens, 4);
        assert_eq!(summary.output_tokens, 6);
        assert_eq!(summary.per_model.len(), 2);

        // Second shutdown is a no-op.
        channel.shutdown().await;
    }

    #[tokio::test]
    async fn worker_resumes_from_persisted_summary() {
        let store = Arc::new(MemoryStore::new());
        {
            let channel = UsageChannel::new(store.clone());
            channel.dispatch(payload("base-v1", 5, 5));
            channel.shutdown().await;
        }

        let channel = UsageChannel::new(store.clone());
        channel.dispatch(payload("base-v1", 5, 5));
        channel.shutdown().await;

        let raw = store.kv_get(USAGE_SUMMARY_KEY).unwrap();
        let summary: UsageSummary = serde_json::from_str(&raw).unwrap();
        assert_eq!(summary.requests, 2);
        assert_eq!(summary.input_tokens, 10);
    }

    #[tokio::test]
    async fn shutdown_without_dispatch_is_a_no_op() {
        let store = Arc::new(MemoryStore::new());
        let channel = UsageChannel::new(store);
        channel.shutdown().await;
    }
}
