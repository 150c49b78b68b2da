//! Deferred key-value writes, kept off the request's critical path
//!
//! Interceptors enqueue writes here instead of touching the store
//! directly, so response latency never includes store I/O. Failures are
//! logged and dropped, never retried, never surfaced.

use std::sync::Arc;
use tokio::sync::mpsc;

use crate::store::ConfigStore;

#[derive(Debug)]
struct KvWrite {
    key: String,
    value: String,
}

/// Handle to the background write queue. Cheap to clone.
#[derive(Clone)]
pub struct BackgroundWriter {
    tx: mpsc::UnboundedSender<KvWrite>,
}

impl BackgroundWriter {
    /// Spawn the consumer task. Must be called within a tokio runtime.
    pub fn spawn(store: Arc<dyn ConfigStore>) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<KvWrite>();

        tokio::spawn(async move {
            while let Some(write) = rx.recv().await {
                // Compare-before-write: no-op writes are skipped, which
                // keeps concurrent last-write-wins updates cheap.
                if store.kv_get(&write.key).as_deref() == Some(write.value.as_str()) {
                    continue;
                }
                if let Err(e) = store.kv_set(&write.key, &write.value) {
                    tracing::warn!("Deferred write of '{}' failed: {}", write.key, e);
                }
            }
        });

        Self { tx }
    }

    /// Enqueue a write. Non-blocking; the request path never awaits it.
    pub fn record(&self, key: &str, value: String) {
        let write = KvWrite {
            key: key.to_string(),
            value,
        };
        if self.tx.send(write).is_err() {
            tracing::debug!("Background writer is gone, dropping write of '{}'", key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::time::Duration;

    async fn settle() {
        // Give the consumer task a chance to drain the queue.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn writes_land_in_the_store() {
        let store = Arc::new(MemoryStore::new());
        let writer = BackgroundWriter::spawn(store.clone());

        writer.record("last_seen_system_prompt", "prompt v1".to_string());
        settle().await;

        assert_eq!(
            store.kv_get("last_seen_system_prompt").as_deref(),
            Some("prompt v1")
        );
    }

    #[tokio::test]
    async fn last_write_wins() {
        let store = Arc::new(MemoryStore::new());
        let writer = BackgroundWriter::spawn(store.clone());

        writer.record("k", "v1".to_string());
        writer.record("k", "v2".to_string());
        settle().await;

        assert_eq!(store.kv_get("k").as_deref(), Some("v2"));
    }
}
