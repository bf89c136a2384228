//! Append-only log store with session-scoped and global fan-out.
//!
//! Every append publishes the entry on two channels: a per-session channel
//! and a global firehose. Appends with the same session id are delivered to
//! subscribers in append order. Publish failures (no listener) are tolerated;
//! append failures are fatal to the calling operation.

use super::types::{LogEntry, LogFilter};
use crate::errors::LogError;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::{RwLock, broadcast};

/// Buffered entries per broadcast channel before slow receivers start lagging.
const CHANNEL_CAPACITY: usize = 256;

/// Log store contract: append, per-session lookup, filtered query, and
/// subscription to the two publish channels.
#[async_trait]
pub trait LogStore: Send + Sync {
    /// Append one entry. The returned entry carries the assigned id and
    /// timestamp.
    async fn append(&self, entry: LogEntry) -> Result<LogEntry, LogError>;

    /// All entries for a session, in append order.
    async fn find_by_session(&self, session_id: &str) -> Result<Vec<LogEntry>, LogError>;

    /// Filtered query over all entries.
    async fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, LogError>;

    /// Subscribe to the session-scoped channel.
    async fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<LogEntry>;

    /// Subscribe to the global firehose.
    async fn subscribe_all(&self) -> broadcast::Receiver<LogEntry>;
}

/// In-memory log store. Per-session ordering follows append order because
/// both the buffer push and the channel send happen under one write lock.
pub struct MemoryLogStore {
    inner: RwLock<Inner>,
    firehose: broadcast::Sender<LogEntry>,
}

struct Inner {
    entries: Vec<LogEntry>,
    session_channels: HashMap<String, broadcast::Sender<LogEntry>>,
}

impl MemoryLogStore {
    pub fn new() -> Self {
        let (firehose, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                entries: Vec::new(),
                session_channels: HashMap::new(),
            }),
            firehose,
        }
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.entries.is_empty()
    }
}

impl Default for MemoryLogStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LogStore for MemoryLogStore {
    async fn append(&self, entry: LogEntry) -> Result<LogEntry, LogError> {
        let mut inner = self.inner.write().await;
        inner.entries.push(entry.clone());

        // Publish while still holding the lock so channel order matches
        // append order. Send errors just mean nobody is listening.
        if let Some(tx) = inner.session_channels.get(&entry.session_id) {
            let _ = tx.send(entry.clone());
        }
        let _ = self.firehose.send(entry.clone());

        Ok(entry)
    }

    async fn find_by_session(&self, session_id: &str) -> Result<Vec<LogEntry>, LogError> {
        let inner = self.inner.read().await;
        Ok(inner
            .entries
            .iter()
            .filter(|e| e.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn query(&self, filter: &LogFilter) -> Result<Vec<LogEntry>, LogError> {
        let inner = self.inner.read().await;
        let mut matched: Vec<LogEntry> = inner
            .entries
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();

        if filter.descending {
            matched.reverse();
        }
        let offset = filter.offset.unwrap_or(0);
        let matched: Vec<LogEntry> = matched.into_iter().skip(offset).collect();
        match filter.limit {
            Some(limit) => Ok(matched.into_iter().take(limit).collect()),
            None => Ok(matched),
        }
    }

    async fn subscribe_session(&self, session_id: &str) -> broadcast::Receiver<LogEntry> {
        let mut inner = self.inner.write().await;
        inner
            .session_channels
            .entry(session_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    async fn subscribe_all(&self) -> broadcast::Receiver<LogEntry> {
        self.firehose.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::types::EventType;
    use serde_json::json;

    fn entry(session: &str, event_type: EventType) -> LogEntry {
        LogEntry::new(session, event_type)
    }

    #[tokio::test]
    async fn append_preserves_per_session_order() {
        let store = MemoryLogStore::new();
        for i in 0..5 {
            store
                .append(entry("sess-1", EventType::PlanningIteration).with_data("i", json!(i)))
                .await
                .unwrap();
        }
        store
            .append(entry("sess-2", EventType::SessionStarted))
            .await
            .unwrap();

        let found = store.find_by_session("sess-1").await.unwrap();
        assert_eq!(found.len(), 5);
        for (i, e) in found.iter().enumerate() {
            assert_eq!(e.data["i"], json!(i));
        }
    }

    #[tokio::test]
    async fn session_channel_receives_in_append_order() {
        let store = MemoryLogStore::new();
        let mut rx = store.subscribe_session("sess-1").await;

        store
            .append(entry("sess-1", EventType::SessionStarted))
            .await
            .unwrap();
        store
            .append(entry("sess-2", EventType::SessionStarted))
            .await
            .unwrap();
        store
            .append(entry("sess-1", EventType::SessionCompleted))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().event_type, EventType::SessionStarted);
        assert_eq!(
            rx.recv().await.unwrap().event_type,
            EventType::SessionCompleted
        );
    }

    #[tokio::test]
    async fn firehose_sees_all_sessions() {
        let store = MemoryLogStore::new();
        let mut rx = store.subscribe_all().await;

        store
            .append(entry("sess-1", EventType::SessionStarted))
            .await
            .unwrap();
        store
            .append(entry("sess-2", EventType::SessionStarted))
            .await
            .unwrap();

        assert_eq!(rx.recv().await.unwrap().session_id, "sess-1");
        assert_eq!(rx.recv().await.unwrap().session_id, "sess-2");
    }

    #[tokio::test]
    async fn append_without_subscribers_succeeds() {
        let store = MemoryLogStore::new();
        let appended = store
            .append(entry("sess-1", EventType::SessionStarted))
            .await
            .unwrap();
        assert!(appended.id.starts_with("log-"));
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn query_filters_limits_and_orders() {
        let store = MemoryLogStore::new();
        store
            .append(entry("sess-1", EventType::StepStarted))
            .await
            .unwrap();
        store
            .append(entry("sess-1", EventType::StepFailed).with_data("error", json!("x")))
            .await
            .unwrap();
        store
            .append(entry("sess-1", EventType::StepStarted))
            .await
            .unwrap();

        let failed = store
            .query(&LogFilter::session("sess-1").with_has_error(true))
            .await
            .unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event_type, EventType::StepFailed);

        let limited = store
            .query(&LogFilter::session("sess-1").with_limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);

        let mut descending = LogFilter::session("sess-1");
        descending.descending = true;
        let newest_first = store.query(&descending).await.unwrap();
        assert_eq!(newest_first[0].event_type, EventType::StepStarted);
        assert_eq!(newest_first[1].event_type, EventType::StepFailed);
    }
}
