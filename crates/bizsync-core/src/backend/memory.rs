//! In-process backend implementing persistence, push and object storage.
//! Every write is echoed to the topics covering the row, including the
//! writer's own, the way the hosted push backend behaves.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{SecondsFormat, Utc};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

use super::{ChangeEvent, ChangeKind, Filter, ObjectStorage, Persistence, Query, Realtime, Row};
use crate::constants::columns;
use crate::error::BackendError;
use crate::subscription::Topic;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub bytes: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
struct MemoryState {
    tables: HashMap<String, Vec<Row>>,
    channels: HashMap<Topic, broadcast::Sender<ChangeEvent>>,
    objects: HashMap<(String, String), StoredObject>,
    next_id: u64,
    offline: bool,
    echo: bool,
    failing_selects: u32,
    failing_updates: bool,
    insert_calls: u64,
}

impl MemoryState {
    fn broadcast(&self, kind: ChangeKind, table: &str, row: &Row) {
        if !self.echo {
            return;
        }
        let Some(Value::String(id)) = row.get(columns::ID) else {
            return;
        };
        for (topic, tx) in &self.channels {
            if topic.covers(table, row) {
                let _ = tx.send(ChangeEvent::new(kind, table, id));
            }
        }
    }

    fn check_online(&self) -> Result<(), BackendError> {
        if self.offline {
            Err(BackendError::Network("backend unreachable".to_string()))
        } else {
            Ok(())
        }
    }
}

pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                echo: true,
                ..Default::default()
            }),
        }
    }

    /// Simulate losing (or regaining) connectivity for writes, reads and uploads
    pub fn set_offline(&self, offline: bool) {
        self.state.lock().offline = offline;
    }

    /// Stop echoing writes to push subscribers
    pub fn set_echo(&self, echo: bool) {
        self.state.lock().echo = echo;
    }

    /// Make the next `n` selects fail with a network error
    pub fn fail_next_selects(&self, n: u32) {
        self.state.lock().failing_selects = n;
    }

    pub fn set_failing_updates(&self, failing: bool) {
        self.state.lock().failing_updates = failing;
    }

    /// Deliver an arbitrary change event to a topic's listeners
    pub fn push_raw(&self, topic: &Topic, event: ChangeEvent) {
        if let Some(tx) = self.state.lock().channels.get(topic) {
            let _ = tx.send(event);
        }
    }

    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.state
            .lock()
            .tables
            .get(table)
            .cloned()
            .unwrap_or_default()
    }

    pub fn insert_calls(&self) -> u64 {
        self.state.lock().insert_calls
    }

    pub fn object(&self, bucket: &str, key: &str) -> Option<StoredObject> {
        self.state
            .lock()
            .objects
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
    }

    pub fn object_count(&self) -> usize {
        self.state.lock().objects.len()
    }
}

#[async_trait]
impl Persistence for MemoryBackend {
    async fn insert(&self, table: &str, mut row: Row) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.insert_calls += 1;
        state.check_online()?;

        state.next_id += 1;
        let id = match row.get(columns::ID) {
            Some(Value::String(id)) => id.clone(),
            _ => format!("{}-{}", table, state.next_id),
        };
        row.insert(columns::ID.into(), Value::String(id.clone()));
        row.entry(columns::CREATED_AT.to_string()).or_insert_with(|| {
            Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
        });

        state
            .tables
            .entry(table.to_string())
            .or_default()
            .push(row.clone());
        state.broadcast(ChangeKind::Insert, table, &row);
        debug!(table, id = %id, "Inserted row");
        Ok(id)
    }

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, BackendError> {
        let mut state = self.state.lock();
        state.check_online()?;
        if state.failing_selects > 0 {
            state.failing_selects -= 1;
            return Err(BackendError::Network("select timed out".to_string()));
        }

        let mut rows: Vec<Row> = state
            .tables
            .get(table)
            .map(|rows| rows.iter().filter(|r| query.filter.matches(r)).cloned().collect())
            .unwrap_or_default();
        if let Some(order) = &query.order {
            rows.sort_by(|a, b| order.compare(a, b));
        }
        let limit = query.limit.unwrap_or(usize::MAX);
        Ok(rows.into_iter().skip(query.offset).take(limit).collect())
    }

    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_online()?;
        if state.failing_updates {
            return Err(BackendError::Rejected("update refused".to_string()));
        }

        let mut touched = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                for (column, value) in &patch {
                    row.insert(column.clone(), value.clone());
                }
                touched.push(row.clone());
            }
        }
        for row in &touched {
            state.broadcast(ChangeKind::Update, table, row);
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &Filter) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.check_online()?;

        let mut removed = Vec::new();
        if let Some(rows) = state.tables.get_mut(table) {
            rows.retain(|r| {
                if filter.matches(r) {
                    removed.push(r.clone());
                    false
                } else {
                    true
                }
            });
        }
        for row in &removed {
            state.broadcast(ChangeKind::Delete, table, row);
        }
        Ok(())
    }
}

#[async_trait]
impl Realtime for MemoryBackend {
    async fn listen(&self, topic: &Topic) -> Result<broadcast::Receiver<ChangeEvent>, BackendError> {
        let mut state = self.state.lock();
        state.check_online()?;
        let tx = state
            .channels
            .entry(topic.clone())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        Ok(tx.subscribe())
    }
}

#[async_trait]
impl ObjectStorage for MemoryBackend {
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError> {
        let mut state = self.state.lock();
        state.check_online()?;
        state.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                bytes,
                content_type: content_type.to_string(),
            },
        );
        Ok(self.public_url(bucket, key))
    }

    fn public_url(&self, bucket: &str, key: &str) -> String {
        format!("memory://{}/{}", bucket, key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::Order;
    use crate::constants::MESSAGES_TABLE;
    use serde_json::json;

    fn message_row(conversation: &str, body: &str) -> Row {
        json!({"conversation_id": conversation, "author_id": "a", "body": body})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_echoes_to_topic() {
        let backend = MemoryBackend::new();
        let mut rx = backend.listen(&Topic::conversation("c1")).await.unwrap();
        let mut other = backend.listen(&Topic::conversation("c2")).await.unwrap();

        let id = backend.insert(MESSAGES_TABLE, message_row("c1", "hi")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, ChangeEvent::new(ChangeKind::Insert, MESSAGES_TABLE, &id));
        assert!(other.try_recv().is_err());

        let row = backend.fetch_by_id(MESSAGES_TABLE, &id).await.unwrap().unwrap();
        assert!(row.contains_key("created_at"));
    }

    #[tokio::test]
    async fn test_offline_rejects_writes_with_network_error() {
        let backend = MemoryBackend::new();
        backend.set_offline(true);
        let err = backend.insert(MESSAGES_TABLE, message_row("c1", "x")).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(backend.insert_calls(), 1);
        assert!(backend.rows(MESSAGES_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_select_orders_pages_and_fails_on_demand() {
        let backend = MemoryBackend::new();
        for i in 0..5 {
            let mut row = message_row("c1", &format!("m{}", i));
            row.insert("created_at".into(), json!(format!("2024-01-01T00:00:0{}Z", i)));
            backend.insert(MESSAGES_TABLE, row).await.unwrap();
        }

        let query = Query::new(Filter::new().eq("conversation_id", "c1"))
            .order(Order::desc("created_at"))
            .limit(2)
            .offset(1);
        let rows = backend.select(MESSAGES_TABLE, &query).await.unwrap();
        let bodies: Vec<_> = rows.iter().map(|r| r["body"].clone()).collect();
        assert_eq!(bodies, vec![json!("m3"), json!("m2")]);

        backend.fail_next_selects(1);
        assert!(backend.select(MESSAGES_TABLE, &query).await.is_err());
        assert!(backend.select(MESSAGES_TABLE, &query).await.is_ok());
    }

    #[tokio::test]
    async fn test_update_and_delete_broadcast() {
        let backend = MemoryBackend::new();
        let id = backend.insert(MESSAGES_TABLE, message_row("c1", "v1")).await.unwrap();
        let mut rx = backend.listen(&Topic::conversation("c1")).await.unwrap();

        let mut patch = Row::new();
        patch.insert("body".into(), json!("v2"));
        backend.update(MESSAGES_TABLE, patch, &Filter::by_id(&id)).await.unwrap();
        backend.delete(MESSAGES_TABLE, &Filter::by_id(&id)).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().event, ChangeKind::Update);
        assert_eq!(rx.recv().await.unwrap().event, ChangeKind::Delete);
        assert!(backend.rows(MESSAGES_TABLE).is_empty());
    }

    #[tokio::test]
    async fn test_upload_stores_object() {
        let backend = MemoryBackend::new();
        let url = backend.upload("attachments", "image/1.png", vec![1, 2], "image/png").await.unwrap();
        assert_eq!(url, "memory://attachments/image/1.png");
        assert_eq!(backend.object("attachments", "image/1.png").unwrap().content_type, "image/png");
    }
}
