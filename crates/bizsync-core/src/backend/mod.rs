//! Collaborator seams: the hosted persistence/query service, the push
//! backend and durable object storage. Everything above this module talks
//! to them only through these traits.

pub mod http_storage;
pub mod memory;

use std::cmp::Ordering;

use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::constants::columns;
use crate::error::BackendError;
use crate::subscription::Topic;

pub use http_storage::HttpObjectStorage;
pub use memory::MemoryBackend;

/// A row as returned by the persistence service
pub type Row = serde_json::Map<String, Value>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// What the push backend delivers: an identifier, never a consistent payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub event: ChangeKind,
    pub table: String,
    pub row_id: String,
}

impl ChangeEvent {
    pub fn new(event: ChangeKind, table: &str, row_id: &str) -> Self {
        Self {
            event,
            table: table.to_string(),
            row_id: row_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Condition {
    Eq(String, Value),
    In(String, Vec<Value>),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    conditions: Vec<Condition>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn by_id(id: &str) -> Self {
        Self::new().eq(columns::ID, id)
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.conditions.push(Condition::Eq(column.to_string(), value.into()));
        self
    }

    pub fn is_in<V: Into<Value>>(mut self, column: &str, values: impl IntoIterator<Item = V>) -> Self {
        self.conditions.push(Condition::In(
            column.to_string(),
            values.into_iter().map(Into::into).collect(),
        ));
        self
    }

    pub fn matches(&self, row: &Row) -> bool {
        self.conditions.iter().all(|condition| match condition {
            Condition::Eq(column, value) => row.get(column) == Some(value),
            Condition::In(column, values) => row.get(column).is_some_and(|v| values.contains(v)),
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub column: String,
    pub descending: bool,
}

impl Order {
    pub fn asc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: false,
        }
    }

    pub fn desc(column: &str) -> Self {
        Self {
            column: column.to_string(),
            descending: true,
        }
    }

    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        let ord = compare_values(a.get(&self.column), b.get(&self.column));
        if self.descending {
            ord.reverse()
        } else {
            ord
        }
    }
}

/// `select(table, filter, order, limit)` plus an offset for paging
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order: Option<Order>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    pub fn order(mut self, order: Order) -> Self {
        self.order = Some(order);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }
}

/// Timestamps compare chronologically, numbers numerically, everything
/// else by its string form. Missing values sort first.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(Value::String(a)), Some(Value::String(b))) => {
            match (DateTime::parse_from_rfc3339(a), DateTime::parse_from_rfc3339(b)) {
                (Ok(a), Ok(b)) => a.cmp(&b),
                _ => a.cmp(b),
            }
        }
        (Some(Value::Number(a)), Some(Value::Number(b))) => a
            .as_f64()
            .partial_cmp(&b.as_f64())
            .unwrap_or(Ordering::Equal),
        (Some(a), Some(b)) => a.to_string().cmp(&b.to_string()),
    }
}

#[async_trait]
pub trait Persistence: Send + Sync {
    /// Insert a row and return the stable id assigned by the backend
    async fn insert(&self, table: &str, row: Row) -> Result<String, BackendError>;

    async fn select(&self, table: &str, query: &Query) -> Result<Vec<Row>, BackendError>;

    async fn update(&self, table: &str, patch: Row, filter: &Filter) -> Result<(), BackendError>;

    async fn delete(&self, table: &str, filter: &Filter) -> Result<(), BackendError>;

    async fn fetch_by_id(&self, table: &str, id: &str) -> Result<Option<Row>, BackendError> {
        let rows = self
            .select(table, &Query::new(Filter::by_id(id)).limit(1))
            .await?;
        Ok(rows.into_iter().next())
    }
}

#[async_trait]
pub trait Realtime: Send + Sync {
    /// Open a change stream for a topic. A client's own writes are echoed.
    async fn listen(&self, topic: &Topic) -> Result<broadcast::Receiver<ChangeEvent>, BackendError>;
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Store bytes under `key` and return the public URL
    async fn upload(
        &self,
        bucket: &str,
        key: &str,
        bytes: Vec<u8>,
        content_type: &str,
    ) -> Result<String, BackendError>;

    fn public_url(&self, bucket: &str, key: &str) -> String;
}
