use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{row_str, row_timestamp, AttachmentKind};
use crate::backend::Row;
use crate::constants::{columns, TEMP_ID_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    Audio,
    Image,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Audio => "audio",
            MessageKind::Image => "image",
            MessageKind::File => "file",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(MessageKind::Text),
            "audio" => Some(MessageKind::Audio),
            "image" => Some(MessageKind::Image),
            "file" => Some(MessageKind::File),
            _ => None,
        }
    }
}

impl From<AttachmentKind> for MessageKind {
    fn from(kind: AttachmentKind) -> Self {
        match kind {
            AttachmentKind::Audio => MessageKind::Audio,
            AttachmentKind::Image => MessageKind::Image,
            AttachmentKind::File => MessageKind::File,
        }
    }
}

/// Either a stable server id or a client-side temporary id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum MessageId {
    Temp(String),
    Server(String),
}

impl MessageId {
    pub fn new_temp() -> Self {
        MessageId::Temp(format!("{}{}", TEMP_ID_PREFIX, Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            MessageId::Temp(id) | MessageId::Server(id) => id,
        }
    }

    pub fn is_temp(&self) -> bool {
        matches!(self, MessageId::Temp(_))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    /// Reference to an uploaded attachment
    Attachment { url: String },
}

impl MessageBody {
    pub fn text(&self) -> Option<&str> {
        match self {
            MessageBody::Text(text) => Some(text),
            MessageBody::Attachment { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    Network(String),
    Validation(String),
    /// Persisted, but the echo never arrived
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageState {
    Pending,
    Confirmed,
    /// Confirmed, then changed remotely
    Edited,
    Failed(FailureReason),
    /// Removed remotely; kept as a tombstone, never shown
    Deleted,
}

impl MessageState {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, MessageState::Confirmed | MessageState::Edited)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, MessageState::Failed(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: String,
    pub author_id: String,
    pub body: MessageBody,
    pub kind: MessageKind,
    /// Ordering key. Pending entries use the client send time and keep it
    /// after confirmation so reconciliation never reorders.
    pub created_at: DateTime<Utc>,
    /// Server timestamp, once known
    pub confirmed_at: Option<DateTime<Utc>>,
    pub state: MessageState,
    pub is_own: bool,
    /// Idempotency key round-tripped by the backend
    pub client_key: Option<String>,
    /// Stable id returned by the insert response while still pending
    pub server_id: Option<String>,
}

impl Message {
    /// A local, not yet persisted message authored by the current user
    pub fn pending(
        conversation_id: &str,
        author_id: &str,
        body: MessageBody,
        kind: MessageKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MessageId::new_temp(),
            conversation_id: conversation_id.to_string(),
            author_id: author_id.to_string(),
            body,
            kind,
            created_at: now,
            confirmed_at: None,
            state: MessageState::Pending,
            is_own: true,
            client_key: Some(Uuid::new_v4().to_string()),
            server_id: None,
        }
    }

    /// Build a confirmed message from a persisted row.
    /// Returns None if required columns are missing.
    pub fn from_row(row: &Row, current_user: &str) -> Option<Self> {
        let id = row_str(row, columns::ID)?;
        let conversation_id = row_str(row, columns::CONVERSATION_ID)?;
        let author_id = row_str(row, columns::AUTHOR_ID)?;
        let created_at = row_timestamp(row, columns::CREATED_AT)?;
        let kind = row_str(row, columns::KIND)
            .and_then(|k| MessageKind::parse(&k))
            .unwrap_or(MessageKind::Text);

        let body = match (kind, row_str(row, columns::ATTACHMENT_URL)) {
            (MessageKind::Text, _) | (_, None) => {
                MessageBody::Text(row_str(row, columns::BODY).unwrap_or_default())
            }
            (_, Some(url)) => MessageBody::Attachment { url },
        };

        Some(Self {
            id: MessageId::Server(id),
            conversation_id,
            is_own: author_id == current_user,
            author_id,
            body,
            kind,
            created_at,
            confirmed_at: Some(created_at),
            state: MessageState::Confirmed,
            client_key: row_str(row, columns::CLIENT_KEY),
            server_id: None,
        })
    }

    /// Row for the insert request. The backend assigns id and created_at.
    pub fn to_insert_row(&self) -> Row {
        let mut row = Row::new();
        row.insert(
            columns::CONVERSATION_ID.into(),
            Value::String(self.conversation_id.clone()),
        );
        row.insert(columns::AUTHOR_ID.into(), Value::String(self.author_id.clone()));
        row.insert(columns::KIND.into(), Value::String(self.kind.as_str().into()));
        match &self.body {
            MessageBody::Text(text) => {
                row.insert(columns::BODY.into(), Value::String(text.clone()));
            }
            MessageBody::Attachment { url } => {
                row.insert(columns::ATTACHMENT_URL.into(), Value::String(url.clone()));
            }
        }
        if let Some(key) = &self.client_key {
            row.insert(columns::CLIENT_KEY.into(), Value::String(key.clone()));
        }
        row
    }

    /// Stable id, if the backend has assigned one
    pub fn stable_id(&self) -> Option<&str> {
        match &self.id {
            MessageId::Server(id) => Some(id),
            MessageId::Temp(_) => self.server_id.as_deref(),
        }
    }

    pub fn is_visible(&self) -> bool {
        self.state != MessageState::Deleted
    }
}
