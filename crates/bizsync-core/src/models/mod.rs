pub mod attachment;
pub mod message;
pub mod notification;

pub use attachment::{infer_content_type, Attachment, AttachmentKind, LocalSource, UploadState};
pub use message::{FailureReason, Message, MessageBody, MessageId, MessageKind, MessageState};
pub use notification::{NotificationEvent, SourceDomain};

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::backend::Row;

pub(crate) fn row_str(row: &Row, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Timestamps travel as RFC 3339 strings; epoch millis are accepted too.
pub(crate) fn row_timestamp(row: &Row, column: &str) -> Option<DateTime<Utc>> {
    match row.get(column)? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n.as_i64().and_then(DateTime::from_timestamp_millis),
        _ => None,
    }
}
