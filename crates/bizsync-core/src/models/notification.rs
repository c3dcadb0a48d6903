use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{row_str, row_timestamp};
use crate::backend::Row;
use crate::constants::columns;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceDomain {
    Task,
    Message,
    Employee,
    Client,
    System,
    Partner,
    Department,
    Position,
    Invoice,
    Financial,
}

impl SourceDomain {
    pub const ALL: [SourceDomain; 10] = [
        SourceDomain::Task,
        SourceDomain::Message,
        SourceDomain::Employee,
        SourceDomain::Client,
        SourceDomain::System,
        SourceDomain::Partner,
        SourceDomain::Department,
        SourceDomain::Position,
        SourceDomain::Invoice,
        SourceDomain::Financial,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SourceDomain::Task => "task",
            SourceDomain::Message => "message",
            SourceDomain::Employee => "employee",
            SourceDomain::Client => "client",
            SourceDomain::System => "system",
            SourceDomain::Partner => "partner",
            SourceDomain::Department => "department",
            SourceDomain::Position => "position",
            SourceDomain::Invoice => "invoice",
            SourceDomain::Financial => "financial",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|d| d.as_str() == s)
    }
}

impl fmt::Display for SourceDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NotificationEvent {
    pub id: String,
    pub source_domain: SourceDomain,
    pub user_id: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
    pub read: bool,
}

impl NotificationEvent {
    pub fn from_row(row: &Row) -> Option<Self> {
        Some(Self {
            id: row_str(row, columns::ID)?,
            source_domain: row_str(row, columns::SOURCE_DOMAIN)
                .and_then(|d| SourceDomain::parse(&d))?,
            user_id: row_str(row, columns::USER_ID)?,
            payload: row.get(columns::PAYLOAD).cloned().unwrap_or(Value::Null),
            created_at: row_timestamp(row, columns::CREATED_AT)?,
            read: row
                .get(columns::READ)
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Short human-readable title from the payload, if any
    pub fn title(&self) -> String {
        self.payload
            .get("title")
            .and_then(Value::as_str)
            .map(|s| s.chars().take(50).collect())
            .unwrap_or_else(|| format!("{} update", self.source_domain))
    }
}
