use std::fmt;

use serde_json::Value;

use crate::backend::{ChangeKind, Row};
use crate::constants::{columns, MESSAGES_TABLE, NOTIFICATIONS_TABLE};
use crate::models::SourceDomain;

/// Logical scope a subscription is filtered to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Conversation(String),
    /// A domain-wide notification scope for one user
    Domain { domain: SourceDomain, user_id: String },
}

impl Topic {
    pub fn conversation(id: &str) -> Self {
        Topic::Conversation(id.to_string())
    }

    pub fn domain(domain: SourceDomain, user_id: &str) -> Self {
        Topic::Domain {
            domain,
            user_id: user_id.to_string(),
        }
    }

    /// Table whose rows this topic carries
    pub fn table(&self) -> &'static str {
        match self {
            Topic::Conversation(_) => MESSAGES_TABLE,
            Topic::Domain { .. } => NOTIFICATIONS_TABLE,
        }
    }

    /// Whether a row belongs to this topic (used by backends to route)
    pub fn covers(&self, table: &str, row: &Row) -> bool {
        if table != self.table() {
            return false;
        }
        let column_is = |column: &str, expected: &str| {
            matches!(row.get(column), Some(Value::String(s)) if s == expected)
        };
        match self {
            Topic::Conversation(id) => column_is(columns::CONVERSATION_ID, id),
            Topic::Domain { domain, user_id } => {
                column_is(columns::SOURCE_DOMAIN, domain.as_str())
                    && column_is(columns::USER_ID, user_id)
            }
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Conversation(id) => write!(f, "conversation:{}", id),
            Topic::Domain { domain, user_id } => write!(f, "{}:{}", domain, user_id),
        }
    }
}

/// Which change kinds a subscriber wants. Empty means all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    kinds: Vec<ChangeKind>,
}

impl EventFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn only(kinds: &[ChangeKind]) -> Self {
        Self {
            kinds: kinds.to_vec(),
        }
    }

    pub fn accepts(&self, kind: ChangeKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_conversation_topic_covers_only_its_rows() {
        let topic = Topic::conversation("c1");
        let row = json!({"conversation_id": "c1"}).as_object().cloned().unwrap();
        let other = json!({"conversation_id": "c2"}).as_object().cloned().unwrap();

        assert!(topic.covers(MESSAGES_TABLE, &row));
        assert!(!topic.covers(MESSAGES_TABLE, &other));
        assert!(!topic.covers(NOTIFICATIONS_TABLE, &row));
    }

    #[test]
    fn test_domain_topic_is_scoped_to_user() {
        let topic = Topic::domain(SourceDomain::Task, "u1");
        let mine = json!({"source_domain": "task", "user_id": "u1"}).as_object().cloned().unwrap();
        let theirs = json!({"source_domain": "task", "user_id": "u2"}).as_object().cloned().unwrap();
        let invoice = json!({"source_domain": "invoice", "user_id": "u1"}).as_object().cloned().unwrap();

        assert!(topic.covers(NOTIFICATIONS_TABLE, &mine));
        assert!(!topic.covers(NOTIFICATIONS_TABLE, &theirs));
        assert!(!topic.covers(NOTIFICATIONS_TABLE, &invoice));
        assert_eq!(topic.to_string(), "task:u1");
    }

    #[test]
    fn test_event_filter() {
        assert!(EventFilter::all().accepts(ChangeKind::Delete));
        let inserts = EventFilter::only(&[ChangeKind::Insert]);
        assert!(inserts.accepts(ChangeKind::Insert));
        assert!(!inserts.accepts(ChangeKind::Update));
    }
}
