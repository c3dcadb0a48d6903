//! The conversation sequence and every transition applied to it.
//! Owned by exactly one ledger task; nothing here suspends.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

use super::reconcile::{apply_confirmed, apply_delete, apply_edit, MatchPolicy, ReconcileOutcome};
use crate::backend::{ChangeKind, Row};
use crate::config::SyncConfig;
use crate::error::{BackendError, SyncError, SyncResult};
use crate::models::{FailureReason, Message, MessageBody, MessageId, MessageKind, MessageState};
use crate::subscription::ResolvedEvent;

/// What the ledger task must do to re-drive a failed message
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum RetryPlan {
    /// Never reached the backend: insert again
    Insert { temp_id: MessageId, row: Row },
    /// Inserted but unconfirmed: fetch the row instead of inserting twice
    Resolve { temp_id: MessageId, server_id: String },
    /// Already confirmed or in flight
    Nothing,
}

pub(crate) struct LedgerState {
    conversation_id: String,
    user_id: String,
    policy: MatchPolicy,
    confirm_timeout: Duration,
    messages: Vec<Message>,
    /// Temp id -> when its insert succeeded
    awaiting_echo: HashMap<MessageId, DateTime<Utc>>,
}

impl LedgerState {
    pub fn new(conversation_id: &str, user_id: &str, config: &SyncConfig) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            user_id: user_id.to_string(),
            policy: MatchPolicy {
                echo_window: config.echo_window(),
            },
            confirm_timeout: config.confirm_timeout(),
            messages: Vec::new(),
            awaiting_echo: HashMap::new(),
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// Append a Pending entry at the tail. The client clock is clamped to the
    /// last entry so the tail stays in timestamp order under clock skew.
    pub fn append_pending(&mut self, body: MessageBody, kind: MessageKind, now: DateTime<Utc>) -> Message {
        let created_at = self
            .messages
            .last()
            .map_or(now, |last| last.created_at.max(now));
        let message = Message::pending(&self.conversation_id, &self.user_id, body, kind, created_at);
        self.messages.push(message.clone());
        message
    }

    fn index_of(&self, id: &MessageId) -> Option<usize> {
        self.messages.iter().position(|m| &m.id == id)
    }

    /// The insert for `temp_id` returned `server_id`
    pub fn persisted(&mut self, temp_id: &MessageId, server_id: String, now: DateTime<Utc>) -> bool {
        let Some(index) = self.index_of(temp_id) else {
            // Echo already promoted it
            return false;
        };

        if self
            .messages
            .iter()
            .any(|m| matches!(&m.id, MessageId::Server(id) if *id == server_id))
        {
            // The echo went unmatched and landed as its own entry
            debug!(conversation = %self.conversation_id, %server_id, "Collapsing pending entry into its echo");
            self.messages.remove(index);
            self.awaiting_echo.remove(temp_id);
            return true;
        }

        let entry = &mut self.messages[index];
        entry.server_id = Some(server_id);
        entry.state = MessageState::Pending;
        self.awaiting_echo.insert(temp_id.clone(), now);
        true
    }

    pub fn persist_failed(&mut self, temp_id: &MessageId, err: &BackendError) -> bool {
        let Some(index) = self.index_of(temp_id) else {
            return false;
        };
        let reason = if err.is_retryable() {
            FailureReason::Network(err.to_string())
        } else {
            FailureReason::Validation(err.to_string())
        };
        warn!(conversation = %self.conversation_id, id = %temp_id, error = %err, "Message send failed");
        self.messages[index].state = MessageState::Failed(reason);
        self.awaiting_echo.remove(temp_id);
        true
    }

    /// Apply a resolved push event. Rows for other conversations are ignored.
    pub fn apply_event(&mut self, event: &ResolvedEvent) -> bool {
        let outcome = match (event.kind, &event.row) {
            (ChangeKind::Delete, _) => apply_delete(&mut self.messages, &event.row_id),
            (kind, Some(row)) => {
                let Some(message) = Message::from_row(row, &self.user_id) else {
                    warn!(row_id = %event.row_id, "Ignoring malformed message row");
                    return false;
                };
                if message.conversation_id != self.conversation_id {
                    debug!(
                        conversation = %self.conversation_id,
                        other = %message.conversation_id,
                        "Ignoring row for another conversation"
                    );
                    return false;
                }
                if kind == ChangeKind::Update {
                    apply_edit(&mut self.messages, message, &self.policy)
                } else {
                    apply_confirmed(&mut self.messages, message, &self.policy)
                }
            }
            (_, None) => return false,
        };
        self.settle(outcome)
    }

    fn settle(&mut self, outcome: ReconcileOutcome) -> bool {
        match outcome {
            ReconcileOutcome::Promoted { temp_id, .. } => {
                self.awaiting_echo.remove(&temp_id);
                true
            }
            ReconcileOutcome::Deleted { index } => {
                let id = self.messages[index].id.clone();
                self.awaiting_echo.remove(&id);
                true
            }
            ReconcileOutcome::Inserted { .. } | ReconcileOutcome::Edited { .. } => true,
            ReconcileOutcome::Unchanged => false,
        }
    }

    /// Fail persisted entries whose echo is overdue. Returns their ids.
    pub fn expire_unconfirmed(&mut self, now: DateTime<Utc>) -> Vec<MessageId> {
        let overdue: Vec<MessageId> = self
            .awaiting_echo
            .iter()
            .filter(|(_, since)| now - **since >= self.confirm_timeout)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &overdue {
            self.awaiting_echo.remove(id);
            if let Some(index) = self.index_of(id) {
                if self.messages[index].state == MessageState::Pending {
                    warn!(conversation = %self.conversation_id, %id, "No echo for persisted message");
                    self.messages[index].state = MessageState::Failed(FailureReason::Conflict);
                }
            }
        }
        overdue
    }

    pub fn begin_retry(&mut self, id: &MessageId) -> SyncResult<RetryPlan> {
        let Some(index) = self
            .messages
            .iter()
            .position(|m| &m.id == id || m.stable_id() == Some(id.as_str()))
        else {
            return Err(SyncError::Validation(format!("unknown message {}", id)));
        };

        let entry = &mut self.messages[index];
        match &entry.state {
            MessageState::Failed(_) => {}
            MessageState::Deleted => {
                return Err(SyncError::Validation(format!("message {} was deleted", id)));
            }
            _ => return Ok(RetryPlan::Nothing),
        }

        entry.state = MessageState::Pending;
        let temp_id = entry.id.clone();
        Ok(match entry.server_id.clone() {
            Some(server_id) => RetryPlan::Resolve { temp_id, server_id },
            None => RetryPlan::Insert {
                temp_id,
                row: entry.to_insert_row(),
            },
        })
    }

    /// Outcome of re-fetching a persisted but unconfirmed row. Returns the
    /// insert row if the row vanished and the message must be sent again.
    pub fn resolved(
        &mut self,
        temp_id: &MessageId,
        result: Result<Option<Row>, BackendError>,
    ) -> Option<Row> {
        let index = self.index_of(temp_id)?;
        match result {
            Ok(Some(row)) => {
                if let Some(message) = Message::from_row(&row, &self.user_id) {
                    let outcome = apply_confirmed(&mut self.messages, message, &self.policy);
                    self.settle(outcome);
                }
                None
            }
            Ok(None) => {
                let entry = &mut self.messages[index];
                entry.server_id = None;
                Some(entry.to_insert_row())
            }
            Err(err) => {
                self.persist_failed(temp_id, &err);
                None
            }
        }
    }

    /// Merge backfilled rows. Returns how many entries were added.
    pub fn merge_history(&mut self, rows: &[Row]) -> usize {
        let mut added = 0;
        for row in rows {
            let Some(message) = Message::from_row(row, &self.user_id) else {
                continue;
            };
            if message.conversation_id != self.conversation_id {
                continue;
            }
            let outcome = apply_confirmed(&mut self.messages, message, &self.policy);
            if matches!(outcome, ReconcileOutcome::Inserted { .. }) {
                added += 1;
            }
            self.settle(outcome);
        }
        added
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::reconcile::is_ordered;
    use crate::subscription::Topic;
    use serde_json::json;

    fn state() -> LedgerState {
        LedgerState::new("c1", "me", &SyncConfig::default())
    }

    fn row(id: &str, conversation: &str, author: &str, body: &str, created_at: &str) -> Row {
        json!({
            "id": id,
            "conversation_id": conversation,
            "author_id": author,
            "body": body,
            "kind": "text",
            "created_at": created_at,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    fn event(kind: ChangeKind, row_id: &str, row: Option<Row>) -> ResolvedEvent {
        ResolvedEvent {
            topic: Topic::conversation("c1"),
            kind,
            table: "messages".into(),
            row_id: row_id.into(),
            row,
        }
    }

    fn text(body: &str) -> MessageBody {
        MessageBody::Text(body.into())
    }

    #[test]
    fn test_pending_is_clamped_to_the_tail() {
        let mut s = state();
        s.apply_event(&event(
            ChangeKind::Insert,
            "m1",
            Some(row("m1", "c1", "bob", "from the future", "2099-01-01T00:00:00Z")),
        ));
        let pending = s.append_pending(text("hi"), MessageKind::Text, Utc::now());

        assert_eq!(s.messages().last().map(|m| &m.id), Some(&pending.id));
        assert!(is_ordered(s.messages()));
    }

    #[test]
    fn test_persist_then_echo_promotes_once() {
        let mut s = state();
        let pending = s.append_pending(text("hello"), MessageKind::Text, Utc::now());
        assert!(s.persisted(&pending.id, "m1".into(), Utc::now()));

        let echo = row("m1", "c1", "me", "hello", "2024-01-01T00:00:00Z");
        assert!(s.apply_event(&event(ChangeKind::Insert, "m1", Some(echo.clone()))));
        assert!(!s.apply_event(&event(ChangeKind::Insert, "m1", Some(echo))));

        assert_eq!(s.messages().len(), 1);
        assert_eq!(s.messages()[0].id, MessageId::Server("m1".into()));
        assert!(s.expire_unconfirmed(Utc::now() + Duration::hours(1)).is_empty());
    }

    #[test]
    fn test_unmatched_echo_collapses_on_persist() {
        let mut s = state();
        let earlier = Utc::now() - Duration::hours(2);
        let pending = s.append_pending(text("hello"), MessageKind::Text, earlier);
        // Outside the echo window and without a client key: lands separately
        s.apply_event(&event(
            ChangeKind::Insert,
            "m1",
            Some(row("m1", "c1", "me", "hello", "2024-06-01T00:00:00Z")),
        ));
        assert_eq!(s.messages().len(), 2);

        s.persisted(&pending.id, "m1".into(), Utc::now());
        assert_eq!(s.messages().len(), 1);
        assert_eq!(s.messages()[0].id, MessageId::Server("m1".into()));
    }

    #[test]
    fn test_overdue_echo_becomes_conflict_and_retry_resolves() {
        let mut s = state();
        let now = Utc::now();
        let pending = s.append_pending(text("hello"), MessageKind::Text, now);
        s.persisted(&pending.id, "m1".into(), now);

        assert!(s.expire_unconfirmed(now + Duration::seconds(5)).is_empty());
        assert_eq!(s.expire_unconfirmed(now + Duration::seconds(60)), vec![pending.id.clone()]);
        assert_eq!(s.messages()[0].state, MessageState::Failed(FailureReason::Conflict));

        let plan = s.begin_retry(&pending.id).unwrap();
        assert_eq!(
            plan,
            RetryPlan::Resolve { temp_id: pending.id.clone(), server_id: "m1".into() }
        );
        let reinsert = s.resolved(&pending.id, Ok(Some(row("m1", "c1", "me", "hello", "2024-01-01T00:00:00Z"))));
        assert!(reinsert.is_none());
        assert_eq!(s.messages()[0].state, MessageState::Confirmed);
    }

    #[test]
    fn test_network_failure_then_retry_inserts_again() {
        let mut s = state();
        let pending = s.append_pending(text("offline"), MessageKind::Text, Utc::now());
        s.persist_failed(&pending.id, &BackendError::Network("down".into()));
        assert!(s.messages()[0].state.is_failed());

        match s.begin_retry(&pending.id).unwrap() {
            RetryPlan::Insert { temp_id, row } => {
                assert_eq!(temp_id, pending.id);
                assert_eq!(row["body"], json!("offline"));
            }
            other => panic!("unexpected plan {:?}", other),
        }
        assert_eq!(s.messages()[0].state, MessageState::Pending);
        assert_eq!(s.begin_retry(&pending.id).unwrap(), RetryPlan::Nothing);
        assert!(s.begin_retry(&MessageId::Temp("tmp-nope".into())).is_err());
    }

    #[test]
    fn test_foreign_rows_are_ignored() {
        let mut s = state();
        let changed = s.apply_event(&event(
            ChangeKind::Insert,
            "x1",
            Some(row("x1", "c2", "bob", "wrong room", "2024-01-01T00:00:00Z")),
        ));
        assert!(!changed);
        assert!(s.messages().is_empty());
    }

    #[test]
    fn test_history_merge_counts_new_rows_only() {
        let mut s = state();
        let rows = vec![
            row("m1", "c1", "bob", "a", "2024-01-01T00:00:00Z"),
            row("m2", "c1", "bob", "b", "2024-01-01T00:00:01Z"),
        ];
        assert_eq!(s.merge_history(&rows), 2);
        assert_eq!(s.merge_history(&rows), 0);
        assert_eq!(s.messages().len(), 2);
    }

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Arrival {
        Peer(usize),
        Send,
        Persisted,
        Echo,
    }

    fn orderings(rest: Vec<Arrival>, prefix: &mut Vec<Arrival>, out: &mut Vec<Vec<Arrival>>) {
        if rest.is_empty() {
            out.push(prefix.clone());
            return;
        }
        for i in 0..rest.len() {
            let mut remaining = rest.clone();
            let next = remaining.remove(i);
            let sent = prefix.contains(&Arrival::Send);
            if matches!(next, Arrival::Persisted | Arrival::Echo) && !sent {
                continue;
            }
            prefix.push(next);
            orderings(remaining, prefix, out);
            prefix.pop();
        }
    }

    #[test]
    fn test_every_arrival_order_converges_to_one_ordered_sequence() {
        let peers = [
            row("p0", "c1", "bob", "early", "2024-01-01T00:00:05Z"),
            row("p1", "c1", "bob", "close", "2024-01-01T00:00:11Z"),
            row("p2", "c1", "bob", "late", "2024-01-01T00:00:20Z"),
        ];
        let sent_at: DateTime<Utc> = "2024-01-01T00:00:10Z".parse().unwrap();

        let mut all = Vec::new();
        let arrivals = vec![
            Arrival::Peer(0),
            Arrival::Peer(1),
            Arrival::Peer(2),
            Arrival::Send,
            Arrival::Persisted,
            Arrival::Echo,
        ];
        orderings(arrivals, &mut Vec::new(), &mut all);
        assert_eq!(all.len(), 240);

        for order in all {
            let mut s = state();
            let mut pending: Option<Message> = None;
            for arrival in &order {
                match *arrival {
                    Arrival::Peer(i) => {
                        let id = peers[i]["id"].as_str().unwrap();
                        s.apply_event(&event(ChangeKind::Insert, id, Some(peers[i].clone())));
                    }
                    Arrival::Send => {
                        pending = Some(s.append_pending(text("mine"), MessageKind::Text, sent_at));
                    }
                    Arrival::Persisted => {
                        let temp_id = &pending.as_ref().unwrap().id;
                        s.persisted(temp_id, "own".into(), sent_at);
                    }
                    Arrival::Echo => {
                        let mut echo = row("own", "c1", "me", "mine", "2024-01-01T00:00:12Z");
                        let key = pending.as_ref().unwrap().client_key.clone().unwrap();
                        echo.insert("client_key".into(), json!(key));
                        s.apply_event(&event(ChangeKind::Insert, "own", Some(echo)));
                    }
                }
                assert!(is_ordered(s.messages()), "unordered after {:?}", order);
                let ids: std::collections::HashSet<_> = s.messages().iter().map(|m| &m.id).collect();
                assert_eq!(ids.len(), s.messages().len(), "duplicate id after {:?}", order);
            }

            let messages = s.messages();
            assert_eq!(messages.len(), 4, "{:?}", order);
            assert!(messages.iter().all(|m| !m.id.is_temp()), "{:?}", order);
            let own: Vec<_> = messages.iter().filter(|m| m.author_id == "me").collect();
            assert_eq!(own.len(), 1, "{:?}", order);
            assert_eq!(own[0].id, MessageId::Server("own".into()));
            assert!(own[0].state.is_confirmed(), "{:?}", order);
        }
    }
}
