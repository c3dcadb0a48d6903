//! Pure sequence transitions applied when the backend reports a row.
//!
//! Echo matching precedence: the stable id returned by the insert response,
//! then the client idempotency key, then author + body + time proximity.

use chrono::Duration;

use crate::models::{Message, MessageId, MessageState};

#[derive(Debug, Clone, Copy)]
pub struct MatchPolicy {
    /// Max distance between a pending send and its heuristic echo
    pub echo_window: Duration,
}

impl Default for MatchPolicy {
    fn default() -> Self {
        Self {
            echo_window: Duration::seconds(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A local entry was replaced in place by its confirmed copy
    Promoted { temp_id: MessageId, index: usize },
    /// A message we had not seen was inserted
    Inserted { index: usize },
    /// Edited in place
    Edited { index: usize },
    /// Tombstoned in place
    Deleted { index: usize },
    /// Nothing changed
    Unchanged,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub sequence: Vec<Message>,
    pub outcome: ReconcileOutcome,
}

/// Merge a confirmed message into a sequence, returning the new sequence.
pub fn reconcile(sequence: &[Message], confirmed: Message, policy: &MatchPolicy) -> Reconciled {
    let mut next = sequence.to_vec();
    let outcome = apply_confirmed(&mut next, confirmed, policy);
    Reconciled {
        sequence: next,
        outcome,
    }
}

/// In-place form of [`reconcile`].
pub fn apply_confirmed(
    sequence: &mut Vec<Message>,
    confirmed: Message,
    policy: &MatchPolicy,
) -> ReconcileOutcome {
    let Some(stable_id) = confirmed.stable_id().map(str::to_string) else {
        return ReconcileOutcome::Unchanged;
    };

    if let Some(index) = sequence
        .iter()
        .position(|m| m.stable_id() == Some(stable_id.as_str()))
    {
        if sequence[index].id.is_temp() {
            return promote(sequence, index, confirmed);
        }
        // Already confirmed: echoes are idempotent
        return ReconcileOutcome::Unchanged;
    }

    if let Some(index) = find_by_client_key(sequence, &confirmed) {
        return promote(sequence, index, confirmed);
    }

    if confirmed.is_own {
        if let Some(index) = find_by_proximity(sequence, &confirmed, policy) {
            return promote(sequence, index, confirmed);
        }
    }

    let index = sequence.partition_point(|m| m.created_at <= confirmed.created_at);
    sequence.insert(index, confirmed);
    ReconcileOutcome::Inserted { index }
}

/// Apply a remote edit. Unknown rows are merged as new confirmed messages.
pub fn apply_edit(
    sequence: &mut Vec<Message>,
    updated: Message,
    policy: &MatchPolicy,
) -> ReconcileOutcome {
    let Some(stable_id) = updated.stable_id().map(str::to_string) else {
        return ReconcileOutcome::Unchanged;
    };
    let Some(index) = sequence
        .iter()
        .position(|m| m.stable_id() == Some(stable_id.as_str()))
    else {
        return apply_confirmed(sequence, updated, policy);
    };

    let entry = &mut sequence[index];
    if entry.state == MessageState::Deleted {
        return ReconcileOutcome::Unchanged;
    }
    if entry.body == updated.body && entry.kind == updated.kind && entry.state.is_confirmed() {
        return ReconcileOutcome::Unchanged;
    }
    entry.id = MessageId::Server(stable_id);
    entry.server_id = None;
    entry.body = updated.body;
    entry.kind = updated.kind;
    entry.state = MessageState::Edited;
    ReconcileOutcome::Edited { index }
}

/// Tombstone a remotely deleted row
pub fn apply_delete(sequence: &mut [Message], row_id: &str) -> ReconcileOutcome {
    match sequence
        .iter_mut()
        .enumerate()
        .find(|(_, m)| m.stable_id() == Some(row_id))
    {
        Some((index, entry)) if entry.state != MessageState::Deleted => {
            entry.state = MessageState::Deleted;
            ReconcileOutcome::Deleted { index }
        }
        _ => ReconcileOutcome::Unchanged,
    }
}

fn promote(sequence: &mut [Message], index: usize, confirmed: Message) -> ReconcileOutcome {
    let local = &sequence[index];
    let temp_id = local.id.clone();
    let promoted = Message {
        // Keep the local ordering key so the entry never moves
        created_at: local.created_at,
        confirmed_at: confirmed.confirmed_at.or(Some(confirmed.created_at)),
        client_key: confirmed.client_key.clone().or_else(|| local.client_key.clone()),
        is_own: true,
        state: MessageState::Confirmed,
        server_id: None,
        ..confirmed
    };
    sequence[index] = promoted;
    ReconcileOutcome::Promoted { temp_id, index }
}

fn find_by_client_key(sequence: &[Message], confirmed: &Message) -> Option<usize> {
    let key = confirmed.client_key.as_deref()?;
    sequence
        .iter()
        .position(|m| m.id.is_temp() && m.client_key.as_deref() == Some(key))
}

fn find_by_proximity(
    sequence: &[Message],
    confirmed: &Message,
    policy: &MatchPolicy,
) -> Option<usize> {
    let server_time = confirmed.confirmed_at.unwrap_or(confirmed.created_at);
    sequence.iter().position(|m| {
        m.id.is_temp()
            && m.server_id.is_none()
            && m.state != MessageState::Deleted
            && m.author_id == confirmed.author_id
            && m.body == confirmed.body
            && (server_time - m.created_at).abs() <= policy.echo_window
    })
}

/// Sorted by the ordering key (ties allowed)
pub fn is_ordered(sequence: &[Message]) -> bool {
    sequence.windows(2).all(|w| w[0].created_at <= w[1].created_at)
}
