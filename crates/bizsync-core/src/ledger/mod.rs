//! Per-conversation optimistic message ledger.
//!
//! One task owns the sequence. Local sends, persistence results, retries and
//! resolved push events all arrive as messages to that task and are applied
//! in order; readers only ever see published snapshots.

mod reconcile;
mod state;

pub use reconcile::{
    apply_confirmed, apply_delete, apply_edit, is_ordered, reconcile, MatchPolicy,
    ReconcileOutcome, Reconciled,
};

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::backend::{Filter, Order, Persistence, Query, Row};
use crate::config::SyncConfig;
use crate::constants::{columns, MESSAGES_TABLE};
use crate::error::{BackendError, SyncError, SyncResult};
use crate::models::{Message, MessageBody, MessageId, MessageKind};
use crate::subscription::ResolvedEvent;
use state::{LedgerState, RetryPlan};

const LEDGER: &str = "conversation ledger";

pub type MessageSnapshot = Arc<Vec<Message>>;

enum LedgerCommand {
    Send {
        body: MessageBody,
        kind: MessageKind,
        response_tx: oneshot::Sender<Message>,
    },
    Persisted {
        temp_id: MessageId,
        result: Result<String, BackendError>,
    },
    Resolved {
        temp_id: MessageId,
        result: Result<Option<Row>, BackendError>,
    },
    Retry {
        id: MessageId,
        response_tx: oneshot::Sender<SyncResult<()>>,
    },
    MergeHistory {
        rows: Vec<Row>,
        response_tx: oneshot::Sender<usize>,
    },
}

#[derive(Debug, Clone, Copy)]
struct PersistPolicy {
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

/// Handle to a conversation's ledger task. Dropping it stops the task;
/// in-flight sends still finish and their results are discarded.
pub struct ConversationLedger {
    conversation_id: String,
    persistence: Arc<dyn Persistence>,
    commands: mpsc::UnboundedSender<LedgerCommand>,
    snapshot: watch::Receiver<MessageSnapshot>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl ConversationLedger {
    /// Start the ledger task. `events` carries resolved push events for the
    /// conversation topic.
    pub fn spawn(
        conversation_id: &str,
        user_id: &str,
        persistence: Arc<dyn Persistence>,
        config: &SyncConfig,
        events: mpsc::UnboundedReceiver<ResolvedEvent>,
    ) -> Self {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(MessageSnapshot::default());
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let actor = LedgerActor {
            state: LedgerState::new(conversation_id, user_id, config),
            persistence: Arc::clone(&persistence),
            policy: PersistPolicy {
                attempts: config.persist_attempts.max(1),
                backoff: config.persist_backoff(),
                timeout: config.persist_timeout(),
            },
            commands_tx: commands_tx.clone(),
            snapshot_tx,
        };
        let task = tokio::spawn(actor.run(commands_rx, events, cancel_rx, config.sweep_interval()));
        info!(conversation = %conversation_id, "Ledger started");

        Self {
            conversation_id: conversation_id.to_string(),
            persistence,
            commands: commands_tx,
            snapshot,
            cancel_tx,
            task,
        }
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    /// Send a text message. The Pending entry is in the sequence when this returns.
    pub async fn send(&self, text: &str) -> SyncResult<Message> {
        if text.trim().is_empty() {
            return Err(SyncError::Validation("message body is empty".to_string()));
        }
        self.send_body(MessageBody::Text(text.to_string()), MessageKind::Text)
            .await
    }

    pub async fn send_body(&self, body: MessageBody, kind: MessageKind) -> SyncResult<Message> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(LedgerCommand::Send {
            body,
            kind,
            response_tx,
        })?;
        response_rx.await.map_err(|_| SyncError::Closed(LEDGER))
    }

    /// Re-drive a Failed message
    pub async fn retry(&self, id: &MessageId) -> SyncResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command(LedgerCommand::Retry {
            id: id.clone(),
            response_tx,
        })?;
        response_rx.await.map_err(|_| SyncError::Closed(LEDGER))?
    }

    /// Backfill the newest `limit` persisted messages. Returns how many were new.
    pub async fn load_history(&self, limit: usize) -> SyncResult<usize> {
        let query = Query::new(Filter::new().eq(columns::CONVERSATION_ID, self.conversation_id.as_str()))
            .order(Order::desc(columns::CREATED_AT))
            .limit(limit);
        let mut rows = self.persistence.select(MESSAGES_TABLE, &query).await?;
        rows.reverse();

        let (response_tx, response_rx) = oneshot::channel();
        self.command(LedgerCommand::MergeHistory { rows, response_tx })?;
        response_rx.await.map_err(|_| SyncError::Closed(LEDGER))
    }

    /// Ordered visible sequence (tombstones hidden)
    pub fn current_messages(&self) -> Vec<Message> {
        self.snapshot
            .borrow()
            .iter()
            .filter(|m| m.is_visible())
            .cloned()
            .collect()
    }

    /// Watch every published snapshot, tombstones included
    pub fn changes(&self) -> watch::Receiver<MessageSnapshot> {
        self.snapshot.clone()
    }

    pub fn close(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }

    fn command(&self, command: LedgerCommand) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::Closed(LEDGER))
    }
}

impl Drop for ConversationLedger {
    fn drop(&mut self) {
        self.close();
    }
}

struct LedgerActor {
    state: LedgerState,
    persistence: Arc<dyn Persistence>,
    policy: PersistPolicy,
    commands_tx: mpsc::UnboundedSender<LedgerCommand>,
    snapshot_tx: watch::Sender<MessageSnapshot>,
}

impl LedgerActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<LedgerCommand>,
        mut events: mpsc::UnboundedReceiver<ResolvedEvent>,
        mut cancel_rx: watch::Receiver<bool>,
        sweep_interval: Duration,
    ) {
        let mut sweep = tokio::time::interval(sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut events_open = true;

        loop {
            tokio::select! {
                biased;
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        break;
                    }
                }
                Some(command) = commands.recv() => self.handle(command),
                event = events.recv(), if events_open => match event {
                    Some(event) => {
                        if self.state.apply_event(&event) {
                            self.publish();
                        }
                    }
                    None => {
                        debug!("Event stream closed");
                        events_open = false;
                    }
                },
                _ = sweep.tick() => {
                    if !self.state.expire_unconfirmed(Utc::now()).is_empty() {
                        self.publish();
                    }
                }
            }
        }
        debug!("Ledger stopped");
    }

    fn handle(&mut self, command: LedgerCommand) {
        match command {
            LedgerCommand::Send {
                body,
                kind,
                response_tx,
            } => {
                let message = self.state.append_pending(body, kind, Utc::now());
                self.publish();
                debug!(id = %message.id, "Pending message appended");
                self.spawn_persist(message.id.clone(), message.to_insert_row());
                let _ = response_tx.send(message);
            }
            LedgerCommand::Persisted { temp_id, result } => {
                let changed = match result {
                    Ok(server_id) => self.state.persisted(&temp_id, server_id, Utc::now()),
                    Err(err) => self.state.persist_failed(&temp_id, &err),
                };
                if changed {
                    self.publish();
                }
            }
            LedgerCommand::Resolved { temp_id, result } => {
                if let Some(row) = self.state.resolved(&temp_id, result) {
                    self.spawn_persist(temp_id, row);
                }
                self.publish();
            }
            LedgerCommand::Retry { id, response_tx } => {
                let result = self.state.begin_retry(&id).map(|plan| {
                    match plan {
                        RetryPlan::Insert { temp_id, row } => self.spawn_persist(temp_id, row),
                        RetryPlan::Resolve { temp_id, server_id } => {
                            self.spawn_resolve(temp_id, server_id)
                        }
                        RetryPlan::Nothing => {}
                    }
                });
                self.publish();
                let _ = response_tx.send(result);
            }
            LedgerCommand::MergeHistory { rows, response_tx } => {
                let added = self.state.merge_history(&rows);
                if added > 0 {
                    self.publish();
                }
                let _ = response_tx.send(added);
            }
        }
    }

    fn publish(&self) {
        self.snapshot_tx
            .send_replace(Arc::new(self.state.messages().to_vec()));
    }

    fn spawn_persist(&self, temp_id: MessageId, row: Row) {
        let persistence = Arc::clone(&self.persistence);
        let commands_tx = self.commands_tx.clone();
        let policy = self.policy;
        tokio::spawn(async move {
            let result = persist_with_retry(persistence.as_ref(), row, policy).await;
            if commands_tx
                .send(LedgerCommand::Persisted { temp_id, result })
                .is_err()
            {
                debug!("Ledger gone, discarding persist result");
            }
        });
    }

    fn spawn_resolve(&self, temp_id: MessageId, server_id: String) {
        let persistence = Arc::clone(&self.persistence);
        let commands_tx = self.commands_tx.clone();
        tokio::spawn(async move {
            let result = persistence.fetch_by_id(MESSAGES_TABLE, &server_id).await;
            if commands_tx
                .send(LedgerCommand::Resolved { temp_id, result })
                .is_err()
            {
                debug!("Ledger gone, discarding resolve result");
            }
        });
    }
}

async fn persist_with_retry(
    persistence: &dyn Persistence,
    row: Row,
    policy: PersistPolicy,
) -> Result<String, BackendError> {
    let mut backoff = policy.backoff;
    let mut attempt = 1;
    loop {
        let insert = tokio::time::timeout(policy.timeout, persistence.insert(MESSAGES_TABLE, row.clone()));
        let result = match insert.await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Network(format!(
                "insert timed out after {:?}",
                policy.timeout
            ))),
        };
        match result {
            Ok(id) => return Ok(id),
            Err(err) if err.is_retryable() && attempt < policy.attempts => {
                debug!(attempt, error = %err, "Retrying message insert");
                tokio::time::sleep(backoff).await;
                backoff = backoff.saturating_mul(2);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
