//! Per-topic push subscriptions.
//!
//! Each active topic owns one pump task reading the backend change stream.
//! The pump resolves the full row behind every event (the push channel only
//! carries identifiers), then fans the resolved event out to every
//! subscriber of that topic whose filter accepts it. Consumers receive
//! events through an [`EventSink`], one multiplexed stream per consumer.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::topic::{EventFilter, Topic};
use crate::backend::{ChangeEvent, ChangeKind, Persistence, Realtime, Row};
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::stats::{SharedSubscriptionStats, SubscriptionStats};

static NEXT_SINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SinkId(u64);

/// A change event with its row already fetched.
/// `row` is None for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEvent {
    pub topic: Topic,
    pub kind: ChangeKind,
    pub table: String,
    pub row_id: String,
    pub row: Option<Row>,
}

/// Delivery end of a consumer's event stream
#[derive(Debug, Clone)]
pub struct EventSink {
    id: SinkId,
    tx: mpsc::UnboundedSender<ResolvedEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ResolvedEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SinkId(NEXT_SINK_ID.fetch_add(1, Ordering::Relaxed));
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> SinkId {
        self.id
    }

    fn deliver(&self, event: ResolvedEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: u64,
    topic: Topic,
}

impl SubscriptionHandle {
    pub fn topic(&self) -> &Topic {
        &self.topic
    }
}

struct Subscriber {
    handle_id: u64,
    filter: EventFilter,
    sink: EventSink,
}

struct TopicEntry {
    subscribers: Vec<Subscriber>,
    cancel_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl TopicEntry {
    fn shutdown(self) {
        let _ = self.cancel_tx.send(true);
        self.task.abort();
    }
}

type Registry = Arc<Mutex<HashMap<Topic, TopicEntry>>>;

#[derive(Debug, Clone, Copy)]
struct ResolvePolicy {
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
}

pub struct SubscriptionManager {
    realtime: Arc<dyn Realtime>,
    persistence: Arc<dyn Persistence>,
    policy: ResolvePolicy,
    registry: Registry,
    stats: SharedSubscriptionStats,
    next_handle: AtomicU64,
}

impl SubscriptionManager {
    pub fn new(
        realtime: Arc<dyn Realtime>,
        persistence: Arc<dyn Persistence>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            realtime,
            persistence,
            policy: ResolvePolicy {
                attempts: config.resolve_attempts.max(1),
                backoff: config.resolve_backoff(),
                timeout: config.resolve_timeout(),
            },
            registry: Arc::new(Mutex::new(HashMap::new())),
            stats: SharedSubscriptionStats::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Subscribe `sink` to `topic`. Registering the same sink on the same
    /// topic again returns the existing handle, so nothing is delivered twice.
    pub async fn subscribe(
        &self,
        topic: Topic,
        filter: EventFilter,
        sink: EventSink,
    ) -> SyncResult<SubscriptionHandle> {
        if let Some(handle) = self.try_attach(&topic, &filter, &sink) {
            return Ok(handle);
        }

        // First subscriber for this topic: open the backend stream
        let rx = self.realtime.listen(&topic).await?;

        let mut registry = self.registry.lock();
        if let Some(entry) = registry.get_mut(&topic) {
            // Another subscribe raced us and already owns a pump; ours is dropped
            drop(rx);
            return Ok(self.attach(&topic, entry, filter, sink));
        }

        let (cancel_tx, cancel_rx) = watch::channel(false);
        let task = tokio::spawn(run_topic_pump(
            topic.clone(),
            rx,
            cancel_rx,
            Arc::clone(&self.registry),
            Arc::clone(&self.persistence),
            self.policy,
            self.stats.clone(),
        ));
        let mut entry = TopicEntry {
            subscribers: Vec::new(),
            cancel_tx,
            task,
        };
        let handle = self.attach(&topic, &mut entry, filter, sink);
        registry.insert(topic.clone(), entry);
        info!(%topic, "Subscribed to topic");
        Ok(handle)
    }

    fn try_attach(
        &self,
        topic: &Topic,
        filter: &EventFilter,
        sink: &EventSink,
    ) -> Option<SubscriptionHandle> {
        let mut registry = self.registry.lock();
        let entry = registry.get_mut(topic)?;
        Some(self.attach(topic, entry, filter.clone(), sink.clone()))
    }

    fn attach(
        &self,
        topic: &Topic,
        entry: &mut TopicEntry,
        filter: EventFilter,
        sink: EventSink,
    ) -> SubscriptionHandle {
        if let Some(existing) = entry.subscribers.iter().find(|s| s.sink.id == sink.id) {
            debug!(%topic, "Sink already subscribed, reusing handle");
            return SubscriptionHandle {
                id: existing.handle_id,
                topic: topic.clone(),
            };
        }
        let handle_id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        entry.subscribers.push(Subscriber {
            handle_id,
            filter,
            sink,
        });
        SubscriptionHandle {
            id: handle_id,
            topic: topic.clone(),
        }
    }

    /// Detach one subscriber. The topic's pump stops with its last subscriber.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        let mut registry = self.registry.lock();
        let Some(entry) = registry.get_mut(&handle.topic) else {
            return false;
        };
        let before = entry.subscribers.len();
        entry.subscribers.retain(|s| s.handle_id != handle.id);
        let removed = entry.subscribers.len() != before;

        if entry.subscribers.is_empty() {
            if let Some(entry) = registry.remove(&handle.topic) {
                entry.shutdown();
                info!(topic = %handle.topic, "Unsubscribed from topic");
            }
        }
        removed
    }

    /// Tear down every subscription. Safe to call repeatedly.
    pub fn unsubscribe_all(&self) {
        let entries: Vec<(Topic, TopicEntry)> = self.registry.lock().drain().collect();
        for (topic, entry) in entries {
            entry.shutdown();
            debug!(%topic, "Subscription torn down");
        }
    }

    pub fn active_topics(&self) -> Vec<Topic> {
        self.registry.lock().keys().cloned().collect()
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.registry
            .lock()
            .get(topic)
            .map(|e| e.subscribers.len())
            .unwrap_or(0)
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.stats.snapshot()
    }
}

impl Drop for SubscriptionManager {
    fn drop(&mut self) {
        self.unsubscribe_all();
    }
}

async fn run_topic_pump(
    topic: Topic,
    mut rx: broadcast::Receiver<ChangeEvent>,
    mut cancel_rx: watch::Receiver<bool>,
    registry: Registry,
    persistence: Arc<dyn Persistence>,
    policy: ResolvePolicy,
    stats: SharedSubscriptionStats,
) {
    let label = topic.to_string();
    debug!(topic = %label, "Topic pump started");

    loop {
        tokio::select! {
            biased;
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    break;
                }
            }
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if event.table != topic.table() {
                            continue;
                        }
                        let row = match event.event {
                            ChangeKind::Delete => None,
                            ChangeKind::Insert | ChangeKind::Update => {
                                match resolve_row(persistence.as_ref(), &event, policy, &stats, &label, &mut cancel_rx).await {
                                    Ok(Some(row)) => Some(row),
                                    // Cancelled mid-resolution
                                    Ok(None) => break,
                                    Err(e) => {
                                        warn!(topic = %label, row_id = %event.row_id, error = %e, "Dropping unresolvable event");
                                        stats.record_dropped(&label);
                                        continue;
                                    }
                                }
                            }
                        };
                        let resolved = ResolvedEvent {
                            topic: topic.clone(),
                            kind: event.event,
                            table: event.table,
                            row_id: event.row_id,
                            row,
                        };
                        if fan_out(&registry, &resolved) {
                            stats.record_delivered(&label);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(topic = %label, skipped, "Change stream lagged, events skipped");
                        stats.record_lagged(&label, skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!(topic = %label, "Change stream closed");
                        break;
                    }
                }
            }
        }
    }
    debug!(topic = %label, "Topic pump stopped");
}

/// Deliver to each subscriber exactly once. Returns true if anyone accepted it.
fn fan_out(registry: &Registry, event: &ResolvedEvent) -> bool {
    let registry = registry.lock();
    let Some(entry) = registry.get(&event.topic) else {
        return false;
    };
    let mut delivered = false;
    for subscriber in &entry.subscribers {
        if subscriber.filter.accepts(event.kind) && subscriber.sink.deliver(event.clone()) {
            delivered = true;
        }
    }
    delivered
}

/// Fetch the row behind a change event with bounded exponential backoff.
/// Each attempt has its own deadline, so a hung fetch costs at most
/// `attempts * timeout` before the event is dropped.
/// `Ok(None)` means the pump was cancelled while waiting.
async fn resolve_row(
    persistence: &dyn Persistence,
    event: &ChangeEvent,
    policy: ResolvePolicy,
    stats: &SharedSubscriptionStats,
    label: &str,
    cancel_rx: &mut watch::Receiver<bool>,
) -> SyncResult<Option<Row>> {
    let mut backoff = policy.backoff;
    let mut last_error = String::from("row not visible yet");

    for attempt in 1..=policy.attempts {
        let fetch = tokio::time::timeout(
            policy.timeout,
            persistence.fetch_by_id(&event.table, &event.row_id),
        );
        tokio::select! {
            result = fetch => match result {
                Ok(Ok(Some(row))) => return Ok(Some(row)),
                Ok(Ok(None)) => last_error = "row not visible yet".to_string(),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("fetch timed out after {:?}", policy.timeout),
            },
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return Ok(None);
                }
            }
        }

        if attempt == policy.attempts {
            break;
        }
        stats.record_retry(label);
        debug!(topic = %label, row_id = %event.row_id, attempt, error = %last_error, "Retrying row resolution");

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            changed = cancel_rx.changed() => {
                if changed.is_err() || *cancel_rx.borrow() {
                    return Ok(None);
                }
            }
        }
        backoff = backoff.saturating_mul(2);
    }

    Err(SyncError::Resolution {
        table: event.table.clone(),
        row_id: event.row_id.clone(),
        reason: last_error,
    })
}
