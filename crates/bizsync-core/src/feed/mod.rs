//! Cross-domain notification feed.
//!
//! One subscription per source domain, all delivering into a single event
//! stream handled by one ordered loop. Pagination and read-state mutations
//! go straight to persistence and are mirrored optimistically.

mod store;

pub use store::{FeedChange, NotificationFeed};

use std::sync::Arc;

use futures::future::try_join_all;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::backend::{ChangeKind, Filter, Order, Persistence, Query, Realtime, Row};
use crate::config::SyncConfig;
use crate::constants::{columns, NOTIFICATIONS_TABLE};
use crate::error::{SyncError, SyncResult};
use crate::models::{NotificationEvent, SourceDomain};
use crate::subscription::{EventFilter, EventSink, ResolvedEvent, SubscriptionManager, Topic};

const FEED: &str = "notification feed";

struct Running {
    user_id: String,
    task: JoinHandle<()>,
}

pub struct FeedAggregator {
    persistence: Arc<dyn Persistence>,
    manager: SubscriptionManager,
    feed: Arc<Mutex<NotificationFeed>>,
    revision: Arc<watch::Sender<u64>>,
    page_size: usize,
    running: Mutex<Option<Running>>,
    /// Single in-flight page load
    load_lock: tokio::sync::Mutex<()>,
}

impl FeedAggregator {
    pub fn new(
        realtime: Arc<dyn Realtime>,
        persistence: Arc<dyn Persistence>,
        config: &SyncConfig,
    ) -> Self {
        Self {
            manager: SubscriptionManager::new(realtime, Arc::clone(&persistence), config),
            persistence,
            feed: Arc::new(Mutex::new(NotificationFeed::new())),
            revision: Arc::new(watch::channel(0).0),
            page_size: config.feed_page_size.max(1),
            running: Mutex::new(None),
            load_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Subscribe to every domain scoped to `user_id`. Starting again for the
    /// same user is a no-op; a different user replaces the session.
    pub async fn start(&self, user_id: &str) -> SyncResult<()> {
        if let Some(running) = self.running.lock().as_ref() {
            if running.user_id == user_id {
                return Ok(());
            }
        }
        self.stop();

        let (sink, events) = EventSink::channel();
        let subscriptions = SourceDomain::ALL.iter().map(|domain| {
            self.manager
                .subscribe(Topic::domain(*domain, user_id), EventFilter::all(), sink.clone())
        });
        if let Err(e) = try_join_all(subscriptions).await {
            warn!(user = %user_id, error = %e, "Feed subscription failed");
            self.manager.unsubscribe_all();
            return Err(e);
        }

        let task = tokio::spawn(run_feed_loop(
            user_id.to_string(),
            events,
            Arc::clone(&self.feed),
            Arc::clone(&self.revision),
        ));
        *self.running.lock() = Some(Running {
            user_id: user_id.to_string(),
            task,
        });
        info!(user = %user_id, domains = SourceDomain::ALL.len(), "Notification feed started");
        Ok(())
    }

    /// Tear down subscriptions and forget loaded events
    pub fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        self.manager.unsubscribe_all();
        running.task.abort();
        self.feed.lock().clear();
        self.bump();
        info!(user = %running.user_id, "Notification feed stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Fetch the next page. Returns how many events were new.
    pub async fn load_more(&self) -> SyncResult<usize> {
        let _guard = self.load_lock.lock().await;
        let user_id = self.user_id()?;

        let offset = {
            let feed = self.feed.lock();
            if !feed.has_more() {
                return Ok(0);
            }
            feed.cursor()
        };

        let query = Query::new(Filter::new().eq(columns::USER_ID, user_id.as_str()))
            .order(Order::desc(columns::CREATED_AT))
            .limit(self.page_size)
            .offset(offset);
        let rows = self.persistence.select(NOTIFICATIONS_TABLE, &query).await?;
        let fetched = rows.len();
        let events: Vec<NotificationEvent> = rows.iter().filter_map(NotificationEvent::from_row).collect();

        let added = {
            let mut feed = self.feed.lock();
            let added = feed.merge_page(events);
            feed.set_has_more(fetched == self.page_size);
            added
        };
        self.bump();
        debug!(offset, fetched, added, "Loaded feed page");
        Ok(added)
    }

    /// Mark one event read, rolling back if the backend refuses
    pub async fn mark_read(&self, id: &str) -> SyncResult<()> {
        let previous = self.feed.lock().set_read(id, true);
        match previous {
            None => return Err(SyncError::Validation(format!("unknown notification {}", id))),
            Some(true) => return Ok(()),
            Some(false) => self.bump(),
        }

        if let Err(e) = self
            .persistence
            .update(NOTIFICATIONS_TABLE, read_patch(), &Filter::by_id(id))
            .await
        {
            warn!(id, error = %e, "Mark read failed, rolling back");
            self.feed.lock().set_read(id, false);
            self.bump();
            return Err(e.into());
        }
        Ok(())
    }

    /// Mark every loaded event read. On failure every flag returns to its
    /// previous value. Returns how many events changed.
    pub async fn mark_all_read(&self) -> SyncResult<usize> {
        let (flags, unread) = {
            let mut feed = self.feed.lock();
            let flags = feed.read_flags();
            let unread: Vec<String> = flags
                .iter()
                .filter(|(_, read)| !read)
                .map(|(id, _)| id.clone())
                .collect();
            for id in &unread {
                feed.set_read(id, true);
            }
            (flags, unread)
        };
        if unread.is_empty() {
            return Ok(0);
        }
        self.bump();

        let filter = Filter::new().is_in(columns::ID, unread.iter().map(String::as_str));
        if let Err(e) = self
            .persistence
            .update(NOTIFICATIONS_TABLE, read_patch(), &filter)
            .await
        {
            warn!(count = unread.len(), error = %e, "Mark all read failed, rolling back");
            self.feed.lock().restore_read_flags(&flags);
            self.bump();
            return Err(e.into());
        }
        Ok(unread.len())
    }

    pub fn unread_count(&self) -> usize {
        self.feed.lock().unread_count()
    }

    pub fn has_more(&self) -> bool {
        self.feed.lock().has_more()
    }

    pub fn snapshot(&self) -> Vec<NotificationEvent> {
        self.feed.lock().items().to_vec()
    }

    /// Bumped on every feed change
    pub fn changes(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.manager
    }

    fn user_id(&self) -> SyncResult<String> {
        self.running
            .lock()
            .as_ref()
            .map(|r| r.user_id.clone())
            .ok_or(SyncError::Closed(FEED))
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }
}

impl Drop for FeedAggregator {
    fn drop(&mut self) {
        if let Some(running) = self.running.lock().take() {
            running.task.abort();
        }
    }
}

fn read_patch() -> Row {
    let mut patch = Row::new();
    patch.insert(columns::READ.into(), Value::Bool(true));
    patch
}

async fn run_feed_loop(
    user_id: String,
    mut events: mpsc::UnboundedReceiver<ResolvedEvent>,
    feed: Arc<Mutex<NotificationFeed>>,
    revision: Arc<watch::Sender<u64>>,
) {
    while let Some(event) = events.recv().await {
        let changed = match (event.kind, &event.row) {
            (ChangeKind::Delete, _) => feed.lock().remove(&event.row_id),
            (_, Some(row)) => match NotificationEvent::from_row(row) {
                Some(notification) if notification.user_id == user_id => {
                    feed.lock().upsert(notification) != FeedChange::Unchanged
                }
                Some(_) => false,
                None => {
                    warn!(row_id = %event.row_id, "Ignoring malformed notification row");
                    false
                }
            },
            (_, None) => false,
        };
        if changed {
            revision.send_modify(|r| *r += 1);
        }
    }
    debug!(user = %user_id, "Feed event loop ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use serde_json::json;
    use std::collections::HashSet;
    use std::time::Duration;

    fn setup(page_size: usize) -> (Arc<MemoryBackend>, FeedAggregator) {
        let backend = Arc::new(MemoryBackend::new());
        let config = SyncConfig {
            resolve_backoff_ms: 1,
            feed_page_size: page_size,
            ..SyncConfig::default()
        };
        let feed = FeedAggregator::new(backend.clone(), backend.clone(), &config);
        (backend, feed)
    }

    fn notification(domain: SourceDomain, user: &str, created_at: &str, read: bool) -> Row {
        json!({
            "source_domain": domain.as_str(),
            "user_id": user,
            "payload": {"title": format!("{} event", domain)},
            "created_at": created_at,
            "read": read,
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    async fn wait_for_len(feed: &FeedAggregator, len: usize) {
        let mut changes = feed.changes();
        tokio::time::timeout(Duration::from_secs(3), async {
            while feed.snapshot().len() < len {
                if changes.changed().await.is_err() {
                    break;
                }
            }
        })
        .await
        .expect("feed never filled");
    }

    #[tokio::test]
    async fn test_events_from_two_domains_merge_by_recency() {
        let (backend, feed) = setup(20);
        feed.start("u1").await.unwrap();

        // Later event first; both within 10ms of each other
        backend
            .insert(
                NOTIFICATIONS_TABLE,
                notification(SourceDomain::Message, "u1", "2024-05-01T10:00:00.008Z", false),
            )
            .await
            .unwrap();
        backend
            .insert(
                NOTIFICATIONS_TABLE,
                notification(SourceDomain::Task, "u1", "2024-05-01T10:00:00.001Z", false),
            )
            .await
            .unwrap();
        // Another user's event never shows up
        backend
            .insert(
                NOTIFICATIONS_TABLE,
                notification(SourceDomain::Task, "u2", "2024-05-01T10:00:00.005Z", false),
            )
            .await
            .unwrap();

        wait_for_len(&feed, 2).await;
        let items = feed.snapshot();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].source_domain, SourceDomain::Message);
        assert_eq!(items[1].source_domain, SourceDomain::Task);
        assert_eq!(feed.unread_count(), 2);
    }

    #[tokio::test]
    async fn test_paging_until_exhausted_matches_server_total() {
        let (backend, feed) = setup(20);
        backend.set_echo(false);
        for i in 0..45 {
            let domain = SourceDomain::ALL[i % SourceDomain::ALL.len()];
            let at = format!("2024-05-01T10:{:02}:{:02}Z", i / 60, i % 60);
            backend
                .insert(NOTIFICATIONS_TABLE, notification(domain, "u1", &at, i % 3 == 0))
                .await
                .unwrap();
        }
        feed.start("u1").await.unwrap();

        let (a, b) = tokio::join!(feed.load_more(), feed.load_more());
        assert_eq!(a.unwrap() + b.unwrap(), 40);

        let mut pages = 0;
        while feed.has_more() {
            feed.load_more().await.unwrap();
            pages += 1;
            assert!(pages < 10);
        }

        let items = feed.snapshot();
        assert_eq!(items.len(), 45);
        let unique: HashSet<_> = items.iter().map(|e| e.id.clone()).collect();
        assert_eq!(unique.len(), 45);
        assert!(items.windows(2).all(|w| w[0].created_at >= w[1].created_at));
        assert_eq!(feed.load_more().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_mark_all_read_failure_rolls_back_every_flag() {
        let (backend, feed) = setup(20);
        backend.set_echo(false);
        for (i, read) in [false, true, false, false].iter().enumerate() {
            let at = format!("2024-05-01T10:00:0{}Z", i);
            backend
                .insert(NOTIFICATIONS_TABLE, notification(SourceDomain::Invoice, "u1", &at, *read))
                .await
                .unwrap();
        }
        feed.start("u1").await.unwrap();
        feed.load_more().await.unwrap();
        let before: Vec<bool> = feed.snapshot().iter().map(|e| e.read).collect();
        assert_eq!(feed.unread_count(), 3);

        backend.set_failing_updates(true);
        assert!(feed.mark_all_read().await.is_err());
        let after: Vec<bool> = feed.snapshot().iter().map(|e| e.read).collect();
        assert_eq!(before, after);

        backend.set_failing_updates(false);
        assert_eq!(feed.mark_all_read().await.unwrap(), 3);
        assert_eq!(feed.unread_count(), 0);
        assert!(backend
            .rows(NOTIFICATIONS_TABLE)
            .iter()
            .all(|r| r["read"] == json!(true)));
    }

    #[tokio::test]
    async fn test_mark_read_is_optimistic_and_mirrored() {
        let (backend, feed) = setup(20);
        backend.set_echo(false);
        let id = backend
            .insert(
                NOTIFICATIONS_TABLE,
                notification(SourceDomain::Client, "u1", "2024-05-01T10:00:00Z", false),
            )
            .await
            .unwrap();
        feed.start("u1").await.unwrap();
        feed.load_more().await.unwrap();

        backend.set_failing_updates(true);
        assert!(feed.mark_read(&id).await.is_err());
        assert_eq!(feed.unread_count(), 1);

        backend.set_failing_updates(false);
        feed.mark_read(&id).await.unwrap();
        assert_eq!(feed.unread_count(), 0);
        assert_eq!(backend.rows(NOTIFICATIONS_TABLE)[0]["read"], json!(true));
        assert!(matches!(feed.mark_read("nope").await, Err(SyncError::Validation(_))));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_stop_tears_down() {
        let (_backend, feed) = setup(20);
        assert!(matches!(feed.load_more().await, Err(SyncError::Closed(_))));

        feed.start("u1").await.unwrap();
        feed.start("u1").await.unwrap();
        assert_eq!(feed.subscriptions().active_topics().len(), SourceDomain::ALL.len());

        feed.stop();
        feed.stop();
        assert!(!feed.is_running());
        assert!(feed.subscriptions().active_topics().is_empty());
        assert!(feed.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_start_fails_cleanly_when_offline() {
        let (backend, feed) = setup(20);
        backend.set_offline(true);
        assert!(matches!(feed.start("u1").await, Err(SyncError::Network(_))));
        assert!(!feed.is_running());
        assert!(feed.subscriptions().active_topics().is_empty());
    }
}
