use crate::models::NotificationEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedChange {
    Inserted,
    Updated,
    Unchanged,
}

/// Newest-first notification list with unique ids.
#[derive(Debug, Clone)]
pub struct NotificationFeed {
    items: Vec<NotificationEvent>,
    has_more: bool,
}

impl Default for NotificationFeed {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            has_more: true,
        }
    }
}

impl NotificationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[NotificationEvent] {
        &self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Offset of the next page
    pub fn cursor(&self) -> usize {
        self.items.len()
    }

    pub fn has_more(&self) -> bool {
        self.has_more
    }

    pub fn set_has_more(&mut self, has_more: bool) {
        self.has_more = has_more;
    }

    pub fn unread_count(&self) -> usize {
        self.items.iter().filter(|e| !e.read).count()
    }

    pub fn get(&self, id: &str) -> Option<&NotificationEvent> {
        self.items.iter().find(|e| e.id == id)
    }

    /// Insert at its recency position, or replace the existing copy.
    /// Ties on created_at are broken by id so arrival order never matters.
    pub fn upsert(&mut self, event: NotificationEvent) -> FeedChange {
        if let Some(pos) = self.items.iter().position(|e| e.id == event.id) {
            if self.items[pos] == event {
                return FeedChange::Unchanged;
            }
            self.items.remove(pos);
            self.insert_sorted(event);
            return FeedChange::Updated;
        }
        self.insert_sorted(event);
        FeedChange::Inserted
    }

    fn insert_sorted(&mut self, event: NotificationEvent) {
        let pos = self
            .items
            .partition_point(|e| (e.created_at, &e.id) > (event.created_at, &event.id));
        self.items.insert(pos, event);
    }

    /// Merge a fetched page. Returns how many events were new.
    pub fn merge_page(&mut self, events: Vec<NotificationEvent>) -> usize {
        let mut added = 0;
        for event in events {
            if self.upsert(event) == FeedChange::Inserted {
                added += 1;
            }
        }
        added
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|e| e.id != id);
        self.items.len() != before
    }

    /// Set one read flag, returning the previous value
    pub fn set_read(&mut self, id: &str, read: bool) -> Option<bool> {
        let event = self.items.iter_mut().find(|e| e.id == id)?;
        Some(std::mem::replace(&mut event.read, read))
    }

    pub fn read_flags(&self) -> Vec<(String, bool)> {
        self.items.iter().map(|e| (e.id.clone(), e.read)).collect()
    }

    /// Restore flags captured by [`read_flags`](Self::read_flags). Events
    /// that have since left the feed are skipped.
    pub fn restore_read_flags(&mut self, flags: &[(String, bool)]) {
        for (id, read) in flags {
            self.set_read(id, *read);
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.has_more = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SourceDomain;
    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    fn event(id: &str, millis: i64, read: bool) -> NotificationEvent {
        NotificationEvent {
            id: id.to_string(),
            source_domain: SourceDomain::Task,
            user_id: "u1".to_string(),
            payload: Value::Null,
            created_at: Utc.timestamp_millis_opt(1_700_000_000_000 + millis).unwrap(),
            read,
        }
    }

    fn ids(feed: &NotificationFeed) -> Vec<&str> {
        feed.items().iter().map(|e| e.id.as_str()).collect()
    }

    #[test]
    fn test_newest_first_regardless_of_arrival() {
        let mut feed = NotificationFeed::new();
        feed.upsert(event("b", 5, false));
        feed.upsert(event("c", 9, false));
        feed.upsert(event("a", 0, false));
        assert_eq!(ids(&feed), vec!["c", "b", "a"]);

        // Equal timestamps: deterministic by id
        let mut left = NotificationFeed::new();
        left.upsert(event("x", 1, false));
        left.upsert(event("y", 1, false));
        let mut right = NotificationFeed::new();
        right.upsert(event("y", 1, false));
        right.upsert(event("x", 1, false));
        assert_eq!(ids(&left), ids(&right));
    }

    #[test]
    fn test_upsert_dedupes_and_updates() {
        let mut feed = NotificationFeed::new();
        assert_eq!(feed.upsert(event("a", 0, false)), FeedChange::Inserted);
        assert_eq!(feed.upsert(event("a", 0, false)), FeedChange::Unchanged);
        assert_eq!(feed.upsert(event("a", 0, true)), FeedChange::Updated);
        assert_eq!(feed.len(), 1);
        assert_eq!(feed.unread_count(), 0);
    }

    #[test]
    fn test_merge_page_counts_only_new() {
        let mut feed = NotificationFeed::new();
        feed.upsert(event("a", 3, false));
        let added = feed.merge_page(vec![event("a", 3, false), event("b", 2, false), event("c", 1, true)]);
        assert_eq!(added, 2);
        assert_eq!(feed.cursor(), 3);
        assert_eq!(feed.unread_count(), 2);
    }

    #[test]
    fn test_read_flags_restore() {
        let mut feed = NotificationFeed::new();
        feed.upsert(event("a", 0, false));
        feed.upsert(event("b", 1, true));
        let flags = feed.read_flags();

        assert_eq!(feed.set_read("a", true), Some(false));
        assert_eq!(feed.set_read("missing", true), None);
        feed.remove("b");
        feed.restore_read_flags(&flags);

        assert_eq!(feed.get("a").map(|e| e.read), Some(false));
        assert!(feed.get("b").is_none());
    }
}
