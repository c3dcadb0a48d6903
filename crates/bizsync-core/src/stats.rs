use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Counters for one topic's live stream
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TopicStats {
    /// Events handed to at least one subscriber
    pub delivered: u64,
    /// Resolution attempts beyond the first
    pub retries: u64,
    /// Events dropped after exhausting resolution retries
    pub dropped: u64,
    /// Events the backend stream skipped because we lagged behind
    pub lagged: u64,
}

/// Stats for all subscriptions, keyed by topic label
#[derive(Debug, Default, Clone)]
pub struct SubscriptionStats {
    pub by_topic: HashMap<String, TopicStats>,
}

impl SubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_delivered(&self) -> u64 {
        self.by_topic.values().map(|s| s.delivered).sum()
    }

    pub fn total_dropped(&self) -> u64 {
        self.by_topic.values().map(|s| s.dropped).sum()
    }

    /// Topics sorted by delivered count (descending)
    pub fn topics_by_count(&self) -> Vec<(String, u64)> {
        let mut topics: Vec<_> = self
            .by_topic
            .iter()
            .map(|(t, s)| (t.clone(), s.delivered))
            .collect();
        topics.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        topics
    }
}

/// Thread-safe wrapper for subscription stats
#[derive(Debug, Clone, Default)]
pub struct SharedSubscriptionStats {
    inner: Arc<RwLock<SubscriptionStats>>,
}

impl SharedSubscriptionStats {
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, topic: &str, f: impl FnOnce(&mut TopicStats)) {
        if let Ok(mut stats) = self.inner.write() {
            f(stats.by_topic.entry(topic.to_string()).or_default());
        }
    }

    pub fn record_delivered(&self, topic: &str) {
        self.update(topic, |s| s.delivered += 1);
    }

    pub fn record_retry(&self, topic: &str) {
        self.update(topic, |s| s.retries += 1);
    }

    pub fn record_dropped(&self, topic: &str) {
        self.update(topic, |s| s.dropped += 1);
    }

    pub fn record_lagged(&self, topic: &str, skipped: u64) {
        self.update(topic, |s| s.lagged += skipped);
    }

    pub fn snapshot(&self) -> SubscriptionStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}
