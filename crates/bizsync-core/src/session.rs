//! Entry point tying the backends, the current user and the configuration
//! together. Views opened here own their subscriptions and tear them down
//! when dropped.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::attachment::{AttachmentPipeline, AudioDevice, RecordingSession};
use crate::backend::{MemoryBackend, ObjectStorage, Persistence, Realtime};
use crate::config::SyncConfig;
use crate::error::SyncResult;
use crate::feed::FeedAggregator;
use crate::ledger::{ConversationLedger, MessageSnapshot};
use crate::models::{Attachment, Message, MessageBody, MessageId};
use crate::stats::SubscriptionStats;
use crate::subscription::{EventFilter, EventSink, SubscriptionManager, Topic};

pub struct SyncSession {
    persistence: Arc<dyn Persistence>,
    realtime: Arc<dyn Realtime>,
    config: SyncConfig,
    user_id: String,
    pipeline: Arc<AttachmentPipeline>,
    feed: FeedAggregator,
}

impl SyncSession {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        realtime: Arc<dyn Realtime>,
        storage: Arc<dyn ObjectStorage>,
        config: SyncConfig,
        user_id: &str,
    ) -> Self {
        let pipeline = Arc::new(AttachmentPipeline::new(Arc::clone(&storage), &config));
        let feed = FeedAggregator::new(Arc::clone(&realtime), Arc::clone(&persistence), &config);
        Self {
            persistence,
            realtime,
            config,
            user_id: user_id.to_string(),
            pipeline,
            feed,
        }
    }

    /// Session backed entirely by one in-process backend
    pub fn in_memory(backend: Arc<MemoryBackend>, config: SyncConfig, user_id: &str) -> Self {
        Self::new(backend.clone(), backend.clone(), backend, config, user_id)
    }

    pub fn with_audio_device(self, device: Arc<dyn AudioDevice>) -> Self {
        self.set_audio_device(device);
        self
    }

    /// Views already opened pick up the device too; they share one pipeline.
    pub fn set_audio_device(&self, device: Arc<dyn AudioDevice>) {
        self.pipeline.set_audio_device(device);
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &AttachmentPipeline {
        &self.pipeline
    }

    pub fn start_recording(&self) -> SyncResult<RecordingSession> {
        Ok(self.pipeline.start_recording()?)
    }

    /// Activate a conversation: subscribe to its topic and start its ledger
    pub async fn open_conversation(&self, conversation_id: &str) -> SyncResult<ConversationView> {
        let manager = SubscriptionManager::new(
            Arc::clone(&self.realtime),
            Arc::clone(&self.persistence),
            &self.config,
        );
        let (sink, events) = EventSink::channel();
        manager
            .subscribe(Topic::conversation(conversation_id), EventFilter::all(), sink)
            .await?;

        let ledger = ConversationLedger::spawn(
            conversation_id,
            &self.user_id,
            Arc::clone(&self.persistence),
            &self.config,
            events,
        );
        info!(conversation = %conversation_id, user = %self.user_id, "Conversation opened");
        Ok(ConversationView {
            manager,
            ledger,
            pipeline: Arc::clone(&self.pipeline),
        })
    }

    pub fn feed(&self) -> &FeedAggregator {
        &self.feed
    }

    pub async fn start_feed(&self) -> SyncResult<()> {
        self.feed.start(&self.user_id).await
    }

    pub fn close(&self) {
        self.feed.stop();
    }
}

/// An open conversation: its ledger plus the subscription feeding it
pub struct ConversationView {
    manager: SubscriptionManager,
    ledger: ConversationLedger,
    pipeline: Arc<AttachmentPipeline>,
}

impl ConversationView {
    pub fn conversation_id(&self) -> &str {
        self.ledger.conversation_id()
    }

    pub async fn send(&self, text: &str) -> SyncResult<Message> {
        self.ledger.send(text).await
    }

    pub fn start_recording(&self) -> SyncResult<RecordingSession> {
        Ok(self.pipeline.start_recording()?)
    }

    /// Upload first; the message is only sent once the attachment is Uploaded
    pub async fn send_attachment(&self, attachment: &mut Attachment) -> SyncResult<Message> {
        let url = self.pipeline.upload(attachment).await?;
        self.ledger
            .send_body(MessageBody::Attachment { url }, attachment.kind.into())
            .await
    }

    pub async fn retry(&self, id: &MessageId) -> SyncResult<()> {
        self.ledger.retry(id).await
    }

    pub async fn load_history(&self, limit: usize) -> SyncResult<usize> {
        self.ledger.load_history(limit).await
    }

    pub fn current_messages(&self) -> Vec<Message> {
        self.ledger.current_messages()
    }

    pub fn changes(&self) -> watch::Receiver<MessageSnapshot> {
        self.ledger.changes()
    }

    pub fn stats(&self) -> SubscriptionStats {
        self.manager.stats()
    }

    pub fn is_subscribed(&self) -> bool {
        !self.manager.active_topics().is_empty()
    }

    /// Deactivate: detach subscriptions and stop the ledger
    pub fn close(&self) {
        self.manager.unsubscribe_all();
        self.ledger.close();
        info!(conversation = %self.conversation_id(), "Conversation closed");
    }
}

impl Drop for ConversationView {
    fn drop(&mut self) {
        self.close();
    }
}
