//! Scripted walk through the sync core against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use bizsync_core::backend::{MemoryBackend, Persistence, Row};
use bizsync_core::constants::{columns, MESSAGES_TABLE, NOTIFICATIONS_TABLE};
use bizsync_core::models::{
    Attachment, AttachmentKind, Message, MessageBody, MessageState, NotificationEvent, SourceDomain,
};
use bizsync_core::{ConversationView, SyncConfig, SyncSession};
use chrono::SecondsFormat;
use serde::Serialize;
use serde_json::json;
use tracing::info;

const DEMO_USER: &str = "demo-user";
const DEMO_PEER: &str = "demo-peer";
const DEMO_CONVERSATION: &str = "demo-conversation";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineEntry {
    pub id: String,
    pub author: String,
    pub body: String,
    pub state: String,
    pub own: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedEntry {
    pub id: String,
    pub domain: String,
    pub title: String,
    pub read: bool,
    pub created_at: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DemoReport {
    pub timeline: Vec<TimelineEntry>,
    pub rejected_attachment: Option<String>,
    pub loaded_from_history: usize,
    pub marked_read: usize,
    pub feed: Vec<FeedEntry>,
    /// Push events delivered to the conversation view
    pub delivered_events: u64,
    pub dropped_events: u64,
}

pub async fn run_demo(config: SyncConfig) -> Result<DemoReport> {
    let backend = Arc::new(MemoryBackend::new());
    let wait = settle_timeout(&config);
    let image_cap = config.image_max_bytes;
    let session = SyncSession::in_memory(backend.clone(), config, DEMO_USER);
    let view = session.open_conversation(DEMO_CONVERSATION).await?;

    info!("Sending while offline");
    backend.set_offline(true);
    let sent = view.send("hello from the train").await?;
    settle(&view, wait, |m| m.iter().any(|m| m.id == sent.id && m.state.is_failed())).await?;

    info!("Reconnected, retrying");
    backend.set_offline(false);
    view.retry(&sent.id).await?;
    settle(&view, wait, |m| m.len() == 1 && m[0].state.is_confirmed()).await?;

    backend
        .insert(MESSAGES_TABLE, peer_message("welcome back"))
        .await
        .context("Failed to insert peer message")?;
    settle(&view, wait, |m| m.len() == 2).await?;

    let mut oversize = Attachment::from_bytes(vec![0; image_cap as usize + 1], AttachmentKind::Image);
    let rejected_attachment = match view.send_attachment(&mut oversize).await {
        Ok(message) => bail!("oversize attachment was sent as {}", message.id),
        Err(e) => Some(e.to_string()),
    };

    for (domain, title) in [
        (SourceDomain::Invoice, "Invoice #1042 paid"),
        (SourceDomain::Employee, "New hire starts Monday"),
        (SourceDomain::Client, "Client onboarding complete"),
    ] {
        backend
            .insert(NOTIFICATIONS_TABLE, notification(domain, title))
            .await
            .context("Failed to seed notification")?;
    }
    session.start_feed().await?;
    let loaded_from_history = session.feed().load_more().await?;

    backend
        .insert(NOTIFICATIONS_TABLE, notification(SourceDomain::Task, "Quarterly report done"))
        .await
        .context("Failed to insert live notification")?;
    let mut changes = session.feed().changes();
    tokio::time::timeout(wait, async {
        while session.feed().snapshot().len() < loaded_from_history + 1 {
            if changes.changed().await.is_err() {
                break;
            }
        }
    })
    .await
    .context("Live notification never arrived")?;

    let marked_read = session.feed().mark_all_read().await?;

    let stats = view.stats();
    let report = DemoReport {
        timeline: view.current_messages().iter().map(timeline_entry).collect(),
        rejected_attachment,
        loaded_from_history,
        marked_read,
        feed: session.feed().snapshot().iter().map(feed_entry).collect(),
        delivered_events: stats.total_delivered(),
        dropped_events: stats.total_dropped(),
    };
    view.close();
    session.close();
    Ok(report)
}

fn settle_timeout(config: &SyncConfig) -> Duration {
    let persist = config
        .persist_backoff()
        .checked_mul(2u32.saturating_pow(config.persist_attempts))
        .unwrap_or(Duration::from_secs(60));
    persist + config.sweep_interval() + Duration::from_secs(5)
}

async fn settle(
    view: &ConversationView,
    timeout: Duration,
    check: impl Fn(&[Message]) -> bool,
) -> Result<()> {
    let mut changes = view.changes();
    let reached = tokio::time::timeout(timeout, async {
        loop {
            if check(&view.current_messages()) {
                return true;
            }
            if changes.changed().await.is_err() {
                return false;
            }
        }
    })
    .await;
    match reached {
        Ok(true) => Ok(()),
        Ok(false) => bail!("conversation closed unexpectedly"),
        Err(_) => bail!("conversation did not settle within {:?}", timeout),
    }
}

fn peer_message(body: &str) -> Row {
    let mut row = Row::new();
    row.insert(columns::CONVERSATION_ID.into(), json!(DEMO_CONVERSATION));
    row.insert(columns::AUTHOR_ID.into(), json!(DEMO_PEER));
    row.insert(columns::BODY.into(), json!(body));
    row.insert(columns::KIND.into(), json!("text"));
    row
}

fn notification(domain: SourceDomain, title: &str) -> Row {
    let mut row = Row::new();
    row.insert(columns::SOURCE_DOMAIN.into(), json!(domain.as_str()));
    row.insert(columns::USER_ID.into(), json!(DEMO_USER));
    row.insert(columns::PAYLOAD.into(), json!({ "title": title }));
    row
}

fn timeline_entry(message: &Message) -> TimelineEntry {
    TimelineEntry {
        id: message.id.to_string(),
        author: message.author_id.clone(),
        body: match &message.body {
            MessageBody::Text(text) => text.clone(),
            MessageBody::Attachment { url } => format!("[{}] {}", message.kind.as_str(), url),
        },
        state: state_label(&message.state),
        own: message.is_own,
    }
}

fn state_label(state: &MessageState) -> String {
    match state {
        MessageState::Pending => "pending".to_string(),
        MessageState::Confirmed => "confirmed".to_string(),
        MessageState::Edited => "edited".to_string(),
        MessageState::Failed(reason) => format!("failed ({:?})", reason),
        MessageState::Deleted => "deleted".to_string(),
    }
}

fn feed_entry(event: &NotificationEvent) -> FeedEntry {
    FeedEntry {
        id: event.id.clone(),
        domain: event.source_domain.to_string(),
        title: event.title(),
        read: event.read,
        created_at: event.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
    }
}
