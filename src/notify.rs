use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::NotificationConfig;
use crate::snowflake::Snowflake;

/// Downstream notifications. Delivery is best effort.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    CommunitySynced {
        community_id: Snowflake,
        channels: usize,
        messages: usize,
    },
    ChannelSynced {
        community_id: Snowflake,
        channel_id: Snowflake,
        messages: usize,
    },
    MessageReceived {
        channel_id: Snowflake,
        message_id: Snowflake,
    },
    MessageUpdated {
        channel_id: Snowflake,
        message_id: Snowflake,
    },
    MessageDeleted {
        channel_id: Snowflake,
        message_id: Snowflake,
    },
    MemberUpdated {
        community_id: Snowflake,
        user_id: Snowflake,
    },
    AttachmentDownloaded {
        attachment_id: Snowflake,
        message_id: Snowflake,
        bytes: u64,
        deduplicated: bool,
    },
    SyncProgress {
        community_id: Snowflake,
        channel_id: Snowflake,
        messages_synced: usize,
    },
    SyncError {
        community_id: Option<Snowflake>,
        entity: String,
        entity_id: String,
        message: String,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::CommunitySynced { .. } => "community_synced",
            SyncEvent::ChannelSynced { .. } => "channel_synced",
            SyncEvent::MessageReceived { .. } => "message_received",
            SyncEvent::MessageUpdated { .. } => "message_updated",
            SyncEvent::MessageDeleted { .. } => "message_deleted",
            SyncEvent::MemberUpdated { .. } => "member_updated",
            SyncEvent::AttachmentDownloaded { .. } => "attachment_downloaded",
            SyncEvent::SyncProgress { .. } => "sync_progress",
            SyncEvent::SyncError { .. } => "sync_error",
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &SyncEvent) -> Result<()>;
}

/// Posts each event as JSON to a webhook-style endpoint.
pub struct HttpEventPublisher {
    http: Client,
    endpoint: String,
}

impl HttpEventPublisher {
    pub fn new(endpoint: &str) -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("community-mirror/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to construct HTTP client")?;
        Ok(Self {
            http,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, event: &SyncEvent) -> Result<()> {
        let response = self
            .http
            .post(&self.endpoint)
            .json(event)
            .send()
            .await
            .with_context(|| format!("failed to deliver {} event", event.name()))?;
        if !response.status().is_success() {
            return Err(anyhow!(
                "event endpoint rejected {} with status {}",
                event.name(),
                response.status()
            ));
        }
        Ok(())
    }
}

/// Wraps an optional publisher. Failures and slow endpoints never reach the caller.
#[derive(Clone)]
pub struct Notifier {
    publisher: Option<Arc<dyn EventPublisher>>,
    timeout: Duration,
}

impl Notifier {
    pub fn new(publisher: Arc<dyn EventPublisher>, timeout: Duration) -> Self {
        Self {
            publisher: Some(publisher),
            timeout,
        }
    }

    pub fn disabled() -> Self {
        Self {
            publisher: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn from_config(config: &NotificationConfig) -> Result<Self> {
        match config.endpoint.as_deref() {
            Some(endpoint) => Ok(Self::new(
                Arc::new(HttpEventPublisher::new(endpoint)?),
                Duration::from_millis(config.timeout_ms),
            )),
            None => Ok(Self::disabled()),
        }
    }

    pub async fn publish(&self, event: SyncEvent) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        match tokio::time::timeout(self.timeout, publisher.publish(&event)).await {
            Ok(Ok(())) => debug!("published {} event", event.name()),
            Ok(Err(err)) => warn!("failed to publish {} event: {:#}", event.name(), err),
            Err(_) => warn!(
                "publishing {} event timed out after {:?}",
                event.name(),
                self.timeout
            ),
        }
    }

    pub async fn sync_error(
        &self,
        community_id: Option<Snowflake>,
        entity: &str,
        entity_id: impl ToString,
        message: impl ToString,
    ) {
        self.publish(SyncEvent::SyncError {
            community_id,
            entity: entity.to_string(),
            entity_id: entity_id.to_string(),
            message: message.to_string(),
        })
        .await;
    }
}
