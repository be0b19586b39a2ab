//! Job queue on core NATS subjects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::{Client, ConnectOptions};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{JobQueueClient, MessageStream, QueueError};
use crate::fanout::StatusUpdate;

/// NATS connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsConfig {
    /// Server URL, e.g. `nats://127.0.0.1:4222`.
    pub url: String,
    /// Client connection name shown by the server.
    pub name: Option<String>,
    pub connection_timeout_secs: u64,
    /// Max reconnection attempts (None = infinite).
    pub max_reconnects: Option<usize>,
    /// Job outcomes are published to `<status_subject>.<job id>`.
    pub status_subject: String,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            url: "nats://127.0.0.1:4222".to_string(),
            name: Some("monkey-worker".to_string()),
            connection_timeout_secs: 5,
            max_reconnects: None,
            status_subject: "monkey.status".to_string(),
        }
    }
}

/// [`JobQueueClient`] backed by a NATS connection.
///
/// Job notifications arrive on a plain subject; the queue's redelivery
/// policy lives in whatever publishes to it.
pub struct NatsJobQueue {
    client: Client,
    status_subject: String,
    closed: AtomicBool,
}

impl NatsJobQueue {
    pub async fn connect(config: &NatsConfig) -> Result<Self, QueueError> {
        let mut options = ConnectOptions::new()
            .connection_timeout(Duration::from_secs(config.connection_timeout_secs));

        if let Some(name) = &config.name {
            options = options.name(name);
        }
        if let Some(max_reconnects) = config.max_reconnects {
            options = options.max_reconnects(max_reconnects);
        }

        let client = async_nats::connect_with_options(config.url.as_str(), options)
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;

        info!(url = %config.url, "Connected to job queue");

        Ok(Self {
            client,
            status_subject: config.status_subject.clone(),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Cancelled);
        }
        Ok(())
    }
}

#[async_trait]
impl JobQueueClient for NatsJobQueue {
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, QueueError> {
        self.ensure_open()?;

        let subscriber = self
            .client
            .subscribe(topic.to_string())
            .await
            .map_err(|e| QueueError::Subscribe {
                topic: topic.to_string(),
                message: e.to_string(),
            })?;

        debug!(topic, "Subscribed to job topic");
        Ok(subscriber.map(|message| Ok(message.payload)).boxed())
    }

    async fn report(&self, update: &StatusUpdate) -> Result<(), QueueError> {
        self.ensure_open()?;

        let payload = serde_json::to_vec(update).map_err(|e| QueueError::Report(e.to_string()))?;
        let subject = format!("{}.{}", self.status_subject, update.job_id);

        self.client
            .publish(subject, payload.into())
            .await
            .map_err(|e| QueueError::Report(e.to_string()))
    }

    async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Drain unsubscribes, flushes pending publishes and closes the
        // connection.
        self.client
            .drain()
            .await
            .map_err(|e| QueueError::Connect(e.to_string()))?;
        info!("Job queue connection closed");
        Ok(())
    }
}
