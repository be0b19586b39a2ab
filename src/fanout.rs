//! Live-status fan-out.
//!
//! Observers attach to named channels (`build-<job id>`) and receive every
//! [`StatusUpdate`] published there. Attachments are reference counted per
//! observer identity: attaching the same identity twice needs two detaches
//! before the observer goes away. A channel exists only while it has at
//! least one observer.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::types::{ChannelName, JobId, ObserverId};

/// Execution status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Accepted, not yet executing.
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeeded | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One progress event of a job, as seen by observers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub job_id: JobId,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl StatusUpdate {
    pub fn new(job_id: JobId, status: JobStatus) -> Self {
        Self {
            job_id,
            status,
            result: None,
            error: None,
            at: Utc::now(),
        }
    }

    pub fn running(job_id: JobId) -> Self {
        Self::new(job_id, JobStatus::Running)
    }

    pub fn succeeded(job_id: JobId, result: Value) -> Self {
        Self {
            result: Some(result),
            ..Self::new(job_id, JobStatus::Succeeded)
        }
    }

    pub fn failed(job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(job_id, JobStatus::Failed)
        }
    }
}

/// Something interested in the updates of a channel.
#[async_trait]
pub trait Observer: Send + Sync {
    /// Identity used for reference counting.
    fn id(&self) -> &ObserverId;

    /// Deliver one update. Must not block for long; slow observers should
    /// buffer or drop.
    async fn deliver(&self, update: &StatusUpdate);
}

/// Observer that forwards updates into a bounded `mpsc` channel.
///
/// When the buffer is full the update is dropped for this observer only.
pub struct ChannelObserver {
    id: ObserverId,
    tx: mpsc::Sender<StatusUpdate>,
}

impl ChannelObserver {
    /// Create an observer with a fresh anonymous identity.
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<StatusUpdate>) {
        Self::with_id(ObserverId::new(uuid::Uuid::new_v4().to_string()), buffer)
    }

    pub fn with_id(id: ObserverId, buffer: usize) -> (Self, mpsc::Receiver<StatusUpdate>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { id, tx }, rx)
    }
}

#[async_trait]
impl Observer for ChannelObserver {
    fn id(&self) -> &ObserverId {
        &self.id
    }

    async fn deliver(&self, update: &StatusUpdate) {
        match self.tx.try_send(update.clone()) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(observer = %self.id, job_id = %update.job_id, "Observer buffer full, dropping update");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(observer = %self.id, "Observer receiver closed");
            }
        }
    }
}

struct Attachment {
    observer: Arc<dyn Observer>,
    count: usize,
}

type Channels = HashMap<ChannelName, HashMap<ObserverId, Attachment>>;

/// Registry of channels and their observers.
///
/// The lock is held only for map operations; delivery happens on a snapshot
/// taken under the lock, after it is released.
#[derive(Default)]
pub struct FanOut {
    channels: Mutex<Channels>,
}

impl FanOut {
    pub fn new() -> Self {
        Self::default()
    }

    fn channels(&self) -> std::sync::MutexGuard<'_, Channels> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attach `observer` to `channel`. Returns the attachment count of the
    /// observer's identity after the call.
    pub fn attach(&self, channel: &ChannelName, observer: Arc<dyn Observer>) -> usize {
        let mut channels = self.channels();
        let observers = channels.entry(channel.clone()).or_default();
        let attachment = observers
            .entry(observer.id().clone())
            .or_insert_with(|| Attachment { observer, count: 0 });
        attachment.count += 1;
        debug!(%channel, count = attachment.count, "Observer attached");
        attachment.count
    }

    /// Drop one attachment of `id` from `channel`. Returns the remaining
    /// count (0 once the observer is gone or was never attached).
    pub fn detach(&self, channel: &ChannelName, id: &ObserverId) -> usize {
        let mut channels = self.channels();
        let Some(observers) = channels.get_mut(channel) else {
            return 0;
        };

        let remaining = match observers.get_mut(id) {
            Some(attachment) => {
                attachment.count -= 1;
                attachment.count
            }
            None => return 0,
        };

        if remaining == 0 {
            observers.remove(id);
            if observers.is_empty() {
                channels.remove(channel);
                debug!(%channel, "Channel removed");
            }
        }
        remaining
    }

    /// Deliver `update` to every observer of `channel`. Returns the number
    /// of observers it was handed to; 0 for an unknown channel.
    pub async fn publish(&self, channel: &ChannelName, update: &StatusUpdate) -> usize {
        let snapshot: Vec<Arc<dyn Observer>> = {
            let channels = self.channels();
            match channels.get(channel) {
                Some(observers) => observers.values().map(|a| a.observer.clone()).collect(),
                None => return 0,
            }
        };

        for observer in &snapshot {
            observer.deliver(update).await;
        }
        snapshot.len()
    }

    /// Attachment count of `id` on `channel`.
    pub fn attachments(&self, channel: &ChannelName, id: &ObserverId) -> usize {
        self.channels()
            .get(channel)
            .and_then(|observers| observers.get(id))
            .map_or(0, |a| a.count)
    }

    /// Number of distinct observers on `channel`.
    pub fn observer_count(&self, channel: &ChannelName) -> usize {
        self.channels().get(channel).map_or(0, |o| o.len())
    }

    pub fn has_channel(&self, channel: &ChannelName) -> bool {
        self.channels().contains_key(channel)
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }
}
