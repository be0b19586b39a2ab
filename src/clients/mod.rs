//! Collaborator boundaries.
//!
//! The worker talks to three outside services: the job queue it consumes
//! from, the naming service that resolves job specs, and the discovery
//! service it announces itself to. Each is a trait so the service can be
//! built against fakes in tests and against the production adapters here.

mod discovery;
mod nats;
mod resolver;

pub use discovery::{Beacon, HttpDiscovery, start_beacon};
pub use nats::{NatsConfig, NatsJobQueue};
pub use resolver::HttpResolver;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde_json::Value;
use std::fmt;
use thiserror::Error;

use crate::fanout::StatusUpdate;
use crate::types::{BranchName, CommitId, ProjectId};

/// Messages received on a subscribed topic, in transport order.
///
/// The stream ending, or yielding an error, means the subscription is gone.
pub type MessageStream = BoxStream<'static, Result<Bytes, QueueError>>;

/// Errors from the job queue.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("job queue connection failed: {0}")]
    Connect(String),

    #[error("subscription to `{topic}` failed: {message}")]
    Subscribe { topic: String, message: String },

    #[error("job queue stream failed: {0}")]
    Stream(String),

    #[error("failed to report job status: {0}")]
    Report(String),

    /// The operation stopped because the worker is shutting down.
    #[error("job queue operation cancelled")]
    Cancelled,
}

impl QueueError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, QueueError::Cancelled)
    }
}

/// Errors from the naming service.
#[derive(Debug, Clone, Error)]
pub enum ResolveError {
    #[error("nothing is published at `{0}`")]
    NotFound(String),

    #[error("request for `{path}` failed: {message}")]
    Request { path: String, message: String },

    #[error("naming service answered `{path}` with status {status}")]
    Status { path: String, status: u16 },

    #[error("unexpected document at `{path}`: {message}")]
    Decode { path: String, message: String },

    #[error("naming client is closed")]
    Closed,
}

/// Errors from the discovery service.
#[derive(Debug, Clone, Error)]
pub enum DiscoveryError {
    #[error("announce failed: {0}")]
    Request(String),

    #[error("discovery service answered with status {0}")]
    Status(u16),
}

/// Source of job notifications.
#[async_trait]
pub trait JobQueueClient: Send + Sync {
    /// Start listening on `topic`.
    async fn subscribe(&self, topic: &str) -> Result<MessageStream, QueueError>;

    /// Report the outcome of a job back to the queue.
    async fn report(&self, update: &StatusUpdate) -> Result<(), QueueError>;

    /// Release the connection. Later calls fail or return nothing.
    async fn close(&self) -> Result<(), QueueError>;
}

/// Resolves published documents by path.
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, path: &ResolutionPath) -> Result<Value, ResolveError>;

    async fn close(&self) {}
}

/// Receives this worker's presence announcements.
#[async_trait]
pub trait DiscoveryClient: Send + Sync {
    async fn announce(&self, beacon: &Beacon) -> Result<(), DiscoveryError>;
}

/// Path of a document in the naming service.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionPath(String);

impl ResolutionPath {
    /// Head commit of a branch: `projects/<project>/branches/<branch>/current`.
    pub fn current(project: &ProjectId, branch: &BranchName) -> Self {
        Self(format!("projects/{}/branches/{}/current", project, branch))
    }

    /// Build spec of a commit:
    /// `projects/<project>/branches/<branch>/commit/<commit>/build`.
    pub fn build(project: &ProjectId, branch: &BranchName, commit: &CommitId) -> Self {
        Self(format!(
            "projects/{}/branches/{}/commit/{}/build",
            project, branch, commit
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResolutionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResolutionPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// `Url::join` replaces the last segment unless the base ends with `/`.
pub(crate) fn with_trailing_slash(mut url: url::Url) -> url::Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
