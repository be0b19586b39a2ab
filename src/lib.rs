// Core modules
pub mod cache;
pub mod clients;
pub mod config;
mod error;
pub mod fanout;
mod maintenance;
pub mod monkey;
pub mod node;
pub mod stream;
pub mod subscription;
pub mod types;
pub mod vm;

// Worker lifecycle
mod service;

#[cfg(test)]
mod testing;

// Re-export key types and functions
pub use cache::{CacheConfig, ContextCache};
pub use config::{Config, ConfigError};
pub use error::{Result, ServiceError};
pub use fanout::{ChannelObserver, FanOut, JobStatus, Observer, StatusUpdate};
pub use maintenance::start_maintenance;
pub use monkey::{JobError, JobMessage, JobRunner, JobSpec, JobTable, Monkey};
pub use node::{Node, NodeError};
pub use service::{Collaborators, Service};
pub use stream::{PeerStream, StreamState};
pub use subscription::{MessageHandler, RetryPolicy, Subscription, SubscriptionState};
pub use types::{BranchName, ChannelName, CommitId, Fingerprint, JobId, ProjectId};
