//! Errors that stop the worker from starting.

use thiserror::Error;

use crate::clients::{DiscoveryError, QueueError, ResolveError};
use crate::config::ConfigError;
use crate::node::NodeError;
use crate::vm::VmError;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("networking node: {0}")]
    Node(#[from] NodeError),

    #[error("job queue: {0}")]
    Queue(#[from] QueueError),

    #[error("naming client: {0}")]
    Resolver(#[from] ResolveError),

    #[error("discovery client: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("scripting VM: {0}")]
    Vm(#[from] VmError),
}

pub type Result<T> = std::result::Result<T, ServiceError>;
