//! Networking node: the worker's peer identity and its bound listener.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("node {0} has no listener left to serve on")]
    ListenerTaken(String),
}

/// A peer in the worker fleet.
///
/// Owns a listener until the peer stream takes it over; a node can back
/// one stream at a time.
pub struct Node {
    peer_id: String,
    local_addr: SocketAddr,
    listener: Mutex<Option<TcpListener>>,
}

impl Node {
    /// Bind `addr` under a fresh peer id.
    pub async fn bind(addr: &str) -> Result<Arc<Self>, NodeError> {
        let listener = TcpListener::bind(addr).await.map_err(|source| NodeError::Bind {
            addr: addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| NodeError::Bind {
            addr: addr.to_string(),
            source,
        })?;

        let peer_id = Uuid::new_v4().to_string();
        info!(%peer_id, %local_addr, "Node listening");

        Ok(Arc::new(Self {
            peer_id,
            local_addr,
            listener: Mutex::new(Some(listener)),
        }))
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub(crate) fn take_listener(&self) -> Result<TcpListener, NodeError> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| NodeError::ListenerTaken(self.peer_id.clone()))
    }
}
