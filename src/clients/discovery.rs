//! Discovery announcements.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{DiscoveryClient, DiscoveryError, with_trailing_slash};

/// Presence announcement of one worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Beacon {
    pub peer_id: String,
    /// Address the peer stream listens on.
    pub listen_addr: String,
    /// Job topic this worker consumes.
    pub topic: String,
    pub version: String,
    pub announced_at: DateTime<Utc>,
}

impl Beacon {
    pub fn new(peer_id: impl Into<String>, listen_addr: impl Into<String>, topic: impl Into<String>) -> Self {
        Self {
            peer_id: peer_id.into(),
            listen_addr: listen_addr.into(),
            topic: topic.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            announced_at: Utc::now(),
        }
    }
}

/// [`DiscoveryClient`] that posts beacons to `{base}/beacons`.
pub struct HttpDiscovery {
    endpoint: Url,
    client: reqwest::Client,
}

impl HttpDiscovery {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, DiscoveryError> {
        let endpoint = with_trailing_slash(base)
            .join("beacons")
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        Ok(Self { endpoint, client })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

#[async_trait]
impl DiscoveryClient for HttpDiscovery {
    async fn announce(&self, beacon: &Beacon) -> Result<(), DiscoveryError> {
        let response = self
            .client
            .post(self.endpoint.clone())
            .json(beacon)
            .send()
            .await
            .map_err(|e| DiscoveryError::Request(e.to_string()))?;

        if !response.status().is_success() {
            return Err(DiscoveryError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// Announce `beacon` every `interval` until `token` is cancelled.
///
/// The first announcement goes out immediately. Failures are logged and
/// the next tick tries again; the caller never awaits the returned handle
/// for progress.
pub fn start_beacon(
    client: Arc<dyn DiscoveryClient>,
    beacon: Beacon,
    interval: Duration,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(peer_id = %beacon.peer_id, ?interval, "Beacon started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let beacon = Beacon {
                announced_at: Utc::now(),
                ..beacon.clone()
            };
            match client.announce(&beacon).await {
                Ok(()) => debug!(peer_id = %beacon.peer_id, "Beacon announced"),
                Err(e) => warn!(peer_id = %beacon.peer_id, error = %e, "Beacon announce failed"),
            }
        }
        debug!("Beacon stopped");
    })
}
