//! Naming service over HTTP.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::debug;
use url::Url;

use super::{NameResolver, ResolutionPath, ResolveError, with_trailing_slash};

/// [`NameResolver`] that fetches `GET {base}/{path}` and expects JSON.
pub struct HttpResolver {
    base: Url,
    client: reqwest::Client,
    closed: AtomicBool,
}

impl HttpResolver {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, ResolveError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ResolveError::Request {
                path: base.to_string(),
                message: e.to_string(),
            })?;

        Ok(Self {
            base: with_trailing_slash(base),
            client,
            closed: AtomicBool::new(false),
        })
    }

    fn url_for(&self, path: &ResolutionPath) -> Result<Url, ResolveError> {
        self.base
            .join(path.as_str().trim_start_matches('/'))
            .map_err(|e| ResolveError::Request {
                path: path.to_string(),
                message: e.to_string(),
            })
    }
}

#[async_trait]
impl NameResolver for HttpResolver {
    async fn resolve(&self, path: &ResolutionPath) -> Result<Value, ResolveError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ResolveError::Closed);
        }

        let url = self.url_for(path)?;
        debug!(%path, %url, "Resolving");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ResolveError::Request {
                path: path.to_string(),
                message: e.to_string(),
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(ResolveError::NotFound(path.to_string())),
            status if !status.is_success() => {
                return Err(ResolveError::Status {
                    path: path.to_string(),
                    status: status.as_u16(),
                });
            }
            _ => {}
        }

        response.json().await.map_err(|e| ResolveError::Decode {
            path: path.to_string(),
            message: e.to_string(),
        })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
