// Peer message stream: HTTP routes other peers and observers use to talk
// to this worker directly.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};

use axum::{
    Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        Json,
        sse::{Event, KeepAlive, Sse},
    },
    routing::get,
};
use futures::{Stream, StreamExt};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info};

use crate::fanout::{ChannelObserver, FanOut, Observer};
use crate::monkey::JobTable;
use crate::node::{Node, NodeError};
use crate::subscription::SubscriptionState;
use crate::types::{ChannelName, ObserverId};

/// Shared state of the stream's routes.
#[derive(Clone)]
pub struct StreamState {
    pub peer_id: String,
    pub jobs: JobTable,
    pub fanout: Arc<FanOut>,
    pub subscription: Option<watch::Receiver<SubscriptionState>>,
    /// Per-observer buffer of the status route.
    pub observer_buffer: usize,
    /// Ends open status streams when the peer stream stops.
    pub shutdown: CancellationToken,
}

pub fn create_router(state: StreamState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/jobs", get(list_jobs))
        .route("/status/{channel}", get(status_stream))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

async fn health_check(State(state): State<StreamState>) -> Result<Json<Value>, StatusCode> {
    let subscription = state.subscription.as_ref().map(|s| *s.borrow());

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "peer_id": state.peer_id,
        "in_flight": state.jobs.len(),
        "subscription": subscription,
        "timestamp": chrono::Utc::now().to_rfc3339()
    })))
}

async fn list_jobs(State(state): State<StreamState>) -> Result<Json<Value>, StatusCode> {
    let jobs = state.jobs.snapshot();

    Ok(Json(serde_json::json!({
        "jobs": jobs,
        "count": jobs.len(),
    })))
}

/// Detaches an SSE client from its channel when the response is dropped.
struct Attachment {
    fanout: Arc<FanOut>,
    channel: ChannelName,
    observer: ObserverId,
}

impl Drop for Attachment {
    fn drop(&mut self) {
        self.fanout.detach(&self.channel, &self.observer);
        debug!(channel = %self.channel, observer = %self.observer, "Status stream closed");
    }
}

/// Server-sent events of one status channel.
async fn status_stream(
    State(state): State<StreamState>,
    Path(channel): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let channel = ChannelName::new(channel);
    let (observer, rx) = ChannelObserver::new(state.observer_buffer);
    let attachment = Attachment {
        fanout: state.fanout.clone(),
        channel: channel.clone(),
        observer: observer.id().clone(),
    };
    state.fanout.attach(&channel, Arc::new(observer));
    debug!(%channel, observer = %attachment.observer, "Status stream opened");

    let events = ReceiverStream::new(rx)
        .map(move |update| {
            let _attached = &attachment;
            let event = Event::default()
                .event(update.status.as_str())
                .json_data(&update)
                .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()));
            Ok(event)
        })
        .take_until(state.shutdown.clone().cancelled_owned());

    Sse::new(events).keep_alive(KeepAlive::default())
}

/// The running peer stream.
pub struct PeerStream {
    local_addr: SocketAddr,
    token: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PeerStream {
    /// Serve the routes on the node's listener until `stop` is called or
    /// `state.shutdown` is cancelled.
    pub fn open(node: &Node, state: StreamState) -> Result<Self, NodeError> {
        let listener = node.take_listener()?;
        let local_addr = node.local_addr();
        let token = state.shutdown.clone();
        let app = create_router(state);

        let shutdown = token.clone();
        let task = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            match result {
                Ok(()) => debug!(%local_addr, "Peer stream stopped"),
                Err(e) => error!(%local_addr, error = %e, "Peer stream failed"),
            }
        });

        info!(%local_addr, "Peer stream serving");
        Ok(Self {
            local_addr,
            token,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting connections and end open status streams.
    pub fn stop(&self) {
        self.token.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Wait for the server task to finish. Returns immediately after the
    /// first call.
    pub async fn join(&self) {
        let task = self.task.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}
