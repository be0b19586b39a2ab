//! In-memory collaborators for unit and integration tests.

#![cfg(test)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::clients::{
    Beacon, DiscoveryClient, DiscoveryError, JobQueueClient, MessageStream, NameResolver,
    QueueError, ResolutionPath, ResolveError,
};
use crate::fanout::{Observer, StatusUpdate};
use crate::subscription::MessageHandler;
use crate::types::ObserverId;
use crate::vm::{Context, Dynamic, InvocationError};

/// Context that answers every call with its own file name.
pub struct StaticContext {
    file: String,
}

impl StaticContext {
    pub fn shared(file: &str) -> Arc<dyn Context> {
        Arc::new(Self {
            file: file.to_string(),
        })
    }
}

impl Context for StaticContext {
    fn file(&self) -> &str {
        &self.file
    }

    fn call(&self, _function: &str, _args: Vec<Dynamic>) -> Result<Dynamic, InvocationError> {
        Ok(Dynamic::from(self.file.clone()))
    }

    fn call_host(&self, _function: &str, _args: Vec<Value>) -> Result<Value, InvocationError> {
        Ok(Value::String(self.file.clone()))
    }
}

type Feed = mpsc::UnboundedSender<Result<Bytes, QueueError>>;

/// Job queue whose streams are driven by the test.
///
/// `push`, `fail` and `end_stream` act on the most recent subscription.
#[derive(Default)]
pub struct FakeQueue {
    subscribes: AtomicUsize,
    feed: Mutex<Option<Feed>>,
    subscribe_failures: Mutex<VecDeque<QueueError>>,
    reports: Mutex<Vec<StatusUpdate>>,
    closed: AtomicBool,
}

impl FakeQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe_count(&self) -> usize {
        self.subscribes.load(Ordering::SeqCst)
    }

    pub fn push(&self, payload: impl Into<Bytes>) {
        if let Some(feed) = self.feed.lock().unwrap().as_ref() {
            let _ = feed.send(Ok(payload.into()));
        }
    }

    pub fn push_json(&self, payload: &Value) {
        self.push(serde_json::to_vec(payload).unwrap());
    }

    pub fn fail(&self, error: QueueError) {
        if let Some(feed) = self.feed.lock().unwrap().as_ref() {
            let _ = feed.send(Err(error));
        }
    }

    pub fn end_stream(&self) {
        self.feed.lock().unwrap().take();
    }

    /// Make the next `subscribe` call fail with `error`.
    pub fn fail_next_subscribe(&self, error: QueueError) {
        self.subscribe_failures.lock().unwrap().push_back(error);
    }

    pub fn reports(&self) -> Vec<StatusUpdate> {
        self.reports.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobQueueClient for FakeQueue {
    async fn subscribe(&self, _topic: &str) -> Result<MessageStream, QueueError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.subscribe_failures.lock().unwrap().pop_front() {
            return Err(error);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.feed.lock().unwrap() = Some(tx);
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn report(&self, update: &StatusUpdate) -> Result<(), QueueError> {
        self.reports.lock().unwrap().push(update.clone());
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Naming service backed by a map of path to answer.
///
/// Unknown paths resolve to `NotFound`. While paused, every resolution
/// waits until `resume` is called.
pub struct FakeResolver {
    answers: Mutex<HashMap<String, Result<Value, ResolveError>>>,
    requests: Mutex<Vec<String>>,
    paused: watch::Sender<bool>,
    closed: AtomicBool,
}

impl FakeResolver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            paused: watch::Sender::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn insert(&self, path: &ResolutionPath, value: Value) {
        self.answers
            .lock()
            .unwrap()
            .insert(path.to_string(), Ok(value));
    }

    pub fn fail(&self, path: &ResolutionPath, error: ResolveError) {
        self.answers
            .lock()
            .unwrap()
            .insert(path.to_string(), Err(error));
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NameResolver for FakeResolver {
    async fn resolve(&self, path: &ResolutionPath) -> Result<Value, ResolveError> {
        self.requests.lock().unwrap().push(path.to_string());

        let mut paused = self.paused.subscribe();
        let _ = paused.wait_for(|p| !*p).await;

        self.answers
            .lock()
            .unwrap()
            .get(path.as_str())
            .cloned()
            .unwrap_or_else(|| Err(ResolveError::NotFound(path.to_string())))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Discovery client that counts announcements.
#[derive(Default)]
pub struct RecordingDiscovery {
    announced: AtomicUsize,
    failing: bool,
}

impl RecordingDiscovery {
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Self::default()
        }
    }

    pub fn count(&self) -> usize {
        self.announced.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DiscoveryClient for RecordingDiscovery {
    async fn announce(&self, _beacon: &Beacon) -> Result<(), DiscoveryError> {
        self.announced.fetch_add(1, Ordering::SeqCst);
        if self.failing {
            return Err(DiscoveryError::Status(503));
        }
        Ok(())
    }
}

/// Observer that keeps every update it receives.
pub struct RecordingObserver {
    id: ObserverId,
    updates: Mutex<Vec<StatusUpdate>>,
}

impl RecordingObserver {
    pub fn shared(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: ObserverId::new(id),
            updates: Mutex::new(Vec::new()),
        })
    }

    pub fn updates(&self) -> Vec<StatusUpdate> {
        self.updates.lock().unwrap().clone()
    }

    pub fn terminal_updates(&self) -> Vec<StatusUpdate> {
        self.updates()
            .into_iter()
            .filter(|u| u.status.is_terminal())
            .collect()
    }
}

#[async_trait]
impl Observer for RecordingObserver {
    fn id(&self) -> &ObserverId {
        &self.id
    }

    async fn deliver(&self, update: &StatusUpdate) {
        self.updates.lock().unwrap().push(update.clone());
    }
}

/// Message handler that records payloads, optionally panicking on one.
#[derive(Default)]
pub struct RecordingHandler {
    payloads: Mutex<Vec<Bytes>>,
    panic_on: Option<Bytes>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn panicking_on(payload: &'static str) -> Arc<Self> {
        Arc::new(Self {
            panic_on: Some(Bytes::from_static(payload.as_bytes())),
            ..Self::default()
        })
    }

    pub fn count(&self) -> usize {
        self.payloads.lock().unwrap().len()
    }
}

#[async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, payload: Bytes) {
        if self.panic_on.as_ref() == Some(&payload) {
            panic!("handler failure");
        }
        self.payloads.lock().unwrap().push(payload);
    }
}
