//! Resilient job-queue subscription.
//!
//! Keeps the worker attached to its job topic for as long as it runs. Any
//! failure of the listener that is not caused by shutdown leads to a fresh
//! `subscribe` on the same topic; shutdown is the only way out.
//!
//! ```text
//! attached ──(failure)──▶ reattaching ──(subscribed)──▶ attached
//!     │                        │
//!     └──────(cancellation)────┴──────────▶ closed
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clients::{JobQueueClient, MessageStream, QueueError};

/// Lifecycle state of a [`Subscription`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionState {
    Attached,
    Reattaching,
    /// Terminal.
    Closed,
}

/// How long to wait before each resubscription attempt.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RetryPolicy {
    /// Resubscribe right away, without limit.
    #[default]
    Immediate,
    /// Exponential backoff starting at `initial_ms`, capped at `max_ms`.
    /// Resets once a message is received.
    Backoff { initial_ms: u64, max_ms: u64 },
}

impl RetryPolicy {
    /// Delay before the `attempt`-th consecutive resubscription (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            RetryPolicy::Immediate => Duration::ZERO,
            RetryPolicy::Backoff { initial_ms, max_ms } => {
                let factor = 1u64 << attempt.saturating_sub(1).min(32);
                Duration::from_millis(initial_ms.saturating_mul(factor).min(*max_ms))
            }
        }
    }
}

/// Receives every message of a subscription.
///
/// Each call runs in its own task: a slow or panicking handler never holds
/// up delivery of the next message.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, payload: Bytes);
}

/// A live subscription to one topic.
pub struct Subscription {
    topic: String,
    state: watch::Receiver<SubscriptionState>,
    reattaches: Arc<AtomicU64>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl Subscription {
    /// Subscribe to `topic` and keep the subscription alive until `token`
    /// is cancelled.
    ///
    /// The first `subscribe` happens before this returns, so a worker that
    /// cannot attach at all learns about it here.
    pub async fn establish(
        queue: Arc<dyn JobQueueClient>,
        topic: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
        token: CancellationToken,
        retry: RetryPolicy,
    ) -> Result<Self, QueueError> {
        let topic = topic.into();

        let stream = tokio::select! {
            result = queue.subscribe(&topic) => result?,
            _ = token.cancelled() => return Err(QueueError::Cancelled),
        };
        info!(%topic, "Subscribed to job queue");

        let (state_tx, state) = watch::channel(SubscriptionState::Attached);
        let reattaches = Arc::new(AtomicU64::new(0));

        let listener = Listener {
            queue,
            topic: topic.clone(),
            handler,
            token: token.clone(),
            retry,
            state: state_tx,
            reattaches: reattaches.clone(),
        };
        let task = tokio::spawn(listener.run(stream));

        Ok(Self {
            topic,
            state,
            reattaches,
            token,
            task,
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    /// Watch state transitions.
    pub fn watch(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    /// Number of successful reattachments so far.
    pub fn reattach_count(&self) -> u64 {
        self.reattaches.load(Ordering::SeqCst)
    }

    /// Stop listening. The state moves to `closed` shortly after.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Wait until the subscription has reached `closed`.
    pub async fn closed(&self) {
        let mut state = self.state.clone();
        let _ = state.wait_for(|s| *s == SubscriptionState::Closed).await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

struct Listener {
    queue: Arc<dyn JobQueueClient>,
    topic: String,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
    retry: RetryPolicy,
    state: watch::Sender<SubscriptionState>,
    reattaches: Arc<AtomicU64>,
}

/// Why a listener stopped receiving.
enum Interruption {
    Failed(QueueError),
    Ended,
}

impl Listener {
    async fn run(self, mut stream: MessageStream) {
        let mut failures = 0u32;

        loop {
            let interruption = self.listen(&mut stream, &mut failures).await;
            drop(stream);

            match interruption {
                Interruption::Failed(e) if e.is_cancellation() => break,
                _ if self.token.is_cancelled() => break,
                Interruption::Failed(e) => {
                    warn!(topic = %self.topic, error = %e, "Subscription failed, reattaching")
                }
                Interruption::Ended => {
                    warn!(topic = %self.topic, "Subscription stream ended, reattaching")
                }
            }
            self.state.send_replace(SubscriptionState::Reattaching);

            match self.resubscribe(&mut failures).await {
                Some(next) => stream = next,
                None => break,
            }

            let count = self.reattaches.fetch_add(1, Ordering::SeqCst) + 1;
            info!(topic = %self.topic, reattach_count = count, "Subscription reattached");
            self.state.send_replace(SubscriptionState::Attached);
        }

        self.state.send_replace(SubscriptionState::Closed);
        info!(topic = %self.topic, "Subscription closed");
    }

    /// Dispatch messages until the stream fails or ends.
    async fn listen(&self, stream: &mut MessageStream, failures: &mut u32) -> Interruption {
        loop {
            let item = tokio::select! {
                biased;
                _ = self.token.cancelled() => return Interruption::Failed(QueueError::Cancelled),
                item = stream.next() => item,
            };

            match item {
                Some(Ok(payload)) => {
                    *failures = 0;
                    let handler = self.handler.clone();
                    tokio::spawn(async move {
                        handler.handle(payload).await;
                    });
                }
                Some(Err(e)) => return Interruption::Failed(e),
                None => return Interruption::Ended,
            }
        }
    }

    /// Subscribe again, retrying under the policy. `None` on cancellation.
    async fn resubscribe(&self, failures: &mut u32) -> Option<MessageStream> {
        loop {
            *failures = failures.saturating_add(1);
            let delay = self.retry.delay(*failures);

            if delay.is_zero() {
                tokio::task::yield_now().await;
            } else {
                debug!(topic = %self.topic, ?delay, "Waiting before resubscribing");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = self.token.cancelled() => return None,
                }
            }

            let result = tokio::select! {
                result = self.queue.subscribe(&self.topic) => result,
                _ = self.token.cancelled() => return None,
            };

            match result {
                Ok(stream) => return Some(stream),
                Err(e) if e.is_cancellation() => return None,
                Err(e) => {
                    warn!(topic = %self.topic, error = %e, attempt = *failures, "Resubscribe failed")
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeQueue, RecordingHandler};

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    async fn establish(queue: &Arc<FakeQueue>, handler: &Arc<RecordingHandler>) -> Subscription {
        Subscription::establish(
            queue.clone(),
            "jobs",
            handler.clone(),
            CancellationToken::new(),
            RetryPolicy::Immediate,
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_messages_are_dispatched() {
        let queue = FakeQueue::new();
        let handler = RecordingHandler::new();
        let subscription = establish(&queue, &handler).await;

        queue.push("one");
        queue.push("two");

        wait_until(|| handler.count() == 2).await;
        assert_eq!(subscription.state(), SubscriptionState::Attached);
        assert_eq!(subscription.topic(), "jobs");
    }

    #[tokio::test]
    async fn test_error_causes_exactly_one_resubscription() {
        let queue = FakeQueue::new();
        let handler = RecordingHandler::new();
        let subscription = establish(&queue, &handler).await;
        assert_eq!(queue.subscribe_count(), 1);

        queue.fail(QueueError::Stream("connection reset".into()));

        wait_until(|| subscription.reattach_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.subscribe_count(), 2);
        assert_eq!(subscription.reattach_count(), 1);
        assert_eq!(subscription.state(), SubscriptionState::Attached);

        // The new stream delivers.
        queue.push("after");
        wait_until(|| handler.count() == 1).await;
    }

    #[tokio::test]
    async fn test_cancellation_error_does_not_resubscribe() {
        let queue = FakeQueue::new();
        let handler = RecordingHandler::new();
        let subscription = establish(&queue, &handler).await;

        queue.fail(QueueError::Cancelled);

        tokio::time::timeout(Duration::from_secs(5), subscription.closed())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(queue.subscribe_count(), 1);
        assert_eq!(subscription.reattach_count(), 0);
        assert_eq!(subscription.state(), SubscriptionState::Closed);
    }

    #[tokio::test]
    async fn test_stream_end_reattaches() {
        let queue = FakeQueue::new();
        let handler = RecordingHandler::new();
        let subscription = establish(&queue, &handler).await;

        queue.end_stream();

        wait_until(|| subscription.reattach_count() == 1).await;
        assert_eq!(queue.subscribe_count(), 2);
    }

    #[tokio::test]
    async fn test_failed_resubscribe_is_retried() {
        let queue = FakeQueue::new();
        let handler = RecordingHandler::new();
        let subscription = establish(&queue, &handler).await;

        queue.fail_next_subscribe(QueueError::Connect("refused".into()));
        queue.fail(QueueError::Stream("connection reset".into()));

        wait_until(|| subscription.reattach_count() == 1).await;
        assert_eq!(queue.subscribe_count(), 3);
    }

    #[tokio::test]
    async fn test_close_is_terminal() {
        let queue = FakeQueue::new();
        let handler = RecordingHandler::new();
        let subscription = establish(&queue, &handler).await;

        subscription.close();
        tokio::time::timeout(Duration::from_secs(5), subscription.closed())
            .await
            .unwrap();

        wait_until(|| subscription.is_finished()).await;
        assert_eq!(queue.subscribe_count(), 1);
    }

    #[tokio::test]
    async fn test_initial_subscribe_failure_is_returned() {
        let queue = FakeQueue::new();
        queue.fail_next_subscribe(QueueError::Connect("refused".into()));

        let result = Subscription::establish(
            queue.clone(),
            "jobs",
            RecordingHandler::new(),
            CancellationToken::new(),
            RetryPolicy::Immediate,
        )
        .await;
        assert!(matches!(result, Err(QueueError::Connect(_))));
    }

    #[tokio::test]
    async fn test_panicking_handler_does_not_stop_delivery() {
        let queue = FakeQueue::new();
        let handler = RecordingHandler::panicking_on("boom");
        let _subscription = establish(&queue, &handler).await;

        queue.push("boom");
        queue.push("fine");

        wait_until(|| handler.count() == 1).await;
        assert_eq!(queue.subscribe_count(), 1);
    }

    #[test]
    fn test_backoff_delays() {
        let policy = RetryPolicy::Backoff {
            initial_ms: 100,
            max_ms: 1_000,
        };
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1_000));
        assert_eq!(policy.delay(60), Duration::from_millis(1_000));
        assert_eq!(RetryPolicy::Immediate.delay(7), Duration::ZERO);
    }
}
