use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::transport::{PubSub, Subscriber, TransportError};

/// Broadcast-backed topic. Every subscriber gets every message published
/// after it subscribed; slow subscribers skip what they missed.
///
/// Clones share the topic but each handle created with [`Self::handle`]
/// owns its own subscriptions and stops them on [`Self::close`].
pub struct InProcPubSub<T> {
    sender: broadcast::Sender<T>,
    shutdown: CancellationToken,
    subscriptions: TaskTracker,
}

impl<T> InProcPubSub<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self::from_sender(sender)
    }

    fn from_sender(sender: broadcast::Sender<T>) -> Self {
        Self {
            sender,
            shutdown: CancellationToken::new(),
            subscriptions: TaskTracker::new(),
        }
    }

    /// Another handle on the same topic with independent subscriptions.
    pub fn handle(&self) -> Self {
        Self::from_sender(self.sender.clone())
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Stop this handle's subscriptions and reject further publishes.
    pub async fn close(&self) {
        self.shutdown.cancel();
        self.subscriptions.close();
        self.subscriptions.wait().await;
    }
}

#[async_trait]
impl<T> PubSub<T> for InProcPubSub<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn publish(&self, message: T) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }
        // No receivers is not an error, nobody is listening yet.
        if self.sender.send(message).is_err() {
            tracing::trace!("Published with no subscribers");
        }
        Ok(())
    }

    async fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) -> Result<(), TransportError> {
        if self.shutdown.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let mut receiver = self.sender.subscribe();
        let shutdown = self.shutdown.clone();
        self.subscriptions.spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    received = receiver.recv() => match received {
                        Ok(message) => {
                            if let Err(e) = subscriber.handle(message).await {
                                tracing::warn!(error = %e, "Subscriber failed to handle message");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(skipped, "Subscriber lagged, messages dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        Ok(())
    }
}
