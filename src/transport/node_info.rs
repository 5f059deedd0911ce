use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio_util::sync::CancellationToken;

use crate::config::NodeInfoConfig;
use crate::models::NodeInfo;
use crate::transport::{NodeInfoDecorator, PubSub, TransportError};

/// Source of the snapshot a node publishes about itself.
#[async_trait]
pub trait NodeInfoProvider: Send + Sync {
    async fn node_info(&self) -> NodeInfo;
}

/// A fixed snapshot, refreshed with the current time on every publish.
#[async_trait]
impl NodeInfoProvider for NodeInfo {
    async fn node_info(&self) -> NodeInfo {
        self.clone()
    }
}

/// Random delay in `[0, max]` so nodes started together do not publish in
/// lockstep.
pub fn random_jitter(max: Duration) -> Duration {
    let max_ms = max.as_millis() as u64;
    if max_ms == 0 {
        return Duration::ZERO;
    }
    let mut rng = rand::thread_rng();
    Duration::from_millis(rng.gen_range(0..=max_ms))
}

/// Periodically publishes this node's decorated snapshot.
pub struct NodeInfoPublisher {
    provider: Arc<dyn NodeInfoProvider>,
    pubsub: Arc<dyn PubSub<NodeInfo>>,
    decorator: Arc<dyn NodeInfoDecorator>,
    interval: Duration,
    jitter: Duration,
}

impl NodeInfoPublisher {
    pub fn new(
        provider: Arc<dyn NodeInfoProvider>,
        pubsub: Arc<dyn PubSub<NodeInfo>>,
        decorator: Arc<dyn NodeInfoDecorator>,
        config: &NodeInfoConfig,
    ) -> Self {
        Self {
            provider,
            pubsub,
            decorator,
            interval: config.publish_interval,
            jitter: config.publish_jitter,
        }
    }

    pub async fn publish_once(&self) -> Result<(), TransportError> {
        let mut info = self.provider.node_info().await;
        info.seen_at = Utc::now();
        let info = self.decorator.decorate(info);
        tracing::trace!(node_id = %info.node_id, "Publishing node info");
        self.pubsub.publish(info).await
    }

    /// Publish until `shutdown` is cancelled or the topic closes.
    pub async fn run(&self, shutdown: CancellationToken) {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(random_jitter(self.jitter)) => {}
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.publish_once().await {
                        Ok(()) => {}
                        Err(TransportError::Closed) => {
                            tracing::debug!("Node info topic closed, stopping publisher");
                            break;
                        }
                        Err(e) => tracing::warn!(error = %e, "Failed to publish node info"),
                    }
                }
            }
        }
    }
}
