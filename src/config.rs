use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{FlotillaError, Result};

/// Evaluation broker tuning.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// How long a dequeued evaluation stays leased before it is treated as
    /// nacked.
    pub visibility_timeout: Duration,
    /// Deliveries allowed before an evaluation is marked failed.
    pub delivery_limit: u32,
    /// Delay before the first redelivery after a nack.
    pub initial_nack_delay: Duration,
    /// Delay before every later redelivery.
    pub subsequent_nack_delay: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(60),
            delivery_limit: 3,
            initial_nack_delay: Duration::from_secs(1),
            subsequent_nack_delay: Duration::from_secs(30),
        }
    }
}

impl BrokerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.visibility_timeout.is_zero() {
            return Err(FlotillaError::InvalidConfig(
                "broker visibility timeout must be positive".to_string(),
            ));
        }
        if self.delivery_limit == 0 {
            return Err(FlotillaError::InvalidConfig(
                "broker delivery limit must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Execution-timeout sweeper settings.
#[derive(Debug, Clone)]
pub struct HousekeepingConfig {
    pub interval: Duration,
    pub workers: usize,
    /// Grace added on top of each task's own execution timeout.
    pub timeout_buffer: Duration,
}

impl Default for HousekeepingConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            workers: 2,
            timeout_buffer: Duration::from_secs(60),
        }
    }
}

impl HousekeepingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.interval.is_zero() {
            return Err(FlotillaError::InvalidConfig(
                "housekeeping interval must be positive".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(FlotillaError::InvalidConfig(
                "housekeeping needs at least one worker".to_string(),
            ));
        }
        Ok(())
    }
}

/// Scheduling worker pool settings.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub count: usize,
    /// Upper bound on a single blocking dequeue.
    pub dequeue_timeout: Duration,
    /// Pause after a failed dequeue before trying again.
    pub error_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 4,
            dequeue_timeout: Duration::from_secs(5),
            error_backoff: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 {
            return Err(FlotillaError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        if self.dequeue_timeout.is_zero() {
            return Err(FlotillaError::InvalidConfig(
                "worker dequeue timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Node-info publishing and liveness settings.
#[derive(Debug, Clone)]
pub struct NodeInfoConfig {
    /// How often compute nodes publish their snapshot.
    pub publish_interval: Duration,
    /// Upper bound of the random delay before the first publish.
    pub publish_jitter: Duration,
    /// A compute node not heard from for this long is considered lost.
    pub node_timeout: Duration,
    /// How often the orchestrator checks for lost nodes.
    pub monitor_interval: Duration,
}

impl Default for NodeInfoConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(10),
            publish_jitter: Duration::from_secs(1),
            node_timeout: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(15),
        }
    }
}

impl NodeInfoConfig {
    pub fn validate(&self) -> Result<()> {
        if self.publish_interval.is_zero() || self.monitor_interval.is_zero() {
            return Err(FlotillaError::InvalidConfig(
                "node info intervals must be positive".to_string(),
            ));
        }
        if self.node_timeout <= self.publish_interval {
            return Err(FlotillaError::InvalidConfig(
                "node timeout must exceed the publish interval".to_string(),
            ));
        }
        Ok(())
    }
}

/// Settings shared by transport substrates.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on a single proxy or callback call.
    pub call_timeout: Duration,
    /// Bound on waiting for in-flight calls during close.
    pub close_timeout: Duration,
    /// Buffered node-info messages per subscriber.
    pub pubsub_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(10),
            close_timeout: Duration::from_secs(5),
            pubsub_capacity: 256,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<()> {
        if self.call_timeout.is_zero() {
            return Err(FlotillaError::InvalidConfig(
                "transport call timeout must be positive".to_string(),
            ));
        }
        if self.pubsub_capacity == 0 {
            return Err(FlotillaError::InvalidConfig(
                "pubsub capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: String,
    pub dashboard_addr: Option<SocketAddr>,
    /// Bound on the whole ordered teardown after shutdown is signalled.
    pub shutdown_timeout: Duration,
    pub broker: BrokerConfig,
    pub housekeeping: HousekeepingConfig,
    pub workers: WorkerConfig,
    pub node_info: NodeInfoConfig,
    pub transport: TransportConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: "orchestrator-1".to_string(),
            dashboard_addr: None,
            shutdown_timeout: Duration::from_secs(10),
            broker: BrokerConfig::default(),
            housekeeping: HousekeepingConfig::default(),
            workers: WorkerConfig::default(),
            node_info: NodeInfoConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            ..Default::default()
        }
    }

    pub fn with_dashboard(mut self, addr: SocketAddr) -> Self {
        self.dashboard_addr = Some(addr);
        self
    }

    pub fn with_housekeeping(mut self, housekeeping: HousekeepingConfig) -> Self {
        self.housekeeping = housekeeping;
        self
    }

    pub fn with_broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn with_workers(mut self, workers: WorkerConfig) -> Self {
        self.workers = workers;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_id.trim().is_empty() {
            return Err(FlotillaError::InvalidConfig(
                "node id must not be empty".to_string(),
            ));
        }
        self.broker.validate()?;
        self.housekeeping.validate()?;
        self.workers.validate()?;
        self.node_info.validate()?;
        self.transport.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(NodeConfig::default().validate().is_ok());
    }

    #[test]
    fn housekeeping_config_default() {
        let cfg = HousekeepingConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(30));
        assert_eq!(cfg.workers, 2);
        assert_eq!(cfg.timeout_buffer, Duration::from_secs(60));
    }

    #[test]
    fn zero_housekeeping_interval_is_rejected() {
        let cfg = HousekeepingConfig {
            interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(matches!(
            cfg.validate(),
            Err(FlotillaError::InvalidConfig(_))
        ));
    }

    #[test]
    fn zero_workers_is_rejected() {
        let cfg = HousekeepingConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = WorkerConfig {
            count: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn broker_delivery_limit_must_be_positive() {
        let cfg = BrokerConfig {
            delivery_limit: 0,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_timeout_must_exceed_publish_interval() {
        let cfg = NodeInfoConfig {
            publish_interval: Duration::from_secs(10),
            node_timeout: Duration::from_secs(10),
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn node_config_builders() {
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();
        let cfg = NodeConfig::new("orch-a")
            .with_dashboard(addr)
            .with_workers(WorkerConfig {
                count: 8,
                ..Default::default()
            });
        assert_eq!(cfg.node_id, "orch-a");
        assert_eq!(cfg.dashboard_addr, Some(addr));
        assert_eq!(cfg.workers.count, 8);
    }

    #[test]
    fn empty_node_id_is_rejected() {
        assert!(NodeConfig::new("  ").validate().is_err());
    }
}
