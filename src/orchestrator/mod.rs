//! Evaluation-driven scheduling core.
//!
//! State changes become [`Evaluation`](crate::models::Evaluation)s that are
//! persisted in the job store and then queued in the [`broker`]. Scheduling
//! [`worker`]s lease them one job at a time. [`housekeeping`] and the
//! [`node_monitor`] raise evaluations for executions and nodes that went
//! quiet; the [`callback`] handler raises them for compute-node reports.

pub mod broker;
pub mod callback;
pub mod housekeeping;
mod lifecycle;
pub mod node_monitor;
pub mod submit;
pub mod worker;

pub use broker::{
    BrokerStats, EvaluationBroker, InMemoryEvaluationBroker, LeaseToken, LeasedEvaluation,
};
pub use callback::ExecutionCallbackHandler;
pub use housekeeping::{is_execution_expired, Housekeeping, HousekeepingParams, SweepReport};
pub use lifecycle::RunId;
pub use node_monitor::NodeMonitor;
pub use submit::JobSubmitter;
pub use worker::{Scheduler, Worker, WorkerPool, WorkerStats};
