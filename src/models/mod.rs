//! Orchestrator data model.
//!
//! Jobs own executions (one per attempt on a compute node) and evaluations
//! (queued requests to reconsider a job's placement). The job store is the
//! only writer of these records; everything else works on copies.

pub mod evaluation;
pub mod execution;
pub mod job;
pub mod node;

pub use evaluation::{EvalStatus, EvalTrigger, Evaluation};
pub use execution::{ComputeState, Execution, ExecutionDesiredState, ExecutionStateType};
pub use job::{Job, JobState, JobType, Task, TaskTimeouts};
pub use node::{ComputeNodeInfo, NodeInfo, NodeType, Resources};
