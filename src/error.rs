use thiserror::Error;
use uuid::Uuid;

use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum FlotillaError {
    #[error("Invalid evaluation: {0}")]
    InvalidEvaluation(String),

    #[error("Invalid job: {0}")]
    InvalidJob(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown {kind} value: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Evaluation broker is closed")]
    BrokerClosed,

    #[error("Lease not found: {0}")]
    LeaseNotFound(Uuid),

    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Job already exists: {0}")]
    JobExists(Uuid),

    #[error("Execution not found: {0}")]
    ExecutionNotFound(Uuid),

    #[error("Execution already exists: {0}")]
    ExecutionExists(Uuid),

    #[error("Evaluation not found: {0}")]
    EvaluationNotFound(Uuid),

    #[error("Conflicting update for {id}: {reason}")]
    Conflict { id: Uuid, reason: String },

    #[error("Store error: {0}")]
    Store(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl FlotillaError {
    /// Whether retrying the failed operation on a later cycle may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            FlotillaError::Store(_) => true,
            FlotillaError::Transport(e) => e.is_transient(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, FlotillaError>;
