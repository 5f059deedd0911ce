use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::FlotillaError;
use crate::models::job::{Job, JobType};

/// Why an evaluation was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvalTrigger {
    JobRegister,
    JobCancel,
    ExecFailure,
    ExecUpdate,
    ExecTimeout,
    NodeFailure,
}

impl EvalTrigger {
    pub const ALL: [EvalTrigger; 6] = [
        EvalTrigger::JobRegister,
        EvalTrigger::JobCancel,
        EvalTrigger::ExecFailure,
        EvalTrigger::ExecUpdate,
        EvalTrigger::ExecTimeout,
        EvalTrigger::NodeFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EvalTrigger::JobRegister => "job-register",
            EvalTrigger::JobCancel => "job-cancel",
            EvalTrigger::ExecFailure => "exec-failure",
            EvalTrigger::ExecUpdate => "exec-update",
            EvalTrigger::ExecTimeout => "exec-timeout",
            EvalTrigger::NodeFailure => "node-failure",
        }
    }
}

impl std::fmt::Display for EvalTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EvalTrigger {
    type Err = FlotillaError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EvalTrigger::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| FlotillaError::UnknownVariant {
                kind: "evaluation trigger",
                value: s.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvalStatus {
    Pending,
    Complete,
    Failed,
    Cancelled,
}

impl std::fmt::Display for EvalStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EvalStatus::Pending => write!(f, "pending"),
            EvalStatus::Complete => write!(f, "complete"),
            EvalStatus::Failed => write!(f, "failed"),
            EvalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub id: Uuid,
    pub job_id: Uuid,
    pub namespace: String,
    /// Copied from the job so workers can route without a store lookup.
    pub job_type: JobType,
    pub triggered_by: EvalTrigger,
    pub priority: i32,
    pub status: EvalStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub create_time: DateTime<Utc>,
    pub modify_time: DateTime<Utc>,
}

impl Evaluation {
    pub fn for_job(job: &Job, triggered_by: EvalTrigger) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_id: job.id,
            namespace: job.namespace.clone(),
            job_type: job.job_type,
            triggered_by,
            priority: 0,
            status: EvalStatus::Pending,
            comment: None,
            create_time: now,
            modify_time: now,
        }
    }

    pub fn with_comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Rejects evaluations the broker cannot route.
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.id.is_nil() {
            return Err(FlotillaError::InvalidEvaluation(
                "missing evaluation id".to_string(),
            ));
        }
        if self.job_id.is_nil() {
            return Err(FlotillaError::InvalidEvaluation(format!(
                "evaluation {} is missing a job id",
                self.id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::job::Task;

    #[test]
    fn trigger_names_round_trip_through_display() {
        for trigger in EvalTrigger::ALL {
            assert_eq!(trigger.to_string().parse::<EvalTrigger>().unwrap(), trigger);
        }
        assert_eq!(
            serde_json::to_string(&EvalTrigger::ExecTimeout).unwrap(),
            "\"exec-timeout\""
        );
        assert!("exec_timeout".parse::<EvalTrigger>().is_err());
    }

    #[test]
    fn evaluation_copies_job_routing_fields() {
        let job = Job::new("svc", JobType::Ops, vec![Task::new("main", "docker")]);
        let eval = Evaluation::for_job(&job, EvalTrigger::ExecTimeout);
        assert_eq!(eval.job_id, job.id);
        assert_eq!(eval.job_type, JobType::Ops);
        assert_eq!(eval.namespace, job.namespace);
        assert_eq!(eval.status, EvalStatus::Pending);
        assert!(eval.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_job_id() {
        let job = Job::new("svc", JobType::Batch, vec![]);
        let mut eval = Evaluation::for_job(&job, EvalTrigger::JobRegister);
        eval.job_id = Uuid::nil();
        assert!(matches!(
            eval.validate(),
            Err(FlotillaError::InvalidEvaluation(_))
        ));
    }
}
