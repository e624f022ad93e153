//! Jobs handed to workers and the runs recorded for them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::{Budget, ConfigId, Configuration};
use crate::errors::{EvaluationError, JobFailure};

/// Unique job identifier.
pub type JobId = Uuid;

/// Free-form auxiliary data attached to an evaluation.
pub type Info = serde_json::Map<String, serde_json::Value>;

/// Lifecycle of a single (configuration, budget) evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// What an objective returns: a scalar loss (lower is better) plus auxiliary info.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evaluation {
    pub loss: f64,
    #[serde(default)]
    pub info: Info,
}

impl Evaluation {
    pub fn new(loss: f64) -> Self {
        Self {
            loss,
            info: Info::new(),
        }
    }

    pub fn with_info(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.info.insert(key.into(), value);
        self
    }

    /// Reject NaN and infinite losses; they cannot be ranked.
    pub fn validated(self) -> Result<Self, EvaluationError> {
        if self.loss.is_finite() {
            Ok(self)
        } else {
            Err(EvaluationError::new(format!(
                "objective returned non-finite loss {}",
                self.loss
            )))
        }
    }
}

/// One unit of work: evaluate `configuration` at `budget`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub config_id: ConfigId,
    pub configuration: Configuration,
    pub budget: Budget,
    /// Opaque per-job data forwarded to the objective.
    #[serde(default)]
    pub extra: serde_json::Value,
    pub submitted_at: DateTime<Utc>,
}

impl Job {
    pub fn new(config_id: ConfigId, configuration: Configuration, budget: Budget) -> Self {
        Self {
            id: Uuid::new_v4(),
            config_id,
            configuration,
            budget,
            extra: serde_json::Value::Null,
            submitted_at: Utc::now(),
        }
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = extra;
        self
    }
}

/// Record of one (config id, budget) evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub config_id: ConfigId,
    pub budget: Budget,
    pub status: RunStatus,
    pub loss: Option<f64>,
    #[serde(default)]
    pub info: Info,
    pub error: Option<String>,
    pub worker_id: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn pending(config_id: ConfigId, budget: Budget) -> Self {
        Self {
            config_id,
            budget,
            status: RunStatus::Pending,
            loss: None,
            info: Info::new(),
            error: None,
            worker_id: None,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
        }
    }

    pub fn mark_running(&mut self, worker_id: Option<String>, at: DateTime<Utc>) {
        self.status = RunStatus::Running;
        self.started_at = Some(at);
        self.worker_id = worker_id;
    }

    pub fn mark_completed(&mut self, evaluation: Evaluation, finished_at: DateTime<Utc>) {
        self.status = RunStatus::Completed;
        self.loss = Some(evaluation.loss);
        self.info = evaluation.info;
        self.finished_at = Some(finished_at);
    }

    pub fn mark_failed(&mut self, failure: &JobFailure, finished_at: DateTime<Utc>) {
        self.status = RunStatus::Failed;
        self.error = Some(failure.to_string());
        self.finished_at = Some(finished_at);
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Loss of a successfully completed run.
    pub fn completed_loss(&self) -> Option<f64> {
        match self.status {
            RunStatus::Completed => self.loss,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_lifecycle() {
        let mut run = Run::pending(ConfigId::new(0, 2, 1), 4.0);
        assert_eq!(run.status, RunStatus::Pending);
        assert!(!run.is_terminal());

        run.mark_running(Some("worker-0".into()), Utc::now());
        assert_eq!(run.status, RunStatus::Running);
        assert_eq!(run.worker_id.as_deref(), Some("worker-0"));

        let evaluation = Evaluation::new(0.25).with_info("budget", serde_json::json!(4.0));
        run.mark_completed(evaluation, Utc::now());
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.completed_loss(), Some(0.25));
        assert!(run.finished_at.is_some());
        assert_eq!(run.info.get("budget"), Some(&serde_json::json!(4.0)));
    }

    #[test]
    fn failed_run_has_no_completed_loss() {
        let mut run = Run::pending(ConfigId::new(0, 0, 0), 1.0);
        run.mark_running(None, Utc::now());
        run.mark_failed(
            &JobFailure::Evaluation(EvaluationError::new("objective raised")),
            Utc::now(),
        );
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.is_terminal());
        assert_eq!(run.completed_loss(), None);
        assert!(run.error.as_deref().unwrap().contains("objective raised"));
    }

    #[test]
    fn non_finite_losses_are_rejected() {
        assert!(Evaluation::new(f64::NAN).validated().is_err());
        assert!(Evaluation::new(f64::INFINITY).validated().is_err());
        assert!(Evaluation::new(1.5).validated().is_ok());
    }

    #[test]
    fn job_round_trips_through_json() {
        let job = Job::new(
            ConfigId::new(0, 1, 2),
            Configuration::new().with("w", 1i64),
            2.5,
        )
        .with_extra(serde_json::json!({"seed": 7}));

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(job, back);
    }

    #[test]
    fn run_status_uses_snake_case() {
        let json = serde_json::to_string(&RunStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }
}
