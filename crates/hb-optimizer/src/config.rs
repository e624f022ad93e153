//! Session parameters and run status tracking.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hb_space::SpaceFormat;
use hb_types::{validation_error, HbResult, Run, RunStatus};
use hb_worker::{DispatcherConfig, TimeoutPolicy};
use serde::{Deserialize, Serialize};

/// Top-level configuration for an optimization session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    /// Namespace shared by the name server, the workers and the master.
    pub run_id: String,

    pub min_budget: f64,
    pub max_budget: f64,

    /// Downsampling ratio between rungs.
    pub eta: f64,

    /// Full Hyperband cycles (each runs every bracket once).
    pub num_iterations: usize,

    /// Workers required before the first bracket starts.
    pub min_n_workers: usize,

    /// How long to wait for `min_n_workers`; `None` waits forever.
    pub worker_wait_timeout: Option<Duration>,

    /// Limit for one rung barrier; `None` waits forever.
    pub rung_timeout: Option<Duration>,

    /// Limit for a single job on a worker.
    pub job_timeout: Option<Duration>,

    /// What a worker-wait or rung timeout does.
    pub timeout_policy: TimeoutPolicy,

    /// Where results are logged. Nothing is persisted when unset.
    pub output_dir: Option<PathBuf>,

    /// Format of the search-space copy in `output_dir`.
    pub space_format: SpaceFormat,

    /// Replace existing logs in `output_dir`.
    pub overwrite: bool,

    /// Seed for the default sampler.
    pub seed: Option<u64>,

    /// How often the registry is re-read while waiting.
    pub poll_interval: Duration,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            run_id: "halfband".to_string(),
            min_budget: 2.0,
            max_budget: 4.0,
            eta: 2.0,
            num_iterations: 1,
            min_n_workers: 1,
            worker_wait_timeout: Some(Duration::from_secs(60)),
            rung_timeout: None,
            job_timeout: None,
            timeout_policy: TimeoutPolicy::Abort,
            output_dir: None,
            space_format: SpaceFormat::Pcs,
            overwrite: false,
            seed: None,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl OptimizerConfig {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn with_budgets(mut self, min_budget: f64, max_budget: f64) -> Self {
        self.min_budget = min_budget;
        self.max_budget = max_budget;
        self
    }

    pub fn with_eta(mut self, eta: f64) -> Self {
        self.eta = eta;
        self
    }

    pub fn with_iterations(mut self, n: usize) -> Self {
        self.num_iterations = n;
        self
    }

    pub fn with_min_workers(mut self, n: usize, wait: Option<Duration>) -> Self {
        self.min_n_workers = n;
        self.worker_wait_timeout = wait;
        self
    }

    pub fn with_rung_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.rung_timeout = timeout;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_timeout_policy(mut self, policy: TimeoutPolicy) -> Self {
        self.timeout_policy = policy;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>, format: SpaceFormat) -> Self {
        self.output_dir = Some(dir.into());
        self.space_format = format;
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_seed(mut self, seed: Option<u64>) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn validate(&self) -> HbResult<()> {
        if self.run_id.trim().is_empty() {
            return Err(validation_error!("run_id must not be empty"));
        }
        if !(self.eta.is_finite() && self.eta >= 2.0) {
            return Err(validation_error!("eta must be at least 2, got {}", self.eta));
        }
        if !(self.min_budget.is_finite() && self.min_budget > 0.0) {
            return Err(validation_error!(
                "min_budget must be positive, got {}",
                self.min_budget
            ));
        }
        if !self.max_budget.is_finite() || self.max_budget < self.min_budget {
            return Err(validation_error!(
                "max_budget {} must not be below min_budget {}",
                self.max_budget,
                self.min_budget
            ));
        }
        if self.num_iterations == 0 {
            return Err(validation_error!("num_iterations must be at least 1"));
        }
        if self.min_n_workers == 0 {
            return Err(validation_error!("min_n_workers must be at least 1"));
        }
        Ok(())
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig::new(self.run_id.clone())
            .with_poll_interval(self.poll_interval)
            .with_job_timeout(self.job_timeout)
    }
}

/// Lifecycle state for an optimization session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

/// Aggregate status of an optimization session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationStatus {
    pub run_id: String,
    pub state: OptimizationState,
    pub runs_completed: usize,
    pub runs_failed: usize,
    pub brackets_completed: usize,
    pub brackets_skipped: usize,
    pub best_loss: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl OptimizationStatus {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            state: OptimizationState::Pending,
            runs_completed: 0,
            runs_failed: 0,
            brackets_completed: 0,
            brackets_skipped: 0,
            best_loss: None,
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.state = OptimizationState::Running;
        self.started_at = Some(Utc::now());
    }

    pub fn mark_completed(&mut self) {
        self.state = OptimizationState::Completed;
        self.finished_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.state = OptimizationState::Failed;
        self.finished_at = Some(Utc::now());
        self.error = Some(error);
    }

    pub fn mark_cancelled(&mut self) {
        self.state = OptimizationState::Cancelled;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_finished(&self) -> bool {
        matches!(
            self.state,
            OptimizationState::Completed | OptimizationState::Failed | OptimizationState::Cancelled
        )
    }

    /// Count a terminal run and track the lowest loss seen.
    pub fn record_run(&mut self, run: &Run) {
        match run.status {
            RunStatus::Completed => {
                self.runs_completed += 1;
                if let Some(loss) = run.loss {
                    if self.best_loss.map_or(true, |best| loss < best) {
                        self.best_loss = Some(loss);
                    }
                }
            }
            RunStatus::Failed => self.runs_failed += 1,
            RunStatus::Pending | RunStatus::Running => {}
        }
    }
}
