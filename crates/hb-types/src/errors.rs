use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Main error type for the HalfBand system
#[derive(Error, Debug)]
pub enum HbError {
    #[error("Search space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Bracket error: {0}")]
    Bracket(#[from] BracketError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

/// Search-space definition errors
#[derive(Error, Debug)]
pub enum SpaceError {
    #[error("Unsupported search space format: {path} (expected a .pcs or .json file)")]
    UnsupportedFormat { path: String },

    #[error("Parse error on line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("Invalid search space: {message}")]
    Invalid { message: String },

    #[error("Unknown hyperparameter: {name}")]
    UnknownHyperparameter { name: String },
}

/// Service registry errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Registry unavailable at {address}: {reason}")]
    Unavailable { address: String, reason: String },

    #[error("Registry credentials not found: {path}")]
    CredentialsNotFound { path: String },

    #[error("Registry protocol error: {message}")]
    Protocol { message: String },

    #[error("Registry rejected request: {message}")]
    Rejected { message: String },
}

/// Job dispatch errors
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Insufficient workers: required {required}, available {available} after waiting {waited:?}")]
    InsufficientWorkers {
        required: usize,
        available: usize,
        waited: Duration,
    },

    #[error("Rung barrier timed out after {waited:?} with {outstanding} jobs outstanding")]
    BarrierTimeout { outstanding: usize, waited: Duration },

    #[error("Dispatcher is shut down")]
    ShutDown,
}

/// Worker transport errors (as seen from the dispatcher or a worker process)
#[derive(Error, Debug, Clone, PartialEq)]
pub enum WorkerError {
    #[error("Worker {worker_id} unreachable: {message}")]
    Unreachable { worker_id: String, message: String },

    #[error("Worker {worker_id} lost connection mid-job: {message}")]
    Lost { worker_id: String, message: String },

    #[error("Worker protocol error: {message}")]
    Protocol { message: String },

    #[error("Worker failed to bind {address}: {message}")]
    Bind { address: String, message: String },
}

/// The user-supplied objective failed for one configuration.
///
/// Always isolated to a single run; never fatal to the session.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[error("Evaluation failed: {message}")]
pub struct EvaluationError {
    pub message: String,
}

impl EvaluationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Why a dispatched job ended without a loss.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum JobFailure {
    #[error("{0}")]
    Evaluation(EvaluationError),

    #[error("worker {worker_id} lost: {message}")]
    WorkerLost { worker_id: String, message: String },

    #[error("job timed out after {seconds:.1}s on worker {worker_id}")]
    TimedOut { worker_id: String, seconds: f64 },

    #[error("job abandoned: {reason}")]
    Abandoned { reason: String },
}

impl From<EvaluationError> for JobFailure {
    fn from(err: EvaluationError) -> Self {
        JobFailure::Evaluation(err)
    }
}

/// Successive-halving bracket errors
#[derive(Error, Debug)]
pub enum BracketError {
    #[error("No successful runs at rung {rung} (budget {budget}) of bracket {bracket} in iteration {iteration}; cannot promote")]
    PromotionImpossible {
        iteration: usize,
        bracket: usize,
        rung: usize,
        budget: f64,
    },

    #[error("Invalid bracket index {bracket}: engine has {max_rungs} rungs")]
    InvalidBracket { bracket: usize, max_rungs: usize },

    #[error("Rung {rung} out of range for bracket with {rungs} rungs")]
    InvalidRung { rung: usize, rungs: usize },

    #[error("Config {config_id} is not a member of rung {rung}")]
    NotAMember { config_id: String, rung: usize },
}

/// Result type alias for HalfBand operations
pub type HbResult<T> = Result<T, HbError>;

/// Helper trait for converting string errors
pub trait IntoHbError {
    fn into_hb_error(self) -> HbError;
}

impl IntoHbError for String {
    fn into_hb_error(self) -> HbError {
        HbError::Internal(self)
    }
}

impl IntoHbError for &str {
    fn into_hb_error(self) -> HbError {
        HbError::Internal(self.to_string())
    }
}

/// Macro for creating validation errors
#[macro_export]
macro_rules! validation_error {
    ($($arg:tt)*) => {
        $crate::HbError::Validation(format!($($arg)*))
    };
}

/// Macro for creating internal errors
#[macro_export]
macro_rules! internal_error {
    ($($arg:tt)*) => {
        $crate::HbError::Internal(format!($($arg)*))
    };
}

/// Macro for creating configuration errors
#[macro_export]
macro_rules! config_error {
    ($($arg:tt)*) => {
        $crate::HbError::Config(format!($($arg)*))
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = DispatchError::InsufficientWorkers {
            required: 2,
            available: 1,
            waited: Duration::from_secs(5),
        };

        assert!(error.to_string().contains("Insufficient workers"));
        assert!(error.to_string().contains("required 2"));
        assert!(error.to_string().contains("available 1"));
    }

    #[test]
    fn test_error_conversion() {
        let space_error = SpaceError::UnsupportedFormat {
            path: "space.yaml".to_string(),
        };
        let hb_error: HbError = space_error.into();

        match hb_error {
            HbError::Space(SpaceError::UnsupportedFormat { path }) => assert_eq!(path, "space.yaml"),
            _ => panic!("Expected Space error"),
        }
    }

    #[test]
    fn test_job_failure_from_evaluation() {
        let failure: JobFailure = EvaluationError::new("division by zero").into();
        assert_eq!(failure.to_string(), "Evaluation failed: division by zero");

        let timed_out = JobFailure::TimedOut {
            worker_id: "w-1".into(),
            seconds: 2.5,
        };
        assert_eq!(timed_out.to_string(), "job timed out after 2.5s on worker w-1");
    }

    #[test]
    fn test_macros() {
        let validation_err = validation_error!("eta must be >= 2, got {}", 1.5);
        assert!(matches!(validation_err, HbError::Validation(_)));
        let _internal_err = internal_error!("Something went wrong");
        let _config_err = config_error!("Missing required field: {}", "max_budget");
    }
}
