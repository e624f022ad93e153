//! Objectives backed by an external executable.

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;

use hb_types::{Budget, Configuration, Evaluation, EvaluationError, Info};
use hb_worker::Objective;
use serde_json::Value;
use tracing::debug;

/// Runs `<program> <args..> --budget <b> --<name> <value>..` once per job.
///
/// The last non-empty stdout line is the result: either a bare number or a
/// JSON object `{"loss": .., "info": {..}}`.
#[derive(Debug, Clone)]
pub struct CommandObjective {
    program: PathBuf,
    args: Vec<String>,
}

impl CommandObjective {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    fn command_line(&self, configuration: &Configuration, budget: Budget) -> Vec<String> {
        let mut line = self.args.clone();
        line.push("--budget".to_string());
        line.push(budget.to_string());
        for (name, value) in configuration.iter() {
            line.push(format!("--{name}"));
            line.push(value.to_string());
        }
        line
    }
}

impl Objective for CommandObjective {
    fn evaluate(
        &self,
        configuration: &Configuration,
        budget: Budget,
        _extra: &Value,
    ) -> Result<Evaluation, EvaluationError> {
        let args = self.command_line(configuration, budget);
        let started = Instant::now();
        let output = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                EvaluationError::new(format!("cannot run {}: {e}", self.program.display()))
            })?;
        debug!(
            program = %self.program.display(),
            budget,
            status = %output.status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "objective exited"
        );

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let tail = stderr.lines().last().unwrap_or("").trim();
            return Err(EvaluationError::new(format!(
                "{} exited with {}: {tail}",
                self.program.display(),
                output.status
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let last = stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .ok_or_else(|| EvaluationError::new("objective printed nothing"))?;
        parse_result(last)
    }
}

/// Parse one result line.
pub fn parse_result(line: &str) -> Result<Evaluation, EvaluationError> {
    if let Ok(loss) = line.parse::<f64>() {
        return Evaluation::new(loss).validated();
    }

    let value: Value = serde_json::from_str(line)
        .map_err(|_| EvaluationError::new(format!("unparsable objective output: {line}")))?;
    let loss = value
        .get("loss")
        .and_then(Value::as_f64)
        .ok_or_else(|| EvaluationError::new(format!("no numeric \"loss\" in {line}")))?;
    let info: Info = match value.get("info") {
        None | Some(Value::Null) => Info::new(),
        Some(Value::Object(map)) => map.clone(),
        Some(other) => {
            return Err(EvaluationError::new(format!(
                "\"info\" must be an object, got {other}"
            )))
        }
    };
    Evaluation { loss, info }.validated()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_numbers_and_json_objects() {
        assert_eq!(parse_result("0.25").unwrap().loss, 0.25);

        let evaluation = parse_result(r#"{"loss": 1.5, "info": {"accuracy": 0.9}}"#).unwrap();
        assert_eq!(evaluation.loss, 1.5);
        assert_eq!(evaluation.info["accuracy"], serde_json::json!(0.9));

        assert!(parse_result(r#"{"loss": 2}"#).unwrap().info.is_empty());
    }

    #[test]
    fn bad_output_is_an_evaluation_error() {
        assert!(parse_result("done").is_err());
        assert!(parse_result(r#"{"accuracy": 0.9}"#).is_err());
        assert!(parse_result(r#"{"loss": "low"}"#).is_err());
        assert!(parse_result(r#"{"loss": 1, "info": [1]}"#).is_err());
        assert!(parse_result("NaN").is_err());
        assert!(parse_result("inf").is_err());
    }

    #[test]
    fn arguments_follow_the_fixed_ones() {
        let objective = CommandObjective::new("train", vec!["--epochs-per-unit".into(), "3".into()]);
        let configuration = Configuration::new().with("lr", 0.5).with("layers", 2i64);
        assert_eq!(
            objective.command_line(&configuration, 2.5),
            vec!["--epochs-per-unit", "3", "--budget", "2.5", "--layers", "2", "--lr", "0.5"]
        );
    }

    #[cfg(unix)]
    mod process {
        use super::*;

        fn shell(script: &str) -> CommandObjective {
            // `sh -c <script> <name> <args..>`: the generated flags land in $@
            CommandObjective::new("sh", vec!["-c".into(), script.into(), "objective".into()])
        }

        #[test]
        fn last_stdout_line_is_the_loss() {
            let objective = shell(r#"echo "epoch 1"; echo "$2""#);
            let configuration = Configuration::new().with("w", 3i64);
            let evaluation = objective
                .evaluate(&configuration, 4.0, &Value::Null)
                .unwrap();
            assert_eq!(evaluation.loss, 4.0);
        }

        #[test]
        fn failing_program_reports_stderr() {
            let objective = shell("echo 'out of memory' >&2; exit 3");
            let err = objective
                .evaluate(&Configuration::new(), 1.0, &Value::Null)
                .unwrap_err();
            assert!(err.message.contains("out of memory"), "{}", err.message);
        }

        #[test]
        fn missing_program_is_an_evaluation_error() {
            let objective = CommandObjective::new("/nonexistent/objective", Vec::new());
            let err = objective
                .evaluate(&Configuration::new(), 1.0, &Value::Null)
                .unwrap_err();
            assert!(err.message.contains("cannot run"));
        }
    }
}
