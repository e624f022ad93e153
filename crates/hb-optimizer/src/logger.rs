//! JSON-lines persistence of a session's results.
//!
//! A result directory holds `configs.json` (one line per sampled
//! configuration), `results.json` (one line per terminal run) and a copy of
//! the search space as `configspace.pcs` or `configspace.json`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use hb_space::{write_space_file, SearchSpace, SpaceFormat};
use hb_types::{config_error, validation_error, HbResult, Run};
use serde::Serialize;
use tracing::{debug, info};

use crate::results::{ConfigRecord, ResultSink, ResultStore};

pub const CONFIGS_FILE: &str = "configs.json";
pub const RESULTS_FILE: &str = "results.json";
pub const SPACE_FILE_STEM: &str = "configspace";

/// Appends flushed results to the two logs of a result directory.
pub struct JsonResultLogger {
    directory: PathBuf,
    configs: BufWriter<File>,
    results: BufWriter<File>,
}

impl JsonResultLogger {
    /// Create (or with `overwrite`, truncate) the logs in `directory`.
    ///
    /// Refuses to touch existing logs unless `overwrite` is set.
    pub fn new(directory: impl AsRef<Path>, overwrite: bool) -> HbResult<Self> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let configs_path = directory.join(CONFIGS_FILE);
        let results_path = directory.join(RESULTS_FILE);
        if !overwrite {
            for path in [&configs_path, &results_path] {
                if path.exists() {
                    return Err(config_error!(
                        "{} already exists; enable overwrite to replace it",
                        path.display()
                    ));
                }
            }
        }

        let configs = BufWriter::new(open_log(&configs_path)?);
        let results = BufWriter::new(open_log(&results_path)?);
        info!(directory = %directory.display(), "logging results");

        Ok(Self {
            directory,
            configs,
            results,
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Save a copy of the search space next to the logs.
    pub fn write_space(&self, space: &SearchSpace, format: SpaceFormat) -> HbResult<PathBuf> {
        let path = self
            .directory
            .join(format!("{SPACE_FILE_STEM}.{}", format.extension()));
        write_space_file(space, &path)?;
        debug!(path = %path.display(), "wrote search space");
        Ok(path)
    }
}

fn open_log(path: &Path) -> HbResult<File> {
    Ok(OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?)
}

fn write_line<T: Serialize>(writer: &mut BufWriter<File>, value: &T) -> HbResult<()> {
    serde_json::to_writer(&mut *writer, value)?;
    writer.write_all(b"\n")?;
    Ok(())
}

impl ResultSink for JsonResultLogger {
    fn new_config(&mut self, record: &ConfigRecord) -> HbResult<()> {
        write_line(&mut self.configs, record)
    }

    fn run_finished(&mut self, run: &Run) -> HbResult<()> {
        write_line(&mut self.results, run)
    }

    fn sync(&mut self) -> HbResult<()> {
        self.configs.flush()?;
        self.results.flush()?;
        Ok(())
    }
}

/// Rebuild a [`ResultStore`] from the logs in `directory`.
///
/// Everything loaded counts as already flushed.
pub fn load_results(directory: impl AsRef<Path>) -> HbResult<ResultStore> {
    let directory = directory.as_ref();
    let mut store = ResultStore::new();

    for (line_no, line) in read_lines(&directory.join(CONFIGS_FILE))? {
        let record: ConfigRecord = serde_json::from_str(&line).map_err(|e| {
            validation_error!("{CONFIGS_FILE} line {line_no}: {e}")
        })?;
        store.insert_config(record);
    }

    for (line_no, line) in read_lines(&directory.join(RESULTS_FILE))? {
        let run: Run = serde_json::from_str(&line).map_err(|e| {
            validation_error!("{RESULTS_FILE} line {line_no}: {e}")
        })?;
        let configuration = store.configuration(run.config_id).cloned().ok_or_else(|| {
            validation_error!(
                "{RESULTS_FILE} line {line_no}: unknown config {}",
                run.config_id
            )
        })?;
        store.record(run.config_id, &configuration, run);
    }

    store.mark_flushed();
    info!(
        directory = %directory.display(),
        configs = store.config_count(),
        runs = store.run_count(),
        "loaded results"
    );
    Ok(store)
}

/// Non-blank lines with their 1-based line numbers.
fn read_lines(path: &Path) -> HbResult<Vec<(usize, String)>> {
    let reader = BufReader::new(File::open(path)?);
    let mut lines = Vec::new();
    for (i, line) in reader.lines().enumerate() {
        let line = line?;
        if !line.trim().is_empty() {
            lines.push((i + 1, line));
        }
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use hb_types::{ConfigId, Configuration, Evaluation, EvaluationError, HbError, JobFailure, RunStatus};
    use tempfile::TempDir;

    fn populated_store() -> ResultStore {
        let mut store = ResultStore::new();
        let now = chrono::Utc::now();
        for (seq, w) in [(0usize, 1i64), (1, 2), (2, 3)] {
            let id = ConfigId::new(0, 0, seq);
            let config = Configuration::new().with("w", w);
            store.record(id, &config, Run::pending(id, 1.0));
        }
        store
            .finish(ConfigId::new(0, 0, 0), 1.0, Ok(Evaluation::new(0.0)), now)
            .unwrap();
        store
            .finish(
                ConfigId::new(0, 0, 1),
                1.0,
                Err(JobFailure::Evaluation(EvaluationError::new("nope"))),
                now,
            )
            .unwrap();
        store
    }

    #[test]
    fn logs_round_trip_through_load() {
        let dir = TempDir::new().unwrap();
        let mut store = populated_store();
        {
            let mut logger = JsonResultLogger::new(dir.path(), false).unwrap();
            assert_eq!(store.flush(&mut logger).unwrap(), 5);
        }

        let configs = fs::read_to_string(dir.path().join(CONFIGS_FILE)).unwrap();
        assert_eq!(configs.lines().count(), 3);
        assert!(configs.lines().next().unwrap().contains("\"config_id\":[0,0,0]"));

        let loaded = load_results(dir.path()).unwrap();
        assert_eq!(loaded.config_count(), 3);
        // the pending run was never written
        assert_eq!(loaded.run_count(), 2);
        assert_eq!(loaded.count_with_status(RunStatus::Failed), 1);
        assert_eq!(loaded.incumbent().unwrap().config_id, ConfigId::new(0, 0, 0));
        assert_eq!(loaded.unflushed(), 0);
    }

    #[test]
    fn existing_logs_are_protected() {
        let dir = TempDir::new().unwrap();
        drop(JsonResultLogger::new(dir.path(), false).unwrap());

        match JsonResultLogger::new(dir.path(), false) {
            Err(HbError::Config(message)) => assert!(message.contains("overwrite")),
            other => panic!("expected a config error, got {:?}", other.map(|_| ())),
        }
        assert!(JsonResultLogger::new(dir.path(), true).is_ok());
    }

    #[test]
    fn space_copy_uses_the_chosen_format() {
        let dir = TempDir::new().unwrap();
        let logger = JsonResultLogger::new(dir.path().join("nested"), false).unwrap();
        let space = SearchSpace::new().add_int("w", -3, 3);

        let path = logger.write_space(&space, SpaceFormat::Json).unwrap();
        assert_eq!(path.file_name().unwrap(), "configspace.json");
        let back = hb_space::read_space(&path).unwrap();
        assert_eq!(back, space);
    }

    #[test]
    fn results_for_unknown_configs_are_rejected() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIGS_FILE), "").unwrap();
        let mut run = Run::pending(ConfigId::new(3, 0, 0), 1.0);
        run.mark_completed(Evaluation::new(1.0), chrono::Utc::now());
        fs::write(
            dir.path().join(RESULTS_FILE),
            format!("{}\n", serde_json::to_string(&run).unwrap()),
        )
        .unwrap();

        assert!(matches!(load_results(dir.path()), Err(HbError::Validation(_))));
    }
}
