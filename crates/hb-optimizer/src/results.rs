//! Append-only record of every configuration and run of a session.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use hb_types::{
    validation_error, Budget, ConfigId, Configuration, Evaluation, HbResult, JobFailure, Run,
    RunStatus,
};
use serde::{Deserialize, Serialize};

use crate::bracket::rank_completed;

/// A sampled configuration, as persisted on first sight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub config_id: ConfigId,
    pub configuration: Configuration,
    pub sampled_at: DateTime<Utc>,
}

/// Destination for flushed results.
pub trait ResultSink {
    fn new_config(&mut self, record: &ConfigRecord) -> HbResult<()>;

    fn run_finished(&mut self, run: &Run) -> HbResult<()>;

    /// Make everything written so far durable.
    fn sync(&mut self) -> HbResult<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JournalEntry {
    Config(ConfigId),
    Run { config_id: ConfigId, index: usize },
}

/// One point of the incumbent trajectory.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub timestamp: DateTime<Utc>,
    pub loss: f64,
    pub config_id: ConfigId,
    pub budget: Budget,
}

/// Best-loss-so-far over completed runs in completion order.
///
/// Only strict improvements are yielded. Clone it to replay from the start.
#[derive(Debug, Clone)]
pub struct Trajectory<'a> {
    runs: std::vec::IntoIter<&'a Run>,
    best: Option<f64>,
}

impl Iterator for Trajectory<'_> {
    type Item = TrajectoryPoint;

    fn next(&mut self) -> Option<Self::Item> {
        for run in self.runs.by_ref() {
            let (Some(loss), Some(timestamp)) = (run.completed_loss(), run.finished_at) else {
                continue;
            };
            if self.best.is_some_and(|best| loss >= best) {
                continue;
            }
            self.best = Some(loss);
            return Some(TrajectoryPoint {
                timestamp,
                loss,
                config_id: run.config_id,
                budget: run.budget,
            });
        }
        None
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResultStore {
    configs: BTreeMap<ConfigId, ConfigRecord>,
    runs: BTreeMap<ConfigId, Vec<Run>>,
    journal: Vec<JournalEntry>,
    /// Journal entries already handed to a sink.
    flushed: usize,
}

impl ResultStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remember a configuration. Returns `false` if the id was already known.
    pub fn discover(&mut self, config_id: ConfigId, configuration: &Configuration) -> bool {
        if self.configs.contains_key(&config_id) {
            return false;
        }
        self.configs.insert(
            config_id,
            ConfigRecord {
                config_id,
                configuration: configuration.clone(),
                sampled_at: Utc::now(),
            },
        );
        self.journal.push(JournalEntry::Config(config_id));
        true
    }

    /// Append `run`. Submitting the same (config, budget) twice appends twice.
    pub fn record(&mut self, config_id: ConfigId, configuration: &Configuration, run: Run) {
        self.discover(config_id, configuration);
        let runs = self.runs.entry(config_id).or_default();
        let terminal = run.is_terminal();
        runs.push(run);
        if terminal {
            self.journal.push(JournalEntry::Run {
                config_id,
                index: runs.len() - 1,
            });
        }
    }

    /// Flag the open run of `config_id` at `budget` as started.
    pub fn mark_running(
        &mut self,
        config_id: ConfigId,
        budget: Budget,
        worker_id: Option<String>,
        at: DateTime<Utc>,
    ) -> HbResult<()> {
        let (_, run) = self.open_run(config_id, budget)?;
        run.mark_running(worker_id, at);
        Ok(())
    }

    /// Move the open run of `config_id` at `budget` to its terminal state.
    pub fn finish(
        &mut self,
        config_id: ConfigId,
        budget: Budget,
        result: Result<Evaluation, JobFailure>,
        finished_at: DateTime<Utc>,
    ) -> HbResult<&Run> {
        let (index, run) = self.open_run(config_id, budget)?;
        match result {
            Ok(evaluation) => run.mark_completed(evaluation, finished_at),
            Err(failure) => run.mark_failed(&failure, finished_at),
        }
        self.journal.push(JournalEntry::Run { config_id, index });
        Ok(&self.runs[&config_id][index])
    }

    fn open_run(&mut self, config_id: ConfigId, budget: Budget) -> HbResult<(usize, &mut Run)> {
        self.runs
            .get_mut(&config_id)
            .and_then(|runs| {
                runs.iter_mut()
                    .enumerate()
                    .rev()
                    .find(|(_, run)| run.budget == budget && !run.is_terminal())
            })
            .ok_or_else(|| validation_error!("no open run for config {config_id} at budget {budget}"))
    }

    /// Every run, grouped by config id in ascending order.
    pub fn runs(&self) -> impl Iterator<Item = &Run> {
        self.runs.values().flatten()
    }

    pub fn runs_for(&self, config_id: ConfigId) -> &[Run] {
        self.runs.get(&config_id).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn configuration(&self, config_id: ConfigId) -> Option<&Configuration> {
        self.configs.get(&config_id).map(|r| &r.configuration)
    }

    pub fn configs(&self) -> impl Iterator<Item = &ConfigRecord> {
        self.configs.values()
    }

    pub fn config_count(&self) -> usize {
        self.configs.len()
    }

    pub fn run_count(&self) -> usize {
        self.runs.values().map(Vec::len).sum()
    }

    pub fn count_with_status(&self, status: RunStatus) -> usize {
        self.runs().filter(|run| run.status == status).count()
    }

    /// The lowest-loss completed run at any budget. Ties go to the higher
    /// budget, then the earlier completion.
    pub fn best_run_overall(&self) -> Option<&Run> {
        self.runs()
            .filter(|run| run.completed_loss().is_some())
            .min_by(|a, b| {
                let loss = |run: &Run| run.loss.unwrap_or(f64::INFINITY);
                loss(a)
                    .total_cmp(&loss(b))
                    .then_with(|| b.budget.total_cmp(&a.budget))
                    .then_with(|| a.finished_at.cmp(&b.finished_at))
            })
    }

    /// The best configuration judged at the highest budget any
    /// configuration completed.
    ///
    /// Each configuration is represented by its best completed run at the
    /// highest budget it reached; among those, the highest budget wins and
    /// the lowest loss breaks ties.
    pub fn incumbent(&self) -> Option<&Run> {
        self.runs
            .values()
            .filter_map(|runs| {
                let top = runs
                    .iter()
                    .filter(|run| run.completed_loss().is_some())
                    .map(|run| run.budget)
                    .fold(None, |acc: Option<Budget>, b| Some(acc.map_or(b, |a| a.max(b))))?;
                rank_completed(runs.iter().filter(|run| run.budget == top))
                    .first()
                    .copied()
            })
            .min_by(|a, b| {
                b.budget
                    .total_cmp(&a.budget)
                    .then_with(|| {
                        let loss = |run: &Run| run.loss.unwrap_or(f64::INFINITY);
                        loss(a).total_cmp(&loss(b))
                    })
                    .then_with(|| a.finished_at.cmp(&b.finished_at))
            })
    }

    /// Lowest completed loss among runs with budget at least `threshold`.
    pub fn best_loss_at_or_above(&self, threshold: Budget) -> Option<f64> {
        self.runs()
            .filter(|run| run.budget >= threshold)
            .filter_map(Run::completed_loss)
            .min_by(f64::total_cmp)
    }

    pub fn incumbent_trajectory(&self) -> Trajectory<'_> {
        let mut completed: Vec<&Run> = self
            .runs()
            .filter(|run| run.completed_loss().is_some() && run.finished_at.is_some())
            .collect();
        completed.sort_by(|a, b| {
            a.finished_at
                .cmp(&b.finished_at)
                .then_with(|| a.config_id.cmp(&b.config_id))
        });
        Trajectory {
            runs: completed.into_iter(),
            best: None,
        }
    }

    /// Journal entries not yet handed to a sink.
    pub fn unflushed(&self) -> usize {
        self.journal.len() - self.flushed
    }

    /// Write every new configuration and terminal run to `sink`, in the
    /// order they happened. Entries that fail to write are retried on the
    /// next flush.
    pub fn flush(&mut self, sink: &mut dyn ResultSink) -> HbResult<usize> {
        let start = self.flushed;
        while self.flushed < self.journal.len() {
            match self.journal[self.flushed] {
                JournalEntry::Config(config_id) => {
                    if let Some(record) = self.configs.get(&config_id) {
                        sink.new_config(record)?;
                    }
                }
                JournalEntry::Run { config_id, index } => {
                    if let Some(run) = self.runs.get(&config_id).and_then(|runs| runs.get(index)) {
                        sink.run_finished(run)?;
                    }
                }
            }
            self.flushed += 1;
        }
        sink.sync()?;
        Ok(self.flushed - start)
    }

    /// Treat everything recorded so far as already persisted.
    pub(crate) fn mark_flushed(&mut self) {
        self.flushed = self.journal.len();
    }

    pub(crate) fn insert_config(&mut self, record: ConfigRecord) -> bool {
        if self.configs.contains_key(&record.config_id) {
            return false;
        }
        self.journal.push(JournalEntry::Config(record.config_id));
        self.configs.insert(record.config_id, record);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hb_types::EvaluationError;
    use proptest::prelude::*;

    fn at(ms: i64) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(ms).unwrap()
    }

    fn config(w: i64) -> Configuration {
        Configuration::new().with("w", w)
    }

    /// Records and completes one run.
    fn complete(store: &mut ResultStore, id: ConfigId, budget: Budget, loss: f64, ms: i64) {
        store.record(id, &config(id.sequence as i64), Run::pending(id, budget));
        store.mark_running(id, budget, Some("w0".into()), at(ms)).unwrap();
        store
            .finish(id, budget, Ok(Evaluation::new(loss)), at(ms))
            .unwrap();
    }

    #[derive(Default)]
    struct MemorySink {
        configs: Vec<ConfigId>,
        runs: Vec<(ConfigId, Budget, RunStatus)>,
        fail_runs: bool,
    }

    impl ResultSink for MemorySink {
        fn new_config(&mut self, record: &ConfigRecord) -> HbResult<()> {
            self.configs.push(record.config_id);
            Ok(())
        }

        fn run_finished(&mut self, run: &Run) -> HbResult<()> {
            if self.fail_runs {
                return Err(hb_types::internal_error!("disk full"));
            }
            self.runs.push((run.config_id, run.budget, run.status));
            Ok(())
        }
    }

    #[test]
    fn lifecycle_through_the_store() {
        let mut store = ResultStore::new();
        let id = ConfigId::new(0, 1, 0);
        store.record(id, &config(1), Run::pending(id, 2.0));
        assert_eq!(store.runs_for(id)[0].status, RunStatus::Pending);

        store.mark_running(id, 2.0, Some("w0".into()), at(1)).unwrap();
        assert_eq!(store.runs_for(id)[0].status, RunStatus::Running);

        let run = store
            .finish(id, 2.0, Ok(Evaluation::new(0.5)), at(2))
            .unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(store.configuration(id), Some(&config(1)));

        // finished runs are closed
        assert!(store.finish(id, 2.0, Ok(Evaluation::new(0.1)), at(3)).is_err());
        assert!(store.mark_running(ConfigId::new(9, 9, 9), 2.0, None, at(4)).is_err());
    }

    #[test]
    fn failures_are_kept_with_their_reason() {
        let mut store = ResultStore::new();
        let id = ConfigId::new(0, 0, 2);
        store.record(id, &config(2), Run::pending(id, 1.0));
        let failure = JobFailure::Evaluation(EvaluationError::new("w=2 is cursed"));
        store.finish(id, 1.0, Err(failure), at(5)).unwrap();

        let run = &store.runs_for(id)[0];
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.error.as_deref().unwrap().contains("cursed"));
        assert_eq!(store.count_with_status(RunStatus::Failed), 1);
        assert!(store.best_run_overall().is_none());
        assert!(store.incumbent().is_none());
    }

    #[test]
    fn best_run_overall_prefers_higher_budget_on_ties() {
        let mut store = ResultStore::new();
        complete(&mut store, ConfigId::new(0, 0, 0), 1.0, 0.3, 10);
        complete(&mut store, ConfigId::new(0, 0, 1), 4.0, 0.3, 20);
        complete(&mut store, ConfigId::new(0, 0, 2), 2.0, 0.4, 5);

        let best = store.best_run_overall().unwrap();
        assert_eq!(best.config_id, ConfigId::new(0, 0, 1));
        assert_eq!(best.budget, 4.0);
    }

    #[test]
    fn incumbent_is_judged_at_the_highest_budget() {
        let mut store = ResultStore::new();
        let a = ConfigId::new(0, 1, 0);
        let b = ConfigId::new(0, 1, 1);
        // a shines at the low budget, b wins where it matters
        complete(&mut store, a, 1.0, 0.01, 1);
        complete(&mut store, b, 1.0, 0.2, 2);
        complete(&mut store, b, 4.0, 0.1, 3);

        let incumbent = store.incumbent().unwrap();
        assert_eq!(incumbent.config_id, b);
        assert_eq!(incumbent.budget, 4.0);
        assert_eq!(store.best_run_overall().unwrap().config_id, a);
        assert_eq!(store.best_loss_at_or_above(2.0), Some(0.1));
        assert_eq!(store.best_loss_at_or_above(8.0), None);
    }

    #[test]
    fn trajectory_only_reports_improvements() {
        let mut store = ResultStore::new();
        complete(&mut store, ConfigId::new(0, 0, 0), 1.0, 0.5, 10);
        complete(&mut store, ConfigId::new(0, 0, 1), 1.0, 0.7, 20);
        complete(&mut store, ConfigId::new(0, 0, 2), 1.0, 0.2, 30);
        complete(&mut store, ConfigId::new(0, 0, 3), 1.0, 0.2, 40);

        let trajectory = store.incumbent_trajectory();
        let losses: Vec<f64> = trajectory.clone().map(|p| p.loss).collect();
        assert_eq!(losses, vec![0.5, 0.2]);
        // restartable
        assert_eq!(trajectory.count(), 2);
        assert_eq!(store.incumbent_trajectory().count(), 2);
    }

    #[test]
    fn flush_writes_each_entry_once() {
        let mut store = ResultStore::new();
        complete(&mut store, ConfigId::new(0, 0, 0), 1.0, 0.5, 10);
        let pending = ConfigId::new(0, 0, 1);
        store.record(pending, &config(1), Run::pending(pending, 1.0));

        let mut sink = MemorySink::default();
        assert_eq!(store.flush(&mut sink).unwrap(), 3);
        assert_eq!(sink.configs.len(), 2);
        assert_eq!(sink.runs.len(), 1);
        assert_eq!(store.unflushed(), 0);

        store
            .finish(pending, 1.0, Ok(Evaluation::new(0.4)), at(15))
            .unwrap();
        assert_eq!(store.flush(&mut sink).unwrap(), 1);
        assert_eq!(sink.runs.len(), 2);
        assert_eq!(sink.configs.len(), 2);
    }

    #[test]
    fn failed_flushes_are_retried() {
        let mut store = ResultStore::new();
        complete(&mut store, ConfigId::new(0, 0, 0), 1.0, 0.5, 10);

        let mut sink = MemorySink {
            fail_runs: true,
            ..MemorySink::default()
        };
        assert!(store.flush(&mut sink).is_err());
        assert_eq!(store.unflushed(), 1);

        sink.fail_runs = false;
        assert_eq!(store.flush(&mut sink).unwrap(), 1);
        assert_eq!(sink.configs.len(), 1);
        assert_eq!(sink.runs.len(), 1);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_best_loss_never_increases(
            results in proptest::collection::vec((0usize..3, 0.0f64..100.0), 1..40),
            threshold in prop_oneof![Just(1.0), Just(3.0), Just(9.0)],
        ) {
            let budgets = [1.0, 3.0, 9.0];
            let mut store = ResultStore::new();
            let mut previous: Option<f64> = None;

            for (i, (rung, loss)) in results.iter().enumerate() {
                complete(&mut store, ConfigId::new(0, 0, i), budgets[*rung], *loss, i as i64);
                let current = store.best_loss_at_or_above(threshold);
                if let (Some(before), Some(now)) = (previous, current) {
                    prop_assert!(now <= before);
                }
                if previous.is_some() {
                    prop_assert!(current.is_some());
                }
                previous = current;
            }

            let trajectory: Vec<f64> = store.incumbent_trajectory().map(|p| p.loss).collect();
            for pair in trajectory.windows(2) {
                prop_assert!(pair[1] < pair[0]);
            }
        }
    }
}
