//! The session driver: brackets in, jobs out, results recorded.

use std::sync::Arc;

use hb_space::SearchSpace;
use hb_types::{
    internal_error, BracketError, ConfigId, Configuration, DispatchError, HbError, HbResult, Run,
};
use hb_worker::{DispatchEvent, Dispatcher, JobOutcome, Registry, TimeoutPolicy};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bracket::{Bracket, BracketEngine, BracketPlan};
use crate::config::{OptimizationState, OptimizationStatus, OptimizerConfig};
use crate::logger::JsonResultLogger;
use crate::results::ResultStore;
use crate::sampler::{ConfigSampler, RandomSampler};

/// The configuration a session settled on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incumbent {
    pub config_id: ConfigId,
    pub configuration: Configuration,
    pub loss: f64,
    /// Budget the loss was measured at.
    pub budget: f64,
}

/// What a finished session hands back.
#[derive(Debug, Clone)]
pub struct OptimizationOutcome {
    /// `None` if no run completed at all.
    pub incumbent: Option<Incumbent>,
    pub store: ResultStore,
    pub status: OptimizationStatus,
}

/// Runs Hyperband over a set of remote workers.
///
/// Lifecycle: [`Optimizer::new`] validates settings and opens the result
/// logs, [`Optimizer::start`] waits for workers, [`Optimizer::run`] executes
/// every bracket, and [`Optimizer::shutdown`] stops the workers and flushes.
pub struct Optimizer {
    config: OptimizerConfig,
    sampler: Box<dyn ConfigSampler>,
    engine: BracketEngine,
    dispatcher: Dispatcher,
    store: ResultStore,
    logger: Option<JsonResultLogger>,
    status: OptimizationStatus,
    started: bool,
}

impl Optimizer {
    pub fn new(
        config: OptimizerConfig,
        space: SearchSpace,
        sampler: Option<Box<dyn ConfigSampler>>,
        registry: Arc<dyn Registry>,
    ) -> HbResult<Self> {
        config.validate()?;
        space.validate()?;
        let engine = BracketEngine::new(config.min_budget, config.max_budget, config.eta)?;

        let logger = match &config.output_dir {
            Some(dir) => {
                let logger = JsonResultLogger::new(dir, config.overwrite)?;
                logger.write_space(&space, config.space_format)?;
                Some(logger)
            }
            None => None,
        };

        let sampler =
            sampler.unwrap_or_else(|| Box::new(RandomSampler::with_seed(space, config.seed)));
        info!(
            run_id = %config.run_id,
            sampler = sampler.name(),
            budgets = ?engine.budgets(),
            eta = config.eta,
            iterations = config.num_iterations,
            "optimizer created"
        );

        Ok(Self {
            dispatcher: Dispatcher::new(registry, config.dispatcher_config()),
            status: OptimizationStatus::new(config.run_id.clone()),
            config,
            sampler,
            engine,
            store: ResultStore::new(),
            logger,
            started: false,
        })
    }

    pub fn config(&self) -> &OptimizerConfig {
        &self.config
    }

    pub fn engine(&self) -> &BracketEngine {
        &self.engine
    }

    pub fn store(&self) -> &ResultStore {
        &self.store
    }

    pub fn status(&self) -> &OptimizationStatus {
        &self.status
    }

    /// Wait for `min_n_workers`. Returns the number of workers found.
    pub async fn start(&mut self) -> HbResult<usize> {
        let found = self
            .dispatcher
            .wait_for_workers(
                self.config.min_n_workers,
                self.config.worker_wait_timeout,
                self.config.timeout_policy,
            )
            .await;

        match found {
            Ok(workers) => {
                self.started = true;
                self.status.mark_running();
                Ok(workers)
            }
            Err(e) => {
                self.status.mark_failed(e.to_string());
                Err(e)
            }
        }
    }

    /// Run every bracket of every iteration.
    ///
    /// A bracket whose rung has no successful run is skipped; fatal errors
    /// (registry loss, rung timeout under [`TimeoutPolicy::Abort`]) end the
    /// session with what was recorded so far flushed.
    pub async fn run(&mut self) -> HbResult<OptimizationOutcome> {
        if !self.started {
            self.start().await?;
        }

        let total = self.config.num_iterations * self.engine.max_rungs();
        while self.engine.brackets_issued() < total {
            let plan = self.engine.next_bracket();
            match self.run_bracket(plan).await {
                Ok(()) => self.status.brackets_completed += 1,
                Err(HbError::Bracket(e @ BracketError::PromotionImpossible { .. })) => {
                    warn!(error = %e, "skipping rest of bracket");
                    self.status.brackets_skipped += 1;
                }
                Err(e) => {
                    if let Err(flush_error) = self.flush() {
                        warn!(error = %flush_error, "could not flush results");
                    }
                    self.status.mark_failed(e.to_string());
                    return Err(e);
                }
            }
            if let Err(e) = self.flush() {
                self.status.mark_failed(e.to_string());
                return Err(e);
            }
        }

        self.status.mark_completed();
        let outcome = self.outcome();
        match &outcome.incumbent {
            Some(best) => info!(
                config = %best.config_id,
                loss = best.loss,
                budget = best.budget,
                completed = self.status.runs_completed,
                failed = self.status.runs_failed,
                "optimization finished"
            ),
            None => warn!(failed = self.status.runs_failed, "optimization finished without a successful run"),
        }
        Ok(outcome)
    }

    /// Stop every worker, release the registry, and flush the logs.
    ///
    /// A session interrupted mid-run is marked cancelled.
    pub async fn shutdown(&mut self) -> HbResult<()> {
        let discarded = self.dispatcher.abandon_outstanding("session shut down");
        for outcome in discarded {
            self.record_outcome(None, outcome)?;
        }
        self.dispatcher.shutdown().await?;
        if !self.status.is_finished() && self.status.state != OptimizationState::Pending {
            self.status.mark_cancelled();
        }
        self.flush()?;
        info!(run_id = %self.config.run_id, state = ?self.status.state, "optimizer shut down");
        Ok(())
    }

    /// Snapshot of the incumbent, the store and the status.
    pub fn outcome(&self) -> OptimizationOutcome {
        let incumbent = self.store.incumbent().and_then(|run| {
            Some(Incumbent {
                config_id: run.config_id,
                configuration: self.store.configuration(run.config_id)?.clone(),
                loss: run.loss?,
                budget: run.budget,
            })
        });
        OptimizationOutcome {
            incumbent,
            store: self.store.clone(),
            status: self.status.clone(),
        }
    }

    async fn run_bracket(&mut self, plan: BracketPlan) -> HbResult<()> {
        let population = plan.initial_population();
        let first_budget = plan.rungs.first().map_or(self.engine.max_budget(), |r| r.budget);
        info!(
            iteration = plan.iteration,
            bracket = plan.bracket,
            rungs = plan.rungs.len(),
            population,
            "starting bracket"
        );

        let sampled = self.sampler.suggest(first_budget, population);
        if sampled.is_empty() {
            return Err(internal_error!(
                "sampler {} produced no configurations",
                self.sampler.name()
            ));
        }
        let members: Vec<(ConfigId, Configuration)> = sampled
            .into_iter()
            .enumerate()
            .map(|(seq, configuration)| (ConfigId::new(plan.iteration, plan.bracket, seq), configuration))
            .collect();
        for (id, configuration) in &members {
            self.store.discover(*id, configuration);
        }

        let mut bracket = Bracket::new(plan, members);
        loop {
            self.run_rung(&mut bracket).await?;
            self.flush()?;
            if bracket.is_last_rung() && bracket.completed_in_rung() == 0 {
                warn!(
                    iteration = bracket.iteration(),
                    bracket = bracket.index(),
                    budget = bracket.current_budget(),
                    "no run completed at the top rung"
                );
            }
            if !bracket.promote(self.engine.eta())? {
                return Ok(());
            }
        }
    }

    /// Dispatch the active rung and wait at the barrier until every job is
    /// terminal (or the rung timeout runs out).
    async fn run_rung(&mut self, bracket: &mut Bracket) -> HbResult<()> {
        let jobs = bracket.rung_jobs();
        info!(
            iteration = bracket.iteration(),
            bracket = bracket.index(),
            rung = bracket.current_rung(),
            budget = bracket.current_budget(),
            jobs = jobs.len(),
            "dispatching rung"
        );

        for job in jobs {
            self.store.record(
                job.config_id,
                &job.configuration,
                Run::pending(job.config_id, job.budget),
            );
            self.dispatcher.submit(job)?;
        }

        let deadline = self.config.rung_timeout.map(|limit| Instant::now() + limit);
        loop {
            match self.dispatcher.next_event(deadline).await {
                Ok(Some(DispatchEvent::Started {
                    config_id,
                    budget,
                    worker_id,
                    at,
                    ..
                })) => {
                    self.store.mark_running(config_id, budget, Some(worker_id), at)?;
                }
                Ok(Some(DispatchEvent::Finished(outcome))) => {
                    self.record_outcome(Some(bracket), outcome)?;
                }
                Ok(None) => return Ok(()),
                Err(HbError::Dispatch(e @ DispatchError::BarrierTimeout { .. })) => {
                    let degrade = self.config.timeout_policy == TimeoutPolicy::Degrade;
                    let reason = if degrade {
                        "rung timed out"
                    } else {
                        "rung timed out; aborting"
                    };
                    for outcome in self.dispatcher.abandon_outstanding(reason) {
                        self.record_outcome(Some(bracket), outcome)?;
                    }
                    if degrade {
                        warn!(error = %e, "continuing with the results at hand");
                        return Ok(());
                    }
                    return Err(e.into());
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn record_outcome(&mut self, bracket: Option<&mut Bracket>, outcome: JobOutcome) -> HbResult<()> {
        let JobOutcome {
            job,
            worker_id,
            result,
            finished_at,
            ..
        } = outcome;

        match &result {
            Ok(evaluation) => {
                debug!(config = %job.config_id, budget = job.budget, loss = evaluation.loss, worker = ?worker_id, "run completed");
                self.sampler
                    .report(&job.configuration, job.budget, evaluation.loss);
            }
            Err(failure) => {
                warn!(config = %job.config_id, budget = job.budget, worker = ?worker_id, error = %failure, "run failed");
            }
        }

        let run = self
            .store
            .finish(job.config_id, job.budget, result, finished_at)?
            .clone();
        self.status.record_run(&run);
        if let Some(bracket) = bracket {
            bracket.record(&run)?;
        }
        Ok(())
    }

    fn flush(&mut self) -> HbResult<()> {
        if let Some(logger) = self.logger.as_mut() {
            let written = self.store.flush(logger)?;
            if written > 0 {
                debug!(entries = written, "flushed results");
            }
        }
        Ok(())
    }
}
