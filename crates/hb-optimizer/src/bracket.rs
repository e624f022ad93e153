//! Successive-halving schedule and rung promotion.
//!
//! The [`BracketEngine`] turns `(min_budget, max_budget, eta)` into a
//! geometric ladder of budgets and hands out bracket plans in Hyperband
//! order. A [`Bracket`] then tracks one plan while it runs: which
//! configurations sit on the current rung, how they did, and who survives.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};
use hb_types::{
    validation_error, Budget, BracketError, ConfigId, Configuration, HbResult, Job, Run,
    RunStatus,
};
use serde::{Deserialize, Serialize};

/// Absorbs float noise in `ln(a)/ln(b)` and `x * eta^s` before rounding.
const EPSILON: f64 = 1e-9;

/// One budget level of a bracket and the population planned for it.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RungPlan {
    pub budget: Budget,
    pub population: usize,
}

/// The rung schedule of bracket `bracket` in iteration `iteration`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BracketPlan {
    pub iteration: usize,
    /// Hyperband's `s`: the bracket uses the top `s + 1` rungs.
    pub bracket: usize,
    pub rungs: Vec<RungPlan>,
}

impl BracketPlan {
    pub fn initial_population(&self) -> usize {
        self.rungs.first().map_or(0, |r| r.population)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct BracketEngine {
    min_budget: Budget,
    max_budget: Budget,
    eta: f64,
    max_rungs: usize,
    budgets: Vec<Budget>,
    /// Brackets handed out so far.
    cursor: usize,
}

impl BracketEngine {
    pub fn new(min_budget: Budget, max_budget: Budget, eta: f64) -> HbResult<Self> {
        if !(eta.is_finite() && eta >= 2.0) {
            return Err(validation_error!("eta must be at least 2, got {eta}"));
        }
        if !(min_budget.is_finite() && min_budget > 0.0) {
            return Err(validation_error!("min_budget must be positive, got {min_budget}"));
        }
        if !max_budget.is_finite() || max_budget < min_budget {
            return Err(validation_error!(
                "max_budget {max_budget} must not be below min_budget {min_budget}"
            ));
        }

        let max_rungs = ((max_budget / min_budget).ln() / eta.ln() + EPSILON).floor() as usize + 1;
        let budgets = (0..max_rungs)
            .map(|k| max_budget * eta.powi(-((max_rungs - 1 - k) as i32)))
            .collect();

        Ok(Self {
            min_budget,
            max_budget,
            eta,
            max_rungs,
            budgets,
            cursor: 0,
        })
    }

    pub fn max_rungs(&self) -> usize {
        self.max_rungs
    }

    /// Budgets of the full ladder, lowest first. The last one is `max_budget`.
    pub fn budgets(&self) -> &[Budget] {
        &self.budgets
    }

    pub fn eta(&self) -> f64 {
        self.eta
    }

    pub fn min_budget(&self) -> Budget {
        self.min_budget
    }

    pub fn max_budget(&self) -> Budget {
        self.max_budget
    }

    /// Rung budgets and populations of bracket `s` (0 is the greediest,
    /// `max_rungs - 1` the most exploratory).
    pub fn plan(&self, iteration: usize, s: usize) -> Result<BracketPlan, BracketError> {
        if s >= self.max_rungs {
            return Err(BracketError::InvalidBracket {
                bracket: s,
                max_rungs: self.max_rungs,
            });
        }

        Ok(self.build_plan(iteration, s))
    }

    /// The next bracket in Hyperband order: `s` counts down from
    /// `max_rungs - 1` to 0, then the next iteration starts over.
    pub fn next_bracket(&mut self) -> BracketPlan {
        let plan = self.plan_at(self.cursor);
        self.cursor += 1;
        plan
    }

    /// Every bracket of `num_iterations` iterations, without advancing.
    pub fn schedule(&self, num_iterations: usize) -> Vec<BracketPlan> {
        (0..num_iterations * self.max_rungs)
            .map(|position| self.plan_at(position))
            .collect()
    }

    pub fn brackets_issued(&self) -> usize {
        self.cursor
    }

    fn plan_at(&self, position: usize) -> BracketPlan {
        let iteration = position / self.max_rungs;
        let s = self.max_rungs - 1 - position % self.max_rungs;
        self.build_plan(iteration, s)
    }

    /// `s` must be below `max_rungs`.
    fn build_plan(&self, iteration: usize, s: usize) -> BracketPlan {
        let mut population =
            ceil(self.max_rungs as f64 / (s + 1) as f64 * self.eta.powi(s as i32));
        let mut rungs = Vec::with_capacity(s + 1);
        for budget in &self.budgets[self.max_rungs - 1 - s..] {
            rungs.push(RungPlan {
                budget: *budget,
                population,
            });
            population = survivors(population, self.eta);
        }

        BracketPlan {
            iteration,
            bracket: s,
            rungs,
        }
    }
}

fn ceil(x: f64) -> usize {
    ((x - EPSILON).ceil() as usize).max(1)
}

/// How many of `population` advance to the next rung.
pub fn survivors(population: usize, eta: f64) -> usize {
    ceil(population as f64 / eta)
}

/// Completed runs, best first: lower loss, then earlier completion, then
/// lower config id. Failed and unfinished runs are dropped.
pub fn rank_completed<'a, I>(runs: I) -> Vec<&'a Run>
where
    I: IntoIterator<Item = &'a Run>,
{
    let mut ranked: Vec<&Run> = runs
        .into_iter()
        .filter(|run| run.status == RunStatus::Completed && run.loss.is_some())
        .collect();
    ranked.sort_by(|a, b| compare_runs(a, b));
    ranked
}

fn compare_runs(a: &Run, b: &Run) -> Ordering {
    let loss = |run: &Run| run.loss.unwrap_or(f64::INFINITY);
    loss(a)
        .total_cmp(&loss(b))
        .then_with(|| compare_finish(a.finished_at, b.finished_at))
        .then_with(|| a.config_id.cmp(&b.config_id))
}

fn compare_finish(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

/// A configuration placed on a rung, with the outcome of its run there.
#[derive(Debug, Clone, PartialEq)]
pub struct RungMember {
    pub configuration: Configuration,
    pub run: Run,
}

impl RungMember {
    pub fn config_id(&self) -> ConfigId {
        self.run.config_id
    }
}

/// Runtime state of one bracket.
#[derive(Debug, Clone)]
pub struct Bracket {
    plan: BracketPlan,
    rung: usize,
    /// Members per rung; only rungs up to `rung` are populated.
    members: Vec<Vec<RungMember>>,
}

impl Bracket {
    /// Seed the first rung with `configurations`.
    pub fn new(plan: BracketPlan, configurations: Vec<(ConfigId, Configuration)>) -> Self {
        let budget = plan.rungs.first().map_or(0.0, |r| r.budget);
        let first = configurations
            .into_iter()
            .map(|(id, configuration)| RungMember {
                configuration,
                run: Run::pending(id, budget),
            })
            .collect();
        let mut members = Vec::with_capacity(plan.rungs.len());
        members.push(first);
        Self {
            plan,
            rung: 0,
            members,
        }
    }

    pub fn plan(&self) -> &BracketPlan {
        &self.plan
    }

    pub fn iteration(&self) -> usize {
        self.plan.iteration
    }

    pub fn index(&self) -> usize {
        self.plan.bracket
    }

    /// Index of the active rung within this bracket.
    pub fn current_rung(&self) -> usize {
        self.rung
    }

    pub fn current_budget(&self) -> Budget {
        self.plan.rungs[self.rung].budget
    }

    pub fn is_last_rung(&self) -> bool {
        self.rung + 1 >= self.plan.rungs.len()
    }

    /// Members of rung `rung`, in placement order.
    pub fn members(&self, rung: usize) -> Result<&[RungMember], BracketError> {
        self.members
            .get(rung)
            .map(Vec::as_slice)
            .ok_or(BracketError::InvalidRung {
                rung,
                rungs: self.members.len(),
            })
    }

    /// One job per member of the active rung.
    pub fn rung_jobs(&self) -> Vec<Job> {
        let budget = self.current_budget();
        self.members[self.rung]
            .iter()
            .map(|m| Job::new(m.config_id(), m.configuration.clone(), budget))
            .collect()
    }

    /// Store the latest state of a run on the active rung.
    pub fn record(&mut self, run: &Run) -> Result<(), BracketError> {
        let rung = self.rung;
        let budget = self.current_budget();
        let member = self.members[rung]
            .iter_mut()
            .find(|m| m.config_id() == run.config_id && run.budget == budget)
            .ok_or_else(|| BracketError::NotAMember {
                config_id: run.config_id.to_string(),
                rung,
            })?;
        member.run = run.clone();
        Ok(())
    }

    pub fn is_rung_complete(&self) -> bool {
        self.members[self.rung].iter().all(|m| m.run.is_terminal())
    }

    pub fn completed_in_rung(&self) -> usize {
        self.members[self.rung]
            .iter()
            .filter(|m| m.run.status == RunStatus::Completed)
            .count()
    }

    /// Advance the best `ceil(population / eta)` completed members to the
    /// next rung. Returns `false` once the top rung has been run.
    ///
    /// Fails with `PromotionImpossible` when nothing on the active rung
    /// completed.
    pub fn promote(&mut self, eta: f64) -> Result<bool, BracketError> {
        if self.is_last_rung() {
            return Ok(false);
        }

        let current = &self.members[self.rung];
        let ranked = rank_completed(current.iter().map(|m| &m.run));
        if ranked.is_empty() {
            return Err(BracketError::PromotionImpossible {
                iteration: self.plan.iteration,
                bracket: self.plan.bracket,
                rung: self.rung,
                budget: self.current_budget(),
            });
        }

        let keep = survivors(current.len(), eta).min(ranked.len());
        let next_budget = self.plan.rungs[self.rung + 1].budget;
        let promoted: Vec<RungMember> = ranked[..keep]
            .iter()
            .filter_map(|run| current.iter().find(|m| m.config_id() == run.config_id))
            .map(|m| RungMember {
                configuration: m.configuration.clone(),
                run: Run::pending(m.config_id(), next_budget),
            })
            .collect();

        self.members.push(promoted);
        self.rung += 1;
        Ok(true)
    }
}
