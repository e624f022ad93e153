//! # hb-optimizer
//!
//! Hyperband scheduling for HalfBand.
//!
//! - [`BracketEngine`] and [`Bracket`]: the successive-halving schedule and
//!   rung promotion.
//! - [`ConfigSampler`]: pluggable proposal strategies (random, grid,
//!   perturbation).
//! - [`ResultStore`] and [`JsonResultLogger`]: every run of a session, its
//!   incumbent and trajectory, and their JSON-lines logs.
//! - [`Optimizer`]: the session driver that ties these to a
//!   [`hb_worker::Dispatcher`], and [`optimize_locally`] for single-machine use.

mod bracket;
mod config;
mod local;
mod logger;
mod master;
mod results;
mod sampler;

pub use bracket::{
    rank_completed, survivors, Bracket, BracketEngine, BracketPlan, RungMember, RungPlan,
};
pub use config::{OptimizationState, OptimizationStatus, OptimizerConfig};
pub use local::optimize_locally;
pub use logger::{load_results, JsonResultLogger, CONFIGS_FILE, RESULTS_FILE};
pub use master::{Incumbent, OptimizationOutcome, Optimizer};
pub use results::{ConfigRecord, ResultSink, ResultStore, Trajectory, TrajectoryPoint};
pub use sampler::{ConfigSampler, GridSampler, PerturbationSampler, RandomSampler};
