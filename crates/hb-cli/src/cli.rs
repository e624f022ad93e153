use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use hb_optimizer::OptimizerConfig;
use hb_space::SpaceFormat;
use hb_worker::TimeoutPolicy;

/// Distributed Hyperband for black-box objectives.
///
/// `run` does everything on this machine. For a cluster, start one
/// `nameserver`, any number of `worker`s and one `master` with the same
/// run id.
#[derive(Parser, Debug)]
#[command(name = "halfband", version, about = "Distributed Hyperband hyperparameter search")]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Name server, workers and master in one process
    Run(RunArgs),
    /// Start a name server and keep it up until Ctrl-C
    Nameserver(NameserverArgs),
    /// Serve an objective to the masters of one run
    Worker(WorkerArgs),
    /// Schedule brackets over the workers registered for a run
    Master(MasterArgs),
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub objective: ObjectiveArgs,

    #[command(flatten)]
    pub session: SessionArgs,

    /// Number of local workers
    #[arg(long, short = 'n', env = "HALFBAND_WORKERS", default_value_t = 1)]
    pub workers: usize,
}

#[derive(Args, Debug)]
pub struct NameserverArgs {
    #[arg(long, env = "HALFBAND_RUN_ID", default_value = "halfband")]
    pub run_id: String,

    /// Address to listen on
    #[arg(long, env = "HALFBAND_BIND", default_value = "127.0.0.1:0")]
    pub bind: String,

    /// Host name put into the credentials file instead of the bind address
    #[arg(long, env = "HALFBAND_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,

    /// Shared directory for the credentials file
    #[arg(long, env = "HALFBAND_SHARED_DIR")]
    pub shared_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct WorkerArgs {
    #[command(flatten)]
    pub objective: ObjectiveArgs,

    #[command(flatten)]
    pub registry: RegistryArgs,

    #[arg(long, env = "HALFBAND_RUN_ID", default_value = "halfband")]
    pub run_id: String,

    /// Worker id (generated when unset)
    #[arg(long, env = "HALFBAND_WORKER_ID")]
    pub worker_id: Option<String>,

    #[arg(long, env = "HALFBAND_BIND", default_value = "127.0.0.1:0")]
    pub bind: String,

    #[arg(long, env = "HALFBAND_ADVERTISE_HOST")]
    pub advertise_host: Option<String>,
}

#[derive(Args, Debug)]
pub struct MasterArgs {
    #[command(flatten)]
    pub session: SessionArgs,

    #[command(flatten)]
    pub registry: RegistryArgs,

    /// Workers required before the first bracket
    #[arg(long, env = "HALFBAND_MIN_WORKERS", default_value_t = 1)]
    pub min_workers: usize,

    /// Seconds to wait for `--min-workers` (0 waits forever)
    #[arg(long, env = "HALFBAND_WORKER_WAIT", default_value_t = 60.0)]
    pub worker_wait: f64,
}

/// The program evaluated for each (configuration, budget).
#[derive(Args, Debug, Clone)]
pub struct ObjectiveArgs {
    /// Executable called as `<program> <args..> --budget <b> --<name> <value>..`
    #[arg(long, env = "HALFBAND_OBJECTIVE")]
    pub objective: PathBuf,

    /// Fixed argument passed before the budget (repeatable)
    #[arg(long = "arg", allow_hyphen_values = true)]
    pub args: Vec<String>,
}

/// Where the name server can be found.
#[derive(Args, Debug, Clone)]
pub struct RegistryArgs {
    /// Name server address (`host:port`)
    #[arg(long, env = "HALFBAND_NAMESERVER", conflicts_with = "shared_dir")]
    pub nameserver: Option<String>,

    /// Directory holding the name server's credentials file
    #[arg(long, env = "HALFBAND_SHARED_DIR")]
    pub shared_dir: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct SessionArgs {
    #[arg(long, env = "HALFBAND_RUN_ID", default_value = "halfband")]
    pub run_id: String,

    /// Search space definition (`.pcs` or `.json`)
    #[arg(long, env = "HALFBAND_SPACE")]
    pub space: PathBuf,

    #[arg(long, env = "HALFBAND_MIN_BUDGET", default_value_t = 2.0)]
    pub min_budget: f64,

    #[arg(long, env = "HALFBAND_MAX_BUDGET", default_value_t = 4.0)]
    pub max_budget: f64,

    #[arg(long, env = "HALFBAND_ETA", default_value_t = 2.0)]
    pub eta: f64,

    /// Full Hyperband cycles
    #[arg(long, env = "HALFBAND_ITERATIONS", default_value_t = 1)]
    pub iterations: usize,

    #[arg(long, value_enum, env = "HALFBAND_SAMPLER", default_value_t = SamplerKind::Random)]
    pub sampler: SamplerKind,

    /// Probability of a fresh random draw for `--sampler perturbation`
    #[arg(long, default_value_t = 0.3)]
    pub exploration_weight: f64,

    /// Points per continuous dimension for `--sampler grid`
    #[arg(long, default_value_t = 5)]
    pub float_steps: usize,

    #[arg(long, env = "HALFBAND_SEED")]
    pub seed: Option<u64>,

    /// Seconds a rung may take before the barrier gives up
    #[arg(long, env = "HALFBAND_RUNG_TIMEOUT")]
    pub rung_timeout: Option<f64>,

    /// Seconds before a single evaluation is abandoned
    #[arg(long, env = "HALFBAND_JOB_TIMEOUT")]
    pub job_timeout: Option<f64>,

    /// Continue with fewer workers or partial rungs instead of failing
    #[arg(long)]
    pub degrade: bool,

    /// Directory for the result logs
    #[arg(long, short = 'o', env = "HALFBAND_OUTPUT_DIR")]
    pub output_dir: Option<PathBuf>,

    /// Replace existing logs in `--output-dir`
    #[arg(long)]
    pub overwrite: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SamplerKind {
    Random,
    Grid,
    Perturbation,
}

impl SessionArgs {
    pub fn optimizer_config(&self) -> anyhow::Result<OptimizerConfig> {
        let policy = if self.degrade {
            TimeoutPolicy::Degrade
        } else {
            TimeoutPolicy::Abort
        };
        let mut config = OptimizerConfig::new(self.run_id.clone())
            .with_budgets(self.min_budget, self.max_budget)
            .with_eta(self.eta)
            .with_iterations(self.iterations)
            .with_seed(self.seed)
            .with_overwrite(self.overwrite)
            .with_timeout_policy(policy)
            .with_rung_timeout(seconds(self.rung_timeout)?)
            .with_job_timeout(seconds(self.job_timeout)?);
        if let Some(dir) = &self.output_dir {
            let format = SpaceFormat::from_path(&self.space)?;
            config = config.with_output_dir(dir.clone(), format);
        }
        Ok(config)
    }
}

/// Positive seconds to a duration; zero and unset both mean "no limit".
pub fn seconds(value: Option<f64>) -> anyhow::Result<Option<Duration>> {
    match value {
        None => Ok(None),
        Some(s) if s == 0.0 => Ok(None),
        Some(s) => Duration::try_from_secs_f64(s)
            .map(Some)
            .map_err(|e| anyhow::anyhow!("invalid duration {s}: {e}")),
    }
}
