//! One-call optimization on the local machine.

use std::sync::Arc;
use std::time::Duration;

use hb_space::SearchSpace;
use hb_types::{config_error, HbResult};
use hb_worker::{
    NameServer, NameServerConfig, Objective, Registry, RegistryClient, WorkerConfig, WorkerServer,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::OptimizerConfig;
use crate::master::{OptimizationOutcome, Optimizer};
use crate::sampler::ConfigSampler;

/// Grace period for worker tasks after the optimizer told them to stop.
const WORKER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Start a name server and `num_workers` TCP workers around `objective`,
/// run the optimizer against them, and tear everything down again.
///
/// Fixed arguments of the objective are whatever the closure captures.
/// Passing `None` as sampler uses random search seeded from `config.seed`.
pub async fn optimize_locally(
    objective: Arc<dyn Objective>,
    space: SearchSpace,
    sampler: Option<Box<dyn ConfigSampler>>,
    config: OptimizerConfig,
    num_workers: usize,
) -> HbResult<OptimizationOutcome> {
    if num_workers == 0 {
        return Err(config_error!("optimize_locally needs at least one worker"));
    }
    config.validate()?;

    let mut ns_config = NameServerConfig::new(config.run_id.clone());
    if let Some(dir) = &config.output_dir {
        ns_config = ns_config.with_working_directory(dir.clone());
    }
    let name_server = NameServer::start(ns_config).await?;
    info!(address = %name_server.address(), workers = num_workers, "local name server up");

    let result = run_with_workers(&name_server, objective, space, sampler, config, num_workers).await;

    if let Err(e) = name_server.shutdown().await {
        warn!(error = %e, "name server shutdown failed");
    }
    result
}

async fn run_with_workers(
    name_server: &NameServer,
    objective: Arc<dyn Objective>,
    space: SearchSpace,
    sampler: Option<Box<dyn ConfigSampler>>,
    config: OptimizerConfig,
    num_workers: usize,
) -> HbResult<OptimizationOutcome> {
    let registry: Arc<dyn Registry> = Arc::new(RegistryClient::connect(name_server.address()).await?);

    let mut tasks: Vec<JoinHandle<HbResult<()>>> = Vec::with_capacity(num_workers);
    for i in 0..num_workers {
        let worker_config =
            WorkerConfig::new(config.run_id.clone()).with_worker_id(format!("{}.worker-{i}", config.run_id));
        let server = match WorkerServer::bind(worker_config, objective.clone()).await {
            Ok(server) => server,
            Err(e) => {
                abort_all(&tasks);
                return Err(e.into());
            }
        };
        tasks.push(tokio::spawn(server.serve(registry.clone())));
    }

    // The quorum covers every local worker.
    let min_workers = config.min_n_workers.max(num_workers);
    let wait = config.worker_wait_timeout;
    let config = config.with_min_workers(min_workers, wait);
    let mut optimizer = match Optimizer::new(config, space, sampler, registry) {
        Ok(optimizer) => optimizer,
        Err(e) => {
            abort_all(&tasks);
            return Err(e);
        }
    };

    let result = optimizer.run().await;
    if let Err(e) = optimizer.shutdown().await {
        warn!(error = %e, "optimizer shutdown failed");
    }

    for task in tasks {
        match tokio::time::timeout(WORKER_STOP_TIMEOUT, task).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!(error = %e, "worker ended with an error"),
            Ok(Err(e)) => warn!(error = %e, "worker task failed"),
            Err(_) => warn!("worker did not stop in time"),
        }
    }

    result.map(|mut outcome| {
        outcome.status = optimizer.status().clone();
        outcome
    })
}

fn abort_all(tasks: &[JoinHandle<HbResult<()>>]) {
    for task in tasks {
        task.abort();
    }
}
