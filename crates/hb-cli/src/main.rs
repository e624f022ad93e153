mod cli;
mod command;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Parser;
use hb_optimizer::{
    optimize_locally, ConfigSampler, GridSampler, OptimizationOutcome, Optimizer,
    PerturbationSampler, RandomSampler,
};
use hb_space::{read_space, SearchSpace};
use hb_worker::{
    NameServer, NameServerConfig, Objective, Registry, RegistryClient, WorkerConfig, WorkerServer,
};
use tracing::{info, warn};

use crate::cli::{
    seconds, CliArgs, Command, MasterArgs, NameserverArgs, ObjectiveArgs, RegistryArgs, RunArgs,
    SamplerKind, SessionArgs, WorkerArgs,
};
use crate::command::CommandObjective;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let args = CliArgs::parse();
    match args.command {
        Command::Run(args) => run(args).await,
        Command::Nameserver(args) => nameserver(args).await,
        Command::Worker(args) => worker(args).await,
        Command::Master(args) => master(args).await,
    }
}

async fn run(args: RunArgs) -> Result<()> {
    let space = load_space(&args.session)?;
    let sampler = build_sampler(&args.session, &space);
    let config = args.session.optimizer_config()?;

    let outcome = optimize_locally(objective(&args.objective), space, Some(sampler), config, args.workers)
        .await
        .context("optimization failed")?;
    report(&outcome);
    Ok(())
}

async fn nameserver(args: NameserverArgs) -> Result<()> {
    let mut config = NameServerConfig::new(args.run_id).with_bind(args.bind);
    if let Some(host) = args.advertise_host {
        config = config.with_advertise_host(host);
    }
    if let Some(dir) = args.shared_dir {
        config = config.with_working_directory(dir);
    }

    let server = NameServer::start(config)
        .await
        .context("failed to start the name server")?;
    info!(address = %server.address(), run_id = %server.run_id(), "name server running; Ctrl-C to stop");
    if let Some(path) = server.credentials_path() {
        info!(path = %path.display(), "credentials written");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    server.shutdown().await.context("name server shutdown failed")?;
    Ok(())
}

async fn worker(args: WorkerArgs) -> Result<()> {
    let registry = connect(&args.registry, &args.run_id).await?;

    let mut config = WorkerConfig::new(args.run_id).with_bind(args.bind);
    if let Some(id) = args.worker_id {
        config = config.with_worker_id(id);
    }
    if let Some(host) = args.advertise_host {
        config = config.with_advertise_host(host);
    }

    let server = WorkerServer::bind(config, objective(&args.objective))
        .await
        .context("failed to start the worker")?;
    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            handle.shutdown();
        }
    });

    server.serve(registry).await.context("worker failed")?;
    Ok(())
}

async fn master(args: MasterArgs) -> Result<()> {
    if args.worker_wait < 0.0 {
        bail!("--worker-wait must not be negative");
    }
    let registry = connect(&args.registry, &args.session.run_id).await?;
    let space = load_space(&args.session)?;
    let sampler = build_sampler(&args.session, &space);
    let config = args
        .session
        .optimizer_config()?
        .with_min_workers(args.min_workers, seconds(Some(args.worker_wait))?);

    let mut optimizer = Optimizer::new(config, space, Some(sampler), registry)
        .context("invalid optimizer settings")?;
    let result = tokio::select! {
        result = optimizer.run() => result.context("optimization failed"),
        _ = tokio::signal::ctrl_c() => Err(anyhow::anyhow!("interrupted")),
    };
    if let Err(e) = optimizer.shutdown().await {
        warn!(error = %e, "shutdown incomplete");
    }

    let outcome = result?;
    report(&outcome);
    Ok(())
}

fn load_space(session: &SessionArgs) -> Result<SearchSpace> {
    read_space(&session.space)
        .with_context(|| format!("failed to load search space {}", session.space.display()))
}

fn build_sampler(session: &SessionArgs, space: &SearchSpace) -> Box<dyn ConfigSampler> {
    match session.sampler {
        SamplerKind::Random => Box::new(RandomSampler::with_seed(space.clone(), session.seed)),
        SamplerKind::Grid => Box::new(GridSampler::new(space, session.float_steps)),
        SamplerKind::Perturbation => Box::new(PerturbationSampler::with_seed(
            space.clone(),
            session.exploration_weight,
            session.seed,
        )),
    }
}

fn objective(args: &ObjectiveArgs) -> Arc<dyn Objective> {
    Arc::new(CommandObjective::new(args.objective.clone(), args.args.clone()))
}

async fn connect(args: &RegistryArgs, run_id: &str) -> Result<Arc<dyn Registry>> {
    let client = match (&args.nameserver, &args.shared_dir) {
        (Some(address), _) => RegistryClient::connect(address.clone())
            .await
            .with_context(|| format!("name server at {address} unreachable"))?,
        (None, Some(dir)) => RegistryClient::from_credentials(dir, run_id)
            .await
            .with_context(|| format!("no name server for run {run_id} in {}", dir.display()))?,
        (None, None) => bail!("pass --nameserver or --shared-dir to locate the name server"),
    };
    Ok(Arc::new(client))
}

fn report(outcome: &OptimizationOutcome) {
    let status = &outcome.status;
    match &outcome.incumbent {
        Some(best) => {
            let configuration = serde_json::to_string(&best.configuration)
                .unwrap_or_else(|_| format!("{:?}", best.configuration));
            println!(
                "Found best value {} with the configuration {} (budget {})",
                best.loss, configuration, best.budget
            );
        }
        None => println!("No configuration completed successfully"),
    }
    println!(
        "{} runs completed, {} failed, {} brackets completed, {} skipped",
        status.runs_completed, status.runs_failed, status.brackets_completed, status.brackets_skipped
    );
}
