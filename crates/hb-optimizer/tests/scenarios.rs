//! End-to-end sessions over real TCP: a name server, workers and a master
//! on 127.0.0.1.

use std::sync::Arc;
use std::time::Duration;

use hb_optimizer::{
    load_results, optimize_locally, GridSampler, OptimizationState, Optimizer, OptimizerConfig,
    RandomSampler,
};
use hb_space::{SearchSpace, SpaceFormat};
use hb_types::{
    Budget, Configuration, DispatchError, EvaluationError, HbError, HbResult, RunStatus,
};
use hb_worker::{
    NameServer, NameServerConfig, Objective, Registry, RegistryClient, TimeoutPolicy,
    WorkerConfig, WorkerServer,
};
use tempfile::TempDir;
use tokio::task::JoinHandle;

fn w_of(configuration: &Configuration) -> i64 {
    configuration.get("w").and_then(|v| v.as_i64()).unwrap()
}

fn quadratic() -> Arc<dyn Objective> {
    Arc::new(
        |configuration: &Configuration, _budget: Budget| -> Result<f64, EvaluationError> {
            let w = configuration
                .get("w")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| EvaluationError::new("missing w"))?;
            Ok((w - 1.0).powi(2))
        },
    )
}

fn integer_space() -> SearchSpace {
    SearchSpace::new().add_int("w", -3, 3)
}

fn session(run_id: &str) -> OptimizerConfig {
    OptimizerConfig::new(run_id)
        .with_budgets(1.0, 10.0)
        .with_eta(2.0)
        .with_poll_interval(Duration::from_millis(50))
}

async fn spawn_workers(
    registry: &Arc<dyn Registry>,
    run_id: &str,
    count: usize,
    objective: Arc<dyn Objective>,
) -> Vec<JoinHandle<HbResult<()>>> {
    let mut tasks = Vec::new();
    for i in 0..count {
        let config = WorkerConfig::new(run_id).with_worker_id(format!("{run_id}-w{i}"));
        let server = WorkerServer::bind(config, objective.clone()).await.unwrap();
        tasks.push(tokio::spawn(server.serve(registry.clone())));
    }
    tasks
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn grid_search_finds_the_minimum() {
    let space = integer_space();
    let sampler = Box::new(GridSampler::new(&space, 5));

    let outcome = optimize_locally(quadratic(), space, Some(sampler), session("grid"), 4)
        .await
        .unwrap();

    let incumbent = outcome.incumbent.expect("an incumbent");
    assert_eq!(w_of(&incumbent.configuration), 1);
    assert_eq!(incumbent.loss, 0.0);
    assert_eq!(incumbent.budget, 10.0);

    let ladder = [1.25, 2.5, 5.0, 10.0];
    assert!(outcome.store.runs().all(|run| ladder.contains(&run.budget)));
    assert!(outcome
        .store
        .runs()
        .all(|run| run.status == RunStatus::Completed));
    assert_eq!(outcome.status.state, OptimizationState::Completed);
    assert_eq!(outcome.status.brackets_completed, 4);
    // 15 + 11 + 6 + 4 jobs across the four brackets
    assert_eq!(outcome.store.run_count(), 36);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_configuration_is_never_promoted() {
    let objective: Arc<dyn Objective> = Arc::new(
        |configuration: &Configuration, _budget: Budget| -> Result<f64, EvaluationError> {
            let w = w_of(configuration);
            if w == 2 {
                return Err(EvaluationError::new("w=2 always fails"));
            }
            Ok(((w - 1) * (w - 1)) as f64)
        },
    );
    let space = integer_space();
    let sampler = Box::new(GridSampler::new(&space, 5));

    let outcome = optimize_locally(objective, space, Some(sampler), session("fails"), 4)
        .await
        .unwrap();
    let store = &outcome.store;

    let cursed: Vec<_> = store
        .configs()
        .filter(|record| w_of(&record.configuration) == 2)
        .map(|record| record.config_id)
        .collect();
    assert!(!cursed.is_empty());
    for id in cursed {
        let runs = store.runs_for(id);
        assert_eq!(runs.len(), 1, "w=2 ({id}) must not reach a second rung");
        assert_eq!(runs[0].status, RunStatus::Failed);
        assert!(runs[0].error.as_deref().unwrap().contains("always fails"));
    }

    assert!(store.count_with_status(RunStatus::Completed) > 0);
    assert_eq!(w_of(&outcome.incumbent.unwrap().configuration), 1);
    assert!(outcome.status.runs_failed > 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn missing_workers_abort_the_session() {
    let name_server = NameServer::start(NameServerConfig::new("quorum")).await.unwrap();
    let registry: Arc<dyn Registry> =
        Arc::new(RegistryClient::connect(name_server.address()).await.unwrap());
    let workers = spawn_workers(&registry, "quorum", 1, quadratic()).await;

    let config = session("quorum").with_min_workers(2, Some(Duration::from_millis(300)));
    let mut optimizer = Optimizer::new(config, integer_space(), None, registry).unwrap();

    match optimizer.run().await {
        Err(HbError::Dispatch(DispatchError::InsufficientWorkers {
            required, available, ..
        })) => {
            assert_eq!(required, 2);
            assert_eq!(available, 1);
        }
        other => panic!("expected InsufficientWorkers, got {:?}", other.map(|_| ())),
    }
    assert_eq!(optimizer.status().state, OptimizationState::Failed);
    assert_eq!(optimizer.store().run_count(), 0);

    optimizer.shutdown().await.unwrap();
    for task in workers {
        task.await.unwrap().unwrap();
    }
    name_server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn degraded_quorum_still_runs() {
    let name_server = NameServer::start(NameServerConfig::new("degrade")).await.unwrap();
    let registry: Arc<dyn Registry> =
        Arc::new(RegistryClient::connect(name_server.address()).await.unwrap());
    let workers = spawn_workers(&registry, "degrade", 1, quadratic()).await;

    let config = session("degrade")
        .with_budgets(1.0, 4.0)
        .with_min_workers(2, Some(Duration::from_millis(300)))
        .with_timeout_policy(TimeoutPolicy::Degrade)
        .with_seed(Some(3));
    let mut optimizer = Optimizer::new(config, integer_space(), None, registry).unwrap();

    let outcome = optimizer.run().await.unwrap();
    assert_eq!(outcome.status.state, OptimizationState::Completed);
    assert!(outcome.incumbent.is_some());

    optimizer.shutdown().await.unwrap();
    assert_eq!(optimizer.status().state, OptimizationState::Completed);
    for task in workers {
        task.await.unwrap().unwrap();
    }
    name_server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn stalled_rung_times_out() {
    let name_server = NameServer::start(NameServerConfig::new("stall")).await.unwrap();
    let registry: Arc<dyn Registry> =
        Arc::new(RegistryClient::connect(name_server.address()).await.unwrap());
    let objective: Arc<dyn Objective> = Arc::new(
        |configuration: &Configuration, _budget: Budget| -> Result<f64, EvaluationError> {
            let w = w_of(configuration);
            if w == -3 {
                std::thread::sleep(Duration::from_millis(1500));
            }
            Ok((w + 4) as f64)
        },
    );
    let workers = spawn_workers(&registry, "stall", 4, objective).await;

    let space = integer_space();
    let sampler = Box::new(GridSampler::new(&space, 5));
    let config = session("stall")
        .with_budgets(1.0, 4.0)
        .with_min_workers(4, Some(Duration::from_secs(5)))
        .with_rung_timeout(Some(Duration::from_millis(400)));
    let mut optimizer = Optimizer::new(config, space, Some(sampler), registry).unwrap();

    match optimizer.run().await {
        Err(HbError::Dispatch(DispatchError::BarrierTimeout { outstanding, .. })) => {
            assert_eq!(outstanding, 1)
        }
        other => panic!("expected BarrierTimeout, got {:?}", other.map(|_| ())),
    }

    let store = optimizer.store();
    let stalled: Vec<_> = store
        .runs()
        .filter(|run| w_of(store.configuration(run.config_id).unwrap()) == -3)
        .collect();
    assert_eq!(stalled.len(), 1);
    assert_eq!(stalled[0].status, RunStatus::Failed);
    assert!(stalled[0].error.as_deref().unwrap().contains("abandoned"));
    assert_eq!(store.count_with_status(RunStatus::Completed), 3);
    assert_eq!(optimizer.status().state, OptimizationState::Failed);

    optimizer.shutdown().await.unwrap();
    for task in workers {
        let _ = tokio::time::timeout(Duration::from_secs(5), task).await;
    }
    name_server.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn seeded_random_search_is_reproducible() {
    let space = SearchSpace::new().add_float("w", -3.0, 3.0);
    let config = |run_id: &str| {
        session(run_id)
            .with_budgets(1.0, 9.0)
            .with_eta(3.0)
            .with_seed(Some(42))
    };

    let first = optimize_locally(quadratic(), space.clone(), None, config("seeded-a"), 2)
        .await
        .unwrap();
    let second = optimize_locally(
        quadratic(),
        space.clone(),
        Some(Box::new(RandomSampler::with_seed(space.clone(), Some(42)))),
        config("seeded-b"),
        3,
    )
    .await
    .unwrap();

    let sampled = |outcome: &hb_optimizer::OptimizationOutcome| -> Vec<Configuration> {
        outcome
            .store
            .configs()
            .map(|record| record.configuration.clone())
            .collect()
    };
    assert_eq!(sampled(&first), sampled(&second));
    // 9 + 5 + 3 configurations across the three brackets
    assert_eq!(first.store.config_count(), 17);

    let incumbent = first.incumbent.unwrap();
    assert_eq!(incumbent.budget, 9.0);
    assert_eq!(Some(incumbent.loss), first.store.best_loss_at_or_above(9.0));
    assert!(space.contains(&incumbent.configuration));

    let trajectory: Vec<f64> = first.store.incumbent_trajectory().map(|p| p.loss).collect();
    assert!(!trajectory.is_empty());
    assert!(trajectory.windows(2).all(|pair| pair[1] < pair[0]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn results_survive_on_disk() {
    let dir = TempDir::new().unwrap();
    let space = integer_space();
    let config = session("persisted")
        .with_budgets(1.0, 4.0)
        .with_output_dir(dir.path(), SpaceFormat::Pcs)
        .with_seed(Some(7));

    let outcome = optimize_locally(quadratic(), space.clone(), None, config.clone(), 2)
        .await
        .unwrap();

    let loaded = load_results(dir.path()).unwrap();
    assert_eq!(loaded.config_count(), outcome.store.config_count());
    assert_eq!(loaded.run_count(), outcome.store.run_count());
    assert_eq!(
        loaded.incumbent().map(|run| run.config_id),
        outcome.incumbent.as_ref().map(|best| best.config_id)
    );

    let copy = hb_space::read_space(dir.path().join("configspace.pcs")).unwrap();
    assert_eq!(copy.hyperparameter_names(), vec!["w"]);
    // the local name server cleaned up after itself
    assert!(!dir.path().join("nameserver_persisted.json").exists());

    // a second session refuses to clobber the logs
    let again = optimize_locally(quadratic(), space, None, config, 1).await;
    assert!(matches!(again, Err(HbError::Config(_))));
}
