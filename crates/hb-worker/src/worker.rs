//! The evaluation contract and the TCP worker that serves it.

use std::any::Any;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use hb_types::{
    Budget, Configuration, Evaluation, EvaluationError, HbResult, Job, RegistryError, WorkerError,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::{
    advertised_address, read_message, write_message, WorkerInfo, WorkerRequest, WorkerResponse,
};
use crate::registry::Registry;

/// User code that scores one configuration at one budget. Lower is better.
///
/// Implementations run on a blocking thread and may take as long as they
/// need. Any closure `Fn(&Configuration, Budget) -> Result<f64, EvaluationError>`
/// is an objective; its info records the budget.
pub trait Objective: Send + Sync + 'static {
    fn evaluate(
        &self,
        configuration: &Configuration,
        budget: Budget,
        extra: &Value,
    ) -> Result<Evaluation, EvaluationError>;
}

impl<F> Objective for F
where
    F: Fn(&Configuration, Budget) -> Result<f64, EvaluationError> + Send + Sync + 'static,
{
    fn evaluate(
        &self,
        configuration: &Configuration,
        budget: Budget,
        _extra: &Value,
    ) -> Result<Evaluation, EvaluationError> {
        let loss = self(configuration, budget)?;
        Ok(Evaluation::new(loss).with_info("budget", serde_json::json!(budget)))
    }
}

/// Anything that can take part in a run as a worker.
#[async_trait]
pub trait Worker: Send + Sync {
    fn id(&self) -> &str;

    /// Advertise this worker so dispatchers of its run can find it.
    async fn register(&self, registry: &dyn Registry) -> Result<(), RegistryError>;

    /// Evaluate one job. Stateless across calls.
    async fn evaluate(&self, job: &Job) -> Result<Evaluation, EvaluationError>;

    async fn deregister(&self, registry: &dyn Registry) -> Result<(), RegistryError>;
}

/// Run `objective` on the blocking pool, turning panics and non-finite
/// losses into evaluation errors.
pub(crate) async fn run_objective(
    objective: Arc<dyn Objective>,
    job: Job,
) -> Result<Evaluation, EvaluationError> {
    let task = tokio::task::spawn_blocking(move || {
        objective.evaluate(&job.configuration, job.budget, &job.extra)
    });
    match task.await {
        Ok(result) => result.and_then(Evaluation::validated),
        Err(e) if e.is_panic() => Err(EvaluationError::new(format!(
            "objective panicked: {}",
            panic_message(e.into_panic())
        ))),
        Err(e) => Err(EvaluationError::new(format!("objective was cancelled: {e}"))),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Worker process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub run_id: String,
    /// Generated from the run id and process id when unset.
    pub worker_id: Option<String>,
    pub bind: String,
    pub advertise_host: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            run_id: "halfband".to_string(),
            worker_id: None,
            bind: "127.0.0.1:0".to_string(),
            advertise_host: None,
        }
    }
}

impl WorkerConfig {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = Some(id.into());
        self
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }
}

/// Stops a running [`WorkerServer`] from another task.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Arc<Notify>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.0.notify_one();
    }
}

/// State shared between the accept loop and connection handlers.
struct Shared {
    worker_id: String,
    objective: Arc<dyn Objective>,
    /// One evaluation at a time; later requests queue.
    slot: Semaphore,
    current_job: Mutex<Option<Uuid>>,
    completed: AtomicUsize,
    shutdown: Arc<Notify>,
}

impl Shared {
    async fn evaluate(&self, job: Job) -> Result<Evaluation, EvaluationError> {
        let _permit = self
            .slot
            .acquire()
            .await
            .map_err(|_| EvaluationError::new("worker is shutting down"))?;
        *self.current_job.lock() = Some(job.id);
        debug!(worker = %self.worker_id, job = %job.id, config = %job.config_id, budget = job.budget, "evaluating");

        let result = run_objective(self.objective.clone(), job).await;

        *self.current_job.lock() = None;
        self.completed.fetch_add(1, Ordering::Relaxed);
        result
    }

    async fn handle(&self, stream: TcpStream) -> io::Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let Some(request) = read_message::<_, WorkerRequest>(&mut reader).await? else {
            return Ok(());
        };

        let response = match request {
            WorkerRequest::Evaluate { job } => {
                let job_id = job.id;
                match self.evaluate(job).await {
                    Ok(evaluation) => WorkerResponse::Completed { job_id, evaluation },
                    Err(error) => {
                        warn!(worker = %self.worker_id, job = %job_id, error = %error, "evaluation failed");
                        WorkerResponse::Failed { job_id, error }
                    }
                }
            }
            WorkerRequest::Ping => {
                let busy = self.current_job.lock().is_some();
                WorkerResponse::Pong {
                    worker_id: self.worker_id.clone(),
                    busy,
                }
            }
            WorkerRequest::Shutdown => {
                info!(worker = %self.worker_id, "shutdown requested");
                self.shutdown.notify_one();
                WorkerResponse::Ack
            }
        };
        write_message(&mut writer, &response).await
    }
}

/// A worker that accepts jobs over TCP and runs them with an [`Objective`].
pub struct WorkerServer {
    info: WorkerInfo,
    listener: TcpListener,
    shared: Arc<Shared>,
}

impl WorkerServer {
    pub async fn bind(config: WorkerConfig, objective: Arc<dyn Objective>) -> Result<Self, WorkerError> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|e| WorkerError::Bind {
                address: config.bind.clone(),
                message: e.to_string(),
            })?;
        let local = listener.local_addr().map_err(|e| WorkerError::Bind {
            address: config.bind.clone(),
            message: e.to_string(),
        })?;
        let address = advertised_address(local, config.advertise_host.as_deref());

        let worker_id = config.worker_id.unwrap_or_else(|| {
            let suffix = Uuid::new_v4().simple().to_string();
            format!("{}.{}.{}", config.run_id, std::process::id(), &suffix[..8])
        });

        let shared = Arc::new(Shared {
            worker_id: worker_id.clone(),
            objective,
            slot: Semaphore::new(1),
            current_job: Mutex::new(None),
            completed: AtomicUsize::new(0),
            shutdown: Arc::new(Notify::new()),
        });

        Ok(Self {
            info: WorkerInfo::new(worker_id, config.run_id, address),
            listener,
            shared,
        })
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    pub fn address(&self) -> &str {
        &self.info.address
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.shared.shutdown.clone())
    }

    /// Number of evaluations finished so far.
    pub fn completed_jobs(&self) -> usize {
        self.shared.completed.load(Ordering::Relaxed)
    }

    /// Register, accept jobs until shut down, then deregister.
    ///
    /// Shutdown comes from a [`ShutdownHandle`] or a `shutdown` request on
    /// the wire. An evaluation still running at that point is left to finish
    /// on its blocking thread; its reply is dropped.
    pub async fn serve(self, registry: Arc<dyn Registry>) -> HbResult<()> {
        self.register(registry.as_ref()).await?;
        info!(
            worker = %self.info.id,
            run_id = %self.info.run_id,
            address = %self.info.address,
            "worker registered"
        );

        loop {
            tokio::select! {
                _ = self.shared.shutdown.notified() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            if let Err(e) = shared.handle(stream).await {
                                debug!(worker = %shared.worker_id, %peer, error = %e, "connection failed");
                            }
                        });
                    }
                    Err(e) => warn!(worker = %self.info.id, error = %e, "accept failed"),
                }
            }
        }

        self.shared.slot.close();
        if let Err(e) = self.deregister(registry.as_ref()).await {
            warn!(worker = %self.info.id, error = %e, "deregistration failed");
        }
        info!(worker = %self.info.id, completed = self.completed_jobs(), "worker stopped");
        Ok(())
    }
}

#[async_trait]
impl Worker for WorkerServer {
    fn id(&self) -> &str {
        &self.info.id
    }

    async fn register(&self, registry: &dyn Registry) -> Result<(), RegistryError> {
        let mut info = self.info.clone();
        info.registered_at = chrono::Utc::now();
        registry.register(info).await
    }

    async fn evaluate(&self, job: &Job) -> Result<Evaluation, EvaluationError> {
        self.shared.evaluate(job.clone()).await
    }

    async fn deregister(&self, registry: &dyn Registry) -> Result<(), RegistryError> {
        registry.deregister(&self.info.id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::WorkerTable;
    use hb_types::ConfigId;
    use std::time::Duration;

    fn quadratic() -> Arc<dyn Objective> {
        Arc::new(|config: &Configuration, _budget: Budget| -> Result<f64, EvaluationError> {
            let w = config
                .get("w")
                .and_then(|v| v.as_f64())
                .ok_or_else(|| EvaluationError::new("missing w"))?;
            Ok((w - 1.0) * (w - 1.0))
        })
    }

    fn job(w: i64, budget: f64) -> Job {
        Job::new(ConfigId::new(0, 0, 0), Configuration::new().with("w", w), budget)
    }

    #[test]
    fn closures_are_objectives() {
        let objective = quadratic();
        let evaluation = objective
            .evaluate(&Configuration::new().with("w", 3i64), 4.0, &Value::Null)
            .unwrap();
        assert_eq!(evaluation.loss, 4.0);
        assert_eq!(evaluation.info.get("budget"), Some(&serde_json::json!(4.0)));

        let err = objective
            .evaluate(&Configuration::new(), 4.0, &Value::Null)
            .unwrap_err();
        assert_eq!(err.message, "missing w");
    }

    #[tokio::test]
    async fn panics_and_nan_become_evaluation_errors() {
        let panicking: Arc<dyn Objective> =
            Arc::new(|_: &Configuration, _: Budget| -> Result<f64, EvaluationError> {
                panic!("boom")
            });
        let err = run_objective(panicking, job(0, 1.0)).await.unwrap_err();
        assert!(err.message.contains("boom"), "{}", err.message);

        let nan: Arc<dyn Objective> =
            Arc::new(|_: &Configuration, _: Budget| -> Result<f64, EvaluationError> { Ok(f64::NAN) });
        let err = run_objective(nan, job(0, 1.0)).await.unwrap_err();
        assert!(err.message.contains("non-finite"));
    }

    #[tokio::test]
    async fn worker_evaluates_in_process() {
        let server = WorkerServer::bind(WorkerConfig::new("unit"), quadratic())
            .await
            .unwrap();
        let evaluation = server.evaluate(&job(1, 2.0)).await.unwrap();
        assert_eq!(evaluation.loss, 0.0);
        assert_eq!(server.completed_jobs(), 1);
    }

    #[tokio::test]
    async fn serve_registers_and_deregisters() {
        let table = Arc::new(WorkerTable::new());
        let server = WorkerServer::bind(
            WorkerConfig::new("unit").with_worker_id("w-7"),
            quadratic(),
        )
        .await
        .unwrap();
        let handle = server.shutdown_handle();
        let registry: Arc<dyn Registry> = table.clone();
        let task = tokio::spawn(server.serve(registry));

        let mut listed = Vec::new();
        for _ in 0..50 {
            listed = table.list("unit").await.unwrap();
            if !listed.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "w-7");

        handle.shutdown();
        task.await.unwrap().unwrap();
        assert!(table.list("unit").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = taken.local_addr().unwrap().to_string();
        let err = WorkerServer::bind(WorkerConfig::new("unit").with_bind(address), quadratic())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, WorkerError::Bind { .. }));
    }
}
