//! Master-side job queue.
//!
//! The [`Dispatcher`] owns the idle/busy worker sets and the pending queue.
//! Jobs go to idle workers in FIFO order; each assignment runs as its own
//! task and reports back over a channel, so the caller only ever waits in
//! [`Dispatcher::next_event`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hb_types::{
    Budget, ConfigId, DispatchError, Evaluation, HbResult, Job, JobFailure, JobId, RegistryError,
    WorkerError,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::protocol::{call, WorkerInfo, WorkerRequest, WorkerResponse};
use crate::registry::Registry;

/// What to do when a bounded wait runs out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// Fail with the corresponding error.
    #[default]
    Abort,
    /// Continue with whatever workers or results are available.
    Degrade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Only workers registered under this run are used.
    pub run_id: String,
    /// How often the registry is re-read while jobs wait for a worker.
    pub poll_interval: Duration,
    pub connect_timeout: Duration,
    /// Per-job limit; `None` waits for the worker indefinitely.
    pub job_timeout: Option<Duration>,
    /// Limit for each worker's shutdown acknowledgement.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            run_id: "halfband".to_string(),
            poll_interval: Duration::from_millis(500),
            connect_timeout: Duration::from_secs(5),
            job_timeout: None,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl DispatcherConfig {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

/// Handle to a registered worker, used from the master.
#[derive(Debug, Clone)]
pub struct RemoteWorker {
    info: WorkerInfo,
    connect_timeout: Duration,
}

impl RemoteWorker {
    pub fn new(info: WorkerInfo, connect_timeout: Duration) -> Self {
        Self {
            info,
            connect_timeout,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn info(&self) -> &WorkerInfo {
        &self.info
    }

    /// Send a job and wait for its result.
    ///
    /// Transport failures become [`JobFailure::WorkerLost`], an expired
    /// `timeout` becomes [`JobFailure::TimedOut`].
    pub async fn evaluate(&self, job: &Job, timeout: Option<Duration>) -> Result<Evaluation, JobFailure> {
        let request = WorkerRequest::Evaluate { job: job.clone() };
        let started = Instant::now();
        let reply = call::<_, WorkerResponse>(&self.info.address, &request, self.connect_timeout, timeout).await;

        match reply {
            Ok(WorkerResponse::Completed { job_id, evaluation }) if job_id == job.id => {
                evaluation.validated().map_err(JobFailure::from)
            }
            Ok(WorkerResponse::Failed { job_id, error }) if job_id == job.id => {
                Err(JobFailure::Evaluation(error))
            }
            Ok(other) => Err(JobFailure::WorkerLost {
                worker_id: self.info.id.clone(),
                message: format!("unexpected reply {other:?}"),
            }),
            Err(e)
                if e.kind() == io::ErrorKind::TimedOut
                    && timeout.is_some_and(|limit| started.elapsed() >= limit) =>
            {
                Err(JobFailure::TimedOut {
                    worker_id: self.info.id.clone(),
                    seconds: started.elapsed().as_secs_f64(),
                })
            }
            Err(e) => Err(JobFailure::WorkerLost {
                worker_id: self.info.id.clone(),
                message: e.to_string(),
            }),
        }
    }

    /// Whether the worker is currently running a job.
    pub async fn ping(&self) -> Result<bool, WorkerError> {
        match self.request(&WorkerRequest::Ping).await? {
            WorkerResponse::Pong { busy, .. } => Ok(busy),
            other => Err(WorkerError::Protocol {
                message: format!("unexpected reply to ping: {other:?}"),
            }),
        }
    }

    /// Ask the worker process to stop and deregister itself.
    pub async fn shutdown(&self) -> Result<(), WorkerError> {
        match self.request(&WorkerRequest::Shutdown).await? {
            WorkerResponse::Ack => Ok(()),
            other => Err(WorkerError::Protocol {
                message: format!("unexpected reply to shutdown: {other:?}"),
            }),
        }
    }

    async fn request(&self, request: &WorkerRequest) -> Result<WorkerResponse, WorkerError> {
        call(
            &self.info.address,
            request,
            self.connect_timeout,
            Some(self.connect_timeout),
        )
        .await
        .map_err(|e| WorkerError::Unreachable {
            worker_id: self.info.id.clone(),
            message: e.to_string(),
        })
    }
}

/// A job that reached a terminal state.
#[derive(Debug, Clone, PartialEq)]
pub struct JobOutcome {
    pub job: Job,
    /// `None` if the job never left the queue.
    pub worker_id: Option<String>,
    pub result: Result<Evaluation, JobFailure>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEvent {
    /// A job was handed to a worker.
    Started {
        job_id: JobId,
        config_id: ConfigId,
        budget: Budget,
        worker_id: String,
        at: DateTime<Utc>,
    },
    Finished(JobOutcome),
}

struct InFlight {
    job: Job,
    worker_id: String,
    started_at: DateTime<Utc>,
    task: JoinHandle<()>,
}

struct Completion {
    job_id: JobId,
    result: Result<Evaluation, JobFailure>,
    finished_at: DateTime<Utc>,
}

pub struct Dispatcher {
    config: DispatcherConfig,
    registry: Arc<dyn Registry>,
    workers: HashMap<String, RemoteWorker>,
    idle: VecDeque<String>,
    /// Lost or timed-out workers; never assigned again this session.
    quarantined: HashSet<String>,
    pending: VecDeque<Job>,
    in_flight: HashMap<JobId, InFlight>,
    started: VecDeque<DispatchEvent>,
    /// Queued jobs released because no worker was left to run them.
    stranded: VecDeque<JobOutcome>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    /// When the current batch of outstanding work began.
    busy_since: Option<Instant>,
    shut_down: bool,
}

impl Dispatcher {
    pub fn new(registry: Arc<dyn Registry>, config: DispatcherConfig) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            config,
            registry,
            workers: HashMap::new(),
            idle: VecDeque::new(),
            quarantined: HashSet::new(),
            pending: VecDeque::new(),
            in_flight: HashMap::new(),
            started: VecDeque::new(),
            stranded: VecDeque::new(),
            completions_tx,
            completions_rx,
            busy_since: None,
            shut_down: false,
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.config
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn idle_count(&self) -> usize {
        self.idle.len()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Jobs submitted but not yet terminal.
    pub fn outstanding(&self) -> usize {
        self.pending.len() + self.in_flight.len()
    }

    pub fn workers(&self) -> impl Iterator<Item = &WorkerInfo> {
        self.workers.values().map(RemoteWorker::info)
    }

    /// Re-read the registry: adopt new workers of this run, forget idle
    /// workers that left. Returns the number of usable workers.
    pub async fn discover(&mut self) -> Result<usize, RegistryError> {
        let listed = self.registry.list(&self.config.run_id).await?;

        let gone: Vec<String> = {
            let listed_ids: HashSet<&str> = listed.iter().map(|w| w.id.as_str()).collect();
            self.idle
                .iter()
                .filter(|id| !listed_ids.contains(id.as_str()))
                .cloned()
                .collect()
        };
        for id in gone {
            info!(worker = %id, "worker left the registry");
            self.forget(&id);
        }

        for info in listed {
            if self.quarantined.contains(&info.id) || self.workers.contains_key(&info.id) {
                continue;
            }
            info!(worker = %info.id, address = %info.address, "discovered worker");
            self.idle.push_back(info.id.clone());
            self.workers
                .insert(info.id.clone(), RemoteWorker::new(info, self.config.connect_timeout));
        }

        self.assign();
        Ok(self.workers.len())
    }

    /// Block until at least `min_workers` are registered.
    ///
    /// With a timeout, [`TimeoutPolicy::Abort`] fails with
    /// `InsufficientWorkers`; [`TimeoutPolicy::Degrade`] proceeds if at least
    /// one worker showed up. Without a timeout this waits indefinitely.
    pub async fn wait_for_workers(
        &mut self,
        min_workers: usize,
        timeout: Option<Duration>,
        policy: TimeoutPolicy,
    ) -> HbResult<usize> {
        let started = Instant::now();
        let deadline = timeout.map(|limit| started + limit);

        loop {
            let available = self.discover().await?;
            if available >= min_workers {
                info!(available, required = min_workers, "worker quorum reached");
                return Ok(available);
            }

            let mut pause = self.config.poll_interval;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    let waited = started.elapsed();
                    if policy == TimeoutPolicy::Degrade && available > 0 {
                        warn!(
                            available,
                            required = min_workers,
                            ?waited,
                            "worker quorum not reached; continuing with fewer workers"
                        );
                        return Ok(available);
                    }
                    return Err(DispatchError::InsufficientWorkers {
                        required: min_workers,
                        available,
                        waited,
                    }
                    .into());
                }
                pause = pause.min(deadline - now);
            }

            debug!(available, required = min_workers, "waiting for workers");
            tokio::time::sleep(pause).await;
        }
    }

    /// Queue a job; it starts as soon as a worker is idle.
    pub fn submit(&mut self, job: Job) -> Result<(), DispatchError> {
        if self.shut_down {
            return Err(DispatchError::ShutDown);
        }
        if self.outstanding() == 0 {
            self.busy_since = Some(Instant::now());
        }
        debug!(job = %job.id, config = %job.config_id, budget = job.budget, "job queued");
        self.pending.push_back(job);
        self.assign();
        Ok(())
    }

    /// Wait for the next job start or completion.
    ///
    /// Returns `Ok(None)` once nothing is outstanding, and
    /// `BarrierTimeout` if `deadline` passes first. Outstanding jobs are left
    /// untouched on timeout; see [`Dispatcher::abandon_outstanding`].
    ///
    /// Queued jobs that no worker can take any more (every worker lost and
    /// none newly registered) finish as [`JobFailure::Abandoned`].
    pub async fn next_event(&mut self, deadline: Option<Instant>) -> HbResult<Option<DispatchEvent>> {
        loop {
            if let Some(event) = self.started.pop_front() {
                return Ok(Some(event));
            }
            if let Some(outcome) = self.stranded.pop_front() {
                return Ok(Some(DispatchEvent::Finished(outcome)));
            }
            if self.is_stranded() {
                if let Err(e) = self.discover().await {
                    warn!(error = %e, pending = self.pending.len(), "worker discovery failed");
                }
                if self.is_stranded() {
                    self.release_stranded();
                    continue;
                }
            }
            if self.outstanding() == 0 {
                self.busy_since = None;
                return Ok(None);
            }
            if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
                return Err(self.barrier_timeout().into());
            }

            tokio::select! {
                Some(completion) = self.completions_rx.recv() => {
                    if let Some(outcome) = self.complete(completion) {
                        return Ok(Some(DispatchEvent::Finished(outcome)));
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    return Err(self.barrier_timeout().into());
                }
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if !self.pending.is_empty() {
                        if let Err(e) = self.discover().await {
                            warn!(error = %e, pending = self.pending.len(), "worker discovery failed");
                        }
                    }
                }
            }
        }
    }

    /// Give up on every queued and running job, returning them as
    /// [`JobFailure::Abandoned`] outcomes. Running evaluations are
    /// disconnected; their workers stay in the pool.
    pub fn abandon_outstanding(&mut self, reason: &str) -> Vec<JobOutcome> {
        let now = Utc::now();
        let mut outcomes: Vec<JobOutcome> = self.stranded.drain(..).collect();
        outcomes.reserve(self.outstanding());
        self.started.clear();

        for (_, flight) in self.in_flight.drain() {
            flight.task.abort();
            if self.workers.contains_key(&flight.worker_id) {
                self.idle.push_back(flight.worker_id.clone());
            }
            outcomes.push(JobOutcome {
                job: flight.job,
                worker_id: Some(flight.worker_id),
                result: Err(JobFailure::Abandoned {
                    reason: reason.to_string(),
                }),
                started_at: Some(flight.started_at),
                finished_at: now,
            });
        }
        for job in self.pending.drain(..) {
            outcomes.push(JobOutcome {
                job,
                worker_id: None,
                result: Err(JobFailure::Abandoned {
                    reason: reason.to_string(),
                }),
                started_at: None,
                finished_at: now,
            });
        }
        while self.completions_rx.try_recv().is_ok() {}
        self.busy_since = None;

        outcomes.sort_by_key(|outcome| outcome.job.config_id);
        if !outcomes.is_empty() {
            warn!(count = outcomes.len(), reason, "abandoned outstanding jobs");
        }
        outcomes
    }

    /// Discard outstanding work, tell every worker to stop, and deregister
    /// the ones that cannot be reached.
    pub async fn shutdown(&mut self) -> HbResult<()> {
        if self.shut_down {
            return Ok(());
        }
        self.shut_down = true;
        let discarded = self.abandon_outstanding("dispatcher shut down");

        let workers: Vec<RemoteWorker> = self.workers.drain().map(|(_, worker)| worker).collect();
        self.idle.clear();
        for worker in &workers {
            match tokio::time::timeout(self.config.shutdown_timeout, worker.shutdown()).await {
                Ok(Ok(())) => debug!(worker = %worker.id(), "worker acknowledged shutdown"),
                Ok(Err(e)) => {
                    warn!(worker = %worker.id(), error = %e, "worker shutdown failed");
                    self.deregister_quietly(worker.id()).await;
                }
                Err(_) => {
                    warn!(worker = %worker.id(), "worker shutdown timed out");
                    self.deregister_quietly(worker.id()).await;
                }
            }
        }
        let quarantined: Vec<String> = self.quarantined.iter().cloned().collect();
        for id in &quarantined {
            self.deregister_quietly(id).await;
        }

        info!(
            workers = workers.len(),
            discarded = discarded.len(),
            "dispatcher shut down"
        );
        Ok(())
    }

    fn assign(&mut self) {
        while !self.pending.is_empty() {
            let Some(worker_id) = self.idle.pop_front() else {
                break;
            };
            let Some(worker) = self.workers.get(&worker_id).cloned() else {
                continue;
            };
            let Some(job) = self.pending.pop_front() else {
                self.idle.push_front(worker_id);
                break;
            };

            let started_at = Utc::now();
            let tx = self.completions_tx.clone();
            let timeout = self.config.job_timeout;
            let request = job.clone();
            let task = tokio::spawn(async move {
                let result = worker.evaluate(&request, timeout).await;
                let _ = tx.send(Completion {
                    job_id: request.id,
                    result,
                    finished_at: Utc::now(),
                });
            });

            debug!(job = %job.id, config = %job.config_id, budget = job.budget, worker = %worker_id, "job started");
            self.started.push_back(DispatchEvent::Started {
                job_id: job.id,
                config_id: job.config_id,
                budget: job.budget,
                worker_id: worker_id.clone(),
                at: started_at,
            });
            self.in_flight.insert(
                job.id,
                InFlight {
                    job,
                    worker_id,
                    started_at,
                    task,
                },
            );
        }
    }

    fn complete(&mut self, completion: Completion) -> Option<JobOutcome> {
        // Late replies for abandoned jobs are dropped.
        let flight = self.in_flight.remove(&completion.job_id)?;

        match &completion.result {
            Err(failure @ (JobFailure::WorkerLost { .. } | JobFailure::TimedOut { .. })) => {
                warn!(worker = %flight.worker_id, job = %flight.job.id, error = %failure, "dropping worker");
                self.forget(&flight.worker_id);
                self.quarantined.insert(flight.worker_id.clone());
            }
            _ => {
                if self.workers.contains_key(&flight.worker_id) {
                    self.idle.push_back(flight.worker_id.clone());
                }
            }
        }
        self.assign();

        Some(JobOutcome {
            job: flight.job,
            worker_id: Some(flight.worker_id),
            result: completion.result,
            started_at: Some(flight.started_at),
            finished_at: completion.finished_at,
        })
    }

    /// Jobs are queued but nothing runs and no worker is left to run them.
    fn is_stranded(&self) -> bool {
        !self.pending.is_empty() && self.in_flight.is_empty() && self.workers.is_empty()
    }

    fn release_stranded(&mut self) {
        let now = Utc::now();
        warn!(
            count = self.pending.len(),
            quarantined = self.quarantined.len(),
            "no workers left; failing queued jobs"
        );
        for job in self.pending.drain(..) {
            self.stranded.push_back(JobOutcome {
                job,
                worker_id: None,
                result: Err(JobFailure::Abandoned {
                    reason: "no workers left".to_string(),
                }),
                started_at: None,
                finished_at: now,
            });
        }
    }

    fn forget(&mut self, worker_id: &str) {
        self.workers.remove(worker_id);
        self.idle.retain(|id| id != worker_id);
    }

    fn barrier_timeout(&self) -> DispatchError {
        DispatchError::BarrierTimeout {
            outstanding: self.outstanding(),
            waited: self.busy_since.map(|at| at.elapsed()).unwrap_or_default(),
        }
    }

    async fn deregister_quietly(&self, worker_id: &str) {
        if let Err(e) = self.registry.deregister(worker_id).await {
            debug!(worker = %worker_id, error = %e, "deregistration failed");
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        for flight in self.in_flight.values() {
            flight.task.abort();
        }
    }
}
