//! Service registry: the name server, its in-memory table, and the client.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use hb_types::{internal_error, HbResult, RegistryError};
use serde::{Deserialize, Serialize};
use tokio::io::BufReader;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{
    advertised_address, call, read_message, write_message, RegistryRequest, RegistryResponse,
    WorkerInfo,
};

/// Discovery interface shared by the in-process table and the TCP client.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Advertise a worker. Re-registering an id replaces the old entry.
    async fn register(&self, worker: WorkerInfo) -> Result<(), RegistryError>;

    /// Remove a worker. Unknown ids are ignored.
    async fn deregister(&self, worker_id: &str) -> Result<(), RegistryError>;

    /// Workers registered under `run_id`, oldest registration first.
    async fn list(&self, run_id: &str) -> Result<Vec<WorkerInfo>, RegistryError>;
}

/// In-memory worker table backing a [`NameServer`].
#[derive(Debug, Default)]
pub struct WorkerTable {
    workers: DashMap<String, WorkerInfo>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

#[async_trait]
impl Registry for WorkerTable {
    async fn register(&self, worker: WorkerInfo) -> Result<(), RegistryError> {
        debug!(worker = %worker.id, address = %worker.address, "registering worker");
        self.workers.insert(worker.id.clone(), worker);
        Ok(())
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), RegistryError> {
        if self.workers.remove(worker_id).is_some() {
            debug!(worker = %worker_id, "deregistered worker");
        }
        Ok(())
    }

    async fn list(&self, run_id: &str) -> Result<Vec<WorkerInfo>, RegistryError> {
        let mut workers: Vec<WorkerInfo> = self
            .workers
            .iter()
            .filter(|entry| entry.run_id == run_id)
            .map(|entry| entry.value().clone())
            .collect();
        workers.sort_by(|a, b| {
            a.registered_at
                .cmp(&b.registered_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        Ok(workers)
    }
}

/// Contents of the `nameserver_<run_id>.json` file a name server leaves in
/// its working directory so processes on other hosts can find it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub run_id: String,
    pub address: String,
}

impl Credentials {
    pub fn file_name(run_id: &str) -> String {
        format!("nameserver_{run_id}.json")
    }

    pub fn path_in(directory: &Path, run_id: &str) -> PathBuf {
        directory.join(Self::file_name(run_id))
    }

    pub fn load(directory: &Path, run_id: &str) -> Result<Self, RegistryError> {
        let path = Self::path_in(directory, run_id);
        let text = fs::read_to_string(&path).map_err(|_| RegistryError::CredentialsNotFound {
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&text).map_err(|e| RegistryError::Protocol {
            message: format!("malformed credentials file {}: {e}", path.display()),
        })
    }

    /// Write the file via a temporary sibling so readers never see a partial file.
    pub fn store(&self, directory: &Path) -> io::Result<PathBuf> {
        fs::create_dir_all(directory)?;
        let path = Self::path_in(directory, &self.run_id);
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_vec_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)?;
        Ok(path)
    }
}

/// Name server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NameServerConfig {
    pub run_id: String,
    /// Address to listen on; port 0 picks a free port.
    pub bind: String,
    /// Host written into the credentials file instead of the bound IP.
    pub advertise_host: Option<String>,
    /// Where the credentials file is written, if anywhere.
    pub working_directory: Option<PathBuf>,
}

impl Default for NameServerConfig {
    fn default() -> Self {
        Self {
            run_id: "halfband".to_string(),
            bind: "127.0.0.1:0".to_string(),
            advertise_host: None,
            working_directory: None,
        }
    }
}

impl NameServerConfig {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            ..Self::default()
        }
    }

    pub fn with_bind(mut self, bind: impl Into<String>) -> Self {
        self.bind = bind.into();
        self
    }

    pub fn with_advertise_host(mut self, host: impl Into<String>) -> Self {
        self.advertise_host = Some(host.into());
        self
    }

    pub fn with_working_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(directory.into());
        self
    }
}

/// TCP name server for one run.
///
/// Owns its accept loop: [`NameServer::start`] spawns it and
/// [`NameServer::shutdown`] stops it and removes the credentials file.
pub struct NameServer {
    run_id: String,
    address: String,
    table: Arc<WorkerTable>,
    shutdown: Arc<Notify>,
    task: Option<JoinHandle<()>>,
    credentials_path: Option<PathBuf>,
}

impl NameServer {
    pub async fn start(config: NameServerConfig) -> HbResult<Self> {
        let listener = TcpListener::bind(&config.bind)
            .await
            .map_err(|e| RegistryError::Unavailable {
                address: config.bind.clone(),
                reason: e.to_string(),
            })?;
        let address = advertised_address(listener.local_addr()?, config.advertise_host.as_deref());

        let credentials_path = match &config.working_directory {
            Some(directory) => {
                let credentials = Credentials {
                    run_id: config.run_id.clone(),
                    address: address.clone(),
                };
                Some(credentials.store(directory)?)
            }
            None => None,
        };

        let table = Arc::new(WorkerTable::new());
        let shutdown = Arc::new(Notify::new());
        let task = tokio::spawn(accept_loop(
            listener,
            table.clone(),
            shutdown.clone(),
            config.run_id.clone(),
        ));

        info!(run_id = %config.run_id, address = %address, "name server started");
        Ok(Self {
            run_id: config.run_id,
            address,
            table,
            shutdown,
            task: Some(task),
            credentials_path,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn credentials_path(&self) -> Option<&Path> {
        self.credentials_path.as_deref()
    }

    /// In-process view of the registered workers.
    pub fn registry(&self) -> Arc<WorkerTable> {
        self.table.clone()
    }

    pub async fn shutdown(mut self) -> HbResult<()> {
        self.shutdown.notify_one();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| internal_error!("name server task failed: {}", e))?;
        }
        if let Some(path) = self.credentials_path.take() {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!(run_id = %self.run_id, "name server stopped");
        Ok(())
    }
}

impl Drop for NameServer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    table: Arc<WorkerTable>,
    shutdown: Arc<Notify>,
    run_id: String,
) {
    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let table = table.clone();
                    let run_id = run_id.clone();
                    tokio::spawn(async move {
                        if let Err(e) = serve_request(stream, &table, &run_id).await {
                            debug!(%peer, error = %e, "registry connection failed");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "name server accept failed"),
            }
        }
    }
}

async fn serve_request(stream: TcpStream, table: &WorkerTable, run_id: &str) -> io::Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let request = match read_message::<_, RegistryRequest>(&mut reader).await {
        Ok(Some(request)) => request,
        Ok(None) => return Ok(()),
        Err(e) if e.kind() == io::ErrorKind::InvalidData => {
            let reply = RegistryResponse::Error {
                message: format!("malformed request: {e}"),
            };
            return write_message(&mut writer, &reply).await;
        }
        Err(e) => return Err(e),
    };

    let response = match request {
        RegistryRequest::Register { worker } if worker.run_id != run_id => RegistryResponse::Error {
            message: format!(
                "worker {} belongs to run {}, this name server serves {}",
                worker.id, worker.run_id, run_id
            ),
        },
        RegistryRequest::Register { worker } => {
            info!(worker = %worker.id, address = %worker.address, "worker registered");
            reply(table.register(worker).await)
        }
        RegistryRequest::Deregister { worker_id } => {
            info!(worker = %worker_id, "worker deregistered");
            reply(table.deregister(&worker_id).await)
        }
        RegistryRequest::List { run_id } => match table.list(&run_id).await {
            Ok(workers) => RegistryResponse::Workers { workers },
            Err(e) => RegistryResponse::Error {
                message: e.to_string(),
            },
        },
        RegistryRequest::Ping => RegistryResponse::Pong {
            run_id: run_id.to_string(),
        },
    };
    write_message(&mut writer, &response).await
}

fn reply(result: Result<(), RegistryError>) -> RegistryResponse {
    match result {
        Ok(()) => RegistryResponse::Ok,
        Err(e) => RegistryResponse::Error {
            message: e.to_string(),
        },
    }
}

/// TCP client for a remote [`NameServer`].
#[derive(Debug, Clone)]
pub struct RegistryClient {
    address: String,
    run_id: String,
    timeout: Duration,
}

impl RegistryClient {
    const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

    /// Connect and ping; fails with [`RegistryError::Unavailable`] if nobody answers.
    pub async fn connect(address: impl Into<String>) -> Result<Self, RegistryError> {
        let mut client = Self {
            address: address.into(),
            run_id: String::new(),
            timeout: Self::DEFAULT_TIMEOUT,
        };
        match client.call(&RegistryRequest::Ping).await? {
            RegistryResponse::Pong { run_id } => {
                client.run_id = run_id;
                debug!(address = %client.address, run_id = %client.run_id, "connected to name server");
                Ok(client)
            }
            other => Err(unexpected(&other)),
        }
    }

    /// Locate the name server through its credentials file.
    pub async fn from_credentials(directory: &Path, run_id: &str) -> Result<Self, RegistryError> {
        let credentials = Credentials::load(directory, run_id)?;
        let client = Self::connect(credentials.address).await?;
        if client.run_id != run_id {
            return Err(RegistryError::Rejected {
                message: format!(
                    "name server at {} serves run {}, expected {}",
                    client.address, client.run_id, run_id
                ),
            });
        }
        Ok(client)
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// The run the connected name server serves.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    async fn call(&self, request: &RegistryRequest) -> Result<RegistryResponse, RegistryError> {
        let response = call(&self.address, request, self.timeout, Some(self.timeout))
            .await
            .map_err(|e| RegistryError::Unavailable {
                address: self.address.clone(),
                reason: e.to_string(),
            })?;
        match response {
            RegistryResponse::Error { message } => Err(RegistryError::Rejected { message }),
            other => Ok(other),
        }
    }
}

fn unexpected(response: &RegistryResponse) -> RegistryError {
    RegistryError::Protocol {
        message: format!("unexpected registry response: {response:?}"),
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn register(&self, worker: WorkerInfo) -> Result<(), RegistryError> {
        match self.call(&RegistryRequest::Register { worker }).await? {
            RegistryResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn deregister(&self, worker_id: &str) -> Result<(), RegistryError> {
        let request = RegistryRequest::Deregister {
            worker_id: worker_id.to_string(),
        };
        match self.call(&request).await? {
            RegistryResponse::Ok => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    async fn list(&self, run_id: &str) -> Result<Vec<WorkerInfo>, RegistryError> {
        let request = RegistryRequest::List {
            run_id: run_id.to_string(),
        };
        match self.call(&request).await? {
            RegistryResponse::Workers { workers } => Ok(workers),
            other => Err(unexpected(&other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn table_filters_by_run() {
        let table = WorkerTable::new();
        table
            .register(WorkerInfo::new("a", "run-1", "127.0.0.1:1"))
            .await
            .unwrap();
        table
            .register(WorkerInfo::new("b", "run-2", "127.0.0.1:2"))
            .await
            .unwrap();

        let listed = table.list("run-1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");

        table.deregister("a").await.unwrap();
        table.deregister("a").await.unwrap();
        assert!(table.list("run-1").await.unwrap().is_empty());
        assert_eq!(table.len(), 1);
    }

    #[tokio::test]
    async fn client_registers_and_lists_over_tcp() {
        let server = NameServer::start(NameServerConfig::new("demo")).await.unwrap();
        let client = RegistryClient::connect(server.address()).await.unwrap();
        assert_eq!(client.run_id(), "demo");

        client
            .register(WorkerInfo::new("w-0", "demo", "127.0.0.1:9000"))
            .await
            .unwrap();
        let workers = client.list("demo").await.unwrap();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].address, "127.0.0.1:9000");
        assert_eq!(server.registry().len(), 1);

        client.deregister("w-0").await.unwrap();
        assert!(client.list("demo").await.unwrap().is_empty());

        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn foreign_run_registration_is_rejected() {
        let server = NameServer::start(NameServerConfig::new("demo")).await.unwrap();
        let client = RegistryClient::connect(server.address()).await.unwrap();

        let err = client
            .register(WorkerInfo::new("w-0", "other", "127.0.0.1:9000"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Rejected { .. }));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn credentials_file_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let server = NameServer::start(
            NameServerConfig::new("shared").with_working_directory(dir.path()),
        )
        .await
        .unwrap();

        let path = server.credentials_path().unwrap().to_path_buf();
        assert_eq!(path, dir.path().join("nameserver_shared.json"));
        assert!(path.exists());

        let client = RegistryClient::from_credentials(dir.path(), "shared")
            .await
            .unwrap();
        assert_eq!(client.address(), server.address());

        server.shutdown().await.unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn missing_credentials_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = RegistryClient::from_credentials(dir.path(), "nobody")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::CredentialsNotFound { .. }));
    }

    #[tokio::test]
    async fn unreachable_registry_is_unavailable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = RegistryClient::connect(address).await.unwrap_err();
        assert!(matches!(err, RegistryError::Unavailable { .. }));
    }
}
