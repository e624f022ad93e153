//! Wire messages and framing.
//!
//! Every exchange is a single request line answered by a single response
//! line on a fresh TCP connection.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hb_types::{Evaluation, EvaluationError, Job, JobId};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// A worker as advertised in the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    pub id: String,
    pub run_id: String,
    /// `host:port` the worker accepts jobs on.
    pub address: String,
    pub registered_at: DateTime<Utc>,
}

impl WorkerInfo {
    pub fn new(id: impl Into<String>, run_id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            run_id: run_id.into(),
            address: address.into(),
            registered_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum RegistryRequest {
    Register { worker: WorkerInfo },
    Deregister { worker_id: String },
    List { run_id: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RegistryResponse {
    Ok,
    Workers { workers: Vec<WorkerInfo> },
    Pong { run_id: String },
    Error { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum WorkerRequest {
    Evaluate { job: Job },
    Ping,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerResponse {
    Completed { job_id: JobId, evaluation: Evaluation },
    Failed { job_id: JobId, error: EvaluationError },
    Pong { worker_id: String, busy: bool },
    Ack,
    Error { message: String },
}

/// Write one message as a JSON line.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line = serde_json::to_vec(message).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Read one JSON line. `Ok(None)` means the peer closed the connection.
pub async fn read_message<R, T>(reader: &mut R) -> io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        return Ok(None);
    }
    serde_json::from_str(line.trim_end())
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Connect, send `request`, and wait for a single response.
///
/// `connect_timeout` bounds the TCP connect; `response_timeout`, if set,
/// bounds the wait for the reply.
pub async fn call<Req, Resp>(
    address: &str,
    request: &Req,
    connect_timeout: Duration,
    response_timeout: Option<Duration>,
) -> io::Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {address} timed out")))??;
    let (reader, mut writer) = stream.into_split();
    write_message(&mut writer, request).await?;

    let mut reader = BufReader::new(reader);
    let reply = match response_timeout {
        Some(limit) => tokio::time::timeout(limit, read_message(&mut reader))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "response timed out"))??,
        None => read_message(&mut reader).await?,
    };
    reply.ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before reply"))
}

/// The `host:port` peers should use to reach a listener bound at `local`.
///
/// A wildcard bind address is replaced by `advertise_host`, or loopback if
/// none is given.
pub fn advertised_address(local: SocketAddr, advertise_host: Option<&str>) -> String {
    match advertise_host {
        Some(host) => format!("{host}:{}", local.port()),
        None if local.ip().is_unspecified() => {
            let loopback = if local.is_ipv4() { "127.0.0.1" } else { "[::1]" };
            format!("{loopback}:{}", local.port())
        }
        None => local.to_string(),
    }
}
