//! # hb-worker
//!
//! Everything that crosses a process boundary in HalfBand.
//!
//! - [`Objective`] and [`Worker`]: the evaluation contract and the TCP server
//!   ([`WorkerServer`]) that exposes an objective to a master.
//! - [`Registry`]: service discovery, served by a [`NameServer`] and reached
//!   through a [`RegistryClient`].
//! - [`Dispatcher`]: the master-side queue that assigns jobs to idle workers
//!   and reports their outcomes as [`DispatchEvent`]s.
//!
//! Messages are newline-delimited JSON, one request per TCP connection.

mod dispatcher;
pub mod protocol;
mod registry;
mod worker;

pub use dispatcher::{
    DispatchEvent, Dispatcher, DispatcherConfig, JobOutcome, RemoteWorker, TimeoutPolicy,
};
pub use protocol::WorkerInfo;
pub use registry::{
    Credentials, NameServer, NameServerConfig, Registry, RegistryClient, WorkerTable,
};
pub use worker::{Objective, ShutdownHandle, Worker, WorkerConfig, WorkerServer};
