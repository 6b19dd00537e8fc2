//! Container runtime drivers
//!
//! Handlers never branch on how a container is backed. They call through
//! the driver traits below, each built as a chain at startup:
//!
//! ```text
//! exec / filesystem / stream:  Agent -> Sandbox -> Synthetic
//! lifecycle:                   Sandbox | Synthetic
//! ```
//!
//! Each layer inspects the container record and either handles the call or
//! hands it to its fallback.

pub mod agent;
pub mod process;
pub mod sandbox;
pub mod synthetic;

pub use process::{ContainerProcess, HostProcessFactory, ProcessFactory, ProcessStats, ProcessTopEntry};

use crate::agent::AgentRegistry;
use crate::error::Result;
use crate::network::NetworkDriver;
use crate::storage::archive::PathStat;
use crate::store::Store;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A bidirectional client connection (hijacked HTTP stream)
pub trait Conn: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Conn for T {}

pub type BoxedConn = Box<dyn Conn>;

/// One exec session to run
#[derive(Debug, Clone, Default)]
pub struct ExecRequest {
    pub container_id: String,
    pub exec_id: String,
    pub cmd: Vec<String>,
    pub env: Vec<String>,
    pub workdir: String,
    pub tty: bool,
}

/// Runs commands inside containers
#[async_trait]
pub trait ExecDriver: Send + Sync {
    /// Run the command, streaming I/O over `conn`; returns the exit code.
    ///
    /// Non-tty output is multiplex-framed.
    async fn exec(&self, req: &ExecRequest, conn: BoxedConn) -> i64;
}

/// Container filesystem access for archive operations
pub trait FilesystemDriver: Send + Sync {
    /// Extract a tar archive at `path`
    fn put_archive(&self, container_id: &str, path: &str, data: &[u8]) -> Result<()>;

    /// Tar up `path` and stat it
    fn get_archive(&self, container_id: &str, path: &str) -> Result<(PathStat, Vec<u8>)>;

    fn stat_path(&self, container_id: &str, path: &str) -> Result<PathStat>;

    /// Host directory backing the container root, if any
    fn root_path(&self, container_id: &str) -> Result<Option<PathBuf>>;
}

/// Attach and log streaming
#[async_trait]
pub trait StreamDriver: Send + Sync {
    /// Bridge `conn` to the container's I/O until it exits
    async fn attach(&self, container_id: &str, tty: bool, conn: BoxedConn) -> Result<()>;

    /// Buffered output so far
    fn log_bytes(&self, container_id: &str) -> Vec<u8>;

    /// Live output chunks; `None` when following is not supported
    fn log_subscribe(&self, container_id: &str, sub_id: &str) -> Option<mpsc::Receiver<Bytes>>;

    fn log_unsubscribe(&self, container_id: &str, sub_id: &str);
}

/// Container main process management
#[async_trait]
pub trait ProcessLifecycleDriver: Send + Sync {
    /// Spawn the main process; `Ok(false)` means nothing real was started
    async fn start(
        &self,
        container_id: &str,
        cmd: &[String],
        env: &[String],
        binds: &HashMap<String, String>,
    ) -> Result<bool>;

    fn stop(&self, container_id: &str);

    fn kill(&self, container_id: &str);

    /// Release process resources; idempotent
    async fn cleanup(&self, container_id: &str);

    /// Cancelled when the process exits; already cancelled when there is none
    fn wait_ch(&self, container_id: &str) -> CancellationToken;

    fn top(&self, container_id: &str) -> Vec<ProcessTopEntry>;

    fn stats(&self, container_id: &str) -> ProcessStats;

    fn is_synthetic(&self, container_id: &str) -> bool;
}

/// The drivers a server dispatches through
#[derive(Clone)]
pub struct DriverSet {
    pub exec: Arc<dyn ExecDriver>,
    pub filesystem: Arc<dyn FilesystemDriver>,
    pub stream: Arc<dyn StreamDriver>,
    pub lifecycle: Arc<dyn ProcessLifecycleDriver>,
    pub network: Arc<dyn NetworkDriver>,
}

impl DriverSet {
    /// Build the standard chains.
    ///
    /// The sandbox layer is only present when a process factory is given.
    pub fn build(
        store: Arc<Store>,
        agents: Arc<AgentRegistry>,
        factory: Option<Arc<dyn ProcessFactory>>,
        network: Arc<dyn NetworkDriver>,
    ) -> Self {
        let synthetic_exec: Arc<dyn ExecDriver> = Arc::new(synthetic::SyntheticExecDriver);
        let synthetic_fs: Arc<dyn FilesystemDriver> =
            Arc::new(synthetic::SyntheticFilesystemDriver::new(store.clone()));
        let synthetic_stream: Arc<dyn StreamDriver> =
            Arc::new(synthetic::SyntheticStreamDriver::new(store.clone()));

        let (exec, filesystem, stream, lifecycle): (
            Arc<dyn ExecDriver>,
            Arc<dyn FilesystemDriver>,
            Arc<dyn StreamDriver>,
            Arc<dyn ProcessLifecycleDriver>,
        ) = match factory {
            Some(factory) => (
                Arc::new(sandbox::SandboxExecDriver::new(
                    store.clone(),
                    factory.clone(),
                    synthetic_exec,
                )),
                Arc::new(sandbox::SandboxFilesystemDriver::new(
                    store.clone(),
                    synthetic_fs,
                )),
                Arc::new(sandbox::SandboxStreamDriver::new(
                    store.clone(),
                    synthetic_stream,
                )),
                Arc::new(sandbox::SandboxLifecycleDriver::new(store.clone(), factory)),
            ),
            None => (
                synthetic_exec,
                synthetic_fs,
                synthetic_stream,
                Arc::new(synthetic::SyntheticLifecycleDriver),
            ),
        };

        Self {
            exec: Arc::new(agent::AgentExecDriver::new(store.clone(), agents.clone(), exec)),
            filesystem: Arc::new(agent::AgentFilesystemDriver::new(store.clone(), filesystem)),
            stream: Arc::new(agent::AgentStreamDriver::new(store, agents, stream)),
            lifecycle,
            network,
        }
    }
}
