//! TCP server for the internal API
//!
//! Connections are served by hyper directly so that attach and exec can
//! take over the socket after `101 UPGRADED`.

use super::router::router;
use crate::backend::{Backend, BackendDesc, BackendOptions};
use crate::error::{Result, SockerlessError};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::Service;
use tracing::{error, info, warn};

/// Default listen address
pub const DEFAULT_ADDR: &str = "127.0.0.1:9100";

/// Server configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Listen address
    pub addr: SocketAddr,
    /// Identity reported by `/info`
    pub desc: BackendDesc,
    /// Resource registry file; in-memory only when unset
    pub registry_file: Option<PathBuf>,
    /// Run container commands as host processes
    pub sandbox: bool,
    /// Back networks with Linux namespaces
    pub linux_net: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], 9100)),
            desc: BackendDesc::default(),
            registry_file: None,
            sandbox: false,
            linux_net: false,
        }
    }
}

impl DaemonConfig {
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    pub fn with_registry_file(mut self, path: Option<PathBuf>) -> Self {
        self.registry_file = path;
        self
    }

    pub fn with_sandbox(mut self, sandbox: bool) -> Self {
        self.sandbox = sandbox;
        self
    }

    pub fn with_linux_net(mut self, linux_net: bool) -> Self {
        self.linux_net = linux_net;
        self
    }

    /// Build the backend this config describes
    pub fn build_backend(&self) -> Backend {
        Backend::new(
            self.desc.clone(),
            BackendOptions {
                sandbox: self.sandbox,
                linux_net: self.linux_net,
                registry_file: self.registry_file.clone(),
            },
        )
    }
}

/// The backend served over HTTP
pub struct SockerlessDaemon {
    config: DaemonConfig,
    backend: Arc<Backend>,
}

impl SockerlessDaemon {
    pub fn new(config: DaemonConfig, backend: Arc<Backend>) -> Self {
        Self { config, backend }
    }

    /// Bind and serve until Ctrl-C
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.config.addr)
            .await
            .map_err(|e| SockerlessError::Server(format!("bind {}: {}", self.config.addr, e)))?;
        info!("Sockerless backend listening on {}", self.config.addr);
        self.serve(listener, async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await
    }

    /// Serve an already-bound listener until `shutdown` resolves
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let app = router(self.backend.clone());
        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                accepted = listener.accept() => accepted?,
                _ = &mut shutdown => break,
            };

            let tower_service = app.clone();
            tokio::spawn(async move {
                let hyper_service =
                    hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
                        tower_service.clone().call(request)
                    });

                if let Err(err) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), hyper_service)
                    .with_upgrades()
                    .await
                {
                    let msg = err.to_string().to_lowercase();
                    if !msg.contains("connection reset") && !msg.contains("broken pipe") {
                        error!("Error serving {}: {}", peer, err);
                    }
                }
            });
        }

        self.stop();
        Ok(())
    }

    /// Flush state that outlives the process
    fn stop(&self) {
        self.backend.events.close();
        if let Err(e) = self.backend.resources.save() {
            warn!("Failed to save resource registry: {}", e);
        }
        info!("Sockerless backend stopped");
    }

    pub fn addr(&self) -> SocketAddr {
        self.config.addr
    }
}
