//! Drivers forwarding to execution agents
//!
//! Containers with `AgentAddress == "reverse"` use the connection their
//! agent registered; any other non-empty address is dialed per session.

use super::{BoxedConn, ExecDriver, ExecRequest, FilesystemDriver, StreamDriver};
use crate::agent::{AgentConn, AgentRegistry, REVERSE_ADDRESS};
use crate::api::types::Container;
use crate::error::{Result, SockerlessError};
use crate::storage::archive::{create_tar, extract_tar, PathStat};
use crate::store::Store;
use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::error;

enum Route {
    Reverse,
    Forward { address: String, token: String },
    Local,
}

fn route(store: &Store, container_id: &str) -> Route {
    let Some(Container {
        agent_address,
        agent_token,
        ..
    }) = store.containers.get(container_id)
    else {
        return Route::Local;
    };
    match agent_address.as_str() {
        "" => Route::Local,
        REVERSE_ADDRESS => Route::Reverse,
        _ => Route::Forward {
            address: agent_address,
            token: agent_token,
        },
    }
}

/// Exec over an agent bridge
pub struct AgentExecDriver {
    store: Arc<Store>,
    agents: Arc<AgentRegistry>,
    fallback: Arc<dyn ExecDriver>,
}

impl AgentExecDriver {
    pub fn new(store: Arc<Store>, agents: Arc<AgentRegistry>, fallback: Arc<dyn ExecDriver>) -> Self {
        Self {
            store,
            agents,
            fallback,
        }
    }
}

#[async_trait]
impl ExecDriver for AgentExecDriver {
    async fn exec(&self, req: &ExecRequest, conn: BoxedConn) -> i64 {
        match route(&self.store, &req.container_id) {
            Route::Reverse => match self.agents.get(&req.container_id) {
                Some(agent) => {
                    agent
                        .bridge_exec(conn, &req.exec_id, &req.cmd, &req.env, &req.workdir, req.tty)
                        .await
                }
                None => {
                    error!("Reverse agent not connected for {}", req.container_id);
                    1
                }
            },
            Route::Forward { address, token } => match AgentConn::dial(&address, &token).await {
                Ok(agent) => {
                    let code = agent
                        .bridge_exec(conn, &req.exec_id, &req.cmd, &req.env, &req.workdir, req.tty)
                        .await;
                    agent.close();
                    code
                }
                Err(e) => {
                    error!("Failed to dial agent {} for exec: {}", address, e);
                    1
                }
            },
            Route::Local => self.fallback.exec(req, conn).await,
        }
    }
}

/// Host-path filesystem access for reverse agents, which run locally
pub struct AgentFilesystemDriver {
    store: Arc<Store>,
    fallback: Arc<dyn FilesystemDriver>,
}

impl AgentFilesystemDriver {
    pub fn new(store: Arc<Store>, fallback: Arc<dyn FilesystemDriver>) -> Self {
        Self { store, fallback }
    }

    fn is_reverse(&self, container_id: &str) -> bool {
        matches!(route(&self.store, container_id), Route::Reverse)
    }
}

fn host_path(path: &str) -> PathBuf {
    super::process::join_clean_path(Path::new("/"), path)
}

impl FilesystemDriver for AgentFilesystemDriver {
    fn put_archive(&self, container_id: &str, path: &str, data: &[u8]) -> Result<()> {
        if self.is_reverse(container_id) {
            return extract_tar(data, &host_path(path));
        }
        self.fallback.put_archive(container_id, path, data)
    }

    fn get_archive(&self, container_id: &str, path: &str) -> Result<(PathStat, Vec<u8>)> {
        if self.is_reverse(container_id) {
            let real = host_path(path);
            let stat = PathStat::from_path(&real)
                .map_err(|_| SockerlessError::not_found("path", path))?;
            let tar = create_tar(&real, &stat.name)?;
            return Ok((stat, tar));
        }
        self.fallback.get_archive(container_id, path)
    }

    fn stat_path(&self, container_id: &str, path: &str) -> Result<PathStat> {
        if self.is_reverse(container_id) {
            return PathStat::from_path(&host_path(path))
                .map_err(|_| SockerlessError::not_found("path", path));
        }
        self.fallback.stat_path(container_id, path)
    }

    fn root_path(&self, container_id: &str) -> Result<Option<PathBuf>> {
        self.fallback.root_path(container_id)
    }
}

/// Attach over an agent bridge
pub struct AgentStreamDriver {
    store: Arc<Store>,
    agents: Arc<AgentRegistry>,
    fallback: Arc<dyn StreamDriver>,
}

impl AgentStreamDriver {
    pub fn new(store: Arc<Store>, agents: Arc<AgentRegistry>, fallback: Arc<dyn StreamDriver>) -> Self {
        Self {
            store,
            agents,
            fallback,
        }
    }
}

#[async_trait]
impl StreamDriver for AgentStreamDriver {
    async fn attach(&self, container_id: &str, tty: bool, conn: BoxedConn) -> Result<()> {
        match route(&self.store, container_id) {
            Route::Reverse => {
                match self.agents.get(container_id) {
                    Some(agent) => {
                        agent.bridge_attach(conn, container_id, tty).await;
                    }
                    None => error!("Reverse agent not connected for attach to {}", container_id),
                }
                Ok(())
            }
            Route::Forward { address, token } => {
                let agent = AgentConn::dial(&address, &token).await.map_err(|e| {
                    error!("Failed to dial agent {} for attach: {}", address, e);
                    e
                })?;
                agent.bridge_attach(conn, container_id, tty).await;
                agent.close();
                Ok(())
            }
            Route::Local => self.fallback.attach(container_id, tty, conn).await,
        }
    }

    fn log_bytes(&self, container_id: &str) -> Vec<u8> {
        self.fallback.log_bytes(container_id)
    }

    fn log_subscribe(&self, container_id: &str, sub_id: &str) -> Option<mpsc::Receiver<Bytes>> {
        self.fallback.log_subscribe(container_id, sub_id)
    }

    fn log_unsubscribe(&self, container_id: &str, sub_id: &str) {
        self.fallback.log_unsubscribe(container_id, sub_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::conn::message_types;
    use crate::agent::Message;
    use crate::driver::synthetic::SyntheticExecDriver;
    use tokio::io::AsyncReadExt;

    fn store_with(id: &str, address: &str) -> Arc<Store> {
        let store = Arc::new(Store::new());
        store.containers.put(
            id,
            Container {
                id: id.to_string(),
                agent_address: address.to_string(),
                ..Default::default()
            },
        );
        store
    }

    fn req(id: &str) -> ExecRequest {
        ExecRequest {
            container_id: id.to_string(),
            exec_id: "e1".to_string(),
            cmd: vec!["id".to_string()],
            tty: true,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_reverse_not_connected_returns_one() {
        let store = store_with("c1", "reverse");
        let driver = AgentExecDriver::new(store, Arc::new(AgentRegistry::new()), Arc::new(SyntheticExecDriver));
        let (client, _server) = tokio::io::duplex(64);
        assert_eq!(driver.exec(&req("c1"), Box::new(client)).await, 1);
    }

    #[tokio::test]
    async fn test_forward_dial_failure_returns_one() {
        let store = store_with("c1", "127.0.0.1:1");
        let driver = AgentExecDriver::new(store, Arc::new(AgentRegistry::new()), Arc::new(SyntheticExecDriver));
        let (client, _server) = tokio::io::duplex(64);
        assert_eq!(driver.exec(&req("c1"), Box::new(client)).await, 1);
    }

    #[tokio::test]
    async fn test_local_delegates() {
        let store = store_with("c1", "");
        let driver = AgentExecDriver::new(store, Arc::new(AgentRegistry::new()), Arc::new(SyntheticExecDriver));
        let (client, mut server) = tokio::io::duplex(64);
        assert_eq!(driver.exec(&req("c1"), Box::new(client)).await, 0);
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"id\n");
    }

    #[tokio::test]
    async fn test_reverse_exec_bridges_registered_conn() {
        let store = store_with("c1", "reverse");
        let agents = Arc::new(AgentRegistry::new());
        let (agent, mut outbound) = crate::agent::AgentConn::channel();
        agents.register("c1", agent.clone());

        let driver = AgentExecDriver::new(store, agents, Arc::new(SyntheticExecDriver));
        let (client, mut server) = tokio::io::duplex(256);
        let exec = tokio::spawn(async move { driver.exec(&req("c1"), Box::new(client)).await });

        let sent = outbound.recv().await.unwrap();
        assert_eq!(sent.msg_type, message_types::EXEC);
        assert_eq!(sent.id, "e1");
        agent.dispatch(&serde_json::to_string(&Message::output(message_types::STDOUT, "e1", b"uid=0\n")).unwrap());
        agent.dispatch(&serde_json::to_string(&Message::exit("e1", 0)).unwrap());
        assert_eq!(exec.await.unwrap(), 0);

        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"uid=0\n");
    }
}
