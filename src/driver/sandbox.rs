//! Drivers backed by sandbox processes
//!
//! A container is handled here when the store holds a process handle for
//! it; otherwise calls fall through to the synthetic layer.

use super::process::{join_clean_path, BoxedReader, ContainerProcess, ProcessFactory};
use super::synthetic::closed_token;
use super::{
    BoxedConn, ExecDriver, ExecRequest, FilesystemDriver, ProcessLifecycleDriver, ProcessStats,
    ProcessTopEntry, StreamDriver,
};
use crate::api::mux::StreamWriter;
use crate::error::{Result, SockerlessError};
use crate::storage::archive::{create_tar, extract_tar, PathStat};
use crate::store::{generate_id, Store};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Attempts made waiting for a process to appear before attach gives up
const ATTACH_POLL_ATTEMPTS: u32 = 100;
const ATTACH_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Runs exec sessions inside the container's process root
pub struct SandboxExecDriver {
    store: Arc<Store>,
    factory: Arc<dyn ProcessFactory>,
    fallback: Arc<dyn ExecDriver>,
}

impl SandboxExecDriver {
    pub fn new(store: Arc<Store>, factory: Arc<dyn ProcessFactory>, fallback: Arc<dyn ExecDriver>) -> Self {
        Self {
            store,
            factory,
            fallback,
        }
    }
}

#[async_trait]
impl ExecDriver for SandboxExecDriver {
    async fn exec(&self, req: &ExecRequest, conn: BoxedConn) -> i64 {
        let Some(proc) = self.store.processes.load(&req.container_id) else {
            return self.fallback.exec(req, conn).await;
        };

        let (read_half, write_half) = tokio::io::split(conn);
        let stdin: BoxedReader = Box::new(read_half);
        let (stdout, stderr) = StreamWriter::pair(Box::new(write_half), req.tty);

        let code = if req.tty && self.factory.is_shell_command(&req.cmd) {
            proc.run_interactive_shell(&req.env, stdin, stdout.clone(), stderr)
                .await
        } else {
            proc.run_exec(
                &req.cmd,
                &req.env,
                &req.workdir,
                Some(stdin),
                stdout.clone(),
                stderr,
            )
            .await
        };
        let _ = stdout.shutdown().await;
        code
    }
}

/// Resolves archive paths against the process root
pub struct SandboxFilesystemDriver {
    store: Arc<Store>,
    fallback: Arc<dyn FilesystemDriver>,
}

impl SandboxFilesystemDriver {
    pub fn new(store: Arc<Store>, fallback: Arc<dyn FilesystemDriver>) -> Self {
        Self { store, fallback }
    }

    fn root(&self, container_id: &str) -> Option<PathBuf> {
        self.store
            .processes
            .load(container_id)
            .map(|p| p.root_path())
    }
}

impl FilesystemDriver for SandboxFilesystemDriver {
    fn put_archive(&self, container_id: &str, path: &str, data: &[u8]) -> Result<()> {
        match self.root(container_id) {
            Some(root) => extract_tar(data, &join_clean_path(&root, path)),
            None => self.fallback.put_archive(container_id, path, data),
        }
    }

    fn get_archive(&self, container_id: &str, path: &str) -> Result<(PathStat, Vec<u8>)> {
        match self.root(container_id) {
            Some(root) => {
                let real = join_clean_path(&root, path);
                let stat = PathStat::from_path(&real)
                    .map_err(|_| SockerlessError::not_found("path", path))?;
                let tar = create_tar(&real, &stat.name)?;
                Ok((stat, tar))
            }
            None => self.fallback.get_archive(container_id, path),
        }
    }

    fn stat_path(&self, container_id: &str, path: &str) -> Result<PathStat> {
        match self.root(container_id) {
            Some(root) => PathStat::from_path(&join_clean_path(&root, path))
                .map_err(|_| SockerlessError::not_found("path", path)),
            None => self.fallback.stat_path(container_id, path),
        }
    }

    fn root_path(&self, container_id: &str) -> Result<Option<PathBuf>> {
        match self.root(container_id) {
            Some(root) => Ok(Some(root)),
            None => self.fallback.root_path(container_id),
        }
    }
}

/// Bridges attach sessions to the process output and stdin
pub struct SandboxStreamDriver {
    store: Arc<Store>,
    fallback: Arc<dyn StreamDriver>,
}

impl SandboxStreamDriver {
    pub fn new(store: Arc<Store>, fallback: Arc<dyn StreamDriver>) -> Self {
        Self { store, fallback }
    }

    /// Wait for a process to appear; attach commonly precedes start
    async fn await_process(&self, container_id: &str) -> Option<Arc<dyn ContainerProcess>> {
        if let Some(proc) = self.store.processes.load(container_id) {
            return Some(proc);
        }
        for _ in 0..ATTACH_POLL_ATTEMPTS {
            tokio::time::sleep(ATTACH_POLL_INTERVAL).await;
            if let Some(proc) = self.store.processes.load(container_id) {
                return Some(proc);
            }
            if !self.store.containers.contains(container_id) {
                break;
            }
        }
        None
    }
}

#[async_trait]
impl StreamDriver for SandboxStreamDriver {
    async fn attach(&self, container_id: &str, tty: bool, conn: BoxedConn) -> Result<()> {
        let Some(proc) = self.await_process(container_id).await else {
            return self.fallback.attach(container_id, tty, conn).await;
        };

        let (mut read_half, write_half) = tokio::io::split(conn);
        let (stdout, _) = StreamWriter::pair(Box::new(write_half), tty);

        let stdin_task = proc.stdin_writer().map(|tx| {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                loop {
                    match read_half.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            })
        });

        let sub_id = generate_id()[..16].to_string();
        let mut rx = proc.subscribe(&sub_id);
        let buffered = proc.log_bytes();
        if stdout.write(&buffered).await.is_ok() {
            while let Some(chunk) = rx.recv().await {
                if stdout.write(&chunk).await.is_err() {
                    debug!("Attach client for {} went away", container_id);
                    break;
                }
            }
        }
        proc.unsubscribe(&sub_id);

        if let Some(task) = stdin_task {
            task.abort();
        }
        let _ = stdout.shutdown().await;
        Ok(())
    }

    fn log_bytes(&self, container_id: &str) -> Vec<u8> {
        match self.store.processes.load(container_id) {
            Some(proc) => proc.log_bytes(),
            None => self.fallback.log_bytes(container_id),
        }
    }

    fn log_subscribe(&self, container_id: &str, sub_id: &str) -> Option<mpsc::Receiver<Bytes>> {
        match self.store.processes.load(container_id) {
            Some(proc) => Some(proc.subscribe(sub_id)),
            None => self.fallback.log_subscribe(container_id, sub_id),
        }
    }

    fn log_unsubscribe(&self, container_id: &str, sub_id: &str) {
        match self.store.processes.load(container_id) {
            Some(proc) => proc.unsubscribe(sub_id),
            None => self.fallback.log_unsubscribe(container_id, sub_id),
        }
    }
}

/// Starts and supervises sandbox processes
pub struct SandboxLifecycleDriver {
    store: Arc<Store>,
    factory: Arc<dyn ProcessFactory>,
}

impl SandboxLifecycleDriver {
    pub fn new(store: Arc<Store>, factory: Arc<dyn ProcessFactory>) -> Self {
        Self { store, factory }
    }
}

#[async_trait]
impl ProcessLifecycleDriver for SandboxLifecycleDriver {
    async fn start(
        &self,
        container_id: &str,
        cmd: &[String],
        env: &[String],
        binds: &HashMap<String, String>,
    ) -> Result<bool> {
        if cmd.first().map_or(true, |c| c.is_empty()) {
            return Ok(false);
        }

        let proc = self.factory.new_process(cmd, env, binds).await?;
        self.store.processes.store(container_id, proc.clone());

        let store = self.store.clone();
        let id = container_id.to_string();
        tokio::spawn(async move {
            let code = proc.wait().await;
            debug!("Process for {} exited with {}", &id, code);
            store.stop_container(&id, code);
        });
        Ok(true)
    }

    fn stop(&self, container_id: &str) {
        if let Some(proc) = self.store.processes.load(container_id) {
            proc.signal();
        }
    }

    fn kill(&self, container_id: &str) {
        self.stop(container_id);
    }

    async fn cleanup(&self, container_id: &str) {
        if let Some(proc) = self.store.processes.load_and_delete(container_id) {
            proc.close().await;
        }
    }

    fn wait_ch(&self, container_id: &str) -> CancellationToken {
        match self.store.processes.load(container_id) {
            Some(proc) => proc.done(),
            None => closed_token(),
        }
    }

    fn top(&self, container_id: &str) -> Vec<ProcessTopEntry> {
        self.store
            .processes
            .load(container_id)
            .map(|p| p.top())
            .unwrap_or_default()
    }

    fn stats(&self, container_id: &str) -> ProcessStats {
        self.store
            .processes
            .load(container_id)
            .map(|p| p.stats())
            .unwrap_or_default()
    }

    fn is_synthetic(&self, _container_id: &str) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::Container;
    use crate::driver::process::HostProcessFactory;
    use crate::driver::synthetic::{
        SyntheticExecDriver, SyntheticFilesystemDriver, SyntheticStreamDriver,
    };
    use tempfile::tempdir;
    use tokio::io::AsyncWriteExt;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    fn store_with(id: &str) -> Arc<Store> {
        let store = Arc::new(Store::new());
        store.containers.put(
            id,
            Container {
                id: id.to_string(),
                ..Default::default()
            },
        );
        store
    }

    #[tokio::test]
    async fn test_start_supervises_exit() {
        let dir = tempdir().unwrap();
        let store = store_with("c1");
        let factory: Arc<dyn ProcessFactory> = Arc::new(HostProcessFactory::new(dir.path().to_path_buf()));
        let driver = SandboxLifecycleDriver::new(store.clone(), factory);

        assert!(!driver.start("c1", &[], &[], &HashMap::new()).await.unwrap());

        let wait = store.mark_running("c1", 1);
        let started = driver
            .start("c1", &strings(&["sh", "-c", "exit 4"]), &[], &HashMap::new())
            .await
            .unwrap();
        assert!(started);
        tokio::time::timeout(Duration::from_secs(5), wait.cancelled())
            .await
            .unwrap();
        assert_eq!(store.containers.get("c1").unwrap().state.exit_code, 4);
        assert!(driver.wait_ch("c1").is_cancelled());

        driver.cleanup("c1").await;
        driver.cleanup("c1").await;
        assert!(!store.processes.contains("c1"));
        assert!(driver.wait_ch("c1").is_cancelled());
    }

    #[tokio::test]
    async fn test_exec_falls_back_without_process() {
        let store = store_with("c1");
        let factory: Arc<dyn ProcessFactory> = Arc::new(HostProcessFactory::default());
        let driver = SandboxExecDriver::new(store, factory, Arc::new(SyntheticExecDriver));
        let (client, mut server) = tokio::io::duplex(256);
        let req = ExecRequest {
            container_id: "c1".to_string(),
            cmd: strings(&["whoami"]),
            tty: true,
            ..Default::default()
        };
        assert_eq!(driver.exec(&req, Box::new(client)).await, 0);
        let mut buf = Vec::new();
        server.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"whoami\n");
    }

    #[tokio::test]
    async fn test_filesystem_uses_process_root() {
        let dir = tempdir().unwrap();
        let store = store_with("c1");
        let factory = HostProcessFactory::new(dir.path().to_path_buf());
        let proc = factory
            .new_process(&strings(&["sleep", "30"]), &[], &HashMap::new())
            .await
            .unwrap();
        std::fs::write(proc.root_path().join("hello.txt"), "hi").unwrap();
        store.processes.store("c1", proc.clone());

        let fs = SandboxFilesystemDriver::new(
            store.clone(),
            Arc::new(SyntheticFilesystemDriver::new(store.clone())),
        );
        assert_eq!(fs.root_path("c1").unwrap(), Some(proc.root_path()));
        assert_eq!(fs.stat_path("c1", "/hello.txt").unwrap().size, 2);
        assert!(matches!(
            fs.stat_path("c1", "/missing"),
            Err(SockerlessError::NotFound { .. })
        ));
        assert!(fs.root_path("other").unwrap().is_none());
        proc.close().await;
    }

    #[tokio::test]
    async fn test_attach_streams_buffer_and_stdin() {
        let dir = tempdir().unwrap();
        let store = store_with("c1");
        let factory = HostProcessFactory::new(dir.path().to_path_buf());
        let proc = factory
            .new_process(&strings(&["cat"]), &[], &HashMap::new())
            .await
            .unwrap();
        store.processes.store("c1", proc.clone());

        let driver = SandboxStreamDriver::new(
            store.clone(),
            Arc::new(SyntheticStreamDriver::new(store.clone())),
        );
        let (client, server) = tokio::io::duplex(1024);
        let attach = tokio::spawn(async move { driver.attach("c1", true, Box::new(server)).await });

        let (mut client_read, mut client_write) = tokio::io::split(client);
        client_write.write_all(b"ping\n").await.unwrap();
        let mut buf = [0u8; 5];
        client_read.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping\n");

        proc.signal();
        tokio::time::timeout(Duration::from_secs(5), attach)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        proc.close().await;
    }
}
