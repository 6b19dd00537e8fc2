//! Bookkeeping-only drivers
//!
//! The end of every chain. Nothing is executed: exec echoes its command,
//! archives land in a staging directory, attach replays the log buffer.

use super::{
    BoxedConn, ExecDriver, ExecRequest, FilesystemDriver, ProcessLifecycleDriver, ProcessStats,
    ProcessTopEntry, StreamDriver,
};
use crate::api::mux::StreamWriter;
use crate::error::{Result, SockerlessError};
use crate::api::short_id;
use crate::driver::process::join_clean_path;
use crate::storage::archive::{create_tar, extract_tar, PathStat};
use crate::store::Store;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// A cancelled token, for "already exited"
pub(crate) fn closed_token() -> CancellationToken {
    let token = CancellationToken::new();
    token.cancel();
    token
}

/// Output of a command that was never run: `echo` prints its arguments,
/// anything else echoes the command line
pub fn synthetic_output(cmd: &[String]) -> String {
    match cmd.split_first() {
        Some((prog, args)) if prog.rsplit('/').next() == Some("echo") => {
            format!("{}\n", args.join(" "))
        }
        _ => format!("{}\n", cmd.join(" ")),
    }
}

/// Echoes the command and exits 0
pub struct SyntheticExecDriver;

#[async_trait]
impl ExecDriver for SyntheticExecDriver {
    async fn exec(&self, req: &ExecRequest, conn: BoxedConn) -> i64 {
        let (stdout, _) = StreamWriter::pair(conn, req.tty);
        let line = synthetic_output(&req.cmd);
        let _ = stdout.write(line.as_bytes()).await;
        let _ = stdout.shutdown().await;
        0
    }
}

/// Keeps copied-in files in a per-container staging directory
pub struct SyntheticFilesystemDriver {
    store: Arc<Store>,
}

impl SyntheticFilesystemDriver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn staging_dir(&self, container_id: &str) -> Result<PathBuf> {
        if let Some(dir) = self.store.staging_dirs.load(container_id) {
            return Ok(dir);
        }
        let dir = std::env::temp_dir().join(format!(
            "sockerless-staging-{}-{}",
            short_id(container_id),
            crate::store::generate_name()
        ));
        std::fs::create_dir_all(&dir)?;
        Ok(self
            .store
            .staging_dirs
            .load_or_store_with(container_id, || dir))
    }

    fn existing_path(&self, container_id: &str, path: &str) -> Result<PathBuf> {
        let staging = self
            .store
            .staging_dirs
            .load(container_id)
            .ok_or_else(|| SockerlessError::not_found("path", path))?;
        let real = join_clean_path(&staging, path);
        if !real.exists() {
            return Err(SockerlessError::not_found("path", path));
        }
        Ok(real)
    }
}

impl FilesystemDriver for SyntheticFilesystemDriver {
    fn put_archive(&self, container_id: &str, path: &str, data: &[u8]) -> Result<()> {
        let staging = self.staging_dir(container_id)?;
        extract_tar(data, &join_clean_path(&staging, path))
    }

    fn get_archive(&self, container_id: &str, path: &str) -> Result<(PathStat, Vec<u8>)> {
        let real = self.existing_path(container_id, path)?;
        let stat = PathStat::from_path(&real)?;
        let tar = create_tar(&real, &stat.name)?;
        Ok((stat, tar))
    }

    fn stat_path(&self, container_id: &str, path: &str) -> Result<PathStat> {
        let real = self.existing_path(container_id, path)?;
        Ok(PathStat::from_path(&real)?)
    }

    fn root_path(&self, _container_id: &str) -> Result<Option<PathBuf>> {
        Ok(None)
    }
}

/// Replays the log buffer and waits for the container to stop
pub struct SyntheticStreamDriver {
    store: Arc<Store>,
}

impl SyntheticStreamDriver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl StreamDriver for SyntheticStreamDriver {
    async fn attach(&self, container_id: &str, _tty: bool, conn: BoxedConn) -> Result<()> {
        // synthetic output is always framed
        let (stdout, _) = StreamWriter::pair(conn, false);
        let logs = self.log_bytes(container_id);
        let _ = stdout.write(&logs).await;
        if let Some(wait) = self.store.wait_ch(container_id) {
            wait.cancelled().await;
        }
        let _ = stdout.shutdown().await;
        Ok(())
    }

    fn log_bytes(&self, container_id: &str) -> Vec<u8> {
        self.store.log_buffers.load(container_id).unwrap_or_default()
    }

    fn log_subscribe(&self, _container_id: &str, _sub_id: &str) -> Option<mpsc::Receiver<Bytes>> {
        None
    }

    fn log_unsubscribe(&self, _container_id: &str, _sub_id: &str) {}
}

/// No-op lifecycle: nothing is ever started
pub struct SyntheticLifecycleDriver;

#[async_trait]
impl ProcessLifecycleDriver for SyntheticLifecycleDriver {
    async fn start(
        &self,
        _container_id: &str,
        _cmd: &[String],
        _env: &[String],
        _binds: &HashMap<String, String>,
    ) -> Result<bool> {
        Ok(false)
    }

    fn stop(&self, _container_id: &str) {}

    fn kill(&self, _container_id: &str) {}

    async fn cleanup(&self, _container_id: &str) {}

    fn wait_ch(&self, _container_id: &str) -> CancellationToken {
        closed_token()
    }

    fn top(&self, _container_id: &str) -> Vec<ProcessTopEntry> {
        Vec::new()
    }

    fn stats(&self, _container_id: &str) -> ProcessStats {
        ProcessStats::default()
    }

    fn is_synthetic(&self, _container_id: &str) -> bool {
        true
    }
}
