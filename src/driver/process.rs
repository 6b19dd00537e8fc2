//! Sandbox container processes
//!
//! A [`ProcessFactory`] turns a container's command into a running
//! [`ContainerProcess`]. The shipped [`HostProcessFactory`] runs the command
//! as a host process rooted in a per-container temp directory. Volume binds
//! appear inside that root as symlinks. Output is kept in a log buffer and
//! fanned out to named subscriptions for attach and log following.

use crate::api::mux::StreamWriter;
use crate::error::{Result, SockerlessError};
use crate::store::generate_name;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::os::unix::process::ExitStatusExt;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Boxed reader used for exec stdin
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Capacity of each live-output subscription
const SUBSCRIBER_CAPACITY: usize = 256;

/// Shell binaries recognized for interactive exec
const SHELLS: [&str; 5] = ["sh", "bash", "ash", "dash", "zsh"];

/// Resource usage of a container process
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProcessStats {
    /// Bytes used by the root directory on disk
    pub memory_usage: u64,
    /// Cumulative wall-clock nanoseconds of executed commands
    pub cpu_nanos: u64,
    /// Main process plus active execs
    pub pids: usize,
}

/// One row of `top` output
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessTopEntry {
    pub pid: i64,
    pub command: String,
}

/// A running container main process
#[async_trait]
pub trait ContainerProcess: Send + Sync {
    /// Block until the main process exits and return its exit code
    async fn wait(&self) -> i64;

    /// Ask the main process to terminate
    fn signal(&self);

    /// Terminate, wait for exit and remove the root directory
    async fn close(&self);

    /// Cancelled when the main process exits
    fn done(&self) -> CancellationToken;

    /// Accumulated stdout/stderr output
    fn log_bytes(&self) -> Vec<u8>;

    /// Live output chunks; the receiver ends when the process exits
    fn subscribe(&self, id: &str) -> mpsc::Receiver<Bytes>;

    fn unsubscribe(&self, id: &str);

    /// Feed for the main process's stdin, if still open
    fn stdin_writer(&self) -> Option<mpsc::Sender<Bytes>>;

    /// Run an additional command in the container filesystem
    async fn run_exec(
        &self,
        cmd: &[String],
        env: &[String],
        workdir: &str,
        stdin: Option<BoxedReader>,
        stdout: StreamWriter,
        stderr: StreamWriter,
    ) -> i64;

    /// Run an interactive shell fed from `stdin`
    async fn run_interactive_shell(
        &self,
        env: &[String],
        stdin: BoxedReader,
        stdout: StreamWriter,
        stderr: StreamWriter,
    ) -> i64;

    fn top(&self) -> Vec<ProcessTopEntry>;

    fn stats(&self) -> ProcessStats;

    /// Host directory acting as the container root
    fn root_path(&self) -> PathBuf;

    fn pid(&self) -> i64;
}

/// Creates container processes
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    /// Start `cmd` with `env`; `binds` maps container paths to host paths
    async fn new_process(
        &self,
        cmd: &[String],
        env: &[String],
        binds: &HashMap<String, String>,
    ) -> Result<Arc<dyn ContainerProcess>>;

    /// Whether `cmd` starts a shell
    fn is_shell_command(&self, cmd: &[String]) -> bool;
}

/// Join `path` onto `root` without letting `..` escape it
pub fn join_clean_path(root: &Path, path: &str) -> PathBuf {
    let mut out = root.to_path_buf();
    for comp in Path::new(path).components() {
        match comp {
            Component::Normal(c) => out.push(c),
            Component::ParentDir => {
                if out != root {
                    out.pop();
                }
            }
            _ => {}
        }
    }
    out
}

/// Total size of all files under `path`
pub fn dir_size(path: &Path) -> u64 {
    walkdir::WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| e.metadata().ok())
        .map(|m| m.len())
        .sum()
}

fn split_env(env: &[String]) -> impl Iterator<Item = (&str, &str)> {
    env.iter().filter_map(|kv| kv.split_once('='))
}

/// Factory running commands as host processes
#[derive(Debug, Clone)]
pub struct HostProcessFactory {
    /// Parent directory for per-container roots
    base_dir: PathBuf,
}

impl Default for HostProcessFactory {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

impl HostProcessFactory {
    /// Create a factory placing container roots under `base_dir`
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }
}

#[async_trait]
impl ProcessFactory for HostProcessFactory {
    async fn new_process(
        &self,
        cmd: &[String],
        env: &[String],
        binds: &HashMap<String, String>,
    ) -> Result<Arc<dyn ContainerProcess>> {
        if cmd.is_empty() || cmd[0].is_empty() {
            return Err(SockerlessError::InvalidParameter(
                "no command specified".to_string(),
            ));
        }

        let root = self
            .base_dir
            .join(format!("sockerless-root-{}", generate_name()));
        std::fs::create_dir_all(&root)?;
        link_binds(&root, binds);

        let proc = HostProcess::spawn(root, cmd, env)?;
        Ok(Arc::new(proc))
    }

    fn is_shell_command(&self, cmd: &[String]) -> bool {
        cmd.first()
            .map(|c| {
                let base = c.rsplit('/').next().unwrap_or(c);
                SHELLS.contains(&base)
            })
            .unwrap_or(false)
    }
}

/// Create bind symlinks inside `root`, shortest container path first.
///
/// Paths nested under an already-linked parent are skipped.
fn link_binds(root: &Path, binds: &HashMap<String, String>) {
    let mut container_paths: Vec<&String> = binds.keys().collect();
    container_paths.sort();

    let mut linked: Vec<PathBuf> = Vec::new();
    for cp in container_paths {
        let clean = join_clean_path(Path::new("/"), cp);
        if linked.iter().any(|p| clean.starts_with(p) && clean != *p) {
            continue;
        }
        linked.push(clean.clone());

        let target = join_clean_path(root, cp);
        if let Some(parent) = target.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = std::fs::remove_dir_all(&target);
        let _ = std::fs::remove_file(&target);
        if let Err(e) = std::os::unix::fs::symlink(&binds[cp], &target) {
            warn!("Failed to link bind {} -> {}: {}", cp, binds[cp], e);
        }
    }
}

#[derive(Default)]
struct Output {
    log: Mutex<Vec<u8>>,
    listeners: Mutex<HashMap<String, mpsc::Sender<Bytes>>>,
    closed: std::sync::atomic::AtomicBool,
}

impl Output {
    fn push(&self, chunk: Bytes) {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(&chunk);
        let listeners = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
        for tx in listeners.values() {
            // slow listeners drop chunks
            let _ = tx.try_send(chunk.clone());
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

/// Host process acting as a container main process
pub struct HostProcess {
    root: PathBuf,
    main_cmd: String,
    pid: i64,
    output: Arc<Output>,
    stdin_tx: Mutex<Option<mpsc::Sender<Bytes>>>,
    stop: CancellationToken,
    done: CancellationToken,
    exit_code: Arc<OnceLock<i64>>,
    next_pid: AtomicI64,
    active_execs: Mutex<HashMap<i64, String>>,
    cpu_nanos: Arc<AtomicU64>,
}

impl HostProcess {
    fn command(root: &Path, cmd: &[String], env: &[String], workdir: Option<&Path>) -> Command {
        let mut command = Command::new(&cmd[0]);
        command
            .args(&cmd[1..])
            .current_dir(workdir.unwrap_or(root))
            .envs(split_env(env))
            .env("SOCKERLESS_ROOT", root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    fn spawn(root: PathBuf, cmd: &[String], env: &[String]) -> Result<Self> {
        let mut child = Self::command(&root, cmd, env, None).spawn().map_err(|e| {
            let _ = std::fs::remove_dir_all(&root);
            SockerlessError::Server(format!("failed to start {}: {}", cmd[0], e))
        })?;
        let pid = child.id().map(i64::from).unwrap_or(0);

        let output = Arc::new(Output::default());
        let (stdin_tx, stdin_rx) = mpsc::channel::<Bytes>(64);
        let stop = CancellationToken::new();
        let done = CancellationToken::new();
        let exit_code = Arc::new(OnceLock::new());
        let cpu_nanos = Arc::new(AtomicU64::new(0));

        if let Some(stdin) = child.stdin.take() {
            tokio::spawn(pump_stdin(stdin_rx, stdin));
        }
        let readers = [
            child
                .stdout
                .take()
                .map(|r| tokio::spawn(fan_out(Box::new(r), output.clone()))),
            child
                .stderr
                .take()
                .map(|r| tokio::spawn(fan_out(Box::new(r), output.clone()))),
        ];

        tokio::spawn(supervise(
            child,
            readers,
            stop.clone(),
            done.clone(),
            exit_code.clone(),
            output.clone(),
            cpu_nanos.clone(),
        ));

        debug!("Started host process {} for {}", pid, cmd.join(" "));

        Ok(Self {
            root,
            main_cmd: cmd.join(" "),
            pid,
            output,
            stdin_tx: Mutex::new(Some(stdin_tx)),
            stop,
            done,
            exit_code,
            next_pid: AtomicI64::new(2),
            active_execs: Mutex::new(HashMap::new()),
            cpu_nanos,
        })
    }

    fn track_exec(&self, command: String) -> i64 {
        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        self.active_execs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(pid, command);
        pid
    }

    fn untrack_exec(&self, pid: i64) {
        self.active_execs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&pid);
    }

    async fn run_child(
        &self,
        cmd: &[String],
        env: &[String],
        workdir: Option<PathBuf>,
        stdin: Option<BoxedReader>,
        stdout: StreamWriter,
        stderr: StreamWriter,
    ) -> i64 {
        if cmd.is_empty() {
            return 126;
        }
        let pid = self.track_exec(cmd.join(" "));
        let started = Instant::now();

        let mut command = Self::command(&self.root, cmd, env, workdir.as_deref());
        if stdin.is_none() {
            command.stdin(Stdio::null());
        }
        let code = match command.spawn() {
            Ok(mut child) => {
                let feeder = match (stdin, child.stdin.take()) {
                    (Some(mut reader), Some(mut child_in)) => Some(tokio::spawn(async move {
                        let _ = tokio::io::copy(&mut reader, &mut child_in).await;
                        let _ = child_in.shutdown().await;
                    })),
                    _ => None,
                };
                let out = child.stdout.take().map(|r| tokio::spawn(copy_to(Box::new(r), stdout)));
                let err = child
                    .stderr
                    .take()
                    .map(|r| tokio::spawn(copy_to(Box::new(r), stderr.clone())));
                let code = match child.wait().await {
                    Ok(status) => exit_code_of(status),
                    Err(e) => {
                        warn!("Exec wait failed: {}", e);
                        -1
                    }
                };
                for h in [out, err].into_iter().flatten() {
                    let _ = h.await;
                }
                if let Some(feeder) = feeder {
                    feeder.abort();
                }
                code
            }
            Err(e) => {
                let _ = stderr
                    .write(format!("exec failed: {}: {}\n", cmd[0], e).as_bytes())
                    .await;
                if e.kind() == std::io::ErrorKind::NotFound {
                    127
                } else {
                    126
                }
            }
        };

        self.cpu_nanos
            .fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
        self.untrack_exec(pid);
        code
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    match (status.code(), status.signal()) {
        (Some(code), _) => i64::from(code),
        (None, Some(sig)) => 128 + i64::from(sig),
        _ => -1,
    }
}

async fn pump_stdin(mut rx: mpsc::Receiver<Bytes>, mut stdin: tokio::process::ChildStdin) {
    while let Some(chunk) = rx.recv().await {
        if stdin.write_all(&chunk).await.is_err() {
            return;
        }
        let _ = stdin.flush().await;
    }
    let _ = stdin.shutdown().await;
}

async fn fan_out(mut reader: BoxedReader, output: Arc<Output>) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => output.push(Bytes::copy_from_slice(&buf[..n])),
        }
    }
}

async fn copy_to(mut reader: BoxedReader, writer: StreamWriter) {
    let mut buf = vec![0u8; 8192];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => {
                if writer.write(&buf[..n]).await.is_err() {
                    return;
                }
            }
        }
    }
}

async fn supervise(
    mut child: Child,
    readers: [Option<tokio::task::JoinHandle<()>>; 2],
    stop: CancellationToken,
    done: CancellationToken,
    exit_code: Arc<OnceLock<i64>>,
    output: Arc<Output>,
    cpu_nanos: Arc<AtomicU64>,
) {
    let started = Instant::now();
    let status = tokio::select! {
        status = child.wait() => status,
        _ = stop.cancelled() => {
            if let Some(pid) = child.id() {
                // SAFETY: plain kill(2) on a child we own
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
            }
            match tokio::time::timeout(std::time::Duration::from_secs(10), child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            }
        }
    };

    let code = match status {
        Ok(status) => exit_code_of(status),
        Err(e) => {
            warn!("Waiting for host process failed: {}", e);
            -1
        }
    };
    for h in readers.into_iter().flatten() {
        let _ = h.await;
    }
    cpu_nanos.fetch_add(started.elapsed().as_nanos() as u64, Ordering::Relaxed);
    let _ = exit_code.set(code);
    output.close();
    done.cancel();
}

#[async_trait]
impl ContainerProcess for HostProcess {
    async fn wait(&self) -> i64 {
        self.done.cancelled().await;
        self.exit_code.get().copied().unwrap_or(-1)
    }

    fn signal(&self) {
        self.stop.cancel();
    }

    async fn close(&self) {
        self.stdin_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.stop.cancel();
        self.done.cancelled().await;
        let _ = tokio::fs::remove_dir_all(&self.root).await;
    }

    fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    fn log_bytes(&self) -> Vec<u8> {
        self.output
            .log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn subscribe(&self, id: &str) -> mpsc::Receiver<Bytes> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_CAPACITY);
        let mut listeners = self
            .output
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !self.output.closed.load(Ordering::SeqCst) {
            listeners.insert(id.to_string(), tx);
        }
        rx
    }

    fn unsubscribe(&self, id: &str) {
        self.output
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn stdin_writer(&self) -> Option<mpsc::Sender<Bytes>> {
        self.stdin_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    async fn run_exec(
        &self,
        cmd: &[String],
        env: &[String],
        workdir: &str,
        stdin: Option<BoxedReader>,
        stdout: StreamWriter,
        stderr: StreamWriter,
    ) -> i64 {
        let dir = if workdir.is_empty() {
            None
        } else {
            let dir = join_clean_path(&self.root, workdir);
            let _ = tokio::fs::create_dir_all(&dir).await;
            Some(dir)
        };
        self.run_child(cmd, env, dir, stdin, stdout, stderr).await
    }

    async fn run_interactive_shell(
        &self,
        env: &[String],
        stdin: BoxedReader,
        stdout: StreamWriter,
        stderr: StreamWriter,
    ) -> i64 {
        let shell = vec!["sh".to_string(), "-i".to_string()];
        self.run_child(&shell, env, None, Some(stdin), stdout, stderr)
            .await
    }

    fn top(&self) -> Vec<ProcessTopEntry> {
        let mut entries = vec![ProcessTopEntry {
            pid: self.pid,
            command: self.main_cmd.clone(),
        }];
        let execs = self.active_execs.lock().unwrap_or_else(PoisonError::into_inner);
        let mut pids: Vec<_> = execs.iter().collect();
        pids.sort_by_key(|(pid, _)| **pid);
        entries.extend(pids.into_iter().map(|(pid, cmd)| ProcessTopEntry {
            pid: *pid,
            command: cmd.clone(),
        }));
        entries
    }

    fn stats(&self) -> ProcessStats {
        let pids = 1 + self
            .active_execs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len();
        ProcessStats {
            memory_usage: dir_size(&self.root),
            cpu_nanos: self.cpu_nanos.load(Ordering::Relaxed),
            pids,
        }
    }

    fn root_path(&self) -> PathBuf {
        self.root.clone()
    }

    fn pid(&self) -> i64 {
        self.pid
    }
}
