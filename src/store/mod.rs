//! Process-wide in-memory state
//!
//! The [`Store`] owns every resource map plus the transient per-container
//! handles (wait signals, log buffers, process handles, staging dirs).
//! Container state is only ever mutated through [`StateStore::update`], so
//! concurrent handlers on the same container serialize.

pub mod filters;
pub mod logs;
pub mod resolve;
pub mod state;

pub use filters::{parse_filters, Filters};
pub use state::{StateStore, SyncMap};

use crate::api::types::{
    AuthRequest, Container, ExecInstance, HealthState, Image, Network, Volume, ZERO_TIME,
};
use crate::driver::process::ContainerProcess;
use crate::network::ipam::IpAllocator;
use crate::pod::PodRegistry;
use chrono::{SecondsFormat, Utc};
use std::path::PathBuf;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Callback consulted when a container's process exits.
///
/// Returns true when the exit was absorbed by a restart.
pub type RestartHook = Arc<dyn Fn(&str, i64) -> bool + Send + Sync>;

/// Current time as RFC3339 with nanoseconds
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Random 64-character hex ID
pub fn generate_id() -> String {
    format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple())
}

/// Random 12-character hex name
pub fn generate_name() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

/// Random 64-character hex token
pub fn generate_token() -> String {
    generate_id()
}

/// All in-memory state shared by the backend
#[derive(Default)]
pub struct Store {
    pub containers: StateStore<Container>,
    /// Container name (with leading `/`) to container ID
    pub container_names: StateStore<String>,
    /// Images keyed by ID and by every alias
    pub images: StateStore<Image>,
    pub networks: StateStore<Network>,
    pub volumes: StateStore<Volume>,
    pub execs: StateStore<ExecInstance>,
    /// Registry credentials keyed by server address
    pub creds: StateStore<AuthRequest>,
    pub pods: PodRegistry,
    pub ipam: IpAllocator,
    /// Cancelled when the container stops
    pub wait_chs: SyncMap<CancellationToken>,
    /// Exit code of each container's most recent run
    pub last_exits: SyncMap<i64>,
    pub log_buffers: SyncMap<Vec<u8>>,
    pub processes: SyncMap<Arc<dyn ContainerProcess>>,
    /// Volume name to host directory
    pub volume_dirs: SyncMap<PathBuf>,
    /// Container ID to pre-start archive staging directory
    pub staging_dirs: SyncMap<PathBuf>,
    pub health_checks: SyncMap<CancellationToken>,
    /// Image ID to directory holding COPY sources at their destinations
    pub build_contexts: SyncMap<PathBuf>,
    restart_hook: RwLock<Option<RestartHook>>,
}

impl Store {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the hook consulted by [`Store::stop_container`]
    pub fn set_restart_hook(&self, hook: RestartHook) {
        *self
            .restart_hook
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(hook);
    }

    fn restart_hook(&self) -> Option<RestartHook> {
        self.restart_hook
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Open a fresh wait signal for a container and return it
    pub fn open_wait_ch(&self, id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.wait_chs.store(id, token.clone());
        token
    }

    /// Wait signal for a container, if it is running
    pub fn wait_ch(&self, id: &str) -> Option<CancellationToken> {
        self.wait_chs.load(id)
    }

    /// Record an exit and wake everyone waiting on the current run
    pub fn release_waiters(&self, id: &str, exit_code: i64) {
        self.last_exits.store(id, exit_code);
        if let Some(ch) = self.wait_chs.load_and_delete(id) {
            ch.cancel();
        }
    }

    /// Exit code of the most recent run, if the container has exited
    pub fn last_exit(&self, id: &str) -> Option<i64> {
        self.last_exits.load(id)
    }

    /// Cancel and forget the health supervisor of a container
    pub fn stop_health_check(&self, id: &str) {
        if let Some(cancel) = self.health_checks.load_and_delete(id) {
            cancel.cancel();
        }
    }

    /// Transition a container to `exited` without consulting the restart policy
    pub fn force_stop_container(&self, id: &str, exit_code: i64) {
        self.stop_health_check(id);

        let finished = now_rfc3339();
        self.containers.update(id, |c| {
            c.state.status = "exited".to_string();
            c.state.running = false;
            c.state.paused = false;
            c.state.restarting = false;
            c.state.pid = 0;
            c.state.exit_code = exit_code;
            c.state.finished_at = finished;
        });
        self.release_waiters(id, exit_code);
    }

    /// Handle a process exit: restart per policy or transition to `exited`.
    ///
    /// A no-op for containers that are not running or already handling an
    /// exit. The claim flips `restarting` under the container's lock, so
    /// only one caller reaches the restart hook per run.
    pub fn stop_container(&self, id: &str, exit_code: i64) {
        let mut claimed = false;
        self.containers.update(id, |c| {
            if c.state.running && !c.state.restarting {
                c.state.restarting = true;
                claimed = true;
            }
        });
        if !claimed {
            return;
        }

        if let Some(hook) = self.restart_hook() {
            if hook(id, exit_code) {
                debug!("Container {} restarting after exit {}", &id[..id.len().min(12)], exit_code);
                return;
            }
        }
        self.force_stop_container(id, exit_code);
    }

    /// Append bytes to a container's log buffer
    pub fn append_log(&self, id: &str, data: &[u8]) {
        self.log_buffers
            .with_entry(id, |buf| buf.extend_from_slice(data));
    }

    /// Replace a container's health sub-state with a fresh copy
    pub fn set_health(&self, id: &str, health: Option<HealthState>) {
        self.containers.update(id, |c| c.state.health = health);
    }

    /// Mark a container running with a fresh wait signal
    pub fn mark_running(&self, id: &str, pid: i64) -> CancellationToken {
        let token = self.open_wait_ch(id);
        let now = now_rfc3339();
        self.containers.update(id, |c| {
            c.state.status = "running".to_string();
            c.state.running = true;
            c.state.paused = false;
            c.state.restarting = false;
            c.state.pid = pid;
            c.state.exit_code = 0;
            c.state.error.clear();
            c.state.started_at = now;
            c.state.finished_at = ZERO_TIME.to_string();
        });
        token
    }

    /// Seed the three predefined networks
    pub fn seed_default_networks(&self) {
        use crate::api::types::{Ipam, IpamConfig};
        use std::collections::HashMap;

        for (name, driver) in [("bridge", "bridge"), ("host", "host"), ("none", "null")] {
            if self.networks.list().iter().any(|n| n.name == name) {
                continue;
            }
            let id = generate_id();
            let mut ipam = Ipam {
                driver: "default".to_string(),
                ..Default::default()
            };
            if name == "bridge" {
                let requested = IpamConfig {
                    subnet: "172.17.0.0/16".to_string(),
                    gateway: "172.17.0.1".to_string(),
                    ..Default::default()
                };
                if let Ok(cfg) = self.ipam.allocate_subnet(&id, Some(&requested)) {
                    ipam.config.push(cfg);
                }
            }
            self.networks.put(
                id.clone(),
                Network {
                    name: name.to_string(),
                    id,
                    created: now_rfc3339(),
                    scope: "local".to_string(),
                    driver: driver.to_string(),
                    ipam,
                    containers: HashMap::new(),
                    ..Default::default()
                },
            );
        }
    }
}
