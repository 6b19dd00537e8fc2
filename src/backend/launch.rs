//! Starting a container's main process
//!
//! Both the start and restart operations and the restart policy engine go
//! through a [`Launcher`], so a policy restart behaves like a first start:
//! real processes get a prepared root, synthetic ones log their command
//! line and stop themselves after a short delay.

use super::{spawn_logged, AUTO_STOP_DELAY, AUTO_STOP_INTERACTIVE_DELAY};
use crate::api::types::Container;
use crate::container::health::HealthSupervisor;
use crate::container::restart::Relauncher;
use crate::driver::DriverSet;
use crate::pod::dns::{build_hosts_file, resolve_peer_hosts, PEER_HOSTS_ENV};
use crate::storage::archive::merge_staging_dir;
use crate::storage::volume::resolve_bind_mounts;
use crate::store::{generate_name, Store};
use async_trait::async_trait;
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, warn};

/// PID reported for running containers until the driver knows better
pub const PLACEHOLDER_PID: i64 = 42;

/// Runs container processes through the lifecycle chain
#[derive(Clone)]
pub struct Launcher {
    store: Arc<Store>,
    drivers: DriverSet,
    health: HealthSupervisor,
}

impl Launcher {
    pub fn new(store: Arc<Store>, drivers: DriverSet, health: HealthSupervisor) -> Self {
        Self {
            store,
            drivers,
            health,
        }
    }

    /// Mark the container running, start health checks and launch it
    pub async fn run(&self, c: &Container) {
        self.store.stop_health_check(&c.id);
        self.store.mark_running(&c.id, PLACEHOLDER_PID);
        self.health.start(&c.id);
        self.launch(c).await;
    }

    /// Launch the main process; falls back to the synthetic lifecycle
    pub async fn launch(&self, c: &Container) {
        let id = c.id.as_str();
        let mut cmd = vec![c.path.clone()];
        cmd.extend(c.args.iter().cloned());
        let env = self.start_env(c);
        let binds = self.start_binds(c);

        let started = match self.drivers.lifecycle.start(id, &cmd, &env, &binds).await {
            Ok(started) => started,
            Err(e) => {
                error!("Failed to start process for {}: {}", c.short_id(), e);
                false
            }
        };

        if started {
            self.prepare_root(c);
            return;
        }

        let line = if c.path.is_empty() {
            String::new()
        } else {
            format!("executing: {} {}\n", c.path, c.args.join(" "))
        };
        self.store.log_buffers.store(id, line.into_bytes());

        let delay = if c.config.open_stdin {
            AUTO_STOP_INTERACTIVE_DELAY
        } else {
            AUTO_STOP_DELAY
        };
        schedule_stop(self.store.clone(), id.to_string(), delay, |_| true);
    }

    /// Environment a container process starts with
    fn start_env(&self, c: &Container) -> Vec<String> {
        let mut env = c.config.env.clone();
        if !c.config.hostname.is_empty() {
            env.push(format!("HOSTNAME={}", c.config.hostname));
        }
        if !c.config.user.is_empty() {
            let mut parts = c.config.user.splitn(2, ':');
            if let Some(uid) = parts.next() {
                env.push(format!("SOCKERLESS_UID={}", uid));
            }
            if let Some(gid) = parts.next() {
                env.push(format!("SOCKERLESS_GID={}", gid));
            }
        }
        if !c.host_config.extra_hosts.is_empty() {
            env.push(format!(
                "SOCKERLESS_EXTRA_HOSTS={}",
                c.host_config.extra_hosts.join(",")
            ));
        }
        let peers = resolve_peer_hosts(&self.store, &c.id);
        if !peers.is_empty() {
            env.push(format!("{}={}", PEER_HOSTS_ENV, peers.join(",")));
        }
        env
    }

    fn start_binds(&self, c: &Container) -> HashMap<String, String> {
        let mut binds = resolve_bind_mounts(&self.store, &c.host_config);
        if !self.drivers.lifecycle.is_synthetic(&c.id) {
            for target in c.host_config.tmpfs.keys() {
                if binds.contains_key(target) {
                    continue;
                }
                let dir = std::env::temp_dir().join(format!("tmpfs-{}", generate_name()));
                match fs::create_dir_all(&dir) {
                    Ok(()) => {
                        binds.insert(target.clone(), dir.display().to_string());
                    }
                    Err(e) => warn!("Failed to create tmpfs dir for {}: {}", target, e),
                }
            }
        }
        binds
    }

    /// Merge staged files into a fresh process root and write `/etc/hosts`
    fn prepare_root(&self, c: &Container) {
        let root = match self.drivers.filesystem.root_path(&c.id) {
            Ok(Some(root)) => root,
            Ok(None) => return,
            Err(e) => {
                warn!("No root path for {}: {}", c.short_id(), e);
                return;
            }
        };
        if let Some(staging) = self.store.staging_dirs.load_and_delete(&c.id) {
            if let Err(e) = merge_staging_dir(&staging, &root) {
                warn!("Failed to merge staged files into {}: {}", c.short_id(), e);
            }
        }

        let peers = resolve_peer_hosts(&self.store, &c.id);
        if peers.is_empty() && c.host_config.extra_hosts.is_empty() && c.config.hostname.is_empty() {
            return;
        }
        let own_ip = c
            .network_settings
            .networks
            .values()
            .map(|e| e.ip_address.as_str())
            .find(|ip| !ip.is_empty())
            .unwrap_or("");
        let hosts = build_hosts_file(&c.config.hostname, own_ip, &peers, &c.host_config.extra_hosts);
        let etc = root.join("etc");
        if let Err(e) = fs::create_dir_all(&etc).and_then(|_| fs::write(etc.join("hosts"), hosts)) {
            warn!("Failed to write /etc/hosts for {}: {}", c.short_id(), e);
        }
    }
}

#[async_trait]
impl Relauncher for Launcher {
    async fn relaunch(&self, container: &Container) {
        self.drivers.lifecycle.cleanup(&container.id).await;
        self.run(container).await;
    }
}

/// Stop a running container after `delay` if `still` holds then
pub(crate) fn schedule_stop<F>(store: Arc<Store>, id: String, delay: Duration, still: F)
where
    F: Fn(&Container) -> bool + Send + 'static,
{
    spawn_logged("auto-stop", async move {
        tokio::time::sleep(delay).await;
        let Some(c) = store.containers.get(&id) else {
            return;
        };
        if c.state.running && still(&c) {
            store.stop_container(&id, 0);
        }
    });
}
