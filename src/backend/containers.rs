//! Container lifecycle and query operations

use super::events::attrs;
use super::launch::schedule_stop;
use super::{Backend, WAIT_AUTO_STOP_DELAY};
use crate::agent::REVERSE_ADDRESS;
use crate::api::mux::{frame, StreamType};
use crate::api::types::{
    Container, ContainerChangeItem, ContainerCommitResponse, ContainerConfig,
    ContainerCreateRequest, ContainerCreateResponse, ContainerPruneResponse, ContainerState,
    ContainerSummary, ContainerTopResponse, ContainerUpdateRequest, ContainerUpdateResponse,
    ContainerWaitResponse, EndpointSettings, Image, NetworkSettings, Port, RootFs,
    SummaryNetworkSettings, ZERO_TIME,
};
use crate::driver::{BoxedConn, StreamDriver};
use crate::error::{Result, SockerlessError};
use crate::image::build::hex_digest;
use crate::image::store_image_with_aliases;
use crate::network::is_predefined;
use crate::pod::materialize::pod_deferred_start;
use crate::storage::archive::{copy_tree, empty_tar, create_tar};
use crate::storage::volume::materialize_mounts;
use crate::store::filters::{format_status, match_container, Filters};
use crate::store::logs::{
    filter_log_since, filter_log_tail, filter_log_until, parse_docker_timestamp,
    strip_line_timestamp,
};
use crate::store::{generate_id, generate_name, now_rfc3339};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::fs;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Gateway given to endpoints on networks the driver does not know
const FALLBACK_GATEWAY: &str = "172.17.0.1";

/// Memory limit reported by stats
const STATS_MEMORY_LIMIT: u64 = 1 << 30;

/// Networks that never form implicit pods
fn is_reserved_network(name: &str) -> bool {
    is_predefined(name) || name == "default"
}

/// Exit code reported for a kill with the given signal
pub fn kill_exit_code(signal: &str) -> i64 {
    match signal {
        "SIGKILL" | "9" | "KILL" => 137,
        _ => 0,
    }
}

/// `80/tcp` to `(80, "tcp")`; the protocol defaults to tcp
fn parse_port_spec(spec: &str) -> Option<(u16, String)> {
    let (port, proto) = spec.split_once('/').unwrap_or((spec, "tcp"));
    Some((port.parse().ok()?, proto.to_string()))
}

fn rfc3339_unix(ts: &str) -> i64 {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

fn command_line(c: &Container) -> String {
    std::iter::once(c.path.as_str())
        .chain(c.args.iter().map(String::as_str))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Query options of a container list
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub all: bool,
    pub limit: usize,
    pub filters: Filters,
}

/// Query options of a logs request
#[derive(Debug, Clone, Default)]
pub struct LogOptions {
    pub follow: bool,
    pub timestamps: bool,
    /// Line count or `all`
    pub tail: String,
    pub since: String,
    pub until: String,
}

/// Parameters of `/commit`
#[derive(Debug, Clone, Default)]
pub struct CommitOptions {
    pub container: String,
    pub repo: String,
    pub tag: String,
    pub comment: String,
    pub author: String,
}

/// Live log subscription, released when dropped
struct LiveLogs {
    rx: mpsc::Receiver<Bytes>,
    stream: Arc<dyn StreamDriver>,
    container_id: String,
    sub_id: String,
}

impl Drop for LiveLogs {
    fn drop(&mut self) {
        self.stream.log_unsubscribe(&self.container_id, &self.sub_id);
    }
}

/// Log response: buffered output plus an optional live tail
pub struct LogStream {
    pub tty: bool,
    /// Buffered output, already framed for non-tty containers
    pub head: Bytes,
    live: Option<LiveLogs>,
}

impl std::fmt::Debug for LogStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogStream")
            .field("tty", &self.tty)
            .field("head", &self.head)
            .field("following", &self.live.is_some())
            .finish()
    }
}

impl LogStream {
    /// Whether output keeps arriving after the head
    pub fn is_following(&self) -> bool {
        self.live.is_some()
    }

    /// Body chunks: the head, then each live chunk until the container exits
    pub fn into_stream(self) -> impl Stream<Item = std::io::Result<Bytes>> + Send {
        let LogStream { tty, head, live } = self;
        let head = (!head.is_empty()).then_some(Ok(head));
        let tail = stream::unfold(live, move |live| async move {
            let mut live = live?;
            loop {
                let chunk = live.rx.recv().await?;
                if chunk.is_empty() {
                    continue;
                }
                let out = if tty { chunk } else { frame(StreamType::Stdout, &chunk) };
                return Some((Ok(out), Some(live)));
            }
        });
        stream::iter(head).chain(tail)
    }
}

impl Backend {
    /// Resolve a container reference or fail with 404
    pub fn resolve_container(&self, reference: &str) -> Result<Container> {
        self.store
            .resolve_container(reference)
            .ok_or_else(|| SockerlessError::not_found("container", reference))
    }

    pub fn inspect_container(&self, reference: &str) -> Result<Container> {
        self.resolve_container(reference)
    }

    pub async fn create_container(
        &self,
        name: &str,
        pod: &str,
        req: ContainerCreateRequest,
    ) -> Result<ContainerCreateResponse> {
        let name = match name {
            "" => format!("/{}", generate_name()),
            n if n.starts_with('/') => n.to_string(),
            n => format!("/{}", n),
        };
        let pod_id = if pod.is_empty() {
            None
        } else {
            let found = self
                .store
                .pods
                .get_pod(pod)
                .ok_or_else(|| SockerlessError::not_found("pod", pod))?;
            Some(found.id)
        };

        let id = generate_id();
        if !self.store.container_names.put_if_absent(&name, id.clone()) {
            return Err(SockerlessError::Conflict(format!(
                "Conflict. The container name \"{}\" is already in use",
                name.trim_start_matches('/')
            )));
        }
        let mut config = req.config;
        let image = self.store.resolve_image(&config.image);
        if let Some(img) = image.as_ref() {
            if config.env.is_empty() {
                config.env = img.config.env.clone();
            }
            if config.cmd.is_empty() {
                config.cmd = img.config.cmd.clone();
            }
            if config.entrypoint.is_empty() {
                config.entrypoint = img.config.entrypoint.clone();
            }
            if config.working_dir.is_empty() {
                config.working_dir = img.config.working_dir.clone();
            }
            if config.healthcheck.is_none() {
                config.healthcheck = img.config.healthcheck.clone();
            }
        }

        let mut host_config = req.host_config.unwrap_or_default();
        if host_config.network_mode.is_empty() {
            host_config.network_mode = "default".to_string();
        }

        let (path, args) = match config.entrypoint.split_first() {
            Some((first, rest)) => (
                first.clone(),
                rest.iter().chain(config.cmd.iter()).cloned().collect(),
            ),
            None => match config.cmd.split_first() {
                Some((first, rest)) => (first.clone(), rest.to_vec()),
                None => (String::new(), Vec::new()),
            },
        };

        let agent_address = req.agent_address.unwrap_or_default();
        let mounts = materialize_mounts(&self.store, &config, &host_config);
        let container = Container {
            id: id.clone(),
            name: name.clone(),
            created: now_rfc3339(),
            path,
            args,
            state: ContainerState {
                status: "created".to_string(),
                started_at: ZERO_TIME.to_string(),
                finished_at: ZERO_TIME.to_string(),
                ..Default::default()
            },
            image: config.image.clone(),
            network_settings: NetworkSettings {
                ports: host_config.port_bindings.clone(),
                ..Default::default()
            },
            mounts,
            platform: "linux".to_string(),
            driver: self.desc.driver.clone(),
            agent_address: agent_address.clone(),
            agent_token: req.agent_token.unwrap_or_default(),
            config,
            host_config,
            ..Default::default()
        };
        let network_mode = container.host_config.network_mode.clone();
        let image_ref = container.config.image.clone();
        self.store.containers.put(id.clone(), container);

        if agent_address == REVERSE_ADDRESS {
            self.agents.prepare(&id);
        }

        let main_network = if network_mode == "default" {
            "bridge".to_string()
        } else {
            network_mode.clone()
        };
        if !main_network.starts_with("container:") {
            self.connect_on_create(&main_network, &id, None).await;
        }
        if let Some(networking) = req.networking_config {
            for (net, endpoint) in networking.endpoints_config {
                if net == main_network || net == network_mode {
                    continue;
                }
                self.connect_on_create(&net, &id, Some(&endpoint)).await;
            }
        }

        if let Some(ctx) = image
            .as_ref()
            .and_then(|img| self.store.build_contexts.load(&img.id))
        {
            self.stage_build_context(&id, &ctx);
        }

        if let Some(pod_id) = pod_id {
            if let Err(e) = self.store.pods.add_container(&pod_id, &id) {
                if let Some(c) = self.store.containers.get(&id) {
                    self.purge_container(&c);
                }
                return Err(e);
            }
        }
        self.join_implicit_pod(&id, &network_mode);

        info!("Created container {} ({})", crate::api::short_id(&id), name);
        let mut attributes = attrs("name", name.trim_start_matches('/'));
        attributes.insert("image".to_string(), image_ref);
        self.events.emit("container", "create", &id, attributes);

        Ok(ContainerCreateResponse {
            id,
            warnings: Vec::new(),
        })
    }

    async fn connect_on_create(&self, network: &str, id: &str, config: Option<&EndpointSettings>) {
        if let Err(e) = self.drivers.network.connect(network, id, config).await {
            debug!("Network {} unavailable for {}: {}", network, crate::api::short_id(id), e);
            let mut endpoint = config.cloned().unwrap_or_default();
            if endpoint.gateway.is_empty() {
                endpoint.gateway = FALLBACK_GATEWAY.to_string();
            }
            self.store.containers.update(id, |c| {
                c.network_settings
                    .networks
                    .insert(network.to_string(), endpoint);
            });
        }
    }

    fn stage_build_context(&self, id: &str, ctx: &std::path::Path) {
        let staging = std::env::temp_dir().join(format!("staging-{}", crate::api::short_id(id)));
        let staged = fs::create_dir_all(&staging)
            .map_err(SockerlessError::from)
            .and_then(|_| copy_tree(ctx, &staging));
        match staged {
            Ok(()) => self.store.staging_dirs.store(id, staging),
            Err(e) => warn!("Failed to stage build context for {}: {}", crate::api::short_id(id), e),
        }
    }

    /// Group the container with others sharing its namespace or network
    pub(super) fn join_implicit_pod(&self, id: &str, network_mode: &str) {
        let pods = &self.store.pods;
        if let Some(reference) = network_mode.strip_prefix("container:") {
            let other = self
                .store
                .resolve_container_id(reference)
                .unwrap_or_else(|| reference.to_string());
            if pods.get_pod_for_container(id).is_some() {
                return;
            }
            let result = match pods.get_pod_for_container(&other) {
                Some(pod) => pods.add_container(&pod.id, id),
                None => {
                    let pod = pods.create_pod(
                        &format!("container-{}", crate::api::short_id(&other)),
                        HashMap::new(),
                    );
                    pods.add_container(&pod.id, &other)
                        .and_then(|_| pods.add_container(&pod.id, id))
                }
            };
            if let Err(e) = result {
                warn!("Failed to group {} with {}: {}", crate::api::short_id(id), other, e);
            }
            return;
        }

        if pods.get_pod_for_container(id).is_some() {
            return;
        }
        let Some(container) = self.store.containers.get(id) else {
            return;
        };
        for net_name in container.network_settings.networks.keys() {
            if is_reserved_network(net_name) {
                continue;
            }
            if let Some(pod) = pods.get_pod_for_network(net_name) {
                if let Err(e) = pods.add_container(&pod.id, id) {
                    warn!("Failed to join pod {}: {}", pod.name, e);
                }
                return;
            }
            let Some(net) = self.store.resolve_network(net_name) else {
                continue;
            };
            if net.containers.len() <= 1 {
                continue;
            }
            let pod = pods.create_pod(&format!("net-{}", net_name), HashMap::new());
            pods.set_network(&pod.id, net_name);
            let mut members: Vec<&String> = net.containers.keys().filter(|c| *c != id).collect();
            members.sort();
            for member in members {
                if pods.get_pod_for_container(member).is_none() {
                    let _ = pods.add_container(&pod.id, member);
                }
            }
            if let Err(e) = pods.add_container(&pod.id, id) {
                warn!("Failed to join pod {}: {}", pod.name, e);
            }
            debug!("Formed pod {} on network {}", pod.name, net_name);
            return;
        }
    }

    pub async fn start_container(&self, reference: &str) -> Result<()> {
        let c = self.resolve_container(reference)?;
        if c.state.running {
            return Err(SockerlessError::NotModified);
        }
        let id = c.id.clone();

        let (deferred, members) = pod_deferred_start(&self.store, &id);
        if !deferred && !members.is_empty() {
            if let Some(pod) = self.store.pods.get_pod_for_container(&id) {
                debug!("All {} members of pod {} started", members.len(), pod.name);
                self.store.pods.set_status(&pod.id, "running");
            }
        }

        self.events
            .emit("container", "start", &id, attrs("name", c.name.trim_start_matches('/')));
        self.launcher.run(&c).await;
        Ok(())
    }

    pub async fn stop_container(&self, reference: &str) -> Result<()> {
        let c = self.resolve_container(reference)?;
        if !c.state.running {
            return Err(SockerlessError::NotModified);
        }
        self.store.force_stop_container(&c.id, 0);
        self.drivers.lifecycle.stop(&c.id);
        self.events
            .emit("container", "stop", &c.id, attrs("name", c.name.trim_start_matches('/')));
        Ok(())
    }

    pub async fn kill_container(&self, reference: &str, signal: &str) -> Result<()> {
        let c = self.resolve_container(reference)?;
        if !c.state.running {
            return Err(SockerlessError::Conflict(format!(
                "Container {} is not running",
                reference
            )));
        }
        self.store.force_stop_container(&c.id, kill_exit_code(signal));
        self.drivers.lifecycle.kill(&c.id);
        self.events
            .emit("container", "kill", &c.id, attrs("name", c.name.trim_start_matches('/')));
        Ok(())
    }

    pub async fn remove_container(&self, reference: &str, force: bool) -> Result<()> {
        let c = self.resolve_container(reference)?;
        if c.state.running && !force {
            return Err(SockerlessError::Conflict(format!(
                "You cannot remove a running container {}. Stop the container before attempting removal or force remove",
                c.short_id()
            )));
        }
        let id = c.id.clone();
        if c.state.running {
            self.store.force_stop_container(&id, 0);
            self.drivers.lifecycle.kill(&id);
        }
        self.store.stop_health_check(&id);
        self.drivers.lifecycle.cleanup(&id).await;

        for net in c.network_settings.networks.keys() {
            if let Err(e) = self.drivers.network.disconnect(net, &id).await {
                debug!("Disconnect {} from {}: {}", c.short_id(), net, e);
            }
        }
        self.purge_container(&c);
        if c.agent_address == REVERSE_ADDRESS {
            self.agents.remove(&id);
        }

        info!("Removed container {}", c.short_id());
        self.events
            .emit("container", "destroy", &id, attrs("name", c.name.trim_start_matches('/')));
        Ok(())
    }

    /// Drop every record of a container
    fn purge_container(&self, c: &Container) {
        // Endpoints left behind by a failed disconnect
        for net in self.store.networks.list() {
            if net.containers.contains_key(&c.id) {
                self.store.networks.update(&net.id, |n| {
                    n.containers.remove(&c.id);
                });
            }
        }
        self.store.containers.delete(&c.id);
        self.store.container_names.delete(&c.name);
        self.store.log_buffers.delete(&c.id);
        self.store.wait_chs.delete(&c.id);
        self.store.last_exits.delete(&c.id);
        if let Some(staging) = self.store.staging_dirs.load_and_delete(&c.id) {
            let _ = fs::remove_dir_all(staging);
        }
        for exec_id in &c.exec_ids {
            self.store.execs.delete(exec_id);
        }
        self.store.pods.remove_container(&c.id);
    }

    pub async fn restart_container(&self, reference: &str) -> Result<()> {
        let c = self.resolve_container(reference)?;
        let id = c.id.clone();
        if c.state.running {
            self.store.force_stop_container(&id, 0);
            self.drivers.lifecycle.stop(&id);
        }
        self.drivers.lifecycle.cleanup(&id).await;

        self.events
            .emit("container", "restart", &id, attrs("name", c.name.trim_start_matches('/')));
        self.launcher.run(&c).await;
        Ok(())
    }

    pub async fn wait_container(&self, reference: &str) -> Result<ContainerWaitResponse> {
        let c = self.resolve_container(reference)?;
        if matches!(c.state.status.as_str(), "exited" | "dead") {
            return Ok(ContainerWaitResponse {
                status_code: c.state.exit_code,
            });
        }
        let Some(ch) = self.store.wait_ch(&c.id) else {
            return Ok(ContainerWaitResponse {
                status_code: c.state.exit_code,
            });
        };

        if !c.has_agent()
            && (c.config.tty || c.config.open_stdin)
            && self.drivers.lifecycle.is_synthetic(&c.id)
        {
            schedule_stop(
                self.store.clone(),
                c.id.clone(),
                WAIT_AUTO_STOP_DELAY,
                |c: &Container| c.exec_ids.is_empty(),
            );
        }

        ch.cancelled().await;
        let status_code = self.store.last_exit(&c.id).unwrap_or(c.state.exit_code);
        Ok(ContainerWaitResponse { status_code })
    }

    pub fn list_containers(&self, opts: &ListOptions) -> Vec<ContainerSummary> {
        let mut containers = self
            .store
            .containers
            .filter(|c| (opts.all || c.state.running) && match_container(c, &opts.filters));

        for (key, cmp) in [("before", std::cmp::Ordering::Less), ("since", std::cmp::Ordering::Greater)] {
            let Some(reference) = opts.filters.get(key).and_then(|v| v.first()) else {
                continue;
            };
            if let Some(pivot) = self.store.resolve_container(reference) {
                containers.retain(|c| c.created.cmp(&pivot.created) == cmp);
            }
        }

        containers.sort_by(|a, b| b.created.cmp(&a.created));
        if opts.limit > 0 {
            containers.truncate(opts.limit);
        }
        containers
            .iter()
            .map(|c| {
                let image_id = self
                    .store
                    .resolve_image(&c.config.image)
                    .map(|img| img.id)
                    .unwrap_or_default();
                summarize(c, &image_id)
            })
            .collect()
    }

    /// Logs so far, and a live tail when following
    pub fn container_logs(&self, reference: &str, opts: &LogOptions) -> Result<LogStream> {
        let c = self.resolve_container(reference)?;
        if c.state.status == "created" {
            return Err(SockerlessError::InvalidParameter(
                "can not get logs from container which is dead or marked for removal".to_string(),
            ));
        }

        let raw = self.drivers.stream.log_bytes(&c.id);
        let text = String::from_utf8_lossy(&raw);
        let stamp = now_rfc3339();
        let mut lines: Vec<String> = if text.is_empty() {
            Vec::new()
        } else {
            text.trim_end_matches('\n')
                .split('\n')
                .map(|l| format!("{} {}", stamp, l))
                .collect()
        };

        if let Ok(since) = parse_docker_timestamp(&opts.since) {
            lines = filter_log_since(&lines, since);
        }
        if let Ok(until) = parse_docker_timestamp(&opts.until) {
            lines = filter_log_until(&lines, until);
        }
        if !opts.tail.is_empty() && opts.tail != "all" {
            if let Ok(n) = opts.tail.parse::<i64>() {
                lines = filter_log_tail(&lines, n);
            }
        }

        let mut body = Vec::new();
        for line in &lines {
            let line = if opts.timestamps {
                line.as_str()
            } else {
                strip_line_timestamp(line)
            };
            body.extend_from_slice(line.as_bytes());
            body.push(b'\n');
        }

        let tty = c.config.tty;
        let head = if tty || body.is_empty() {
            Bytes::from(body)
        } else {
            frame(StreamType::Stdout, &body)
        };

        let live = if opts.follow {
            let sub_id = generate_id()[..16].to_string();
            self.drivers
                .stream
                .log_subscribe(&c.id, &sub_id)
                .map(|rx| LiveLogs {
                    rx,
                    stream: self.drivers.stream.clone(),
                    container_id: c.id.clone(),
                    sub_id,
                })
        } else {
            None
        };
        Ok(LogStream { tty, head, live })
    }

    /// Bridge a hijacked connection to the container's I/O
    pub async fn attach_container(&self, id: &str, conn: BoxedConn) -> Result<()> {
        let tty = self
            .store
            .containers
            .get(id)
            .map(|c| c.config.tty)
            .unwrap_or(false);
        self.drivers.stream.attach(id, tty, conn).await
    }

    pub fn top_container(&self, reference: &str) -> Result<ContainerTopResponse> {
        let c = self.resolve_container(reference)?;
        if !c.state.running {
            return Err(SockerlessError::Conflict(format!(
                "Container {} is not running",
                reference
            )));
        }
        let mut entries = self.drivers.lifecycle.top(&c.id);
        if entries.is_empty() {
            entries.push(crate::driver::ProcessTopEntry {
                pid: 1,
                command: command_line(&c),
            });
        }
        let titles = ["UID", "PID", "PPID", "C", "STIME", "TTY", "TIME", "CMD"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let processes = entries
            .into_iter()
            .map(|e| {
                vec![
                    "root".to_string(),
                    e.pid.to_string(),
                    "0".to_string(),
                    "0".to_string(),
                    "00:00".to_string(),
                    "?".to_string(),
                    "00:00:00".to_string(),
                    e.command,
                ]
            })
            .collect();
        Ok(ContainerTopResponse { titles, processes })
    }

    pub async fn prune_containers(&self, filters: &Filters) -> ContainerPruneResponse {
        let pruned = self.store.containers.prune_if(|_, c| {
            matches!(c.state.status.as_str(), "exited" | "dead") && match_container(c, filters)
        });
        let mut containers_deleted = Vec::with_capacity(pruned.len());
        for c in pruned {
            self.drivers.lifecycle.cleanup(&c.id).await;
            for net in c.network_settings.networks.keys() {
                let _ = self.drivers.network.disconnect(net, &c.id).await;
            }
            self.purge_container(&c);
            self.events
                .emit("container", "destroy", &c.id, attrs("name", c.name.trim_start_matches('/')));
            containers_deleted.push(c.id);
        }
        ContainerPruneResponse {
            containers_deleted,
            space_reclaimed: 0,
        }
    }

    /// One Docker stats entry; `preread` is the previous entry's `read`
    pub fn container_stats(&self, reference: &str, preread: &str) -> Result<Value> {
        let c = self.resolve_container(reference)?;
        if !c.state.running {
            return Err(SockerlessError::Conflict(format!(
                "Container {} is not running",
                reference
            )));
        }
        let stats = self.drivers.lifecycle.stats(&c.id);
        let now = Utc::now();
        Ok(json!({
            "read": now.to_rfc3339_opts(chrono::SecondsFormat::Nanos, true),
            "preread": if preread.is_empty() { ZERO_TIME } else { preread },
            "id": c.id,
            "name": c.name,
            "cpu_stats": {
                "cpu_usage": { "total_usage": stats.cpu_nanos },
                "online_cpus": 1,
                "system_cpu_usage": now.timestamp_nanos_opt().unwrap_or_default(),
            },
            "memory_stats": {
                "usage": stats.memory_usage,
                "limit": STATS_MEMORY_LIMIT,
            },
            "pids_stats": { "current": stats.pids },
            "networks": {},
        }))
    }

    pub fn rename_container(&self, reference: &str, new_name: &str) -> Result<()> {
        if new_name.is_empty() {
            return Err(SockerlessError::InvalidParameter("name is required".to_string()));
        }
        let c = self.resolve_container(reference)?;
        let name = if new_name.starts_with('/') {
            new_name.to_string()
        } else {
            format!("/{}", new_name)
        };
        if self.store.container_names.contains(&name) {
            return Err(SockerlessError::Conflict(format!(
                "Conflict. The container name \"{}\" is already in use",
                name.trim_start_matches('/')
            )));
        }
        self.store.container_names.delete(&c.name);
        self.store.container_names.put(name.clone(), c.id.clone());
        self.store.containers.update(&c.id, |c| c.name = name.clone());
        self.events
            .emit("container", "rename", &c.id, attrs("name", name.trim_start_matches('/')));
        Ok(())
    }

    pub fn pause_container(&self, reference: &str) -> Result<()> {
        let c = self.resolve_container(reference)?;
        if !c.state.running {
            return Err(SockerlessError::Conflict(format!(
                "Container {} is not running",
                reference
            )));
        }
        self.store.containers.update(&c.id, |c| {
            c.state.paused = true;
            c.state.status = "paused".to_string();
        });
        self.events
            .emit("container", "pause", &c.id, attrs("name", c.name.trim_start_matches('/')));
        Ok(())
    }

    pub fn unpause_container(&self, reference: &str) -> Result<()> {
        let c = self.resolve_container(reference)?;
        if !c.state.paused {
            return Err(SockerlessError::Conflict(format!(
                "Container {} is not paused",
                reference
            )));
        }
        self.store.containers.update(&c.id, |c| {
            c.state.paused = false;
            c.state.status = "running".to_string();
        });
        self.events
            .emit("container", "unpause", &c.id, attrs("name", c.name.trim_start_matches('/')));
        Ok(())
    }

    /// Apply a restart policy change; a missing body changes nothing
    pub fn update_container(
        &self,
        reference: &str,
        req: Option<ContainerUpdateRequest>,
    ) -> Result<ContainerUpdateResponse> {
        let c = self.resolve_container(reference)?;
        if let Some(policy) = req.map(|r| r.restart_policy).filter(|p| !p.name.is_empty()) {
            self.store
                .containers
                .update(&c.id, |c| c.host_config.restart_policy = policy);
        }
        Ok(ContainerUpdateResponse {
            warnings: Vec::new(),
        })
    }

    pub fn container_changes(&self, reference: &str) -> Result<Vec<ContainerChangeItem>> {
        self.resolve_container(reference)?;
        Ok(Vec::new())
    }

    /// Tar of the container root; empty for containers without one
    pub async fn export_container(&self, reference: &str) -> Result<Vec<u8>> {
        let c = self.resolve_container(reference)?;
        let Some(root) = self.drivers.filesystem.root_path(&c.id)? else {
            return Ok(empty_tar());
        };
        tokio::task::spawn_blocking(move || create_tar(&root, "."))
            .await
            .map_err(|e| SockerlessError::Server(e.to_string()))?
    }

    /// New image from a container's config with optional overrides
    pub fn commit_container(
        &self,
        opts: &CommitOptions,
        overrides: Option<ContainerConfig>,
    ) -> Result<ContainerCommitResponse> {
        if opts.container.is_empty() {
            return Err(SockerlessError::InvalidParameter(
                "container query parameter is required".to_string(),
            ));
        }
        let c = self.resolve_container(&opts.container)?;
        let mut config = c.config.clone();
        if let Some(o) = overrides {
            if !o.cmd.is_empty() {
                config.cmd = o.cmd;
            }
            if !o.entrypoint.is_empty() {
                config.entrypoint = o.entrypoint;
            }
            if !o.env.is_empty() {
                config.env = o.env;
            }
            if !o.working_dir.is_empty() {
                config.working_dir = o.working_dir;
            }
        }

        let created = now_rfc3339();
        let id = format!("sha256:{}", hex_digest(format!("{}{}", c.id, created).as_bytes()));
        let tag = if opts.tag.is_empty() { "latest" } else { opts.tag.as_str() };
        let reference = format!("{}:{}", opts.repo, tag);
        let image = Image {
            id: id.clone(),
            repo_tags: if opts.repo.is_empty() {
                Vec::new()
            } else {
                vec![reference.clone()]
            },
            created,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            author: opts.author.clone(),
            comment: opts.comment.clone(),
            config,
            root_fs: RootFs {
                fs_type: "layers".to_string(),
                layers: Vec::new(),
            },
            ..Default::default()
        };
        if opts.repo.is_empty() {
            self.store.images.put(id.clone(), image);
        } else {
            store_image_with_aliases(&self.store, &reference, image);
        }
        info!("Committed {} as {}", c.short_id(), crate::api::short_id(id.trim_start_matches("sha256:")));
        Ok(ContainerCommitResponse { id })
    }
}

/// List entry for a container
pub fn summarize(c: &Container, image_id: &str) -> ContainerSummary {
    let mut ports = Vec::new();
    for (spec, bindings) in &c.host_config.port_bindings {
        let Some((private_port, port_type)) = parse_port_spec(spec) else {
            continue;
        };
        for b in bindings {
            ports.push(Port {
                ip: if b.host_ip.is_empty() { "0.0.0.0".to_string() } else { b.host_ip.clone() },
                private_port,
                public_port: b.host_port.parse().ok(),
                port_type: port_type.clone(),
            });
        }
    }
    for spec in c.config.exposed_ports.keys() {
        if c.host_config.port_bindings.contains_key(spec) {
            continue;
        }
        if let Some((private_port, port_type)) = parse_port_spec(spec) {
            ports.push(Port {
                private_port,
                port_type,
                ..Default::default()
            });
        }
    }
    ports.sort_by_key(|p| (p.private_port, p.public_port));

    ContainerSummary {
        id: c.id.clone(),
        names: vec![c.name.clone()],
        image: c.config.image.clone(),
        image_id: image_id.to_string(),
        command: command_line(c),
        created: rfc3339_unix(&c.created),
        state: c.state.status.clone(),
        status: format_status(&c.state),
        ports,
        labels: c.config.labels.clone(),
        size_rw: 0,
        network_settings: Some(SummaryNetworkSettings {
            networks: c.network_settings.networks.clone(),
        }),
        mounts: c.mounts.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{HealthcheckConfig, HostConfig, NetworkCreateRequest, PortBinding, RestartPolicy};
    use std::time::Duration;
    use crate::backend::testing::backend;

    fn create_req(image: &str, cmd: &[&str]) -> ContainerCreateRequest {
        ContainerCreateRequest {
            config: ContainerConfig {
                image: image.to_string(),
                cmd: cmd.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn on_network(net: &str) -> ContainerCreateRequest {
        let mut req = create_req("alpine", &["sleep", "1"]);
        req.host_config = Some(HostConfig {
            network_mode: net.to_string(),
            ..Default::default()
        });
        req
    }

    #[tokio::test]
    async fn test_create_fills_from_image_and_joins_bridge() {
        let b = backend();
        b.store.images.put(
            "alpine:latest",
            Image {
                id: "sha256:img".to_string(),
                config: ContainerConfig {
                    env: vec!["PATH=/bin".to_string()],
                    entrypoint: vec!["/entry".to_string()],
                    working_dir: "/srv".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let resp = b
            .create_container("web", "", create_req("alpine:latest", &["run", "fast"]))
            .await
            .unwrap();
        let c = b.inspect_container("web").unwrap();
        assert_eq!(c.id, resp.id);
        assert_eq!(c.name, "/web");
        assert_eq!(c.path, "/entry");
        assert_eq!(c.args, vec!["run", "fast"]);
        assert_eq!(c.config.env, vec!["PATH=/bin"]);
        assert_eq!(c.config.working_dir, "/srv");
        assert_eq!(c.state.status, "created");
        assert_eq!(c.host_config.network_mode, "default");

        let endpoint = &c.network_settings.networks["bridge"];
        let bridge = b.store.resolve_network("bridge").unwrap();
        assert_eq!(bridge.containers[&c.id].endpoint_id, endpoint.endpoint_id);
    }

    #[tokio::test]
    async fn test_duplicate_name_conflicts() {
        let b = backend();
        b.create_container("dup", "", create_req("alpine", &["true"])).await.unwrap();
        let err = b
            .create_container("/dup", "", create_req("busybox", &["true"]))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(err.to_string().contains("\"dup\" is already in use"));
        assert_eq!(b.inspect_container("dup").unwrap().config.image, "alpine");
    }

    #[tokio::test]
    async fn test_create_with_unknown_pod_is_not_found() {
        let b = backend();
        let err = b
            .create_container("", "nope", create_req("alpine", &["true"]))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "No such pod: nope");
    }

    #[tokio::test]
    async fn test_synthetic_start_auto_stops() {
        let b = backend();
        let id = b
            .create_container("", "", create_req("alpine", &["echo", "hi"]))
            .await
            .unwrap()
            .id;
        b.start_container(&id).await.unwrap();
        assert!(b.inspect_container(&id).unwrap().state.running);
        assert!(matches!(
            b.start_container(&id).await.unwrap_err(),
            SockerlessError::NotModified
        ));

        let wait = tokio::time::timeout(Duration::from_millis(500), b.wait_container(&id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(wait.status_code, 0);
        let c = b.inspect_container(&id).unwrap();
        assert_eq!(c.state.status, "exited");
        assert!(b.store.wait_ch(&id).is_none());

        let logs = b.container_logs(&id, &LogOptions::default()).unwrap();
        assert!(!logs.is_following());
        let demuxed = crate::api::mux::demux(&logs.head);
        assert_eq!(demuxed[0].1, b"executing: echo hi\n");
    }

    #[tokio::test]
    async fn test_stop_and_kill_on_stopped_container() {
        let b = backend();
        let id = b
            .create_container("", "", create_req("alpine", &["true"]))
            .await
            .unwrap()
            .id;
        assert!(matches!(
            b.stop_container(&id).await.unwrap_err(),
            SockerlessError::NotModified
        ));
        assert_eq!(b.kill_container(&id, "KILL").await.unwrap_err().status_code(), 409);

        b.store.mark_running(&id, 42);
        b.kill_container(&id, "SIGKILL").await.unwrap();
        let c = b.inspect_container(&id).unwrap();
        assert_eq!(c.state.exit_code, 137);
        assert!(!c.state.running);
    }

    #[tokio::test]
    async fn test_remove_cleans_every_index() {
        let b = backend();
        b.drivers
            .network
            .create(&NetworkCreateRequest {
                name: "app".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let id = b.create_container("gone", "", on_network("app")).await.unwrap().id;
        b.store.mark_running(&id, 42);

        let err = b.remove_container(&id, false).await.unwrap_err();
        assert_eq!(err.status_code(), 409);
        assert!(err.to_string().contains("cannot remove a running container"));

        b.remove_container(&id, true).await.unwrap();
        assert!(!b.store.containers.contains(&id));
        assert!(!b.store.container_names.contains("/gone"));
        for net in b.store.networks.list() {
            assert!(!net.containers.contains_key(&id), "{} still lists it", net.name);
        }
        assert_eq!(b.remove_container(&id, false).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_implicit_pod_on_shared_network() {
        let b = backend();
        b.drivers
            .network
            .create(&NetworkCreateRequest {
                name: "my-net".to_string(),
                driver: "bridge".to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        let a = b.create_container("a", "", on_network("my-net")).await.unwrap().id;
        assert!(b.store.pods.get_pod_for_container(&a).is_none());
        let c = b.create_container("b", "", on_network("my-net")).await.unwrap().id;

        let pod = b.store.pods.get_pod_for_network("my-net").unwrap();
        assert_eq!(pod.network_name, "my-net");
        assert!(pod.container_ids.contains(&a));
        assert!(pod.container_ids.contains(&c));
        assert_eq!(b.store.pods.get_pod_for_container(&a).unwrap().id, pod.id);
    }

    #[tokio::test]
    async fn test_container_network_mode_forms_pod() {
        let b = backend();
        let main = b.create_container("main", "", create_req("alpine", &["sh"])).await.unwrap().id;
        let side = b
            .create_container("side", "", on_network("container:main"))
            .await
            .unwrap()
            .id;
        let pod = b.store.pods.get_pod_for_container(&side).unwrap();
        assert_eq!(pod.name, format!("container-{}", &main[..12]));
        assert_eq!(pod.container_ids, vec![main, side]);
    }

    #[tokio::test]
    async fn test_list_sorting_filters_and_ports() {
        let b = backend();
        let mut req = create_req("nginx", &["nginx"]);
        req.config.exposed_ports.insert("443/tcp".to_string(), Default::default());
        req.host_config = Some(HostConfig {
            port_bindings: [(
                "80/tcp".to_string(),
                vec![PortBinding {
                    host_ip: String::new(),
                    host_port: "8080".to_string(),
                }],
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        });
        let first = b.create_container("first", "", req).await.unwrap().id;
        tokio::time::sleep(Duration::from_millis(2)).await;
        let second = b.create_container("second", "", create_req("alpine", &["true"])).await.unwrap().id;

        assert!(b.list_containers(&ListOptions::default()).is_empty());
        let all = b.list_containers(&ListOptions {
            all: true,
            ..Default::default()
        });
        assert_eq!(all.iter().map(|s| s.id.clone()).collect::<Vec<_>>(), vec![second.clone(), first.clone()]);
        let ports = &all[1].ports;
        assert_eq!(ports.len(), 2);
        assert_eq!(ports[0].private_port, 80);
        assert_eq!(ports[0].public_port, Some(8080));
        assert_eq!(ports[1].private_port, 443);
        assert_eq!(all[1].command, "nginx");

        let before = b.list_containers(&ListOptions {
            all: true,
            limit: 0,
            filters: [("before".to_string(), vec!["second".to_string()])].into_iter().collect(),
        });
        assert_eq!(before.len(), 1);
        assert_eq!(before[0].id, first);

        let limited = b.list_containers(&ListOptions {
            all: true,
            limit: 1,
            ..Default::default()
        });
        assert_eq!(limited[0].id, second);
    }

    #[tokio::test]
    async fn test_logs_require_started_container() {
        let b = backend();
        let id = b.create_container("", "", create_req("alpine", &["true"])).await.unwrap().id;
        assert_eq!(
            b.container_logs(&id, &LogOptions::default()).unwrap_err().status_code(),
            400
        );
        b.store.mark_running(&id, 42);
        b.store.log_buffers.store(&id, b"one\ntwo\nthree\n".to_vec());
        let logs = b
            .container_logs(
                &id,
                &LogOptions {
                    tail: "2".to_string(),
                    timestamps: true,
                    ..Default::default()
                },
            )
            .unwrap();
        let frames = crate::api::mux::demux(&logs.head);
        let text = String::from_utf8(frames[0].1.clone()).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with(" two"));
        assert!(crate::store::logs::parse_line_timestamp(lines[1]).is_some());
    }

    #[tokio::test]
    async fn test_rename_pause_update_top() {
        let b = backend();
        let id = b.create_container("old", "", create_req("alpine", &["sleep", "9"])).await.unwrap().id;
        b.create_container("taken", "", create_req("alpine", &["true"])).await.unwrap();

        assert_eq!(b.rename_container(&id, "").unwrap_err().status_code(), 400);
        assert_eq!(b.rename_container(&id, "taken").unwrap_err().status_code(), 409);
        b.rename_container(&id, "new").unwrap();
        assert_eq!(b.store.container_names.get("/new").unwrap(), id);
        assert!(!b.store.container_names.contains("/old"));

        assert_eq!(b.pause_container(&id).unwrap_err().status_code(), 409);
        assert_eq!(b.top_container(&id).unwrap_err().status_code(), 409);
        b.store.mark_running(&id, 42);
        b.pause_container(&id).unwrap();
        assert_eq!(b.inspect_container(&id).unwrap().state.status, "paused");
        b.unpause_container(&id).unwrap();
        assert!(b.unpause_container(&id).is_err());

        let top = b.top_container(&id).unwrap();
        assert_eq!(top.titles[7], "CMD");
        assert_eq!(top.processes[0][1], "1");
        assert_eq!(top.processes[0][7], "sleep 9");

        b.update_container(
            &id,
            Some(ContainerUpdateRequest {
                restart_policy: crate::api::types::RestartPolicy {
                    name: "always".to_string(),
                    maximum_retry_count: 0,
                },
            }),
        )
        .unwrap();
        assert_eq!(b.inspect_container(&id).unwrap().host_config.restart_policy.name, "always");
        b.update_container(&id, None).unwrap();
        assert_eq!(b.inspect_container(&id).unwrap().host_config.restart_policy.name, "always");
    }

    #[tokio::test]
    async fn test_prune_removes_only_stopped() {
        let b = backend();
        let running = b.create_container("", "", create_req("alpine", &["true"])).await.unwrap().id;
        let exited = b.create_container("", "", create_req("alpine", &["true"])).await.unwrap().id;
        b.store.mark_running(&running, 42);
        b.store.mark_running(&exited, 42);
        b.store.force_stop_container(&exited, 1);

        let resp = b.prune_containers(&Filters::new()).await;
        assert_eq!(resp.containers_deleted, vec![exited.clone()]);
        assert!(b.store.containers.contains(&running));
        assert!(!b.store.containers.contains(&exited));
    }

    #[tokio::test]
    async fn test_stats_and_export() {
        let b = backend();
        let id = b.create_container("", "", create_req("alpine", &["true"])).await.unwrap().id;
        assert_eq!(b.container_stats(&id, "").unwrap_err().status_code(), 409);
        b.store.mark_running(&id, 42);
        let stats = b.container_stats(&id, "").unwrap();
        assert_eq!(stats["preread"], ZERO_TIME);
        assert_eq!(stats["memory_stats"]["limit"], STATS_MEMORY_LIMIT);
        assert_eq!(stats["cpu_stats"]["online_cpus"], 1);

        assert_eq!(b.export_container(&id).await.unwrap(), empty_tar());
        assert!(b.container_changes(&id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_creates_tagged_image() {
        let b = backend();
        let id = b.create_container("src", "", create_req("alpine", &["sh"])).await.unwrap().id;
        assert_eq!(
            b.commit_container(&CommitOptions::default(), None).unwrap_err().status_code(),
            400
        );
        let resp = b
            .commit_container(
                &CommitOptions {
                    container: id,
                    repo: "snap".to_string(),
                    ..Default::default()
                },
                Some(ContainerConfig {
                    cmd: vec!["run".to_string()],
                    ..Default::default()
                }),
            )
            .unwrap();
        let img = b.store.resolve_image("snap").unwrap();
        assert_eq!(img.id, resp.id);
        assert_eq!(img.repo_tags, vec!["snap:latest"]);
        assert_eq!(img.config.cmd, vec!["run"]);
    }

    #[tokio::test]
    async fn test_health_starts_with_container() {
        let b = backend();
        let mut req = create_req("alpine", &["sleep", "9"]);
        req.config.open_stdin = true;
        req.config.healthcheck = Some(HealthcheckConfig {
            test: vec!["CMD".to_string(), "true".to_string()],
            interval: 10_000_000,
            ..Default::default()
        });
        let id = b.create_container("", "", req).await.unwrap().id;
        b.start_container(&id).await.unwrap();
        let health = b.inspect_container(&id).unwrap().state.health.unwrap();
        assert!(matches!(health.status.as_str(), "starting" | "healthy"));
        b.stop_container(&id).await.unwrap();
        assert!(!b.store.health_checks.contains(&id));
    }

    fn with_policy(cmd: &[&str], name: &str) -> ContainerCreateRequest {
        let mut req = create_req("alpine", cmd);
        req.host_config = Some(HostConfig {
            restart_policy: RestartPolicy {
                name: name.to_string(),
                maximum_retry_count: 0,
            },
            ..Default::default()
        });
        req
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creates_with_one_name() {
        let b = backend();
        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let b = b.clone();
                tokio::spawn(async move {
                    b.create_container("race", "", create_req("alpine", &["true"])).await
                })
            })
            .collect();

        let mut created = 0;
        let mut conflicts = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => created += 1,
                Err(e) => {
                    assert_eq!(e.status_code(), 409);
                    conflicts += 1;
                }
            }
        }
        assert_eq!(created, 1);
        assert_eq!(conflicts, 7);

        let all = b.list_containers(&ListOptions {
            all: true,
            ..Default::default()
        });
        assert_eq!(all.len(), 1);
        let id = b.store.container_names.get("/race").unwrap();
        assert_eq!(b.inspect_container(&id).unwrap().name, "/race");
    }

    #[tokio::test]
    async fn test_always_policy_keeps_restarting_synthetic() {
        let b = backend();
        let id = b
            .create_container("", "", with_policy(&["echo", "hi"], "always"))
            .await
            .unwrap()
            .id;
        b.start_container(&id).await.unwrap();

        // exits after 50ms, relaunches after 100ms then 200ms backoff
        tokio::time::sleep(Duration::from_millis(700)).await;
        let c = b.inspect_container(&id).unwrap();
        assert!(c.restart_count >= 2, "restart count {}", c.restart_count);
        assert_eq!(b.store.log_buffers.load(&id).unwrap(), b"executing: echo hi\n".to_vec());

        b.stop_container(&id).await.ok();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(b.inspect_container(&id).unwrap().state.status, "exited");
    }

    #[tokio::test]
    async fn test_wait_reports_exit_absorbed_by_restart() {
        let b = backend();
        let id = b
            .create_container("", "", with_policy(&["sleep", "1"], "on-failure"))
            .await
            .unwrap()
            .id;
        b.start_container(&id).await.unwrap();

        let waiter = {
            let b = b.clone();
            let id = id.clone();
            tokio::spawn(async move { b.wait_container(&id).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        b.store.stop_container(&id, 3);

        let wait = tokio::time::timeout(Duration::from_millis(500), waiter)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(wait.status_code, 3);
        assert_eq!(b.inspect_container(&id).unwrap().restart_count, 1);
    }

    #[tokio::test]
    async fn test_policy_restart_resumes_health_checks() {
        let b = backend();
        let mut req = with_policy(&["sleep", "9"], "always");
        req.config.open_stdin = true;
        req.config.healthcheck = Some(HealthcheckConfig {
            test: vec!["CMD".to_string(), "true".to_string()],
            interval: 10_000_000,
            ..Default::default()
        });
        let id = b.create_container("", "", req).await.unwrap().id;
        b.start_container(&id).await.unwrap();
        assert!(b.store.health_checks.contains(&id));

        b.store.stop_container(&id, 1);
        assert!(!b.store.health_checks.contains(&id));

        tokio::time::sleep(Duration::from_millis(150)).await;
        let c = b.inspect_container(&id).unwrap();
        assert!(c.state.running);
        assert!(b.store.health_checks.contains(&id));
        let health = c.state.health.unwrap();
        assert!(matches!(health.status.as_str(), "starting" | "healthy"));
        b.stop_container(&id).await.unwrap();
    }

    #[tokio::test]
    async fn test_explicit_restart_leaves_restart_count() {
        let b = backend();
        let mut req = create_req("alpine", &["sleep", "9"]);
        req.config.open_stdin = true;
        let id = b.create_container("", "", req).await.unwrap().id;
        b.start_container(&id).await.unwrap();
        b.restart_container(&id).await.unwrap();
        let c = b.inspect_container(&id).unwrap();
        assert!(c.state.running);
        assert_eq!(c.restart_count, 0);
        b.stop_container(&id).await.unwrap();
    }
}
