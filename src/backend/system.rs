//! System info, disk usage, the event stream and management views

use super::containers::summarize;
use super::{Backend, ResourceEntry};
use crate::api::types::{BackendInfo, DiskUsageResponse, Event};
use crate::config::context::apply_env;
use crate::driver::process::dir_size;
use crate::error::{Result, SockerlessError};
use crate::image::dockerfile::parse_duration;
use crate::image::unique_images;
use crate::store::filters::Filters;
use crate::store::generate_id;
use crate::store::logs::parse_docker_timestamp;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures_util::stream::{self, Stream};
use serde::Serialize;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::info;

/// Orphan age used when `max_age` is not given
pub const DEFAULT_ORPHAN_MAX_AGE: Duration = Duration::from_secs(3600);

/// `GET /internal/v1/status` body
#[derive(Debug, Clone, Serialize)]
pub struct StatusResponse {
    pub backend_type: String,
    pub instance_id: String,
    pub uptime_seconds: u64,
    pub containers: usize,
    pub active_resources: usize,
    pub context: String,
}

/// `GET /internal/v1/containers/summary` entry
#[derive(Debug, Clone, Serialize)]
pub struct ContainerBrief {
    pub id: String,
    pub name: String,
    pub image: String,
    pub state: String,
    pub created: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
}

/// One `GET /internal/v1/check` result
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: String,
    pub detail: String,
}

impl CheckResult {
    fn ok(name: &str, detail: String) -> Self {
        Self {
            name: name.to_string(),
            status: "ok".to_string(),
            detail,
        }
    }
}

/// Which events a subscription forwards
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub types: Vec<String>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl EventFilter {
    /// Build from the `filters`, `since` and `until` query parameters
    pub fn from_query(filters: &Filters, since: &str, until: &str) -> Result<Self> {
        let parse = |s: &str| {
            if s.is_empty() {
                Ok(None)
            } else {
                parse_docker_timestamp(s).map(Some)
            }
        };
        Ok(Self {
            types: filters.get("type").cloned().unwrap_or_default(),
            since: parse(since)?,
            until: parse(until)?,
        })
    }

    fn matches(&self, event: &Event) -> bool {
        if !self.types.is_empty() && !self.types.iter().any(|t| *t == event.event_type) {
            return false;
        }
        let at = Utc.timestamp_nanos(event.time_nano);
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at <= u)
    }
}

/// A live `/events` subscription; dropping it unsubscribes
pub struct EventSubscription {
    bus: Arc<super::EventBus>,
    id: String,
    rx: mpsc::Receiver<Event>,
    filter: EventFilter,
}

impl Drop for EventSubscription {
    fn drop(&mut self) {
        self.bus.unsubscribe(&self.id);
    }
}

impl EventSubscription {
    /// Next matching event; `None` once `until` passes or the bus closes
    pub async fn next_event(&mut self) -> Option<Event> {
        let deadline = self.filter.until.map(|u| {
            let left = (u - Utc::now()).to_std().unwrap_or_default();
            tokio::time::Instant::now() + left
        });
        loop {
            let event = match deadline {
                Some(d) => tokio::select! {
                    _ = tokio::time::sleep_until(d) => return None,
                    ev = self.rx.recv() => ev?,
                },
                None => self.rx.recv().await?,
            };
            if self.filter.matches(&event) {
                return Some(event);
            }
        }
    }

    /// JSON lines, one per event
    pub fn into_stream(self) -> impl Stream<Item = io::Result<Bytes>> + Send {
        stream::unfold(self, |mut sub| async move {
            let event = sub.next_event().await?;
            let mut line = match serde_json::to_vec(&event) {
                Ok(line) => line,
                Err(e) => return Some((Err(io::Error::other(e)), sub)),
            };
            line.push(b'\n');
            Some((Ok(Bytes::from(line)), sub))
        })
    }
}

fn mem_total() -> u64 {
    std::fs::read_to_string("/proc/meminfo")
        .ok()
        .and_then(|s| {
            s.lines()
                .find(|l| l.starts_with("MemTotal:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok())
        })
        .map_or(0, |kb| kb * 1024)
}

fn kernel_version() -> String {
    std::fs::read_to_string("/proc/sys/kernel/osrelease")
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

impl Backend {
    pub fn info(&self) -> BackendInfo {
        let containers = self.store.containers.list();
        let running = containers.iter().filter(|c| c.state.running).count();
        let paused = containers.iter().filter(|c| c.state.paused).count();
        BackendInfo {
            id: self.desc.instance_id.clone(),
            name: self.desc.name.clone(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            containers: containers.len(),
            containers_running: running,
            containers_paused: paused,
            containers_stopped: containers.len() - running,
            images: unique_images(&self.store).len(),
            driver: self.desc.driver.clone(),
            operating_system: "linux".to_string(),
            os_type: "linux".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            ncpu: num_cpus::get(),
            mem_total: mem_total(),
            kernel_version: kernel_version(),
        }
    }

    pub fn disk_usage(&self) -> DiskUsageResponse {
        let images = self.list_images(&Filters::new());
        let layers_size = images.iter().map(|i| i.size).sum();
        let containers = self
            .store
            .containers
            .list()
            .iter()
            .map(|c| {
                let image_id = self
                    .store
                    .resolve_image(&c.config.image)
                    .map(|img| img.id)
                    .unwrap_or_default();
                let mut summary = summarize(c, &image_id);
                if let Ok(Some(root)) = self.drivers.filesystem.root_path(&c.id) {
                    summary.size_rw = dir_size(&root);
                }
                summary
            })
            .collect();
        let volumes = self
            .store
            .volumes
            .list()
            .into_iter()
            .map(|mut v| {
                if let Some(dir) = self.store.volume_dirs.load(&v.name) {
                    v.status = Some(HashMap::from([(
                        "Size".to_string(),
                        serde_json::Value::from(dir_size(&dir)),
                    )]));
                }
                v
            })
            .collect();
        DiskUsageResponse {
            layers_size,
            images,
            containers,
            volumes,
        }
    }

    /// Subscribe to the event bus under a fresh ID
    pub fn subscribe_events(&self, filter: EventFilter) -> EventSubscription {
        let id = generate_id()[..16].to_string();
        EventSubscription {
            rx: self.events.subscribe(&id),
            bus: self.events.clone(),
            id,
            filter,
        }
    }

    pub fn status(&self) -> StatusResponse {
        StatusResponse {
            backend_type: self.desc.name.clone(),
            instance_id: self.desc.instance_id.clone(),
            uptime_seconds: self.uptime_secs(),
            containers: self.store.containers.len(),
            active_resources: self.resources.list_active().len(),
            context: self.contexts.active_name(),
        }
    }

    pub fn containers_summary(&self) -> Vec<ContainerBrief> {
        let mut out: Vec<ContainerBrief> = self
            .store
            .containers
            .list()
            .into_iter()
            .map(|c| ContainerBrief {
                pod_name: self.store.pods.get_pod_for_container(&c.id).map(|p| p.name),
                id: c.id,
                name: c.name.trim_start_matches('/').to_string(),
                image: c.config.image,
                state: c.state.status,
                created: c.created,
            })
            .collect();
        out.sort_by(|a, b| a.created.cmp(&b.created));
        out
    }

    pub fn checks(&self) -> Vec<CheckResult> {
        let registry = match self.resources.save() {
            Ok(()) => CheckResult::ok(
                "resource_registry",
                format!("{} entries", self.resources.list_all().len()),
            ),
            Err(e) => CheckResult {
                name: "resource_registry".to_string(),
                status: "error".to_string(),
                detail: e.to_string(),
            },
        };
        vec![
            CheckResult::ok(
                "store",
                format!(
                    "{} containers, {} networks",
                    self.store.containers.len(),
                    self.store.networks.len()
                ),
            ),
            registry,
        ]
    }

    /// Re-read the active context, overriding env values that changed
    pub fn reload_context(&self) -> Result<usize> {
        let name = self.contexts.active_name();
        if name.is_empty() {
            return Ok(0);
        }
        let config = self.contexts.load(&name)?;
        let changed = apply_env(&config.env, true);
        info!("Reloaded context {} ({} env values changed)", name, changed);
        Ok(changed)
    }

    pub fn list_resources(&self, active_only: bool) -> Vec<ResourceEntry> {
        let mut entries = if active_only {
            self.resources.list_active()
        } else {
            self.resources.list_all()
        };
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        entries
    }

    pub fn orphaned_resources(&self, max_age: Duration) -> Vec<ResourceEntry> {
        self.resources.list_orphaned(max_age)
    }

    /// Mark every orphaned resource cleaned up; returns how many
    pub fn cleanup_orphaned(&self, max_age: Duration) -> usize {
        let orphaned = self.resources.list_orphaned(max_age);
        for entry in &orphaned {
            self.resources.mark_cleaned_up(&entry.resource_id);
        }
        if !orphaned.is_empty() {
            info!("Marked {} orphaned resources cleaned up", orphaned.len());
        }
        orphaned.len()
    }
}

/// Parse a `max_age` query value such as `30m`, falling back to one hour
pub fn parse_max_age(raw: &str) -> Result<Duration> {
    if raw.is_empty() {
        return Ok(DEFAULT_ORPHAN_MAX_AGE);
    }
    parse_duration(raw)
        .ok_or_else(|| SockerlessError::InvalidParameter(format!("invalid max_age: {}", raw)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{ContainerConfig, ContainerCreateRequest};
    use crate::backend::testing::backend;
    use crate::config::{ContextConfig, ContextStore};
    use futures_util::StreamExt;
    use tempfile::tempdir;

    async fn container(b: &Backend, name: &str) -> String {
        b.create_container(
            name,
            "",
            ContainerCreateRequest {
                config: ContainerConfig {
                    image: "alpine".to_string(),
                    cmd: vec!["sleep".to_string(), "5".to_string()],
                    open_stdin: true,
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .id
    }

    fn entry(id: &str, age: chrono::Duration) -> ResourceEntry {
        ResourceEntry {
            container_id: format!("c-{}", id),
            backend: "ecs-fargate".to_string(),
            resource_type: "task".to_string(),
            resource_id: id.to_string(),
            instance_id: "i".to_string(),
            created_at: Utc::now() - age,
            cleaned_up: false,
            status: String::new(),
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_info_counts() {
        let b = backend();
        b.pull_image("alpine", "").await.unwrap();
        let id = container(&b, "a").await;
        container(&b, "b").await;
        b.start_container(&id).await.unwrap();

        let info = b.info();
        assert_eq!(info.containers, 2);
        assert_eq!(info.containers_running, 1);
        assert_eq!(info.containers_stopped, 1);
        assert_eq!(info.images, 1);
        assert_eq!(info.os_type, "linux");
        assert!(info.ncpu > 0);
        assert_eq!(info.name, "memory");
    }

    #[tokio::test]
    async fn test_disk_usage_lists_everything() {
        let b = backend();
        b.pull_image("alpine", "").await.unwrap();
        container(&b, "a").await;
        b.create_volume(&Default::default());
        let df = b.disk_usage();
        assert_eq!(df.images.len(), 1);
        assert_eq!(df.containers.len(), 1);
        assert_eq!(df.volumes.len(), 1);
        assert_eq!(df.containers[0].names, vec!["/a"]);
    }

    #[tokio::test]
    async fn test_event_stream_filters_by_type() {
        let b = backend();
        let filters = Filters::from([("type".to_string(), vec!["volume".to_string()])]);
        let sub = b.subscribe_events(EventFilter::from_query(&filters, "", "").unwrap());
        assert_eq!(b.events.subscriber_count(), 1);
        let mut stream = Box::pin(sub.into_stream());

        b.events.emit("network", "create", "n1", HashMap::new());
        b.events.emit("volume", "create", "v1", HashMap::new());
        let line = stream.next().await.unwrap().unwrap();
        let ev: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(ev["Type"], "volume");
        assert_eq!(ev["Actor"]["ID"], "v1");
        assert!(line.ends_with(b"\n"));

        drop(stream);
        assert_eq!(b.events.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_event_stream_ends_at_until() {
        let b = backend();
        let until = (Utc::now() + chrono::Duration::milliseconds(100)).to_rfc3339();
        let filter = EventFilter::from_query(&Filters::new(), "", &until).unwrap();
        let mut stream = Box::pin(b.subscribe_events(filter).into_stream());
        assert!(stream.next().await.is_none());

        assert_eq!(
            EventFilter::from_query(&Filters::new(), "yesterday", "")
                .unwrap_err()
                .status_code(),
            400
        );
    }

    #[tokio::test]
    async fn test_status_and_summary() {
        let b = backend();
        b.create_pod(crate::backend::pods::PodCreateRequest {
            name: "grp".to_string(),
            ..Default::default()
        })
        .unwrap();
        let id = container(&b, "solo").await;
        b.create_container(
            "member",
            "grp",
            ContainerCreateRequest {
                config: ContainerConfig {
                    image: "alpine".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let status = b.status();
        assert_eq!(status.containers, 2);
        assert_eq!(status.backend_type, "memory");

        let summary = b.containers_summary();
        let solo = summary.iter().find(|c| c.id == id).unwrap();
        assert_eq!(solo.name, "solo");
        assert!(solo.pod_name.is_none());
        let member = summary.iter().find(|c| c.name == "member").unwrap();
        assert_eq!(member.pod_name.as_deref(), Some("grp"));

        let checks = b.checks();
        assert!(checks.iter().all(|c| c.status == "ok"));
    }

    #[test]
    fn test_orphans_and_cleanup() {
        let b = backend();
        b.resources.register(entry("old", chrono::Duration::hours(2)));
        b.resources.register(entry("new", chrono::Duration::minutes(1)));

        assert_eq!(b.list_resources(true).len(), 2);
        let orphaned = b.orphaned_resources(parse_max_age("").unwrap());
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].resource_id, "old");
        assert_eq!(b.orphaned_resources(parse_max_age("30s").unwrap()).len(), 2);

        assert_eq!(b.cleanup_orphaned(DEFAULT_ORPHAN_MAX_AGE), 1);
        assert_eq!(b.list_resources(true).len(), 1);
        assert_eq!(b.list_resources(false).len(), 2);
        assert_eq!(parse_max_age("soon").unwrap_err().status_code(), 400);
    }

    #[test]
    fn test_reload_overrides_env() {
        let home = tempdir().unwrap();
        let contexts = ContextStore::new(home.path());
        let key = "SOCKERLESS_TEST_RELOAD_VALUE";
        contexts
            .create(
                "dev",
                &ContextConfig {
                    backend: "memory".to_string(),
                    env: HashMap::from([(key.to_string(), "new".to_string())]),
                    ..Default::default()
                },
            )
            .unwrap();
        contexts.set_active("dev").unwrap();
        std::env::set_var(key, "old");

        let b = Backend::new(Default::default(), Default::default()).with_contexts(contexts);
        assert_eq!(b.reload_context().unwrap(), 1);
        assert_eq!(std::env::var(key).unwrap(), "new");
        assert_eq!(b.reload_context().unwrap(), 0);
        assert_eq!(b.status().context, "dev");
    }
}
