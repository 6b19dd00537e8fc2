//! Podman-compatible pod operations

use super::Backend;
use crate::error::{Result, SockerlessError};
use crate::pod::{Pod, DEFAULT_SHARED_NAMESPACES};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

/// `POST /libpod/pods/create` body
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PodCreateRequest {
    pub name: String,
    pub labels: HashMap<String, String>,
    pub hostname: String,
    /// Comma-separated namespaces, such as `ipc,net,uts`
    pub share: String,
    pub no_infra: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PodContainerInfo {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "State")]
    pub state: String,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodInspectResponse {
    #[serde(rename = "Id")]
    pub id: String,
    pub name: String,
    pub created: String,
    pub state: String,
    pub hostname: String,
    pub labels: HashMap<String, String>,
    pub num_containers: usize,
    pub containers: Vec<PodContainerInfo>,
    pub shared_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PodListEntry {
    #[serde(rename = "Id")]
    pub id: String,
    pub name: String,
    pub status: String,
    pub created: String,
    pub labels: HashMap<String, String>,
    pub containers: Vec<PodContainerInfo>,
}

/// Result of a pod-wide start, stop or kill
#[derive(Debug, Clone, Default, Serialize)]
pub struct PodActionResponse {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Errs")]
    pub errs: Vec<String>,
}

impl Backend {
    fn resolve_pod(&self, reference: &str) -> Result<Pod> {
        self.store
            .pods
            .get_pod(reference)
            .ok_or_else(|| SockerlessError::not_found("pod", reference))
    }

    fn pod_members(&self, pod: &Pod) -> Vec<PodContainerInfo> {
        pod.container_ids
            .iter()
            .filter_map(|id| self.store.containers.get(id))
            .map(|c| PodContainerInfo {
                id: c.id.clone(),
                name: c.name.trim_start_matches('/').to_string(),
                state: c.state.status,
            })
            .collect()
    }

    pub fn create_pod(&self, req: PodCreateRequest) -> Result<String> {
        if req.name.is_empty() {
            return Err(SockerlessError::InvalidParameter(
                "pod name is required".to_string(),
            ));
        }
        if self.store.pods.exists(&req.name) {
            return Err(SockerlessError::Conflict(format!(
                "pod with name {} already exists",
                req.name
            )));
        }
        let pod = self.store.pods.create_pod(&req.name, req.labels);
        if !req.hostname.is_empty() {
            self.store.pods.set_hostname(&pod.id, &req.hostname);
        }
        let shared = if req.share.is_empty() {
            DEFAULT_SHARED_NAMESPACES.iter().map(|s| s.to_string()).collect()
        } else {
            req.share
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };
        self.store.pods.set_shared_namespaces(&pod.id, shared);
        info!("Created pod {} ({})", req.name, crate::api::short_id(&pod.id));
        Ok(pod.id)
    }

    pub fn list_pods(&self) -> Vec<PodListEntry> {
        self.store
            .pods
            .list()
            .into_iter()
            .map(|pod| PodListEntry {
                containers: self.pod_members(&pod),
                id: pod.id,
                name: pod.name,
                status: pod.status,
                created: pod.created,
                labels: pod.labels,
            })
            .collect()
    }

    pub fn inspect_pod(&self, reference: &str) -> Result<PodInspectResponse> {
        let pod = self.resolve_pod(reference)?;
        Ok(PodInspectResponse {
            containers: self.pod_members(&pod),
            num_containers: pod.container_ids.len(),
            id: pod.id,
            name: pod.name,
            created: pod.created,
            state: pod.status,
            hostname: pod.hostname,
            labels: pod.labels,
            shared_namespaces: pod.shared_ns,
        })
    }

    pub fn pod_exists(&self, reference: &str) -> Result<()> {
        if self.store.pods.exists(reference) {
            Ok(())
        } else {
            Err(SockerlessError::not_found("pod", reference))
        }
    }

    /// Start every member that is not running
    pub async fn start_pod(&self, reference: &str) -> Result<PodActionResponse> {
        let pod = self.resolve_pod(reference)?;
        let mut errs = Vec::new();
        for id in &pod.container_ids {
            match self.start_container(id).await {
                Ok(()) | Err(SockerlessError::NotModified) => {}
                Err(e) => errs.push(format!("{}: {}", crate::api::short_id(id), e)),
            }
        }
        self.store.pods.set_status(&pod.id, "running");
        Ok(PodActionResponse { id: pod.id, errs })
    }

    pub async fn stop_pod(&self, reference: &str) -> Result<PodActionResponse> {
        let pod = self.resolve_pod(reference)?;
        let mut errs = Vec::new();
        for id in &pod.container_ids {
            match self.stop_container(id).await {
                Ok(()) | Err(SockerlessError::NotModified) => {}
                Err(e) => errs.push(format!("{}: {}", crate::api::short_id(id), e)),
            }
        }
        self.store.pods.set_status(&pod.id, "stopped");
        Ok(PodActionResponse { id: pod.id, errs })
    }

    pub async fn kill_pod(&self, reference: &str, signal: &str) -> Result<PodActionResponse> {
        let pod = self.resolve_pod(reference)?;
        for id in &pod.container_ids {
            let running = self
                .store
                .containers
                .get(id)
                .is_some_and(|c| c.state.running);
            if running {
                if let Err(e) = self.kill_container(id, signal).await {
                    warn!("Failed to kill pod member {}: {}", crate::api::short_id(id), e);
                }
            }
        }
        self.store.pods.set_status(&pod.id, "exited");
        Ok(PodActionResponse {
            id: pod.id,
            errs: Vec::new(),
        })
    }

    /// Delete a pod; with `force` its members are removed too
    pub async fn remove_pod(&self, reference: &str, force: bool) -> Result<()> {
        let pod = self.resolve_pod(reference)?;
        if force {
            for id in &pod.container_ids {
                if let Err(e) = self.remove_container(id, true).await {
                    warn!("Failed to remove pod member {}: {}", crate::api::short_id(id), e);
                }
            }
        }
        self.store.pods.delete_pod(&pod.id);
        info!("Removed pod {}", pod.name);
        Ok(())
    }
}
