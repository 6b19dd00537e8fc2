//! Pod registry
//!
//! A pod groups containers that must be launched together on the same
//! execution substrate. The registry keeps secondary indexes by pod name,
//! member container and attached network.

pub mod dns;
pub mod materialize;

use crate::error::{Result, SockerlessError};
use crate::store::{generate_id, now_rfc3339};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

pub use dns::resolve_peer_hosts;

/// Namespaces shared by pod members unless configured otherwise
pub const DEFAULT_SHARED_NAMESPACES: [&str; 3] = ["ipc", "net", "uts"];

/// A group of containers started and stopped as a unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pod {
    pub id: String,
    pub name: String,
    pub container_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub started_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network_name: String,
    /// One of `created`, `running`, `stopped`, `exited`
    pub status: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, rename = "sharedNs", skip_serializing_if = "Vec::is_empty")]
    pub shared_ns: Vec<String>,
    pub created: String,
}

impl Pod {
    /// Whether every member has been started
    pub fn all_started(&self) -> bool {
        self.started_ids.len() >= self.container_ids.len()
    }
}

#[derive(Debug, Default)]
struct PodIndex {
    pods: HashMap<String, Pod>,
    by_name: HashMap<String, String>,
    by_container: HashMap<String, String>,
    by_network: HashMap<String, String>,
}

impl PodIndex {
    fn lookup(&self, name_or_id: &str) -> Option<&Pod> {
        if let Some(pod) = self.pods.get(name_or_id) {
            return Some(pod);
        }
        if let Some(pod) = self.by_name.get(name_or_id).and_then(|id| self.pods.get(id)) {
            return Some(pod);
        }
        if name_or_id.is_empty() {
            return None;
        }
        self.pods
            .iter()
            .find(|(id, _)| id.starts_with(name_or_id))
            .map(|(_, pod)| pod)
    }
}

/// Registry of pods with lookups by name, member container and network
#[derive(Debug, Default)]
pub struct PodRegistry {
    inner: RwLock<PodIndex>,
}

impl PodRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, PodIndex> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, PodIndex> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create a new, empty pod
    pub fn create_pod(&self, name: &str, labels: HashMap<String, String>) -> Pod {
        let pod = Pod {
            id: generate_id(),
            name: name.to_string(),
            status: "created".to_string(),
            labels,
            shared_ns: DEFAULT_SHARED_NAMESPACES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            created: now_rfc3339(),
            ..Default::default()
        };

        let mut index = self.write();
        index.by_name.insert(pod.name.clone(), pod.id.clone());
        index.pods.insert(pod.id.clone(), pod.clone());
        pod
    }

    /// Add a container to a pod; adding an existing member is a no-op
    pub fn add_container(&self, pod_id: &str, container_id: &str) -> Result<()> {
        let mut index = self.write();
        let pod = index
            .pods
            .get_mut(pod_id)
            .ok_or_else(|| SockerlessError::not_found("pod", pod_id))?;

        if pod.container_ids.iter().any(|c| c == container_id) {
            return Ok(());
        }
        pod.container_ids.push(container_id.to_string());
        index
            .by_container
            .insert(container_id.to_string(), pod_id.to_string());
        Ok(())
    }

    /// Look up a pod by ID, then name, then ID prefix
    pub fn get_pod(&self, name_or_id: &str) -> Option<Pod> {
        self.read().lookup(name_or_id).cloned()
    }

    /// The pod a container belongs to
    pub fn get_pod_for_container(&self, container_id: &str) -> Option<Pod> {
        let index = self.read();
        index
            .by_container
            .get(container_id)
            .and_then(|id| index.pods.get(id))
            .cloned()
    }

    /// The pod attached to a user-defined network
    pub fn get_pod_for_network(&self, network_name: &str) -> Option<Pod> {
        let index = self.read();
        index
            .by_network
            .get(network_name)
            .and_then(|id| index.pods.get(id))
            .cloned()
    }

    /// Associate a network with a pod
    pub fn set_network(&self, pod_id: &str, network_name: &str) {
        let mut index = self.write();
        if let Some(pod) = index.pods.get_mut(pod_id) {
            pod.network_name = network_name.to_string();
            index
                .by_network
                .insert(network_name.to_string(), pod_id.to_string());
        }
    }

    /// Set the pod hostname
    pub fn set_hostname(&self, pod_id: &str, hostname: &str) {
        if let Some(pod) = self.write().pods.get_mut(pod_id) {
            pod.hostname = hostname.to_string();
        }
    }

    /// Replace the shared namespace set
    pub fn set_shared_namespaces(&self, pod_id: &str, namespaces: Vec<String>) {
        if let Some(pod) = self.write().pods.get_mut(pod_id) {
            pod.shared_ns = namespaces;
        }
    }

    /// Update the pod status
    pub fn set_status(&self, pod_id: &str, status: &str) {
        if let Some(pod) = self.write().pods.get_mut(pod_id) {
            pod.status = status.to_string();
        }
    }

    /// Record that a member has started.
    ///
    /// Returns `(defer, members)`: `defer` is true while some members have
    /// not started yet, `members` is the full member list. Marking the same
    /// container twice is a no-op.
    pub fn mark_started(&self, pod_id: &str, container_id: &str) -> (bool, Vec<String>) {
        let mut index = self.write();
        let Some(pod) = index.pods.get_mut(pod_id) else {
            return (false, Vec::new());
        };

        if !pod.started_ids.iter().any(|s| s == container_id) {
            pod.started_ids.push(container_id.to_string());
        }
        (!pod.all_started(), pod.container_ids.clone())
    }

    /// Snapshot of all pods
    pub fn list(&self) -> Vec<Pod> {
        self.read().pods.values().cloned().collect()
    }

    /// Remove a pod and its index entries
    pub fn delete_pod(&self, pod_id: &str) -> bool {
        let mut index = self.write();
        let Some(pod) = index.pods.remove(pod_id) else {
            return false;
        };
        for cid in &pod.container_ids {
            index.by_container.remove(cid);
        }
        if !pod.network_name.is_empty() {
            index.by_network.remove(&pod.network_name);
        }
        index.by_name.remove(&pod.name);
        true
    }

    /// Drop a container from whichever pod holds it
    pub fn remove_container(&self, container_id: &str) {
        let mut index = self.write();
        let Some(pod_id) = index.by_container.remove(container_id) else {
            return;
        };
        if let Some(pod) = index.pods.get_mut(&pod_id) {
            pod.container_ids.retain(|c| c != container_id);
            pod.started_ids.retain(|c| c != container_id);
        }
    }

    /// Whether a pod with the given name or ID exists
    pub fn exists(&self, name_or_id: &str) -> bool {
        self.read().lookup(name_or_id).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_pod_defaults() {
        let reg = PodRegistry::new();
        let pod = reg.create_pod("web", HashMap::new());
        assert_eq!(pod.status, "created");
        assert_eq!(pod.shared_ns, vec!["ipc", "net", "uts"]);
        assert_eq!(pod.id.len(), 64);
        assert!(reg.exists("web"));
        assert!(reg.exists(&pod.id[..8]));
    }

    #[test]
    fn test_add_container_idempotent() {
        let reg = PodRegistry::new();
        let pod = reg.create_pod("p", HashMap::new());
        reg.add_container(&pod.id, "c1").unwrap();
        reg.add_container(&pod.id, "c1").unwrap();
        assert_eq!(reg.get_pod(&pod.id).unwrap().container_ids, vec!["c1"]);
        assert_eq!(reg.get_pod_for_container("c1").unwrap().id, pod.id);
    }

    #[test]
    fn test_add_container_unknown_pod() {
        let reg = PodRegistry::new();
        let err = reg.add_container("missing", "c1").unwrap_err();
        assert_eq!(err.status_code(), 404);
    }

    #[test]
    fn test_mark_started_defers_until_all() {
        let reg = PodRegistry::new();
        let pod = reg.create_pod("p", HashMap::new());
        reg.add_container(&pod.id, "a").unwrap();
        reg.add_container(&pod.id, "b").unwrap();

        let (defer, _) = reg.mark_started(&pod.id, "a");
        assert!(defer);
        let (defer, _) = reg.mark_started(&pod.id, "a");
        assert!(defer);
        let (defer, ids) = reg.mark_started(&pod.id, "b");
        assert!(!defer);
        assert_eq!(ids, vec!["a", "b"]);

        let pod = reg.get_pod(&pod.id).unwrap();
        assert_eq!(pod.started_ids, vec!["a", "b"]);
    }

    #[test]
    fn test_delete_pod_clears_indexes() {
        let reg = PodRegistry::new();
        let pod = reg.create_pod("p", HashMap::new());
        reg.add_container(&pod.id, "a").unwrap();
        reg.set_network(&pod.id, "net1");
        assert!(reg.get_pod_for_network("net1").is_some());

        assert!(reg.delete_pod(&pod.id));
        assert!(!reg.delete_pod(&pod.id));
        assert!(reg.get_pod_for_container("a").is_none());
        assert!(reg.get_pod_for_network("net1").is_none());
        assert!(!reg.exists("p"));
    }
}
