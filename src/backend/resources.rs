//! Tracking of externally provisioned resources
//!
//! Cloud-backed drivers register the task, function or job that backs a
//! container here so a restarted backend can find and clean it up. The
//! registry persists to a JSON file on every mutation when a path is set.

use crate::api::types::{Container, ContainerConfig, ContainerState};
use crate::error::Result;
use crate::store::Store;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// One tracked resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceEntry {
    pub container_id: String,
    pub backend: String,
    /// `task`, `function`, `job`, `site`
    pub resource_type: String,
    /// ARN or fully qualified name
    pub resource_id: String,
    pub instance_id: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub cleaned_up: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, String>,
}

impl ResourceEntry {
    /// Not cleaned up, with an empty, `pending` or `active` status
    pub fn is_active(&self) -> bool {
        !self.cleaned_up && matches!(self.status.as_str(), "" | "pending" | "active")
    }
}

/// Resource entries keyed by resource ID
#[derive(Debug, Default)]
pub struct ResourceRegistry {
    entries: RwLock<HashMap<String, ResourceEntry>>,
    path: Option<PathBuf>,
}

impl ResourceRegistry {
    /// Registry persisting to `path`, or in-memory only when `None`
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            path,
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, ResourceEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, ResourceEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self, entry: ResourceEntry) {
        self.write().insert(entry.resource_id.clone(), entry);
        self.auto_save();
    }

    pub fn mark_cleaned_up(&self, resource_id: &str) {
        if let Some(e) = self.write().get_mut(resource_id) {
            e.cleaned_up = true;
            e.status = "cleanedUp".to_string();
        }
        self.auto_save();
    }

    pub fn mark_active(&self, resource_id: &str) {
        if let Some(e) = self.write().get_mut(resource_id) {
            e.status = "active".to_string();
        }
        self.auto_save();
    }

    pub fn list_active(&self) -> Vec<ResourceEntry> {
        self.read().values().filter(|e| e.is_active()).cloned().collect()
    }

    /// Active entries created more than `max_age` ago
    pub fn list_orphaned(&self, max_age: Duration) -> Vec<ResourceEntry> {
        let cutoff = Utc::now() - chrono::Duration::from_std(max_age).unwrap_or_default();
        self.read()
            .values()
            .filter(|e| e.is_active() && e.created_at < cutoff)
            .cloned()
            .collect()
    }

    pub fn list_all(&self) -> Vec<ResourceEntry> {
        self.read().values().cloned().collect()
    }

    fn auto_save(&self) {
        if let Err(e) = self.save() {
            warn!("Failed to save resource registry: {}", e);
        }
    }

    /// Write the registry as pretty JSON via a temp file and rename
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(&*self.read())?;
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    /// Merge entries from disk; a missing file is not an error
    pub fn load(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let loaded: HashMap<String, ResourceEntry> = serde_json::from_str(&data)?;
        self.write().extend(loaded);
        Ok(())
    }
}

/// Recreate running container records for active entries the store lacks.
///
/// Returns how many containers were recovered.
pub fn reconstruct_container_state(store: &Store, registry: &ResourceRegistry) -> usize {
    let mut recovered = 0;
    for entry in registry.list_active() {
        if store.containers.contains(&entry.container_id) {
            continue;
        }
        let name = entry
            .metadata
            .get("name")
            .filter(|n| !n.is_empty())
            .cloned()
            .unwrap_or_else(|| format!("/{}", crate::api::short_id(&entry.container_id)));
        let image = entry.metadata.get("image").cloned().unwrap_or_default();
        let created = entry.created_at.to_rfc3339_opts(SecondsFormat::Nanos, true);

        let container = Container {
            id: entry.container_id.clone(),
            name: name.clone(),
            created: created.clone(),
            image: image.clone(),
            state: ContainerState {
                status: "running".to_string(),
                running: true,
                pid: 1,
                started_at: created,
                finished_at: crate::api::ZERO_TIME.to_string(),
                ..Default::default()
            },
            config: ContainerConfig {
                image,
                ..Default::default()
            },
            driver: entry.backend.clone(),
            ..Default::default()
        };
        store.containers.put(entry.container_id.clone(), container);
        store.container_names.put(name, entry.container_id.clone());
        store.open_wait_ch(&entry.container_id);
        recovered += 1;
    }
    if recovered > 0 {
        info!("Recovered {} containers from the resource registry", recovered);
    }
    recovered
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn entry(id: &str, age: Duration) -> ResourceEntry {
        ResourceEntry {
            container_id: format!("{}-container", id),
            backend: "ecs-fargate".to_string(),
            resource_type: "task".to_string(),
            resource_id: id.to_string(),
            instance_id: "inst-1".to_string(),
            created_at: Utc::now() - chrono::Duration::from_std(age).unwrap(),
            cleaned_up: false,
            status: String::new(),
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_is_active() {
        let mut e = entry("r1", Duration::ZERO);
        assert!(e.is_active());
        e.status = "pending".to_string();
        assert!(e.is_active());
        e.status = "failed".to_string();
        assert!(!e.is_active());
        e.status = "active".to_string();
        e.cleaned_up = true;
        assert!(!e.is_active());
    }

    #[test]
    fn test_orphaned_and_cleanup() {
        let registry = ResourceRegistry::new(None);
        registry.register(entry("old", Duration::from_secs(7200)));
        registry.register(entry("new", Duration::from_secs(10)));

        let orphaned = registry.list_orphaned(Duration::from_secs(3600));
        assert_eq!(orphaned.len(), 1);
        assert_eq!(orphaned[0].resource_id, "old");

        registry.mark_cleaned_up("old");
        assert_eq!(registry.list_active().len(), 1);
        assert_eq!(registry.list_all().len(), 2);
        registry.mark_active("new");
        assert_eq!(registry.list_active()[0].status, "active");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("registry.json");
        let registry = ResourceRegistry::new(Some(path.clone()));
        registry.register(entry("r1", Duration::from_secs(5)));
        assert!(path.exists());
        assert!(!path.with_extension("tmp").exists());

        let reloaded = ResourceRegistry::new(Some(path));
        reloaded.load().unwrap();
        assert_eq!(reloaded.list_all(), registry.list_all());

        let missing = ResourceRegistry::new(Some(dir.path().join("absent.json")));
        missing.load().unwrap();
        assert!(missing.list_all().is_empty());
    }

    #[test]
    fn test_reconstruct_container_state() {
        let store = Store::new();
        let registry = ResourceRegistry::new(None);
        let mut named = entry("r1", Duration::from_secs(5));
        named.metadata.insert("name".to_string(), "/web".to_string());
        named.metadata.insert("image".to_string(), "nginx".to_string());
        registry.register(named);
        let mut gone = entry("r2", Duration::from_secs(5));
        gone.cleaned_up = true;
        registry.register(gone);

        assert_eq!(reconstruct_container_state(&store, &registry), 1);
        let c = store.containers.get("r1-container").unwrap();
        assert_eq!(c.name, "/web");
        assert_eq!(c.config.image, "nginx");
        assert!(c.state.running);
        assert_eq!(store.container_names.get("/web").unwrap(), "r1-container");
        assert!(store.wait_ch("r1-container").is_some());

        assert_eq!(reconstruct_container_state(&store, &registry), 0);
    }
}
