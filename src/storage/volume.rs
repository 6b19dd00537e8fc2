//! Volume management
//!
//! Volumes are store records. When a real process factory is configured a
//! volume also gets a host directory so processes can see its contents.

use crate::api::types::{
    ContainerConfig, HostConfig, MountPoint, Volume, VolumeCreateRequest,
    VolumePruneResponse,
};
use crate::driver::process::dir_size;
use crate::error::{Result, SockerlessError};
use crate::store::filters::{match_volume, Filters};
use crate::store::{generate_id, now_rfc3339, Store};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Mountpoint reported for volumes without a host directory
pub fn default_mountpoint(name: &str) -> String {
    format!("/var/lib/sockerless/volumes/{}/_data", name)
}

fn make_host_dir(name: &str) -> Option<PathBuf> {
    let dir = std::env::temp_dir().join(format!("vol-{}-{}", name, &generate_id()[..8]));
    match std::fs::create_dir_all(&dir) {
        Ok(()) => Some(dir),
        Err(e) => {
            warn!("Failed to create host directory for volume {}: {}", name, e);
            None
        }
    }
}

fn remove_host_dir(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        debug!("Failed to remove volume directory {}: {}", path.display(), e);
    }
}

/// Volume manager
pub struct VolumeManager {
    store: Arc<Store>,
    /// Whether volumes get host directories
    host_dirs: bool,
}

impl VolumeManager {
    /// Create a new volume manager
    pub fn new(store: Arc<Store>, host_dirs: bool) -> Self {
        Self { store, host_dirs }
    }

    /// Create a volume; an existing name returns the existing record
    pub fn create(&self, req: &VolumeCreateRequest) -> Volume {
        let name = if req.name.is_empty() {
            generate_id()[..12].to_string()
        } else {
            req.name.clone()
        };
        if let Some(existing) = self.store.volumes.get(&name) {
            return existing;
        }

        let mut volume = Volume {
            name: name.clone(),
            driver: if req.driver.is_empty() {
                "local".to_string()
            } else {
                req.driver.clone()
            },
            mountpoint: default_mountpoint(&name),
            created_at: now_rfc3339(),
            labels: req.labels.clone(),
            scope: "local".to_string(),
            options: req.driver_opts.clone(),
            status: None,
        };

        if self.host_dirs {
            if let Some(dir) = make_host_dir(&name) {
                volume.mountpoint = dir.display().to_string();
                self.store.volume_dirs.store(name.clone(), dir);
            }
        }

        self.store.volumes.put(name, volume.clone());
        volume
    }

    /// Volumes matching the filters, sorted by name
    pub fn list(&self, filters: &Filters) -> Vec<Volume> {
        let mut volumes = self.store.volumes.filter(|v| match_volume(v, filters));
        volumes.sort_by(|a, b| a.name.cmp(&b.name));
        volumes
    }

    pub fn inspect(&self, name: &str) -> Result<Volume> {
        self.store
            .volumes
            .get(name)
            .ok_or_else(|| SockerlessError::not_found("volume", name))
    }

    /// Remove a volume and its host directory
    pub fn remove(&self, name: &str, force: bool) -> Result<()> {
        if !self.store.volumes.contains(name) {
            return Err(SockerlessError::not_found("volume", name));
        }
        if !force && self.in_use().contains(name) {
            return Err(SockerlessError::Conflict(format!(
                "remove {}: volume is in use",
                name
            )));
        }
        self.store.volumes.delete(name);
        if let Some(dir) = self.store.volume_dirs.load_and_delete(name) {
            remove_host_dir(&dir);
        }
        Ok(())
    }

    /// Names of volumes mounted by any container
    fn in_use(&self) -> HashSet<String> {
        self.store
            .containers
            .list()
            .into_iter()
            .flat_map(|c| c.mounts.into_iter().map(|m| m.name))
            .filter(|n| !n.is_empty())
            .collect()
    }

    /// Remove every volume no container mounts
    pub fn prune(&self, filters: &Filters) -> VolumePruneResponse {
        let used = self.in_use();
        let removed = self
            .store
            .volumes
            .prune_if(|name, v| !used.contains(name) && match_volume(v, filters));

        let mut resp = VolumePruneResponse::default();
        for volume in removed {
            if let Some(dir) = self.store.volume_dirs.load_and_delete(&volume.name) {
                resp.space_reclaimed += dir_size(&dir);
                remove_host_dir(&dir);
            }
            resp.volumes_deleted.push(volume.name);
        }
        resp.volumes_deleted.sort();
        resp
    }
}

/// Split a bind spec `source:target[:mode]`
pub fn parse_bind(bind: &str) -> Option<(&str, &str, &str)> {
    let mut parts = bind.splitn(3, ':');
    let source = parts.next()?;
    let target = parts.next()?;
    Some((source, target, parts.next().unwrap_or("")))
}

/// Host directories to expose inside a container, keyed by container path.
///
/// Named volumes map to their host directory; absolute host paths pass
/// through when they are existing directories. Volume mounts without a host
/// directory get one created on demand.
pub fn resolve_bind_mounts(store: &Store, host_config: &HostConfig) -> HashMap<String, String> {
    let mut resolved = HashMap::new();

    for bind in &host_config.binds {
        let Some((source, target, _)) = parse_bind(bind) else {
            continue;
        };
        if let Some(dir) = store.volume_dirs.load(source) {
            resolved.insert(target.to_string(), dir.display().to_string());
        } else if Path::new(source).is_absolute() && Path::new(source).is_dir() {
            resolved.insert(target.to_string(), source.to_string());
        }
    }

    for mount in &host_config.mounts {
        if mount.mount_type != "volume" || mount.source.is_empty() || mount.target.is_empty() {
            continue;
        }
        let dir = match store.volume_dirs.load(&mount.source) {
            Some(dir) => Some(dir),
            None => make_host_dir(&mount.source).map(|dir| {
                store.volume_dirs.store(mount.source.clone(), dir.clone());
                dir
            }),
        };
        if let Some(dir) = dir {
            resolved.insert(mount.target.clone(), dir.display().to_string());
        }
    }

    resolved
}

/// Materialized mount list for a new container.
///
/// Binds come first, then `HostConfig.Mounts`, then anonymous volumes for
/// image volume paths nothing else covers.
pub fn materialize_mounts(store: &Store, config: &ContainerConfig, host_config: &HostConfig) -> Vec<MountPoint> {
    let mut mounts = Vec::new();
    let mut seen = HashSet::new();

    for bind in &host_config.binds {
        let Some((source, target, mode)) = parse_bind(bind) else {
            continue;
        };
        let rw = !mode.split(',').any(|m| m == "ro");
        let point = if Path::new(source).is_absolute() {
            MountPoint {
                mount_type: "bind".to_string(),
                source: source.to_string(),
                destination: target.to_string(),
                mode: mode.to_string(),
                rw,
                ..Default::default()
            }
        } else {
            let mountpoint = store
                .volumes
                .get(source)
                .map(|v| v.mountpoint)
                .unwrap_or_else(|| default_mountpoint(source));
            MountPoint {
                mount_type: "volume".to_string(),
                name: source.to_string(),
                source: mountpoint,
                destination: target.to_string(),
                driver: "local".to_string(),
                mode: mode.to_string(),
                rw,
            }
        };
        seen.insert(target.to_string());
        mounts.push(point);
    }

    for mount in &host_config.mounts {
        if !seen.insert(mount.target.clone()) {
            continue;
        }
        let mut point = MountPoint {
            mount_type: mount.mount_type.clone(),
            source: mount.source.clone(),
            destination: mount.target.clone(),
            rw: !mount.read_only,
            ..Default::default()
        };
        if mount.mount_type == "volume" {
            point.name = mount.source.clone();
            point.driver = "local".to_string();
            point.source = store
                .volumes
                .get(&mount.source)
                .map(|v| v.mountpoint)
                .unwrap_or_else(|| default_mountpoint(&mount.source));
        }
        mounts.push(point);
    }

    let mut anonymous: Vec<&String> = config
        .volumes
        .keys()
        .filter(|dest| !seen.contains(*dest))
        .collect();
    anonymous.sort();
    for dest in anonymous {
        let name = generate_id();
        mounts.push(MountPoint {
            mount_type: "volume".to_string(),
            source: default_mountpoint(&name),
            name,
            destination: dest.clone(),
            driver: "local".to_string(),
            rw: true,
            ..Default::default()
        });
    }

    mounts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{Container, EmptyObject, Mount};
    use tempfile::tempdir;

    fn req(name: &str) -> VolumeCreateRequest {
        VolumeCreateRequest {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_defaults_and_idempotent() {
        let store = Arc::new(Store::new());
        let manager = VolumeManager::new(store.clone(), false);
        let v = manager.create(&req("data"));
        assert_eq!(v.driver, "local");
        assert_eq!(v.scope, "local");
        assert_eq!(v.mountpoint, "/var/lib/sockerless/volumes/data/_data");

        let again = manager.create(&req("data"));
        assert_eq!(again.created_at, v.created_at);
        assert_eq!(store.volumes.len(), 1);
    }

    #[test]
    fn test_create_generates_name() {
        let manager = VolumeManager::new(Arc::new(Store::new()), false);
        let v = manager.create(&req(""));
        assert_eq!(v.name.len(), 12);
    }

    #[test]
    fn test_host_dir_lifecycle() {
        let store = Arc::new(Store::new());
        let manager = VolumeManager::new(store.clone(), true);
        let v = manager.create(&req("cache"));
        let dir = store.volume_dirs.load("cache").unwrap();
        assert!(dir.is_dir());
        assert_eq!(v.mountpoint, dir.display().to_string());

        manager.remove("cache", false).unwrap();
        assert!(!dir.exists());
        assert_eq!(manager.remove("cache", false).unwrap_err().status_code(), 404);
    }

    #[test]
    fn test_prune_skips_mounted() {
        let store = Arc::new(Store::new());
        let manager = VolumeManager::new(store.clone(), false);
        manager.create(&req("used"));
        manager.create(&req("unused"));
        let mut c = Container {
            id: "c1".to_string(),
            ..Default::default()
        };
        c.mounts.push(MountPoint {
            name: "used".to_string(),
            ..Default::default()
        });
        store.containers.put("c1", c);

        let resp = manager.prune(&Filters::new());
        assert_eq!(resp.volumes_deleted, vec!["unused"]);
        assert!(store.volumes.contains("used"));
        assert_eq!(manager.remove("used", false).unwrap_err().status_code(), 409);
    }

    #[test]
    fn test_resolve_bind_mounts() {
        let store = Store::new();
        let host = tempdir().unwrap();
        let vol_dir = tempdir().unwrap();
        store.volume_dirs.store("data", vol_dir.path().to_path_buf());

        let hc = HostConfig {
            binds: vec![
                format!("{}:/src", host.path().display()),
                "data:/data:ro".to_string(),
                "/does/not/exist:/missing".to_string(),
            ],
            mounts: vec![Mount {
                mount_type: "volume".to_string(),
                source: "auto".to_string(),
                target: "/auto".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let binds = resolve_bind_mounts(&store, &hc);
        assert_eq!(binds["/src"], host.path().display().to_string());
        assert_eq!(binds["/data"], vol_dir.path().display().to_string());
        assert!(!binds.contains_key("/missing"));
        let auto = store.volume_dirs.load("auto").unwrap();
        assert_eq!(binds["/auto"], auto.display().to_string());
        std::fs::remove_dir_all(auto).unwrap();
    }

    #[test]
    fn test_materialize_mounts() {
        let store = Store::new();
        let mut config = ContainerConfig::default();
        config.volumes.insert("/data".to_string(), EmptyObject {});
        config.volumes.insert("/cache".to_string(), EmptyObject {});
        let hc = HostConfig {
            binds: vec!["/host:/data:ro".to_string(), "named:/named".to_string()],
            ..Default::default()
        };

        let mounts = materialize_mounts(&store, &config, &hc);
        assert_eq!(mounts.len(), 3);
        assert_eq!(mounts[0].mount_type, "bind");
        assert!(!mounts[0].rw);
        assert_eq!(mounts[1].name, "named");
        assert_eq!(mounts[1].mount_type, "volume");
        assert_eq!(mounts[2].destination, "/cache");
        assert_eq!(mounts[2].name.len(), 64);
    }
}
