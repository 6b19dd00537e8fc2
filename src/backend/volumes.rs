//! Volume operations with events

use super::events::attrs;
use super::Backend;
use crate::api::types::{Volume, VolumeCreateRequest, VolumeListResponse, VolumePruneResponse};
use crate::error::Result;
use crate::store::filters::Filters;

impl Backend {
    pub fn create_volume(&self, req: &VolumeCreateRequest) -> Volume {
        let existed = !req.name.is_empty() && self.store.volumes.contains(&req.name);
        let volume = self.volumes.create(req);
        if !existed {
            self.events
                .emit("volume", "create", &volume.name, attrs("driver", &volume.driver));
        }
        volume
    }

    pub fn list_volumes(&self, filters: &Filters) -> VolumeListResponse {
        VolumeListResponse {
            volumes: self.volumes.list(filters),
            warnings: Vec::new(),
        }
    }

    pub fn inspect_volume(&self, name: &str) -> Result<Volume> {
        self.volumes.inspect(name)
    }

    pub fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        self.volumes.remove(name, force)?;
        self.events.emit("volume", "destroy", name, Default::default());
        Ok(())
    }

    pub fn prune_volumes(&self, filters: &Filters) -> VolumePruneResponse {
        let resp = self.volumes.prune(filters);
        for name in &resp.volumes_deleted {
            self.events.emit("volume", "destroy", name, Default::default());
        }
        resp
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::testing::backend;

    #[tokio::test]
    async fn test_create_is_idempotent_and_emits_once() {
        let b = backend();
        let mut rx = b.events.subscribe("vol");
        let req = VolumeCreateRequest {
            name: "data".to_string(),
            ..Default::default()
        };
        let first = b.create_volume(&req);
        let second = b.create_volume(&req);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(first.driver, "local");

        let ev = rx.recv().await.unwrap();
        assert_eq!((ev.action.as_str(), ev.actor.id.as_str()), ("create", "data"));
        assert!(rx.try_recv().is_err());

        assert_eq!(b.list_volumes(&Filters::new()).volumes.len(), 1);
        b.remove_volume("data", false).unwrap();
        assert_eq!(rx.recv().await.unwrap().action, "destroy");
        assert_eq!(b.inspect_volume("data").unwrap_err().status_code(), 404);
        assert_eq!(b.remove_volume("data", false).unwrap_err().status_code(), 404);
    }

    #[test]
    fn test_prune_reports_removed() {
        let b = backend();
        b.create_volume(&VolumeCreateRequest::default());
        b.create_volume(&VolumeCreateRequest {
            name: "keep".to_string(),
            ..Default::default()
        });
        let resp = b.prune_volumes(&Filters::new());
        assert_eq!(resp.volumes_deleted.len(), 2);
        assert!(b.list_volumes(&Filters::new()).volumes.is_empty());
    }
}
