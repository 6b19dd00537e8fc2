//! Network operations over the platform network driver

use super::events::attrs;
use super::Backend;
use crate::api::types::{
    EndpointSettings, Network, NetworkCreateRequest, NetworkCreateResponse, NetworkPruneResponse,
};
use crate::error::{Result, SockerlessError};
use crate::store::filters::Filters;
use tracing::info;

impl Backend {
    pub async fn create_network(&self, req: &NetworkCreateRequest) -> Result<NetworkCreateResponse> {
        let resp = self.drivers.network.create(req).await?;
        info!("Created network {} ({})", req.name, crate::api::short_id(&resp.id));
        self.events
            .emit("network", "create", &resp.id, attrs("name", &req.name));
        Ok(resp)
    }

    pub async fn list_networks(&self, filters: &Filters) -> Result<Vec<Network>> {
        self.drivers.network.list(filters).await
    }

    pub async fn inspect_network(&self, reference: &str) -> Result<Network> {
        self.drivers.network.inspect(reference).await
    }

    pub async fn remove_network(&self, reference: &str) -> Result<()> {
        let network = self.drivers.network.inspect(reference).await?;
        self.drivers.network.remove(reference).await?;
        if let Some(pod) = self.store.pods.get_pod_for_network(&network.name) {
            self.store.pods.set_network(&pod.id, "");
        }
        self.events
            .emit("network", "destroy", &network.id, attrs("name", &network.name));
        Ok(())
    }

    /// Attach a container, joining the network's implicit pod if it forms one
    pub async fn connect_network(
        &self,
        reference: &str,
        container: &str,
        config: Option<&EndpointSettings>,
    ) -> Result<()> {
        let network = self.drivers.network.inspect(reference).await?;
        let id = self
            .store
            .resolve_container_id(container)
            .ok_or_else(|| SockerlessError::not_found("container", container))?;
        self.drivers.network.connect(reference, &id, config).await?;
        self.join_implicit_pod(&id, "");

        let mut attributes = attrs("container", &id);
        attributes.insert("name".to_string(), network.name.clone());
        self.events.emit("network", "connect", &network.id, attributes);
        Ok(())
    }

    pub async fn disconnect_network(&self, reference: &str, container: &str) -> Result<()> {
        let network = self.drivers.network.inspect(reference).await?;
        let id = self
            .store
            .resolve_container_id(container)
            .ok_or_else(|| SockerlessError::not_found("container", container))?;
        self.drivers.network.disconnect(reference, &id).await?;

        let mut attributes = attrs("container", &id);
        attributes.insert("name".to_string(), network.name.clone());
        self.events.emit("network", "disconnect", &network.id, attributes);
        Ok(())
    }

    pub async fn prune_networks(&self, filters: &Filters) -> Result<NetworkPruneResponse> {
        let resp = self.drivers.network.prune(filters).await?;
        for id in &resp.networks_deleted {
            self.events.emit("network", "destroy", id, Default::default());
        }
        Ok(resp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{ContainerConfig, ContainerCreateRequest, HostConfig};
    use crate::backend::testing::backend;

    async fn container(b: &Backend, name: &str) -> String {
        b.create_container(
            name,
            "",
            ContainerCreateRequest {
                config: ContainerConfig {
                    image: "alpine".to_string(),
                    ..Default::default()
                },
                host_config: Some(HostConfig {
                    network_mode: "none".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
        )
        .await
        .unwrap()
        .id
    }

    fn ip_on(b: &Backend, id: &str, net: &str) -> String {
        b.inspect_container(id).unwrap().network_settings.networks[net]
            .ip_address
            .clone()
    }

    #[tokio::test]
    async fn test_released_ip_is_reused() {
        let b = backend();
        b.create_network(&NetworkCreateRequest {
            name: "n".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let x = container(&b, "x").await;
        let y = container(&b, "y").await;
        let z = container(&b, "z").await;
        let w = container(&b, "w").await;
        for id in [&x, &y, &z] {
            b.connect_network("n", id, None).await.unwrap();
        }
        let (ip_x, ip_y, ip_z) = (ip_on(&b, &x, "n"), ip_on(&b, &y, "n"), ip_on(&b, &z, "n"));
        assert_ne!(ip_x, ip_y);
        assert_ne!(ip_y, ip_z);

        b.disconnect_network("n", &y).await.unwrap();
        assert!(!b.inspect_container(&y).unwrap().network_settings.networks.contains_key("n"));
        b.connect_network("n", &w, None).await.unwrap();

        assert_eq!(ip_on(&b, &x, "n"), ip_x);
        assert_eq!(ip_on(&b, &z, "n"), ip_z);
        assert_eq!(ip_on(&b, &w, "n"), ip_y);
        assert_eq!(b.inspect_network("n").await.unwrap().containers.len(), 3);
    }

    #[tokio::test]
    async fn test_connect_forms_pod_and_unknown_container_is_404() {
        let b = backend();
        b.create_network(&NetworkCreateRequest {
            name: "shared".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let a = container(&b, "a").await;
        let c = container(&b, "c").await;
        b.connect_network("shared", &a, None).await.unwrap();
        b.connect_network("shared", &c, None).await.unwrap();
        let pod = b.store.pods.get_pod_for_network("shared").unwrap();
        assert!(pod.container_ids.contains(&a) && pod.container_ids.contains(&c));

        let err = b.connect_network("shared", "ghost", None).await.unwrap_err();
        assert_eq!(err.to_string(), "No such container: ghost");
        assert_eq!(b.connect_network("nope", &a, None).await.unwrap_err().status_code(), 404);
    }

    #[tokio::test]
    async fn test_remove_and_prune_emit_events() {
        let b = backend();
        let mut rx = b.events.subscribe("t");
        let id = b
            .create_network(&NetworkCreateRequest {
                name: "tmp".to_string(),
                ..Default::default()
            })
            .await
            .unwrap()
            .id;
        assert_eq!(b.remove_network("bridge").await.unwrap_err().status_code(), 409);
        b.remove_network("tmp").await.unwrap();

        let created = rx.recv().await.unwrap();
        assert_eq!((created.event_type.as_str(), created.action.as_str()), ("network", "create"));
        let destroyed = rx.recv().await.unwrap();
        assert_eq!(destroyed.action, "destroy");
        assert_eq!(destroyed.actor.id, id);

        b.create_network(&NetworkCreateRequest {
            name: "idle".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
        let pruned = b.prune_networks(&Filters::new()).await.unwrap();
        assert_eq!(pruned.networks_deleted.len(), 1);
        assert!(b.inspect_network("bridge").await.is_ok());
    }
}
