//! Network drivers
//!
//! The synthetic driver keeps networks purely as records in the store,
//! with addresses handed out by the [`IpAllocator`](super::ipam::IpAllocator).

use crate::api::types::{
    EndpointResource, EndpointSettings, Ipam, Network, NetworkCreateRequest, NetworkCreateResponse,
    NetworkPruneResponse,
};
use crate::error::{Result, SockerlessError};
use crate::store::filters::{match_network, match_network_prune, Filters};
use crate::store::{generate_id, now_rfc3339, Store};
use async_trait::async_trait;
use std::sync::Arc;

/// Names of the networks that always exist
pub const PREDEFINED_NETWORKS: [&str; 3] = ["bridge", "host", "none"];

/// Whether `name` is one of the predefined networks
pub fn is_predefined(name: &str) -> bool {
    PREDEFINED_NETWORKS.contains(&name)
}

/// Network operations
#[async_trait]
pub trait NetworkDriver: Send + Sync {
    fn name(&self) -> &'static str;

    async fn create(&self, req: &NetworkCreateRequest) -> Result<NetworkCreateResponse>;

    async fn inspect(&self, reference: &str) -> Result<Network>;

    async fn list(&self, filters: &Filters) -> Result<Vec<Network>>;

    async fn remove(&self, reference: &str) -> Result<()>;

    /// Attach a container, allocating its address
    async fn connect(
        &self,
        network: &str,
        container_id: &str,
        config: Option<&EndpointSettings>,
    ) -> Result<()>;

    async fn disconnect(&self, network: &str, container_id: &str) -> Result<()>;

    async fn prune(&self, filters: &Filters) -> Result<NetworkPruneResponse>;
}

/// In-memory network bookkeeping
pub struct SyntheticNetworkDriver {
    store: Arc<Store>,
}

impl SyntheticNetworkDriver {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub(crate) fn store(&self) -> &Arc<Store> {
        &self.store
    }

    fn resolve(&self, reference: &str) -> Result<Network> {
        self.store
            .resolve_network(reference)
            .ok_or_else(|| SockerlessError::not_found("network", reference))
    }

    /// Networks a prune with `filters` would remove
    pub fn prunable(&self, filters: &Filters) -> Vec<Network> {
        self.store
            .networks
            .filter(|n| prunable(n, filters))
    }
}

fn prunable(n: &Network, filters: &Filters) -> bool {
    !is_predefined(&n.name) && n.containers.is_empty() && match_network_prune(n, filters)
}

#[async_trait]
impl NetworkDriver for SyntheticNetworkDriver {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    async fn create(&self, req: &NetworkCreateRequest) -> Result<NetworkCreateResponse> {
        if req.name.is_empty() {
            return Err(SockerlessError::InvalidParameter(
                "network name is required".to_string(),
            ));
        }
        if self.store.networks.list().iter().any(|n| n.name == req.name) {
            return Err(SockerlessError::Conflict(format!(
                "network with name {} already exists",
                req.name
            )));
        }

        let id = generate_id();
        let mut ipam = req.ipam.clone().unwrap_or_else(|| Ipam {
            driver: "default".to_string(),
            ..Default::default()
        });
        if ipam.driver.is_empty() {
            ipam.driver = "default".to_string();
        }
        match ipam.config.first_mut() {
            None => ipam.config.push(self.store.ipam.allocate_subnet(&id, None)?),
            Some(requested) => *requested = self.store.ipam.allocate_subnet(&id, Some(&*requested))?,
        }

        let driver = if req.driver.is_empty() {
            "bridge".to_string()
        } else {
            req.driver.clone()
        };

        self.store.networks.put(
            id.clone(),
            Network {
                name: req.name.clone(),
                id: id.clone(),
                created: now_rfc3339(),
                scope: "local".to_string(),
                driver,
                enable_ipv6: req.enable_ipv6,
                ipam,
                internal: req.internal,
                attachable: req.attachable,
                ingress: req.ingress,
                containers: Default::default(),
                options: req.options.clone(),
                labels: req.labels.clone(),
            },
        );

        Ok(NetworkCreateResponse {
            id,
            warning: String::new(),
        })
    }

    async fn inspect(&self, reference: &str) -> Result<Network> {
        self.resolve(reference)
    }

    async fn list(&self, filters: &Filters) -> Result<Vec<Network>> {
        let mut networks = self.store.networks.filter(|n| match_network(n, filters));
        networks.sort_by(|a, b| a.created.cmp(&b.created));
        Ok(networks)
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        let network = self.resolve(reference)?;
        if is_predefined(&network.name) {
            return Err(SockerlessError::Conflict(format!(
                "{} is a pre-defined network and cannot be removed",
                network.name
            )));
        }
        self.store.networks.delete(&network.id);
        self.store.ipam.release_subnet(&network.id);
        Ok(())
    }

    async fn connect(
        &self,
        network: &str,
        container_id: &str,
        config: Option<&EndpointSettings>,
    ) -> Result<()> {
        let net = self.resolve(network)?;
        let container_name = self
            .store
            .containers
            .get(container_id)
            .map(|c| c.name)
            .ok_or_else(|| SockerlessError::not_found("container", container_id))?;

        let assignment = self.store.ipam.allocate_ip(&net.id)?;
        let mut endpoint = EndpointSettings {
            network_id: net.id.clone(),
            endpoint_id: generate_id()[..16].to_string(),
            gateway: assignment.gateway.to_string(),
            ip_address: assignment.ip.to_string(),
            ip_prefix_len: assignment.prefix_len,
            mac_address: assignment.mac,
            aliases: Vec::new(),
        };
        if let Some(config) = config {
            if !config.ip_address.is_empty() {
                endpoint.ip_address = config.ip_address.clone();
            }
            if !config.aliases.is_empty() {
                endpoint.aliases = config.aliases.clone();
            }
        }

        let resource = EndpointResource {
            name: container_name.trim_start_matches('/').to_string(),
            endpoint_id: endpoint.endpoint_id.clone(),
            mac_address: endpoint.mac_address.clone(),
            ipv4_address: format!("{}/{}", endpoint.ip_address, endpoint.ip_prefix_len),
            ipv6_address: String::new(),
        };
        self.store.networks.update(&net.id, |n| {
            n.containers.insert(container_id.to_string(), resource);
        });
        self.store.containers.update(container_id, |c| {
            c.network_settings
                .networks
                .insert(net.name.clone(), endpoint);
        });
        Ok(())
    }

    async fn disconnect(&self, network: &str, container_id: &str) -> Result<()> {
        let net = self.resolve(network)?;
        if let Some(endpoint) = self
            .store
            .containers
            .get(container_id)
            .and_then(|c| c.network_settings.networks.get(&net.name).cloned())
        {
            self.store.ipam.release_ip(&net.id, &endpoint.ip_address);
        }
        self.store.networks.update(&net.id, |n| {
            n.containers.remove(container_id);
        });
        self.store.containers.update(container_id, |c| {
            c.network_settings.networks.remove(&net.name);
        });
        Ok(())
    }

    async fn prune(&self, filters: &Filters) -> Result<NetworkPruneResponse> {
        let pruned = self.store.networks.prune_if(|_, n| prunable(n, filters));
        let networks_deleted = pruned
            .into_iter()
            .map(|n| {
                self.store.ipam.release_subnet(&n.id);
                n.id
            })
            .collect();
        Ok(NetworkPruneResponse { networks_deleted })
    }
}
