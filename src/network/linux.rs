//! Linux network namespaces on top of synthetic networking
//!
//! Each network gets a namespace `sockerless-<id12>` and a bridge
//! `br-<id12>`; each connected container gets a veth pair. Kernel-side
//! failures are logged and never fail the bookkeeping operation.

use super::driver::{NetworkDriver, SyntheticNetworkDriver};
use crate::api::types::{EndpointSettings, Network, NetworkCreateRequest, NetworkCreateResponse, NetworkPruneResponse};
use crate::api::short_id;
use crate::error::{Result, SockerlessError};
use crate::store::filters::Filters;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Kernel objects created for one network
#[derive(Debug, Clone)]
struct NamespaceInfo {
    ns_name: String,
    bridge_name: String,
    /// Prefix length of the network's subnet
    mask: String,
}

/// Runs `ip` commands to manage namespaces, bridges and veth pairs
#[derive(Debug, Default)]
pub struct NetnsManager {
    namespaces: Mutex<HashMap<String, NamespaceInfo>>,
}

async fn ip(args: &[&str]) -> Result<()> {
    debug!("ip {}", args.join(" "));
    let output = Command::new("ip").args(args).output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(SockerlessError::Server(format!(
        "ip {} failed: {}",
        args.join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

/// Mask suffix of a CIDR, defaulting to /16
fn mask_of(subnet: &str) -> String {
    subnet
        .rsplit_once('/')
        .map(|(_, m)| m.to_string())
        .unwrap_or_else(|| "16".to_string())
}

fn veth_names(container_id: &str) -> (String, String) {
    let short = &container_id[..container_id.len().min(8)];
    (format!("veth-{}", short), format!("eth0-{}", short))
}

impl NetnsManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the process may manage network namespaces
    pub fn available(&self) -> bool {
        // SAFETY: geteuid has no preconditions
        unsafe { libc::geteuid() == 0 }
    }

    /// Create the namespace and bridge for a network, rolling back on failure
    pub async fn create_namespace(&self, network_id: &str, gateway: &str, subnet: &str) -> Result<()> {
        let mut namespaces = self.namespaces.lock().await;
        let short = short_id(network_id);
        let info = NamespaceInfo {
            ns_name: format!("sockerless-{}", short),
            bridge_name: format!("br-{}", short),
            mask: mask_of(subnet),
        };
        let cidr = format!("{}/{}", gateway, info.mask);

        ip(&["netns", "add", &info.ns_name]).await?;
        if let Err(e) = ip(&["link", "add", &info.bridge_name, "type", "bridge"]).await {
            let _ = ip(&["netns", "del", &info.ns_name]).await;
            return Err(e);
        }
        let configured = match ip(&["addr", "add", &cidr, "dev", &info.bridge_name]).await {
            Ok(()) => ip(&["link", "set", &info.bridge_name, "up"]).await,
            Err(e) => Err(e),
        };
        if let Err(e) = configured {
            let _ = ip(&["link", "del", &info.bridge_name]).await;
            let _ = ip(&["netns", "del", &info.ns_name]).await;
            return Err(e);
        }

        namespaces.insert(network_id.to_string(), info);
        Ok(())
    }

    /// Remove a network's bridge and namespace; unknown networks are ignored
    pub async fn delete_namespace(&self, network_id: &str) {
        let Some(info) = self.namespaces.lock().await.remove(network_id) else {
            return;
        };
        let _ = ip(&["link", "del", &info.bridge_name]).await;
        let _ = ip(&["netns", "del", &info.ns_name]).await;
    }

    /// Connect a container to a network's bridge with a veth pair
    pub async fn create_veth_pair(&self, network_id: &str, container_id: &str, container_ip: &str) -> Result<()> {
        let info = self
            .namespaces
            .lock()
            .await
            .get(network_id)
            .cloned()
            .ok_or_else(|| {
                SockerlessError::Server(format!("namespace for network {} not found", network_id))
            })?;
        let (host_end, container_end) = veth_names(container_id);

        ip(&["link", "add", &host_end, "type", "veth", "peer", "name", &container_end]).await?;
        let attached = match ip(&["link", "set", &host_end, "master", &info.bridge_name]).await {
            Ok(()) => ip(&["link", "set", &container_end, "netns", &info.ns_name]).await,
            Err(e) => Err(e),
        };
        if let Err(e) = attached {
            let _ = ip(&["link", "del", &host_end]).await;
            return Err(e);
        }

        let cidr = format!("{}/{}", container_ip, info.mask);
        let ns = info.ns_name.as_str();
        let _ = ip(&["netns", "exec", ns, "ip", "addr", "add", &cidr, "dev", &container_end]).await;
        let _ = ip(&["netns", "exec", ns, "ip", "link", "set", &container_end, "up"]).await;
        let _ = ip(&["link", "set", &host_end, "up"]).await;
        Ok(())
    }

    /// Remove a container's veth pair; deleting one end removes both
    pub async fn remove_veth_pair(&self, container_id: &str) {
        let (host_end, _) = veth_names(container_id);
        let _ = ip(&["link", "del", &host_end]).await;
    }
}

/// Synthetic networking plus real namespaces when running as root
pub struct LinuxNetworkDriver {
    synthetic: SyntheticNetworkDriver,
    netns: NetnsManager,
}

impl LinuxNetworkDriver {
    pub fn new(synthetic: SyntheticNetworkDriver) -> Self {
        Self {
            synthetic,
            netns: NetnsManager::new(),
        }
    }
}

#[async_trait]
impl NetworkDriver for LinuxNetworkDriver {
    fn name(&self) -> &'static str {
        "linux"
    }

    async fn create(&self, req: &NetworkCreateRequest) -> Result<NetworkCreateResponse> {
        let resp = self.synthetic.create(req).await?;
        if self.netns.available() {
            let pool = self
                .synthetic
                .store()
                .networks
                .get(&resp.id)
                .and_then(|n| n.ipam.config.first().cloned());
            if let Some(pool) = pool {
                if let Err(e) = self
                    .netns
                    .create_namespace(&resp.id, &pool.gateway, &pool.subnet)
                    .await
                {
                    warn!("Namespace creation for {} failed, using synthetic networking: {}", req.name, e);
                }
            }
        }
        Ok(resp)
    }

    async fn inspect(&self, reference: &str) -> Result<Network> {
        self.synthetic.inspect(reference).await
    }

    async fn list(&self, filters: &Filters) -> Result<Vec<Network>> {
        self.synthetic.list(filters).await
    }

    async fn remove(&self, reference: &str) -> Result<()> {
        if self.netns.available() {
            if let Some(net) = self.synthetic.store().resolve_network(reference) {
                self.netns.delete_namespace(&net.id).await;
            }
        }
        self.synthetic.remove(reference).await
    }

    async fn connect(
        &self,
        network: &str,
        container_id: &str,
        config: Option<&EndpointSettings>,
    ) -> Result<()> {
        self.synthetic.connect(network, container_id, config).await?;
        if !self.netns.available() {
            return Ok(());
        }
        let store = self.synthetic.store();
        let endpoint = store.resolve_network(network).and_then(|net| {
            store
                .containers
                .get(container_id)
                .and_then(|c| c.network_settings.networks.get(&net.name).cloned())
                .map(|ep| (net.id, ep))
        });
        if let Some((net_id, ep)) = endpoint {
            if let Err(e) = self
                .netns
                .create_veth_pair(&net_id, container_id, &ep.ip_address)
                .await
            {
                warn!("Veth creation for {} failed, using synthetic networking: {}", container_id, e);
            }
        }
        Ok(())
    }

    async fn disconnect(&self, network: &str, container_id: &str) -> Result<()> {
        if self.netns.available() && self.synthetic.store().resolve_network(network).is_some() {
            self.netns.remove_veth_pair(container_id).await;
        }
        self.synthetic.disconnect(network, container_id).await
    }

    async fn prune(&self, filters: &Filters) -> Result<NetworkPruneResponse> {
        if self.netns.available() {
            for net in self.synthetic.prunable(filters) {
                self.netns.delete_namespace(&net.id).await;
            }
        }
        self.synthetic.prune(filters).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::sync::Arc;

    #[test]
    fn test_mask_of() {
        assert_eq!(mask_of("10.0.0.0/24"), "24");
        assert_eq!(mask_of(""), "16");
    }

    #[test]
    fn test_veth_names_use_short_container_id() {
        let (host, container) = veth_names("0123456789abcdef");
        assert_eq!(host, "veth-01234567");
        assert_eq!(container, "eth0-01234567");
    }

    #[tokio::test]
    async fn test_delete_unknown_namespace_is_noop() {
        NetnsManager::new().delete_namespace("missing").await;
    }

    #[tokio::test]
    async fn test_bookkeeping_matches_synthetic() {
        let store = Arc::new(Store::new());
        store.seed_default_networks();
        let driver = LinuxNetworkDriver::new(SyntheticNetworkDriver::new(store.clone()));
        assert_eq!(driver.name(), "linux");
        if driver.netns.available() {
            // real namespaces would be created on this host
            return;
        }
        let req = NetworkCreateRequest {
            name: "app".to_string(),
            ..Default::default()
        };
        driver.create(&req).await.unwrap();
        assert_eq!(driver.inspect("app").await.unwrap().name, "app");
        driver.remove("app").await.unwrap();
        assert!(driver.inspect("app").await.is_err());
    }
}
