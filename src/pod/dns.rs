//! Peer host resolution for pod members

use crate::store::Store;
use std::collections::HashSet;

/// Network names that never carry peer DNS
const RESERVED_NETWORKS: [&str; 4] = ["bridge", "host", "none", "default"];

/// Fallback address for pods sharing a loopback interface
const LOCALHOST: &str = "127.0.0.1";

/// Environment variable handing peer hosts to an agent
pub const PEER_HOSTS_ENV: &str = "SOCKERLESS_PEER_HOSTS";

/// `host:ip` pairs for every pod peer sharing a user-defined network with
/// the container.
///
/// Each peer yields its name, then its hostname when distinct, then its
/// endpoint aliases. Peers without a known address on a shared network
/// resolve to `127.0.0.1`.
pub fn resolve_peer_hosts(store: &Store, container_id: &str) -> Vec<String> {
    let Some(container) = store.containers.get(container_id) else {
        return Vec::new();
    };

    let mut shared: Vec<&String> = container
        .network_settings
        .networks
        .keys()
        .filter(|name| !RESERVED_NETWORKS.contains(&name.as_str()))
        .collect();
    if shared.is_empty() {
        return Vec::new();
    }
    shared.sort();

    let Some(pod) = store.pods.get_pod_for_container(container_id) else {
        return Vec::new();
    };

    let mut hosts = Vec::new();
    for peer_id in pod.container_ids.iter().filter(|id| *id != container_id) {
        let Some(peer) = store.containers.get(peer_id) else {
            continue;
        };

        let mut ip = String::new();
        let mut aliases: Vec<String> = Vec::new();
        for net in &shared {
            if let Some(ep) = peer.network_settings.networks.get(*net) {
                if !ep.ip_address.is_empty() {
                    ip = ep.ip_address.clone();
                }
                aliases.extend(ep.aliases.iter().cloned());
            }
        }
        if ip.is_empty() {
            ip = LOCALHOST.to_string();
        }

        let name = peer.name.trim_start_matches('/');
        let hostname = peer.config.hostname.as_str();
        let mut seen = HashSet::new();

        if !name.is_empty() {
            seen.insert(name.to_string());
            hosts.push(format!("{}:{}", name, ip));
        }
        if !hostname.is_empty() && seen.insert(hostname.to_string()) {
            hosts.push(format!("{}:{}", hostname, ip));
        }
        for alias in aliases {
            if seen.insert(alias.clone()) {
                hosts.push(format!("{}:{}", alias, ip));
            }
        }
    }
    hosts
}

/// Render an `/etc/hosts` file: loopback entries, the container's own
/// hostname, then peer and extra hosts given as `host:ip`.
pub fn build_hosts_file(hostname: &str, own_ip: &str, peers: &[String], extra_hosts: &[String]) -> String {
    let mut out = String::from("127.0.0.1\tlocalhost\n::1\tlocalhost ip6-localhost ip6-loopback\n");
    if !hostname.is_empty() {
        let ip = if own_ip.is_empty() { LOCALHOST } else { own_ip };
        out.push_str(&format!("{}\t{}\n", ip, hostname));
    }
    for entry in peers.iter().chain(extra_hosts) {
        if let Some((host, ip)) = entry.split_once(':') {
            out.push_str(&format!("{}\t{}\n", ip, host));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{Container, EndpointSettings};
    use std::collections::HashMap;

    fn member(store: &Store, id: &str, name: &str, hostname: &str, nets: &[(&str, &str, &[&str])]) {
        let mut networks = HashMap::new();
        for (net, ip, aliases) in nets {
            networks.insert(
                net.to_string(),
                EndpointSettings {
                    ip_address: ip.to_string(),
                    aliases: aliases.iter().map(|a| a.to_string()).collect(),
                    ..Default::default()
                },
            );
        }
        let mut c = Container {
            id: id.to_string(),
            name: name.to_string(),
            ..Default::default()
        };
        c.config.hostname = hostname.to_string();
        c.network_settings.networks = networks;
        store.containers.put(id, c);
    }

    #[test]
    fn test_peer_hosts_names_hostnames_and_aliases() {
        let store = Store::new();
        member(&store, "a", "/web", "", &[("app", "172.18.0.2", &[])]);
        member(&store, "b", "/db", "database", &[("app", "172.18.0.3", &["db", "pg"])]);
        let pod = store.pods.create_pod("p", HashMap::new());
        store.pods.add_container(&pod.id, "a").unwrap();
        store.pods.add_container(&pod.id, "b").unwrap();

        let hosts = resolve_peer_hosts(&store, "a");
        assert_eq!(
            hosts,
            vec!["db:172.18.0.3", "database:172.18.0.3", "pg:172.18.0.3"]
        );
    }

    #[test]
    fn test_peer_without_shared_ip_uses_localhost() {
        let store = Store::new();
        member(&store, "a", "/web", "", &[("app", "172.18.0.2", &[])]);
        member(&store, "b", "/cache", "", &[]);
        let pod = store.pods.create_pod("p", HashMap::new());
        store.pods.add_container(&pod.id, "a").unwrap();
        store.pods.add_container(&pod.id, "b").unwrap();

        assert_eq!(resolve_peer_hosts(&store, "a"), vec!["cache:127.0.0.1"]);
    }

    #[test]
    fn test_reserved_networks_only_yield_nothing() {
        let store = Store::new();
        member(&store, "a", "/web", "", &[("bridge", "172.17.0.2", &[])]);
        member(&store, "b", "/db", "", &[("bridge", "172.17.0.3", &[])]);
        let pod = store.pods.create_pod("p", HashMap::new());
        store.pods.add_container(&pod.id, "a").unwrap();
        store.pods.add_container(&pod.id, "b").unwrap();

        assert!(resolve_peer_hosts(&store, "a").is_empty());
    }

    #[test]
    fn test_build_hosts_file() {
        let hosts = build_hosts_file(
            "web",
            "172.18.0.2",
            &["db:172.18.0.3".to_string()],
            &["registry:10.0.0.5".to_string()],
        );
        assert!(hosts.starts_with("127.0.0.1\tlocalhost\n"));
        assert!(hosts.contains("172.18.0.2\tweb\n"));
        assert!(hosts.contains("172.18.0.3\tdb\n"));
        assert!(hosts.ends_with("10.0.0.5\tregistry\n"));
    }
}
