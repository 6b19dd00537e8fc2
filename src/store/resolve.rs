//! Reference resolution for containers, networks and images

use super::Store;
use crate::api::types::{Container, Image, Network};

/// Shortest ID prefix accepted for container lookups
const MIN_PREFIX_LEN: usize = 3;

impl Store {
    /// Find a container by full ID, name, `/`-prefixed name or short-ID prefix
    pub fn resolve_container(&self, reference: &str) -> Option<Container> {
        if let Some(c) = self.containers.get(reference) {
            return Some(c);
        }
        if let Some(c) = self
            .container_names
            .get(reference)
            .and_then(|id| self.containers.get(&id))
        {
            return Some(c);
        }
        if !reference.starts_with('/') {
            if let Some(c) = self
                .container_names
                .get(&format!("/{}", reference))
                .and_then(|id| self.containers.get(&id))
            {
                return Some(c);
            }
        }
        if reference.len() >= MIN_PREFIX_LEN {
            return self
                .containers
                .list()
                .into_iter()
                .find(|c| c.id.len() > reference.len() && c.id.starts_with(reference));
        }
        None
    }

    /// Resolve a container reference to its ID
    pub fn resolve_container_id(&self, reference: &str) -> Option<String> {
        self.resolve_container(reference).map(|c| c.id)
    }

    /// Find a network by full ID, name or ID prefix
    pub fn resolve_network(&self, reference: &str) -> Option<Network> {
        if let Some(n) = self.networks.get(reference) {
            return Some(n);
        }
        let networks = self.networks.list();
        if let Some(n) = networks.iter().find(|n| n.name == reference) {
            return Some(n.clone());
        }
        if reference.is_empty() {
            return None;
        }
        networks.into_iter().find(|n| n.id.starts_with(reference))
    }

    /// Find an image by reference, `reference:latest`, or ID prefix
    pub fn resolve_image(&self, reference: &str) -> Option<Image> {
        if let Some(img) = self.images.get(reference) {
            return Some(img);
        }
        if !reference.contains(':') && !reference.contains('@') {
            if let Some(img) = self.images.get(&format!("{}:latest", reference)) {
                return Some(img);
            }
        }
        if reference.is_empty() {
            return None;
        }
        let stripped = reference.strip_prefix("sha256:").unwrap_or(reference);
        self.images.list().into_iter().find(|img| {
            img.id.starts_with(reference)
                || img
                    .id
                    .strip_prefix("sha256:")
                    .is_some_and(|hex| !stripped.is_empty() && hex.starts_with(stripped))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store_with(id: &str, name: &str) -> Store {
        let store = Store::new();
        store.containers.put(
            id,
            Container {
                id: id.to_string(),
                name: name.to_string(),
                ..Default::default()
            },
        );
        store.container_names.put(name, id.to_string());
        store
    }

    #[test]
    fn test_resolve_container_by_id_name_prefix() {
        let store = store_with("abcdef0123456789", "/web");
        assert!(store.resolve_container("abcdef0123456789").is_some());
        assert!(store.resolve_container("/web").is_some());
        assert!(store.resolve_container("web").is_some());
        assert!(store.resolve_container("abc").is_some());
        assert!(store.resolve_container("ab").is_none());
        assert!(store.resolve_container("zzz").is_none());
    }

    #[test]
    fn test_resolve_network_order() {
        let store = Store::new();
        store.networks.put(
            "0123456789",
            Network {
                id: "0123456789".to_string(),
                name: "my-net".to_string(),
                ..Default::default()
            },
        );
        assert_eq!(store.resolve_network("my-net").unwrap().id, "0123456789");
        assert_eq!(store.resolve_network("0123").unwrap().name, "my-net");
        assert!(store.resolve_network("other").is_none());
    }

    #[test]
    fn test_resolve_image_latest_and_prefix() {
        let store = Store::new();
        let img = Image {
            id: "sha256:feedface".to_string(),
            ..Default::default()
        };
        store.images.put("alpine:latest", img.clone());
        store.images.put(img.id.clone(), img);
        assert!(store.resolve_image("alpine").is_some());
        assert!(store.resolve_image("sha256:feed").is_some());
        assert!(store.resolve_image("feed").is_some());
        assert!(store.resolve_image("busybox").is_none());
    }
}
