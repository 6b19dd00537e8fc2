//! Image references, aliases and config resolution
//!
//! Images are metadata only. An image is stored under its ID and under
//! every alias a client might use to look it up again.

pub mod build;
pub mod dockerfile;
pub mod registry;

pub use build::{build_image, BuildOutput, BuildRequest};
pub use dockerfile::{parse_dockerfile, ParsedDockerfile};
pub use registry::{parse_image_ref, RegistryClient};

use crate::api::types::{ContainerConfig, Image};
use crate::store::Store;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use base64::Engine;
use serde::Deserialize;

/// PATH given to images whose config is unknown
pub const DEFAULT_PATH_ENV: &str = "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Tag shown for untagged images
pub const NONE_TAG: &str = "<none>:<none>";

/// Append `:latest` when a reference carries neither tag nor digest
pub fn normalize_ref(reference: &str) -> String {
    if reference.contains(':') || reference.contains('@') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

/// Split `name:tag` on the tag colon, ignoring registry ports
pub fn split_tag(reference: &str) -> (&str, Option<&str>) {
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    match reference[last_slash..].rfind(':') {
        Some(i) => (
            &reference[..last_slash + i],
            Some(&reference[last_slash + i + 1..]),
        ),
        None => (reference, None),
    }
}

/// Repository part of a reference
pub fn repository_of(reference: &str) -> &str {
    let name = reference.split('@').next().unwrap_or(reference);
    split_tag(name).0
}

/// Fully qualified Docker Hub name for short references (`alpine`, `user/app`)
fn docker_hub_name(name: &str) -> Option<String> {
    match name.split_once('/') {
        Some((first, _)) if first.contains('.') || first.contains(':') || first == "localhost" => None,
        Some(_) => Some(format!("docker.io/{}", name)),
        None => Some(format!("docker.io/library/{}", name)),
    }
}

/// Every key an image stored under `reference` should resolve from
pub fn image_aliases(reference: &str) -> Vec<String> {
    let (name, tag) = split_tag(reference);
    let tag = tag.unwrap_or("latest");

    let mut aliases = vec![reference.to_string()];
    let mut push = |alias: String| {
        if !aliases.contains(&alias) {
            aliases.push(alias);
        }
    };
    push(name.to_string());

    let short = name
        .strip_prefix("docker.io/library/")
        .or_else(|| name.strip_prefix("docker.io/"));
    if let Some(short) = short {
        push(format!("{}:{}", short, tag));
        push(short.to_string());
    } else if let Some(full) = docker_hub_name(name) {
        push(format!("{}:{}", full, tag));
        push(full);
    }
    aliases
}

/// Store an image under its ID and every alias of `reference`
pub fn store_image_with_aliases(store: &Store, reference: &str, image: Image) {
    for alias in image_aliases(reference) {
        store.images.put(alias, image.clone());
    }
    store.images.put(image.id.clone(), image);
}

/// Re-store an updated image under every key that currently holds it
pub fn replace_image(store: &Store, image: &Image) {
    for key in store.images.keys() {
        store.images.update(&key, |existing| {
            if existing.id == image.id {
                *existing = image.clone();
            }
        });
    }
}

/// Drop an image and every alias pointing at it
pub fn remove_image(store: &Store, image_id: &str) {
    store.images.prune_if(|_, img| img.id == image_id);
}

/// Distinct images, one entry per ID
pub fn unique_images(store: &Store) -> Vec<Image> {
    let mut seen = std::collections::HashSet::new();
    let mut images: Vec<Image> = store
        .images
        .list()
        .into_iter()
        .filter(|img| seen.insert(img.id.clone()))
        .collect();
    images.sort_by(|a, b| b.created.cmp(&a.created).then(a.id.cmp(&b.id)));
    images
}

/// Overlay the non-empty fields of a registry config onto `base`
pub fn merge_registry_config(base: &mut ContainerConfig, fetched: ContainerConfig) {
    if !fetched.env.is_empty() {
        base.env = fetched.env;
    }
    if !fetched.cmd.is_empty() {
        base.cmd = fetched.cmd;
    }
    if !fetched.entrypoint.is_empty() {
        base.entrypoint = fetched.entrypoint;
    }
    if !fetched.working_dir.is_empty() {
        base.working_dir = fetched.working_dir;
    }
    if !fetched.labels.is_empty() {
        base.labels = fetched.labels;
    }
    if !fetched.exposed_ports.is_empty() {
        base.exposed_ports = fetched.exposed_ports;
    }
}

/// Decode an `X-Registry-Auth` value into `(username, password)`.
///
/// The header is base64 JSON; URL-safe and standard alphabets are accepted.
pub fn decode_registry_auth(header: &str) -> Option<(String, String)> {
    #[derive(Deserialize)]
    struct Auth {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    }

    if header.is_empty() {
        return None;
    }
    let decoded = URL_SAFE
        .decode(header)
        .or_else(|_| STANDARD.decode(header))
        .ok()?;
    let auth: Auth = serde_json::from_slice(&decoded).ok()?;
    if auth.username.is_empty() {
        return None;
    }
    Some((auth.username, auth.password))
}

/// Base64 `user:pass` for basic auth
pub fn basic_auth(username: &str, password: &str) -> String {
    STANDARD.encode(format!("{}:{}", username, password))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(id: &str) -> Image {
        Image {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_split_tag_ignores_port() {
        assert_eq!(split_tag("alpine:3.19"), ("alpine", Some("3.19")));
        assert_eq!(split_tag("localhost:5000/app"), ("localhost:5000/app", None));
        assert_eq!(
            split_tag("localhost:5000/app:v1"),
            ("localhost:5000/app", Some("v1"))
        );
        assert_eq!(repository_of("redis@sha256:abc"), "redis");
    }

    #[test]
    fn test_aliases_for_short_name() {
        let aliases = image_aliases("alpine:3.19");
        for want in ["alpine:3.19", "alpine", "docker.io/library/alpine:3.19", "docker.io/library/alpine"] {
            assert!(aliases.contains(&want.to_string()), "missing {}", want);
        }
    }

    #[test]
    fn test_aliases_for_qualified_names() {
        let aliases = image_aliases("docker.io/library/nginx:1.25");
        assert!(aliases.contains(&"nginx:1.25".to_string()));
        assert!(aliases.contains(&"nginx".to_string()));

        let aliases = image_aliases("docker.io/user/app:v2");
        assert!(aliases.contains(&"user/app:v2".to_string()));

        let aliases = image_aliases("ghcr.io/org/tool:v1");
        assert_eq!(aliases, vec!["ghcr.io/org/tool:v1", "ghcr.io/org/tool"]);
    }

    #[test]
    fn test_store_and_remove_with_aliases() {
        let store = Store::new();
        store_image_with_aliases(&store, "alpine:3.19", image("sha256:aaa"));
        let id = store.resolve_image("docker.io/library/alpine:3.19").unwrap().id;
        assert_eq!(id, "sha256:aaa");
        assert_eq!(store.resolve_image("alpine").unwrap().id, "sha256:aaa");
        assert_eq!(unique_images(&store).len(), 1);

        remove_image(&store, "sha256:aaa");
        assert!(store.images.is_empty());
    }

    #[test]
    fn test_replace_image_updates_aliases() {
        let store = Store::new();
        store_image_with_aliases(&store, "app:v1", image("sha256:bbb"));
        let mut img = store.resolve_image("app:v1").unwrap();
        img.repo_tags.push("app:v2".to_string());
        replace_image(&store, &img);
        assert_eq!(store.images.get("app").unwrap().repo_tags, vec!["app:v2"]);
    }

    #[test]
    fn test_decode_registry_auth() {
        let header = URL_SAFE.encode(r#"{"username":"bob","password":"s3cret"}"#);
        assert_eq!(
            decode_registry_auth(&header),
            Some(("bob".to_string(), "s3cret".to_string()))
        );
        assert_eq!(decode_registry_auth(""), None);
        assert_eq!(decode_registry_auth("!!!"), None);
        assert_eq!(basic_auth("bob", "pw"), STANDARD.encode("bob:pw"));
    }

    #[test]
    fn test_merge_registry_config_keeps_defaults_for_empty_fields() {
        let mut base = ContainerConfig {
            env: vec![DEFAULT_PATH_ENV.to_string()],
            cmd: vec!["/bin/sh".to_string()],
            ..Default::default()
        };
        merge_registry_config(
            &mut base,
            ContainerConfig {
                cmd: vec!["nginx".to_string()],
                ..Default::default()
            },
        );
        assert_eq!(base.env, vec![DEFAULT_PATH_ENV]);
        assert_eq!(base.cmd, vec!["nginx"]);
    }
}
