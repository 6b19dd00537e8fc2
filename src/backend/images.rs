//! Image pull, build and bookkeeping

use super::events::attrs;
use super::Backend;
use crate::api::types::{
    AuthRequest, AuthResponse, ContainerConfig, Image, ImageDeleteResponse, ImageHistoryEntry,
    ImagePruneResponse, ImageSummary, RootFs,
};
use crate::config::DockerConfig;
use crate::error::{Result, SockerlessError};
use crate::image::build::hex_digest;
use crate::image::{
    basic_auth, build_image, decode_registry_auth, image_aliases, merge_registry_config,
    normalize_ref, parse_image_ref, replace_image, repository_of, split_tag,
    store_image_with_aliases, unique_images, BuildOutput, BuildRequest, DEFAULT_PATH_ENV, NONE_TAG,
};
use crate::store::filters::Filters;
use crate::store::{generate_id, now_rfc3339};
use chrono::DateTime;
use serde_json::{json, Value};
use std::collections::HashSet;
use tracing::{debug, info};

/// Size reported for pulled images, which have no layers
pub const PULLED_IMAGE_SIZE: u64 = 7654321;

/// Layer ID shown in pull progress
const PROGRESS_LAYER_ID: &str = "abc123";

fn unix_seconds(ts: &str) -> i64 {
    DateTime::parse_from_rfc3339(ts)
        .map(|t| t.timestamp())
        .unwrap_or(0)
}

fn filter_is_true(filters: &Filters, key: &str) -> bool {
    filters
        .get(key)
        .is_some_and(|vals| vals.iter().any(|v| v == "true" || v == "1"))
}

/// Tagged with something other than `<none>`
fn has_real_tag(img: &Image) -> bool {
    img.repo_tags.iter().any(|t| !t.contains("<none>"))
}

impl Backend {
    /// Pull an image and return the progress messages to stream.
    ///
    /// `auth_header` is the raw `X-Registry-Auth` value.
    pub async fn pull_image(&self, reference: &str, auth_header: &str) -> Result<Vec<Value>> {
        if reference.is_empty() {
            return Err(SockerlessError::InvalidParameter(
                "image reference is required".to_string(),
            ));
        }
        let reference = normalize_ref(reference);
        let repo = repository_of(&reference).to_string();

        if self.store.resolve_image(&reference).is_some() {
            return Ok(vec![
                json!({"status": format!("Pulling from {}", repo)}),
                json!({"status": format!("Status: Image is up to date for {}", reference)}),
            ]);
        }

        let digest = hex_digest(reference.as_bytes());
        let mut config = ContainerConfig {
            env: vec![DEFAULT_PATH_ENV.to_string()],
            cmd: vec!["/bin/sh".to_string()],
            ..Default::default()
        };
        let auth = self.pull_credentials(&reference, auth_header);
        if let Some(fetched) = self
            .registry
            .fetch_image_config(&reference, auth.as_deref())
            .await
        {
            merge_registry_config(&mut config, fetched);
        }

        let image = Image {
            id: format!("sha256:{}", digest),
            repo_tags: vec![reference.clone()],
            repo_digests: vec![format!("{}@sha256:{}", repo, digest)],
            created: now_rfc3339(),
            size: PULLED_IMAGE_SIZE,
            virtual_size: PULLED_IMAGE_SIZE,
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config,
            root_fs: RootFs {
                fs_type: "layers".to_string(),
                layers: vec![format!("sha256:{}", generate_id())],
            },
            ..Default::default()
        };
        let id = image.id.clone();
        store_image_with_aliases(&self.store, &reference, image);
        info!("Pulled {}", reference);
        self.events.emit("image", "pull", &reference, attrs("name", &reference));
        debug!("Image {} stored as {}", reference, id);

        Ok(vec![
            json!({"status": format!("Pulling from {}", repo)}),
            json!({"status": "Pulling fs layer", "id": PROGRESS_LAYER_ID}),
            json!({"status": "Download complete", "id": PROGRESS_LAYER_ID}),
            json!({"status": "Pull complete", "id": PROGRESS_LAYER_ID}),
            json!({"status": format!("Digest: sha256:{}", digest)}),
            json!({"status": format!("Status: Downloaded newer image for {}", reference)}),
        ])
    }

    /// Basic credentials: header, then `/auth` logins, then the Docker config
    fn pull_credentials(&self, reference: &str, auth_header: &str) -> Option<String> {
        if let Some((user, pass)) = decode_registry_auth(auth_header) {
            return Some(basic_auth(&user, &pass));
        }
        let registry = parse_image_ref(reference).registry;
        if let Some(cred) = self.store.creds.get(&registry) {
            return Some(basic_auth(&cred.username, &cred.password));
        }
        DockerConfig::load_default()
            .registry_auth(&registry)
            .map(|(user, pass)| basic_auth(&user, &pass))
    }

    pub fn inspect_image(&self, name: &str) -> Result<Image> {
        self.store
            .resolve_image(name)
            .ok_or_else(|| SockerlessError::not_found("image", name))
    }

    /// Accept an image tarball; layers are discarded
    pub fn load_image(&self, _tarball: &[u8]) -> Value {
        let image = Image {
            id: format!("sha256:{}", generate_id()),
            repo_tags: vec!["loaded:latest".to_string()],
            created: now_rfc3339(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            root_fs: RootFs {
                fs_type: "layers".to_string(),
                layers: Vec::new(),
            },
            ..Default::default()
        };
        self.store.images.put(image.id.clone(), image.clone());
        self.store.images.put("loaded:latest", image.clone());
        self.store.images.put("loaded", image);
        json!({"stream": "Loaded image: loaded:latest\n"})
    }

    pub fn tag_image(&self, name: &str, repo: &str, tag: &str) -> Result<()> {
        if repo.is_empty() {
            return Err(SockerlessError::InvalidParameter("repo is required".to_string()));
        }
        let mut image = self.inspect_image(name)?;
        let tag = if tag.is_empty() { "latest" } else { tag };
        let reference = format!("{}:{}", repo, tag);
        if !image.repo_tags.contains(&reference) {
            image.repo_tags.push(reference.clone());
        }
        image.repo_tags.retain(|t| t != NONE_TAG);
        replace_image(&self.store, &image);
        store_image_with_aliases(&self.store, &reference, image.clone());
        self.events.emit("image", "tag", &image.id, attrs("name", &reference));
        Ok(())
    }

    /// Distinct images, optionally narrowed by `dangling`, `reference` or `label`
    pub fn list_images(&self, filters: &Filters) -> Vec<ImageSummary> {
        let containers = self.store.containers.list();
        unique_images(&self.store)
            .into_iter()
            .filter(|img| match filters.get("dangling").and_then(|v| v.first()) {
                Some(v) if v == "true" || v == "1" => !has_real_tag(img),
                Some(v) if v == "false" || v == "0" => has_real_tag(img),
                _ => true,
            })
            .filter(|img| {
                filters.get("reference").map_or(true, |refs| {
                    refs.iter().any(|r| {
                        img.repo_tags
                            .iter()
                            .any(|t| t == r || repository_of(t) == r.as_str())
                    })
                })
            })
            .filter(|img| {
                filters.get("label").map_or(true, |labels| {
                    labels.iter().all(|l| match l.split_once('=') {
                        Some((k, v)) => img.config.labels.get(k).map(String::as_str) == Some(v),
                        None => img.config.labels.contains_key(l),
                    })
                })
            })
            .map(|img| {
                let in_use = containers
                    .iter()
                    .filter(|c| self.store.resolve_image(&c.config.image).is_some_and(|i| i.id == img.id))
                    .count();
                ImageSummary {
                    id: img.id.clone(),
                    parent_id: String::new(),
                    repo_tags: img.repo_tags.clone(),
                    repo_digests: img.repo_digests.clone(),
                    created: unix_seconds(&img.created),
                    size: img.size,
                    shared_size: 0,
                    virtual_size: img.virtual_size,
                    labels: img.config.labels.clone(),
                    containers: in_use as i64,
                }
            })
            .collect()
    }

    pub fn remove_image(&self, name: &str) -> Result<Vec<ImageDeleteResponse>> {
        let image = self.inspect_image(name)?;
        crate::image::remove_image(&self.store, &image.id);

        let mut resp: Vec<ImageDeleteResponse> = image
            .repo_tags
            .iter()
            .map(|t| ImageDeleteResponse {
                untagged: t.clone(),
                ..Default::default()
            })
            .collect();
        resp.push(ImageDeleteResponse {
            deleted: image.id.clone(),
            ..Default::default()
        });
        for tag in &image.repo_tags {
            self.events.emit("image", "untag", &image.id, attrs("name", tag));
        }
        self.events.emit("image", "delete", &image.id, attrs("name", name));
        Ok(resp)
    }

    pub fn image_history(&self, name: &str) -> Result<Vec<ImageHistoryEntry>> {
        let image = self.inspect_image(name)?;
        Ok(vec![ImageHistoryEntry {
            id: image.id,
            created: unix_seconds(&image.created),
            created_by: "/bin/sh -c #(nop) CMD [\"sh\"]".to_string(),
            tags: image.repo_tags,
            size: image.size,
            comment: String::new(),
        }])
    }

    /// Remove images no container references; `dangling=true` spares tagged ones
    pub fn prune_images(&self, filters: &Filters) -> ImagePruneResponse {
        let mut referenced = HashSet::new();
        for c in self.store.containers.list() {
            referenced.insert(c.config.image.clone());
            referenced.insert(c.image.clone());
            if let Some(img) = self.store.resolve_image(&c.config.image) {
                referenced.insert(img.id);
            }
        }
        let dangling_only = filter_is_true(filters, "dangling");

        let mut resp = ImagePruneResponse::default();
        for image in unique_images(&self.store) {
            let in_use = referenced.contains(&image.id)
                || image.repo_tags.iter().any(|t| {
                    referenced.contains(t) || referenced.contains(split_tag(t).0)
                });
            if in_use || (dangling_only && has_real_tag(&image)) {
                continue;
            }

            for tag in &image.repo_tags {
                resp.images_deleted.push(ImageDeleteResponse {
                    untagged: tag.clone(),
                    ..Default::default()
                });
            }
            resp.images_deleted.push(ImageDeleteResponse {
                deleted: image.id.clone(),
                ..Default::default()
            });
            resp.space_reclaimed += image.size;

            crate::image::remove_image(&self.store, &image.id);
            for tag in &image.repo_tags {
                for alias in image_aliases(tag) {
                    self.store.images.delete(&alias);
                }
            }
            self.events.emit("image", "delete", &image.id, Default::default());
        }
        resp
    }

    /// Remember credentials for later pulls; every login succeeds
    pub fn login(&self, req: AuthRequest) -> AuthResponse {
        if !req.server_address.is_empty() {
            self.store.creds.put(req.server_address.clone(), req);
        }
        AuthResponse {
            status: "Login Succeeded".to_string(),
        }
    }

    /// Build off the async runtime; the parse and context unpack are blocking
    pub async fn build(&self, req: BuildRequest) -> Result<BuildOutput> {
        let store = self.store.clone();
        let output = tokio::task::spawn_blocking(move || build_image(&store, req))
            .await
            .map_err(|e| SockerlessError::Server(e.to_string()))??;
        info!("Built {}", output.reference);
        self.events
            .emit("image", "tag", &output.image_id, attrs("name", &output.reference));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::types::{Container, ContainerCreateRequest};
    use crate::backend::testing::backend;
    use crate::backend::{Backend, BackendDesc, BackendOptions};
    use crate::image::registry::mock;
    use crate::image::RegistryClient;
    use base64::engine::general_purpose::URL_SAFE;
    use base64::Engine;
    use std::sync::atomic::Ordering;

    fn image(id: &str, tags: &[&str], size: u64) -> Image {
        Image {
            id: id.to_string(),
            repo_tags: tags.iter().map(|s| s.to_string()).collect(),
            size,
            created: now_rfc3339(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pull_resolves_multi_arch_config() {
        let (addr, state) = mock::serve(false).await;
        let b = Backend::new(BackendDesc::default(), BackendOptions::default())
            .with_registry(RegistryClient::new("http", true).with_hub_host(&addr.to_string()));

        let progress = b.pull_image("alpine:3.19", "").await.unwrap();
        assert_eq!(progress.len(), 6);
        assert_eq!(progress[0]["status"], "Pulling from alpine");
        assert_eq!(progress[5]["status"], "Status: Downloaded newer image for alpine:3.19");

        let img = b.inspect_image("alpine:3.19").unwrap();
        assert_eq!(img.config.cmd, vec!["/bin/sh"]);
        assert_eq!(img.config.env, vec!["PATH=/bin"]);
        assert!(img.repo_tags.contains(&"alpine:3.19".to_string()));
        assert_eq!(img.size, PULLED_IMAGE_SIZE);
        for alias in ["alpine:3.19", "alpine", "docker.io/library/alpine:3.19"] {
            assert_eq!(b.inspect_image(alias).unwrap().id, img.id, "{}", alias);
        }
        assert!(state.manifest_requests.load(Ordering::SeqCst) >= 2);

        let again = b.pull_image("alpine:3.19", "").await.unwrap();
        assert_eq!(again.len(), 2);
        assert_eq!(again[1]["status"], "Status: Image is up to date for alpine:3.19");
    }

    #[tokio::test]
    async fn test_pull_without_registry_uses_defaults() {
        let b = backend();
        assert_eq!(b.pull_image("", "").await.unwrap_err().status_code(), 400);
        b.pull_image("busybox", "").await.unwrap();
        let img = b.inspect_image("busybox:latest").unwrap();
        assert_eq!(img.config.cmd, vec!["/bin/sh"]);
        assert_eq!(img.config.env, vec![DEFAULT_PATH_ENV]);
        assert_eq!(img.id, format!("sha256:{}", hex_digest(b"busybox:latest")));
        assert_eq!(img.repo_digests[0], format!("busybox@sha256:{}", hex_digest(b"busybox:latest")));
    }

    #[test]
    fn test_pull_credential_chain() {
        let b = backend();
        let header = URL_SAFE.encode(r#"{"username":"hdr","password":"pw"}"#);
        assert_eq!(
            b.pull_credentials("ghcr.io/org/app:1", &header),
            Some(basic_auth("hdr", "pw"))
        );
        b.login(AuthRequest {
            username: "stored".to_string(),
            password: "s3".to_string(),
            server_address: "ghcr.io".to_string(),
            ..Default::default()
        });
        assert_eq!(
            b.pull_credentials("ghcr.io/org/app:1", ""),
            Some(basic_auth("stored", "s3"))
        );
    }

    #[test]
    fn test_tag_history_and_remove() {
        let b = backend();
        store_image_with_aliases(&b.store, "app:1", image("sha256:aaa", &["app:1"], 10));
        assert_eq!(b.tag_image("missing", "x", "").unwrap_err().status_code(), 404);
        b.tag_image("app:1", "registry.local/app", "").unwrap();

        let tagged = b.inspect_image("registry.local/app:latest").unwrap();
        assert_eq!(tagged.repo_tags, vec!["app:1", "registry.local/app:latest"]);
        assert_eq!(b.inspect_image("app:1").unwrap().repo_tags.len(), 2);

        assert_eq!(b.image_history("nope").unwrap_err().status_code(), 404);
        let history = b.image_history("app:1").unwrap();
        assert_eq!(history[0].created_by, "/bin/sh -c #(nop) CMD [\"sh\"]");

        let resp = b.remove_image("app:1").unwrap();
        assert_eq!(resp.len(), 3);
        assert_eq!(resp[2].deleted, "sha256:aaa");
        assert!(b.store.images.is_empty());
    }

    #[test]
    fn test_list_dedupes_aliases() {
        let b = backend();
        store_image_with_aliases(&b.store, "docker.io/library/nginx:1", image("sha256:n", &["nginx:1"], 5));
        b.store.images.put("sha256:d", image("sha256:d", &[NONE_TAG], 3));
        assert_eq!(b.list_images(&Filters::new()).len(), 2);

        let dangling: Filters = [("dangling".to_string(), vec!["true".to_string()])].into_iter().collect();
        let listed = b.list_images(&dangling);
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "sha256:d");

        let by_ref: Filters = [("reference".to_string(), vec!["nginx".to_string()])].into_iter().collect();
        assert_eq!(b.list_images(&by_ref)[0].id, "sha256:n");
    }

    #[tokio::test]
    async fn test_prune_dangling_spares_referenced() {
        let b = backend();
        store_image_with_aliases(&b.store, "myapp:v1", image("sha256:tagged", &["myapp:v1"], 100));
        b.store.images.put("sha256:dangling", image("sha256:dangling", &[NONE_TAG], 42));
        b.create_container(
            "c",
            "",
            ContainerCreateRequest {
                config: ContainerConfig {
                    image: "myapp:v1".to_string(),
                    ..Default::default()
                },
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let filters: Filters = [("dangling".to_string(), vec!["true".to_string()])].into_iter().collect();
        let resp = b.prune_images(&filters);
        assert_eq!(resp.space_reclaimed, 42);
        assert_eq!(resp.images_deleted.last().unwrap().deleted, "sha256:dangling");
        assert!(b.store.resolve_image("sha256:dangling").is_none());
        assert_eq!(b.inspect_image("myapp:v1").unwrap().id, "sha256:tagged");

        b.store.containers.prune_if(|_, _: &Container| true);
        let resp = b.prune_images(&Filters::new());
        assert_eq!(resp.space_reclaimed, 100);
        assert!(b.store.images.is_empty());
    }

    #[test]
    fn test_load_and_login() {
        let b = backend();
        let out = b.load_image(b"ignored");
        assert_eq!(out["stream"], "Loaded image: loaded:latest\n");
        assert_eq!(b.inspect_image("loaded").unwrap().repo_tags, vec!["loaded:latest"]);
        assert_eq!(b.login(AuthRequest::default()).status, "Login Succeeded");
        assert!(b.store.creds.is_empty());
    }
}
