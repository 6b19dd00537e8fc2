//! OCI distribution client for image configuration
//!
//! Pulls never download layers. The client only resolves a reference to
//! its config blob so pulled images carry the real `Env`, `Cmd`,
//! `Entrypoint` and friends. Any network failure degrades to `None` and the
//! caller falls back to a synthetic config.

use crate::api::types::{ContainerConfig, EmptyObject};
use crate::config::{env_value, REGISTRY_SCHEME_ENV, SKIP_IMAGE_CONFIG_ENV};
use crate::error::{Result, SockerlessError};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::debug;

/// OCI Distribution Specification media types
pub mod media_types {
    pub const MANIFEST_V2: &str = "application/vnd.docker.distribution.manifest.v2+json";
    pub const MANIFEST_LIST_V2: &str = "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
    pub const OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
}

/// Docker Hub's registry host
pub const DOCKER_HUB_REGISTRY: &str = "registry-1.docker.io";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// A reference split into its registry coordinates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

impl ImageRef {
    /// Normalized `registry/repository:tag`
    pub fn canonical(&self) -> String {
        format!("{}/{}:{}", self.registry, self.repository, self.tag)
    }
}

/// Split a reference into registry, repository and tag.
///
/// Digests are dropped. Single-segment names live under `library/` on
/// Docker Hub.
pub fn parse_image_ref(reference: &str) -> ImageRef {
    let mut name = reference.split('@').next().unwrap_or(reference);

    let mut tag = "latest";
    let last_slash = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    if let Some(colon) = name[last_slash..].rfind(':') {
        let pos = last_slash + colon;
        tag = &name[pos + 1..];
        name = &name[..pos];
    }

    let (registry, repository) = match name.split_once('/') {
        Some((first, rest)) if first.contains('.') || first.contains(':') => {
            let registry = if first == "docker.io" {
                DOCKER_HUB_REGISTRY
            } else {
                first
            };
            (registry.to_string(), rest.to_string())
        }
        Some(_) => (DOCKER_HUB_REGISTRY.to_string(), name.to_string()),
        None => (DOCKER_HUB_REGISTRY.to_string(), format!("library/{}", name)),
    };

    ImageRef {
        registry,
        repository,
        tag: tag.to_string(),
    }
}

/// Split a challenge on commas outside quoted strings
fn split_auth_params(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    for ch in s.chars() {
        match ch {
            '"' => {
                in_quote = !in_quote;
                current.push(ch);
            }
            ',' if !in_quote => parts.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

/// Parse a `Bearer` challenge into its realm and remaining parameters
pub fn parse_www_authenticate(header: &str) -> (String, HashMap<String, String>) {
    let header = header
        .strip_prefix("Bearer ")
        .or_else(|| header.strip_prefix("bearer "))
        .unwrap_or(header);

    let mut realm = String::new();
    let mut params = HashMap::new();
    for part in split_auth_params(header) {
        let Some((key, value)) = part.trim().split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').to_string();
        if key == "realm" {
            realm = value;
        } else {
            params.insert(key.to_string(), value);
        }
    }
    (realm, params)
}

#[derive(Debug, Default, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: String,
    #[serde(default)]
    access_token: String,
}

/// Manifest list / OCI index
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestList {
    #[serde(default)]
    manifests: Vec<PlatformManifest>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformManifest {
    #[serde(default)]
    digest: String,
    #[serde(default)]
    platform: Platform,
}

#[derive(Debug, Default, Deserialize)]
struct Platform {
    #[serde(default)]
    architecture: String,
    #[serde(default)]
    os: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageManifest {
    #[serde(default)]
    config: Descriptor,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Descriptor {
    #[serde(default)]
    digest: String,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigBlob {
    #[serde(default)]
    config: BlobConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
struct BlobConfig {
    env: Option<Vec<String>>,
    cmd: Option<Vec<String>>,
    entrypoint: Option<Vec<String>>,
    working_dir: String,
    labels: Option<HashMap<String, String>>,
    exposed_ports: Option<HashMap<String, EmptyObject>>,
}

impl From<BlobConfig> for ContainerConfig {
    fn from(blob: BlobConfig) -> Self {
        ContainerConfig {
            env: blob.env.unwrap_or_default(),
            cmd: blob.cmd.unwrap_or_default(),
            entrypoint: blob.entrypoint.unwrap_or_default(),
            working_dir: blob.working_dir,
            labels: blob.labels.unwrap_or_default(),
            exposed_ports: blob.exposed_ports.unwrap_or_default(),
            ..Default::default()
        }
    }
}

/// Registry client with a config cache keyed by normalized reference
pub struct RegistryClient {
    client: reqwest::Client,
    scheme: String,
    enabled: bool,
    /// Host contacted for Docker Hub references
    hub_host: String,
    cache: RwLock<HashMap<String, ContainerConfig>>,
}

impl Default for RegistryClient {
    fn default() -> Self {
        Self::new("https", true)
    }
}

impl RegistryClient {
    pub fn new(scheme: &str, enabled: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            scheme: scheme.to_string(),
            enabled,
            hub_host: DOCKER_HUB_REGISTRY.to_string(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Configure from `SOCKERLESS_SKIP_IMAGE_CONFIG` and `SOCKERLESS_REGISTRY_SCHEME`
    pub fn from_env() -> Self {
        let enabled = env_value(SKIP_IMAGE_CONFIG_ENV).as_deref() != Some("true");
        let scheme = env_value(REGISTRY_SCHEME_ENV).unwrap_or_else(|| "https".to_string());
        Self::new(&scheme, enabled)
    }

    /// Send Docker Hub references to another host, such as a local mirror
    pub fn with_hub_host(mut self, host: &str) -> Self {
        self.hub_host = host.to_string();
        self
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Resolve a reference to its image config.
    ///
    /// `basic_auth` is a base64 `user:pass` used for the token exchange.
    /// Returns `None` when disabled or when the registry can't be reached.
    pub async fn fetch_image_config(
        &self,
        reference: &str,
        basic_auth: Option<&str>,
    ) -> Option<ContainerConfig> {
        if !self.enabled {
            return None;
        }
        let mut image = parse_image_ref(reference);
        let key = image.canonical();
        if let Some(cached) = self
            .cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return Some(cached.clone());
        }

        if image.registry == DOCKER_HUB_REGISTRY {
            image.registry = self.hub_host.clone();
        }

        match self.fetch_config(&image, basic_auth).await {
            Ok(config) => {
                self.cache
                    .write()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(key, config.clone());
                Some(config)
            }
            Err(e) => {
                debug!("Falling back to synthetic config for {}: {}", reference, e);
                None
            }
        }
    }

    async fn fetch_config(&self, image: &ImageRef, basic_auth: Option<&str>) -> Result<ContainerConfig> {
        let token = self.token(image, basic_auth).await?;
        let digest = self.config_digest(image, token.as_deref()).await?;
        let body = self
            .get(&self.blob_url(image, &digest), token.as_deref(), &[])
            .await?
            .0;
        let blob: ConfigBlob = serde_json::from_slice(&body)
            .map_err(|e| SockerlessError::Registry(format!("decode config: {}", e)))?;
        Ok(blob.config.into())
    }

    fn manifest_url(&self, image: &ImageRef, reference: &str) -> String {
        format!(
            "{}://{}/v2/{}/manifests/{}",
            self.scheme, image.registry, image.repository, reference
        )
    }

    fn blob_url(&self, image: &ImageRef, digest: &str) -> String {
        format!(
            "{}://{}/v2/{}/blobs/{}",
            self.scheme, image.registry, image.repository, digest
        )
    }

    /// Probe the manifest endpoint and run the bearer token exchange on 401
    async fn token(&self, image: &ImageRef, basic_auth: Option<&str>) -> Result<Option<String>> {
        let probe = self
            .client
            .get(self.manifest_url(image, &image.tag))
            .send()
            .await
            .map_err(registry_error)?;

        match probe.status() {
            reqwest::StatusCode::OK => return Ok(None),
            reqwest::StatusCode::UNAUTHORIZED => {}
            status => {
                return Err(SockerlessError::Registry(format!(
                    "unexpected status {} from registry",
                    status
                )))
            }
        }

        let challenge = probe
            .headers()
            .get("Www-Authenticate")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| SockerlessError::Registry("no Www-Authenticate header in 401 response".to_string()))?;
        let (realm, params) = parse_www_authenticate(challenge);
        if realm.is_empty() {
            return Err(SockerlessError::Registry("no realm in Www-Authenticate header".to_string()));
        }

        let mut request = self.client.get(&realm).query(&params);
        if let Some(auth) = basic_auth.filter(|a| !a.is_empty()) {
            request = request.header("Authorization", format!("Basic {}", auth));
        }
        let response = request.send().await.map_err(registry_error)?;
        if !response.status().is_success() {
            return Err(SockerlessError::Registry(format!(
                "token endpoint returned {}",
                response.status()
            )));
        }
        let body: TokenResponse = response.json().await.map_err(registry_error)?;
        Ok(Some(if body.token.is_empty() {
            body.access_token
        } else {
            body.token
        }))
    }

    /// Config digest for the image, picking linux/amd64 from a manifest list
    async fn config_digest(&self, image: &ImageRef, token: Option<&str>) -> Result<String> {
        let (mut body, content_type) = self
            .get(
                &self.manifest_url(image, &image.tag),
                token,
                &[
                    media_types::OCI_INDEX,
                    media_types::MANIFEST_LIST_V2,
                    media_types::OCI_MANIFEST,
                    media_types::MANIFEST_V2,
                ],
            )
            .await?;

        if content_type.contains("manifest.list") || content_type.contains("image.index") {
            let list: ManifestList = serde_json::from_slice(&body)
                .map_err(|e| SockerlessError::Registry(format!("decode manifest list: {}", e)))?;
            let digest = list
                .manifests
                .iter()
                .find(|m| m.platform.architecture == "amd64" && m.platform.os == "linux")
                .or_else(|| list.manifests.first())
                .map(|m| m.digest.clone())
                .ok_or_else(|| SockerlessError::Registry("no suitable manifest in manifest list".to_string()))?;

            body = self
                .get(
                    &self.manifest_url(image, &digest),
                    token,
                    &[media_types::OCI_MANIFEST, media_types::MANIFEST_V2],
                )
                .await?
                .0;
        }

        let manifest: ImageManifest = serde_json::from_slice(&body)
            .map_err(|e| SockerlessError::Registry(format!("decode manifest: {}", e)))?;
        if manifest.config.digest.is_empty() {
            return Err(SockerlessError::Registry("no config digest in manifest".to_string()));
        }
        Ok(manifest.config.digest)
    }

    /// GET with optional bearer token; returns the body and content type
    async fn get(&self, url: &str, token: Option<&str>, accept: &[&str]) -> Result<(Vec<u8>, String)> {
        let mut request = self.client.get(url);
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            request = request.bearer_auth(token);
        }
        if !accept.is_empty() {
            request = request.header("Accept", accept.join(", "));
        }

        let response = request.send().await.map_err(registry_error)?;
        if !response.status().is_success() {
            return Err(SockerlessError::Registry(format!(
                "registry returned {} for {}",
                response.status(),
                url
            )));
        }
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        let body = response.bytes().await.map_err(registry_error)?;
        Ok((body.to_vec(), content_type))
    }
}

fn registry_error(e: reqwest::Error) -> SockerlessError {
    SockerlessError::Registry(e.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_parse_image_ref() {
        let r = parse_image_ref("alpine");
        assert_eq!(r.registry, DOCKER_HUB_REGISTRY);
        assert_eq!(r.repository, "library/alpine");
        assert_eq!(r.tag, "latest");

        let r = parse_image_ref("myuser/app:1.2");
        assert_eq!(r.repository, "myuser/app");
        assert_eq!(r.tag, "1.2");

        let r = parse_image_ref("localhost:5000/team/app");
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, "latest");

        let r = parse_image_ref("docker.io/library/redis:7@sha256:abcd");
        assert_eq!(r.registry, DOCKER_HUB_REGISTRY);
        assert_eq!(r.repository, "library/redis");
        assert_eq!(r.tag, "7");

        let r = parse_image_ref("ghcr.io/org/tool:v1");
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/tool");
    }

    #[test]
    fn test_parse_www_authenticate() {
        let (realm, params) = parse_www_authenticate(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/alpine:pull,push""#,
        );
        assert_eq!(realm, "https://auth.docker.io/token");
        assert_eq!(params["service"], "registry.docker.io");
        assert_eq!(params["scope"], "repository:library/alpine:pull,push");
    }

    #[tokio::test]
    async fn test_fetch_multi_arch_config_with_token() {
        let (addr, state) = mock::serve(true).await;
        let client = RegistryClient::new("http", true);
        let reference = format!("{}/library/alpine:3.19", addr);

        let config = client.fetch_image_config(&reference, None).await.unwrap();
        assert_eq!(config.cmd, vec!["/bin/sh"]);
        assert_eq!(config.env, vec!["PATH=/bin"]);
        assert_eq!(config.working_dir, "");
        assert!(state.token_requests.load(Ordering::SeqCst) >= 1);

        let requests = state.manifest_requests.load(Ordering::SeqCst);
        client.fetch_image_config(&reference, None).await.unwrap();
        assert_eq!(state.manifest_requests.load(Ordering::SeqCst), requests);
    }

    #[tokio::test]
    async fn test_hub_host_redirects_library_refs() {
        let (addr, _state) = mock::serve(false).await;
        let client = RegistryClient::new("http", true).with_hub_host(&addr.to_string());
        let config = client.fetch_image_config("alpine:3.19", None).await.unwrap();
        assert_eq!(config.cmd, vec!["/bin/sh"]);
    }

    #[tokio::test]
    async fn test_cache_shared_across_reference_spellings() {
        let (addr, state) = mock::serve(false).await;
        let client = RegistryClient::new("http", true).with_hub_host(&addr.to_string());
        client.fetch_image_config("alpine", None).await.unwrap();
        let requests = state.manifest_requests.load(Ordering::SeqCst);

        for reference in ["alpine:latest", "library/alpine", "docker.io/library/alpine:latest"] {
            let config = client.fetch_image_config(reference, None).await.unwrap();
            assert_eq!(config.cmd, vec!["/bin/sh"]);
        }
        assert_eq!(state.manifest_requests.load(Ordering::SeqCst), requests);
    }

    #[tokio::test]
    async fn test_unreachable_registry_falls_back() {
        let client = RegistryClient::new("http", true);
        assert!(client
            .fetch_image_config("127.0.0.1:1/library/alpine:3.19", None)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn test_disabled_client_skips_network() {
        let client = RegistryClient::new("http", false);
        assert!(!client.enabled());
        assert!(client.fetch_image_config("alpine", None).await.is_none());
    }
}
