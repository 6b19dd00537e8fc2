//! `docker build` without layers
//!
//! The context is unpacked, the Dockerfile parsed, and the resulting config
//! layered over the base image's. `COPY`/`ADD` sources are staged under
//! their destination paths so containers started from the image see them.

use super::dockerfile::{instruction_lines, parse_dockerfile, CopyInstruction, DOCKERFILE_NAME};
use super::{normalize_ref, store_image_with_aliases, DEFAULT_PATH_ENV};
use crate::api::types::{ContainerConfig, Image, RootFs};
use crate::driver::process::join_clean_path;
use crate::error::{Result, SockerlessError};
use crate::storage::archive::{copy_tree, extract_tar};
use crate::store::{generate_id, generate_name, now_rfc3339, Store};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Inputs of a build
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    /// `t` query parameter; may be empty
    pub tag: String,
    /// Dockerfile path inside the context
    pub dockerfile: String,
    pub build_args: HashMap<String, String>,
    /// Tar (optionally gzipped) build context
    pub context: Vec<u8>,
}

/// A finished build and the progress messages to stream back
#[derive(Debug, Clone)]
pub struct BuildOutput {
    pub image_id: String,
    pub reference: String,
    pub messages: Vec<Value>,
}

struct TempDir(PathBuf);

impl TempDir {
    fn new(prefix: &str) -> Result<Self> {
        let path = std::env::temp_dir().join(format!("{}{}", prefix, generate_name()));
        fs::create_dir_all(&path)?;
        Ok(Self(path))
    }

    fn into_path(self) -> PathBuf {
        let path = self.0.clone();
        std::mem::forget(self);
        path
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

/// Layer a parsed Dockerfile config over its base image config.
///
/// Env appends, arrays replace, non-empty scalars override, maps union.
pub fn merge_config(base: ContainerConfig, parsed: &ContainerConfig) -> ContainerConfig {
    let mut out = base;
    out.env.extend(parsed.env.iter().cloned());
    if !parsed.cmd.is_empty() {
        out.cmd = parsed.cmd.clone();
    }
    if !parsed.entrypoint.is_empty() {
        out.entrypoint = parsed.entrypoint.clone();
    }
    if !parsed.shell.is_empty() {
        out.shell = parsed.shell.clone();
    }
    if !parsed.working_dir.is_empty() {
        out.working_dir = parsed.working_dir.clone();
    }
    if !parsed.user.is_empty() {
        out.user = parsed.user.clone();
    }
    if !parsed.stop_signal.is_empty() {
        out.stop_signal = parsed.stop_signal.clone();
    }
    if parsed.healthcheck.is_some() {
        out.healthcheck = parsed.healthcheck.clone();
    }
    out.labels
        .extend(parsed.labels.iter().map(|(k, v)| (k.clone(), v.clone())));
    out.exposed_ports
        .extend(parsed.exposed_ports.iter().map(|(k, v)| (k.clone(), v.clone())));
    out.volumes
        .extend(parsed.volumes.iter().map(|(k, v)| (k.clone(), v.clone())));
    out
}

/// Copy sources into a fresh staging directory at their destination paths.
///
/// Missing sources are skipped. Returns `None` when there is nothing to stage.
pub fn prepare_build_context(context_dir: &Path, copies: &[CopyInstruction]) -> Result<Option<PathBuf>> {
    if copies.is_empty() {
        return Ok(None);
    }
    let staging = TempDir::new("build-ctx-")?;

    for copy in copies {
        let src = join_clean_path(context_dir, &copy.src);
        let mut dest = join_clean_path(&staging.0, &copy.dest);
        let Ok(meta) = fs::metadata(&src) else {
            debug!("Build source {} missing, skipping", copy.src);
            continue;
        };

        if meta.is_dir() {
            fs::create_dir_all(&dest)?;
            copy_tree(&src, &dest)?;
        } else {
            if copy.dest.ends_with('/') {
                if let Some(name) = src.file_name() {
                    dest = dest.join(name);
                }
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&src, &dest)?;
        }
    }
    Ok(Some(staging.into_path()))
}

fn stream(text: String) -> Value {
    json!({ "stream": text })
}

/// Run a build and store the resulting image.
///
/// Blocking; callers run it on the blocking pool.
pub fn build_image(store: &Store, req: BuildRequest) -> Result<BuildOutput> {
    let dockerfile_name = if req.dockerfile.is_empty() {
        DOCKERFILE_NAME
    } else {
        req.dockerfile.as_str()
    };

    let context = TempDir::new("docker-build-")?;
    extract_tar(&req.context, &context.0)
        .map_err(|e| SockerlessError::Server(format!("failed to extract build context: {}", e)))?;
    let content = fs::read_to_string(join_clean_path(&context.0, dockerfile_name))
        .map_err(|e| SockerlessError::Server(format!("failed to read Dockerfile: {}", e)))?;
    let parsed = parse_dockerfile(&content, &req.build_args)?;

    let base = store
        .resolve_image(&parsed.from)
        .map(|img| img.config)
        .unwrap_or_else(|| ContainerConfig {
            env: vec![DEFAULT_PATH_ENV.to_string()],
            ..Default::default()
        });
    let config = merge_config(base, &parsed.config);

    let digest = hex_digest(format!("{}{}", req.tag, now_rfc3339()).as_bytes());
    let image_id = format!("sha256:{}", digest);
    let short_id = digest[..12].to_string();
    let reference = if req.tag.is_empty() {
        image_id.clone()
    } else {
        normalize_ref(&req.tag)
    };

    let image = Image {
        id: image_id.clone(),
        repo_tags: vec![reference.clone()],
        created: now_rfc3339(),
        architecture: "amd64".to_string(),
        os: "linux".to_string(),
        config,
        root_fs: RootFs {
            fs_type: "layers".to_string(),
            layers: vec![format!("sha256:{}", generate_id())],
        },
        ..Default::default()
    };
    store_image_with_aliases(store, &reference, image);

    if let Some(staging) = prepare_build_context(&context.0, &parsed.copies)? {
        if let Some(previous) = store.build_contexts.load_and_delete(&image_id) {
            let _ = fs::remove_dir_all(previous);
        }
        store.build_contexts.store(image_id.clone(), staging);
    }

    let lines = instruction_lines(&content);
    let total = lines.len();
    let mut messages = Vec::with_capacity(total * 2 + 3);
    for (i, line) in lines.iter().enumerate() {
        messages.push(stream(format!("Step {}/{} : {}\n", i + 1, total, line)));
        messages.push(stream(format!(" ---> {}\n", short_id)));
    }
    messages.push(json!({ "aux": { "ID": image_id } }));
    messages.push(stream(format!("Successfully built {}\n", short_id)));
    if !req.tag.is_empty() {
        messages.push(stream(format!("Successfully tagged {}\n", reference)));
    }

    info!("Built image {} as {}", short_id, reference);
    Ok(BuildOutput {
        image_id,
        reference,
        messages,
    })
}

/// Lowercase hex SHA-256
pub fn hex_digest(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
