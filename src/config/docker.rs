//! Credentials from the Docker client config (`auths` only)

use crate::error::{Result, SockerlessError};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Registry names that all mean Docker Hub
pub const DOCKER_HUB_ALIASES: [&str; 4] = [
    "docker.io",
    "index.docker.io",
    "registry-1.docker.io",
    "https://index.docker.io/v1/",
];

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuthEntry {
    /// base64 `user:pass`
    #[serde(default)]
    pub auth: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DockerConfig {
    #[serde(default)]
    pub auths: HashMap<String, AuthEntry>,
}

impl DockerConfig {
    /// `$DOCKER_CONFIG/config.json`, else `~/.docker/config.json`
    pub fn default_path() -> PathBuf {
        if let Some(dir) = super::env_value("DOCKER_CONFIG") {
            return PathBuf::from(dir).join("config.json");
        }
        dirs::home_dir()
            .unwrap_or_default()
            .join(".docker")
            .join("config.json")
    }

    /// Parse a config file; a missing file is an empty config
    pub fn load(path: &Path) -> Result<Self> {
        let data = match fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&data)
            .map_err(|e| SockerlessError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Load from the default location, treating errors as no credentials
    pub fn load_default() -> Self {
        Self::load(&Self::default_path()).unwrap_or_default()
    }

    /// Credentials for a registry; Docker Hub aliases share one slot
    pub fn registry_auth(&self, registry: &str) -> Option<(String, String)> {
        if let Some(creds) = self.auths.get(registry).and_then(|e| decode_auth(&e.auth)) {
            return Some(creds);
        }
        if !DOCKER_HUB_ALIASES.contains(&registry) {
            return None;
        }
        DOCKER_HUB_ALIASES
            .iter()
            .filter_map(|alias| self.auths.get(*alias))
            .find_map(|e| decode_auth(&e.auth))
    }
}

fn decode_auth(encoded: &str) -> Option<(String, String)> {
    let decoded = STANDARD.decode(encoded).ok()?;
    let text = String::from_utf8(decoded).ok()?;
    let (user, pass) = text.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}
