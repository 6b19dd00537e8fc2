//! Named contexts
//!
//! A context is `contexts/<name>/config.json` under the home directory and
//! carries a backend name plus environment to export at startup. The
//! active context is named by `SOCKERLESS_CONTEXT` or the `active` file.

use super::{env_value, home_dir, CONTEXT_ENV};
use crate::error::{Result, SockerlessError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const CONFIG_FILE: &str = "config.json";
const ACTIVE_FILE: &str = "active";

/// Stored context configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    pub backend: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub frontend_addr: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub backend_addr: String,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

/// Contexts rooted at one home directory
#[derive(Debug, Clone)]
pub struct ContextStore {
    home: PathBuf,
}

impl Default for ContextStore {
    fn default() -> Self {
        Self::new(home_dir())
    }
}

impl ContextStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    fn contexts_dir(&self) -> PathBuf {
        self.home.join("contexts")
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.contexts_dir().join(name).join(CONFIG_FILE)
    }

    /// Name of the active context; empty when none is set
    pub fn active_name(&self) -> String {
        if let Some(name) = env_value(CONTEXT_ENV) {
            return name;
        }
        fs::read_to_string(self.home.join(ACTIVE_FILE))
            .map(|s| s.trim().to_string())
            .unwrap_or_default()
    }

    pub fn set_active(&self, name: &str) -> Result<()> {
        if !self.config_path(name).exists() {
            return Err(SockerlessError::not_found("context", name));
        }
        fs::create_dir_all(&self.home)?;
        fs::write(self.home.join(ACTIVE_FILE), format!("{}\n", name))?;
        Ok(())
    }

    pub fn create(&self, name: &str, config: &ContextConfig) -> Result<()> {
        if name.is_empty() || name.contains('/') || name.starts_with('.') {
            return Err(SockerlessError::InvalidParameter(format!(
                "invalid context name {:?}",
                name
            )));
        }
        if config.backend.is_empty() {
            return Err(SockerlessError::InvalidParameter(
                "backend is required".to_string(),
            ));
        }
        let path = self.config_path(name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, serde_json::to_string_pretty(config)?)?;
        Ok(())
    }

    pub fn load(&self, name: &str) -> Result<ContextConfig> {
        let data = fs::read_to_string(self.config_path(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                SockerlessError::not_found("context", name)
            } else {
                e.into()
            }
        })?;
        serde_json::from_str(&data)
            .map_err(|e| SockerlessError::Config(format!("context {}: {}", name, e)))
    }

    /// Context names, sorted
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(self.contexts_dir()) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().into_string().ok())
            .collect();
        names.sort();
        Ok(names)
    }

    /// Delete a context, clearing the active marker if it pointed there
    pub fn delete(&self, name: &str) -> Result<()> {
        let dir = self.contexts_dir().join(name);
        if !dir.is_dir() {
            return Err(SockerlessError::not_found("context", name));
        }
        fs::remove_dir_all(dir)?;
        let active = self.home.join(ACTIVE_FILE);
        if fs::read_to_string(&active).map(|s| s.trim() == name).unwrap_or(false) {
            fs::remove_file(active)?;
        }
        Ok(())
    }

    /// Export the active context's env without overriding existing values.
    ///
    /// Missing or unreadable contexts are logged and skipped.
    pub fn load_active_env(&self) -> usize {
        let name = self.active_name();
        if name.is_empty() {
            return 0;
        }
        match self.load(&name) {
            Ok(config) => {
                let applied = apply_env(&config.env, false);
                info!("Loaded context {} ({} env values applied)", name, applied);
                applied
            }
            Err(e) => {
                warn!("Failed to load context {}: {}", name, e);
                0
            }
        }
    }
}

/// Export `env` into the process, returning how many values changed.
///
/// Without `override_existing`, variables that are already set are left
/// alone.
pub fn apply_env(env: &HashMap<String, String>, override_existing: bool) -> usize {
    let sorted: BTreeMap<_, _> = env.iter().collect();
    let mut changed = 0;
    for (key, value) in sorted {
        match std::env::var(key) {
            Ok(current) if current == *value => continue,
            Ok(_) if !override_existing => {
                debug!("Keeping existing value of {}", key);
                continue;
            }
            _ => {}
        }
        std::env::set_var(key, value);
        changed += 1;
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(backend: &str, env: &[(&str, &str)]) -> ContextConfig {
        ContextConfig {
            backend: backend.to_string(),
            env: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_list_load_delete() {
        let dir = tempdir().unwrap();
        let store = ContextStore::new(dir.path());
        assert!(store.list().unwrap().is_empty());

        store.create("prod", &config("ecs-fargate", &[("REGION", "eu")])).unwrap();
        store.create("dev", &config("memory", &[])).unwrap();
        assert_eq!(store.list().unwrap(), vec!["dev", "prod"]);
        assert_eq!(store.load("prod").unwrap().env["REGION"], "eu");

        store.delete("dev").unwrap();
        assert_eq!(store.list().unwrap(), vec!["prod"]);
        assert!(matches!(
            store.load("dev").unwrap_err(),
            SockerlessError::NotFound { .. }
        ));
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let dir = tempdir().unwrap();
        let store = ContextStore::new(dir.path());
        assert!(store.create("", &config("memory", &[])).is_err());
        assert!(store.create("a/b", &config("memory", &[])).is_err());
        assert!(store.create("ok", &config("", &[])).is_err());
    }

    #[test]
    fn test_active_file_and_delete_clears_it() {
        let dir = tempdir().unwrap();
        let store = ContextStore::new(dir.path());
        store.create("ci", &config("memory", &[])).unwrap();
        assert!(store.set_active("missing").is_err());
        store.set_active("ci").unwrap();
        assert_eq!(
            fs::read_to_string(dir.path().join("active")).unwrap(),
            "ci\n"
        );

        store.delete("ci").unwrap();
        assert!(!dir.path().join("active").exists());
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let dir = tempdir().unwrap();
        let ctx = dir.path().join("contexts/broken");
        fs::create_dir_all(&ctx).unwrap();
        fs::write(ctx.join("config.json"), "{invalid").unwrap();
        let store = ContextStore::new(dir.path());
        assert!(matches!(
            store.load("broken").unwrap_err(),
            SockerlessError::Config(_)
        ));
    }

    #[test]
    fn test_apply_env_respects_existing() {
        std::env::set_var("SOCKERLESS_TEST_CTX_KEEP", "original");
        std::env::remove_var("SOCKERLESS_TEST_CTX_NEW");
        let env: HashMap<String, String> = [
            ("SOCKERLESS_TEST_CTX_KEEP", "context"),
            ("SOCKERLESS_TEST_CTX_NEW", "fresh"),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();

        assert_eq!(apply_env(&env, false), 1);
        assert_eq!(std::env::var("SOCKERLESS_TEST_CTX_KEEP").unwrap(), "original");
        assert_eq!(std::env::var("SOCKERLESS_TEST_CTX_NEW").unwrap(), "fresh");

        assert_eq!(apply_env(&env, true), 1);
        assert_eq!(std::env::var("SOCKERLESS_TEST_CTX_KEEP").unwrap(), "context");
        assert_eq!(apply_env(&env, true), 0);
    }
}
