//! Backend pool definitions (`pools.json`)

use super::{env_value, home_dir, POOLS_CONFIG_ENV};
use crate::error::{Result, SockerlessError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

/// Backend types a pool may name
pub const VALID_BACKEND_TYPES: [&str; 7] = [
    "memory",
    "ecs-fargate",
    "lambda",
    "cloudrun-jobs",
    "cloud-run-functions",
    "aca-jobs",
    "azure-functions",
];

/// One pool; zero concurrency means unlimited, zero queue rejects at capacity
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    pub backend_type: String,
    #[serde(default)]
    pub max_concurrency: i64,
    #[serde(default)]
    pub queue_size: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolsConfig {
    pub default_pool: String,
    pub pools: Vec<PoolConfig>,
}

impl Default for PoolsConfig {
    /// A single unlimited `memory` pool named `default`
    fn default() -> Self {
        Self {
            default_pool: "default".to_string(),
            pools: vec![PoolConfig {
                name: "default".to_string(),
                backend_type: "memory".to_string(),
                max_concurrency: 0,
                queue_size: 0,
            }],
        }
    }
}

fn invalid(msg: String) -> SockerlessError {
    SockerlessError::Config(format!("pools config: {}", msg))
}

impl PoolsConfig {
    pub fn validate(&self) -> Result<()> {
        if self.pools.is_empty() {
            return Err(invalid("at least one pool is required".to_string()));
        }

        let mut seen = HashSet::new();
        for (i, pool) in self.pools.iter().enumerate() {
            if pool.name.is_empty() {
                return Err(invalid(format!("pool {} has empty name", i)));
            }
            if !seen.insert(pool.name.as_str()) {
                return Err(invalid(format!("duplicate pool name {:?}", pool.name)));
            }
            if !VALID_BACKEND_TYPES.contains(&pool.backend_type.as_str()) {
                return Err(invalid(format!(
                    "pool {:?} has invalid backend_type {:?}",
                    pool.name, pool.backend_type
                )));
            }
            if pool.max_concurrency < 0 {
                return Err(invalid(format!(
                    "pool {:?} has negative max_concurrency {}",
                    pool.name, pool.max_concurrency
                )));
            }
            if pool.queue_size < 0 {
                return Err(invalid(format!(
                    "pool {:?} has negative queue_size {}",
                    pool.name, pool.queue_size
                )));
            }
        }

        if self.default_pool.is_empty() {
            return Err(invalid("default_pool is required".to_string()));
        }
        if !seen.contains(self.default_pool.as_str()) {
            return Err(invalid(format!(
                "default_pool {:?} does not match any pool",
                self.default_pool
            )));
        }
        Ok(())
    }

    /// Parse and validate a pools file
    pub fn from_file(path: &Path) -> Result<Self> {
        let data = fs::read_to_string(path)
            .map_err(|e| invalid(format!("reading {}: {}", path.display(), e)))?;
        let config: PoolsConfig =
            serde_json::from_str(&data).map_err(|e| invalid(format!("invalid JSON: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `SOCKERLESS_POOLS_CONFIG`, else `<home>/pools.json`.
    ///
    /// A missing home pools file yields the default config; a missing
    /// explicit file is an error.
    pub fn load(home: &Path) -> Result<Self> {
        if let Some(path) = env_value(POOLS_CONFIG_ENV) {
            return Self::from_file(Path::new(&path));
        }
        let path = home.join("pools.json");
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::from_file(&path)
    }

    /// Path `load` reads from
    pub fn source_path() -> PathBuf {
        env_value(POOLS_CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| home_dir().join("pools.json"))
    }

    pub fn get_pool(&self, name: &str) -> Option<&PoolConfig> {
        self.pools.iter().find(|p| p.name == name)
    }

    pub fn pool_names(&self) -> Vec<&str> {
        self.pools.iter().map(|p| p.name.as_str()).collect()
    }
}
