//! Persistent configuration
//!
//! Everything lives under the sockerless home directory: named contexts,
//! the active-context marker and the optional pools file. Registry
//! credentials come from the Docker client config.

pub mod context;
pub mod docker;
pub mod pools;

pub use context::{ContextConfig, ContextStore};
pub use docker::DockerConfig;
pub use pools::{PoolConfig, PoolsConfig};

use std::path::PathBuf;

/// Overrides the home directory
pub const HOME_ENV: &str = "SOCKERLESS_HOME";

/// Overrides the active context
pub const CONTEXT_ENV: &str = "SOCKERLESS_CONTEXT";

/// Explicit pools file
pub const POOLS_CONFIG_ENV: &str = "SOCKERLESS_POOLS_CONFIG";

/// `true` disables registry lookups during pull
pub const SKIP_IMAGE_CONFIG_ENV: &str = "SOCKERLESS_SKIP_IMAGE_CONFIG";

/// `http` or `https` for registry requests
pub const REGISTRY_SCHEME_ENV: &str = "SOCKERLESS_REGISTRY_SCHEME";

/// Non-empty value of an environment variable
pub fn env_value(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

/// `$SOCKERLESS_HOME`, else `~/.sockerless`
pub fn home_dir() -> PathBuf {
    if let Some(home) = env_value(HOME_ENV) {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".sockerless")
}
