//! Restart policy engine
//!
//! Installed as the store's restart hook. When a running container's
//! process exits the hook decides whether the policy absorbs the exit; if
//! so the relaunch happens on a background task after an exponential
//! backoff.

use crate::api::types::{Container, RestartPolicy};
use crate::store::Store;
use async_trait::async_trait;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::info;

const BASE_DELAY: Duration = Duration::from_millis(100);
const MAX_DELAY: Duration = Duration::from_secs(60);

/// Starts a container's main process again once its backoff elapses
#[async_trait]
pub trait Relauncher: Send + Sync {
    /// Bring `container` back to running, including its health checks
    async fn relaunch(&self, container: &Container);
}

/// Whether a container exiting with `exit_code` should be relaunched
pub fn should_restart(policy: &RestartPolicy, exit_code: i64, restart_count: u32) -> bool {
    match policy.name.as_str() {
        "" | "no" => false,
        "on-failure" => {
            exit_code != 0
                && (policy.maximum_retry_count == 0 || restart_count < policy.maximum_retry_count)
        }
        "always" | "unless-stopped" => true,
        _ => false,
    }
}

/// Backoff before restart number `count` (zero-based)
pub fn restart_delay(count: u32) -> Duration {
    if count >= 10 {
        return MAX_DELAY;
    }
    (BASE_DELAY * 2u32.pow(count)).min(MAX_DELAY)
}

/// Relaunches containers according to their restart policy
pub struct RestartManager {
    store: Weak<Store>,
    launcher: Arc<dyn Relauncher>,
}

impl RestartManager {
    /// Build the manager and install it as the store's restart hook
    pub fn install(store: &Arc<Store>, launcher: Arc<dyn Relauncher>) -> Arc<Self> {
        let manager = Arc::new(Self {
            store: Arc::downgrade(store),
            launcher,
        });
        let hook = manager.clone();
        store.set_restart_hook(Arc::new(move |id: &str, code: i64| hook.handle_exit(id, code)));
        manager
    }

    /// Returns true when the exit is absorbed by a pending restart.
    ///
    /// Waiters on the exited run are released with `exit_code` right away;
    /// the relaunch opens a fresh wait signal.
    pub fn handle_exit(&self, container_id: &str, exit_code: i64) -> bool {
        let Some(store) = self.store.upgrade() else {
            return false;
        };
        let Some(container) = store.containers.get(container_id) else {
            return false;
        };
        let count = container.restart_count;
        if !should_restart(&container.host_config.restart_policy, exit_code, count) {
            return false;
        }

        store.stop_health_check(container_id);
        store.containers.update(container_id, |c| {
            c.restart_count += 1;
            c.state.status = "restarting".to_string();
            c.state.restarting = true;
            c.state.exit_code = exit_code;
        });
        store.release_waiters(container_id, exit_code);

        let delay = restart_delay(count);
        info!(
            "Restarting container {} in {:?} (attempt {}, exit {})",
            crate::api::short_id(container_id),
            delay,
            count + 1,
            exit_code
        );

        let launcher = self.launcher.clone();
        let id = container_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            relaunch(&store, launcher.as_ref(), &id).await;
        });
        true
    }
}

async fn relaunch(store: &Store, launcher: &dyn Relauncher, id: &str) {
    let Some(container) = store.containers.get(id) else {
        return;
    };
    if !container.state.restarting {
        // stopped or removed while waiting
        return;
    }
    launcher.relaunch(&container).await;
}
