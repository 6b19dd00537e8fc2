//! Group start for multi-container pods

use crate::api::types::Container;
use crate::error::{Result, SockerlessError};
use crate::store::Store;
use std::time::Duration;
use tokio::time::{sleep, Instant};

const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Record a member start and decide whether to defer it.
///
/// Returns `(true, [])` while other members of a multi-container pod have
/// not started, `(false, members)` once the last one starts, and
/// `(false, [])` for containers outside any multi-container pod.
pub fn pod_deferred_start(store: &Store, container_id: &str) -> (bool, Vec<Container>) {
    let Some(pod) = store.pods.get_pod_for_container(container_id) else {
        return (false, Vec::new());
    };
    if pod.container_ids.len() <= 1 {
        return (false, Vec::new());
    }

    let (defer, ids) = store.pods.mark_started(&pod.id, container_id);
    if defer {
        return (true, Vec::new());
    }
    let members = ids
        .iter()
        .filter_map(|id| store.containers.get(id))
        .collect();
    (false, members)
}

fn has_usable_healthcheck(c: &Container) -> bool {
    match c.config.healthcheck.as_ref() {
        Some(hc) => !hc.test.is_empty() && !(hc.test.len() == 1 && hc.test[0] == "NONE"),
        None => false,
    }
}

/// Poll pod members with health checks until all are healthy
pub async fn wait_for_service_health(store: &Store, pod_id: &str, timeout: Duration) -> Result<()> {
    let pod = store
        .pods
        .get_pod(pod_id)
        .ok_or_else(|| SockerlessError::not_found("pod", pod_id))?;

    let checked: Vec<String> = pod
        .container_ids
        .iter()
        .filter(|id| {
            store
                .containers
                .get(id)
                .map(|c| has_usable_healthcheck(&c))
                .unwrap_or(false)
        })
        .cloned()
        .collect();
    if checked.is_empty() {
        return Ok(());
    }

    let deadline = Instant::now() + timeout;
    loop {
        let all_healthy = checked.iter().all(|id| match store.containers.get(id) {
            Some(c) => c.state.health.as_ref().map(|h| h.status == "healthy").unwrap_or(false),
            None => true,
        });
        if all_healthy {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(SockerlessError::Timeout(
                "timeout waiting for service containers to become healthy".to_string(),
            ));
        }
        sleep(HEALTH_POLL_INTERVAL.min(deadline - Instant::now())).await;
    }
}
