//! Container health check supervisor
//!
//! One task per running container with a usable healthcheck. Probes run
//! through the exec driver chain, so agent, sandbox and synthetic
//! containers are all probed the same way.

use crate::api::types::{HealthLog, HealthState, HealthcheckConfig};
use crate::driver::{ExecDriver, ExecRequest};
use crate::store::{generate_id, now_rfc3339, Store};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_RETRIES: u32 = 3;

/// Probes retained in `State.Health.Log`
pub const MAX_LOG_ENTRIES: usize = 5;

/// Bytes of probe output kept per log entry
pub const MAX_OUTPUT_BYTES: usize = 4096;

/// Resolved probe settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSettings {
    pub cmd: Vec<String>,
    pub interval: Duration,
    pub timeout: Duration,
    pub start_period: Duration,
    pub retries: u32,
}

/// Probe command for a healthcheck test; `None` disables checking.
///
/// `CMD-SHELL` runs through `sh -c`, a bare list is taken as the command.
pub fn parse_test(test: &[String]) -> Option<Vec<String>> {
    let (kind, rest) = test.split_first()?;
    match kind.to_uppercase().as_str() {
        "NONE" => None,
        "CMD" if !rest.is_empty() => Some(rest.to_vec()),
        "CMD-SHELL" if !rest.is_empty() => Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            rest.join(" "),
        ]),
        "CMD" | "CMD-SHELL" => None,
        _ => Some(test.to_vec()),
    }
}

fn nanos_or(value: i64, default: Duration) -> Duration {
    if value > 0 {
        Duration::from_nanos(value as u64)
    } else {
        default
    }
}

impl HealthSettings {
    pub fn from_config(hc: &HealthcheckConfig) -> Option<Self> {
        Some(Self {
            cmd: parse_test(&hc.test)?,
            interval: nanos_or(hc.interval, DEFAULT_INTERVAL),
            timeout: nanos_or(hc.timeout, DEFAULT_TIMEOUT),
            start_period: nanos_or(hc.start_period, Duration::ZERO),
            retries: if hc.retries > 0 { hc.retries } else { DEFAULT_RETRIES },
        })
    }
}

fn truncate_output(mut s: String) -> String {
    if s.len() > MAX_OUTPUT_BYTES {
        let mut end = MAX_OUTPUT_BYTES;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        s.truncate(end);
    }
    s
}

/// Fold one probe result into a fresh copy of the health state
pub fn record_probe(prev: &HealthState, entry: HealthLog, retries: u32) -> HealthState {
    let mut next = prev.clone();
    let exit_code = entry.exit_code;
    next.log.push(entry);
    if next.log.len() > MAX_LOG_ENTRIES {
        let excess = next.log.len() - MAX_LOG_ENTRIES;
        next.log.drain(..excess);
    }
    if exit_code == 0 {
        next.status = "healthy".to_string();
        next.failing_streak = 0;
    } else {
        next.failing_streak += 1;
        if next.failing_streak >= retries {
            next.status = "unhealthy".to_string();
        }
    }
    next
}

/// Starts and stops per-container health check loops
#[derive(Clone)]
pub struct HealthSupervisor {
    store: Arc<Store>,
    exec: Arc<dyn ExecDriver>,
}

impl HealthSupervisor {
    pub fn new(store: Arc<Store>, exec: Arc<dyn ExecDriver>) -> Self {
        Self { store, exec }
    }

    /// Begin checking a container; no-op without a usable healthcheck
    pub fn start(&self, container_id: &str) {
        let Some(container) = self.store.containers.get(container_id) else {
            return;
        };
        let Some(settings) = container
            .config
            .healthcheck
            .as_ref()
            .and_then(HealthSettings::from_config)
        else {
            return;
        };

        self.store.set_health(
            container_id,
            Some(HealthState {
                status: "starting".to_string(),
                ..Default::default()
            }),
        );

        let cancel = CancellationToken::new();
        if let Some(previous) = self
            .store
            .health_checks
            .load_and_delete(container_id)
        {
            previous.cancel();
        }
        self.store.health_checks.store(container_id, cancel.clone());

        let this = self.clone();
        let id = container_id.to_string();
        tokio::spawn(async move {
            let task = tokio::spawn(this.run(id.clone(), settings, cancel));
            if let Err(e) = task.await {
                warn!("Health check for {} aborted: {}", crate::api::short_id(&id), e);
            }
        });
    }

    /// Cancel a container's supervisor
    pub fn stop(&self, container_id: &str) {
        self.store.stop_health_check(container_id);
    }

    async fn run(self, container_id: String, settings: HealthSettings, cancel: CancellationToken) {
        if !settings.start_period.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(settings.start_period) => {}
                _ = cancel.cancelled() => return,
            }
        }

        let mut ticker = tokio::time::interval(settings.interval);
        ticker.tick().await;
        loop {
            let start = now_rfc3339();
            let (exit_code, output) = tokio::select! {
                r = self.probe(&container_id, &settings) => r,
                _ = cancel.cancelled() => return,
            };
            let entry = HealthLog {
                start,
                end: now_rfc3339(),
                exit_code,
                output: truncate_output(output),
            };
            debug!("Health probe for {} exited {}", crate::api::short_id(&container_id), exit_code);

            self.store.containers.update(&container_id, |c| {
                if let Some(prev) = c.state.health.as_ref() {
                    c.state.health = Some(record_probe(prev, entry, settings.retries));
                }
            });

            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }
        }
    }

    async fn probe(&self, container_id: &str, settings: &HealthSettings) -> (i64, String) {
        let (mut client, server) = tokio::io::duplex(MAX_OUTPUT_BYTES * 2);
        let req = ExecRequest {
            container_id: container_id.to_string(),
            exec_id: format!("healthcheck-{}", &generate_id()[..8]),
            cmd: settings.cmd.clone(),
            tty: true,
            ..Default::default()
        };

        let exec = self.exec.exec(&req, Box::new(server));
        let collect = async {
            let mut buf = Vec::new();
            let _ = client.read_to_end(&mut buf).await;
            buf
        };
        match tokio::time::timeout(settings.timeout, async { tokio::join!(exec, collect) }).await {
            Ok((code, buf)) => (code, String::from_utf8_lossy(&buf).into_owned()),
            Err(_) => (
                -1,
                format!("Health check exceeded timeout ({:?})", settings.timeout),
            ),
        }
    }
}
