//! Execution agents
//!
//! Containers backed by an agent either expose it for forward dials or have
//! it dial back to `/agent/connect` (reverse mode). Reverse connections are
//! kept in the [`AgentRegistry`] keyed by container ID.

pub mod conn;
pub mod entrypoint;

pub use conn::{AgentConn, Message};
pub use entrypoint::{
    build_agent_callback_entrypoint, build_agent_entrypoint, build_original_command,
    is_tail_dev_null,
};

use crate::error::{Result, SockerlessError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Container address value selecting reverse mode
pub const REVERSE_ADDRESS: &str = "reverse";

#[derive(Default)]
struct RegistryState {
    conns: HashMap<String, Arc<AgentConn>>,
    /// Pending `wait_for_agent` signals
    ready: HashMap<String, CancellationToken>,
    /// Cancelled when the agent disconnects
    done: HashMap<String, CancellationToken>,
}

/// Reverse agent connections by container ID
#[derive(Default)]
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Create the disconnect signal before the agent has connected
    pub fn prepare(&self, container_id: &str) {
        self.lock()
            .done
            .entry(container_id.to_string())
            .or_default();
    }

    /// Store a connection and wake anyone waiting for it
    pub fn register(&self, container_id: &str, conn: Arc<AgentConn>) {
        let mut state = self.lock();
        state.conns.insert(container_id.to_string(), conn);
        state.done.entry(container_id.to_string()).or_default();
        if let Some(ready) = state.ready.remove(container_id) {
            ready.cancel();
        }
        debug!("Registered reverse agent for {}", container_id);
    }

    pub fn get(&self, container_id: &str) -> Option<Arc<AgentConn>> {
        self.lock().conns.get(container_id).cloned()
    }

    /// Drop and close the connection, releasing disconnect waiters
    pub fn remove(&self, container_id: &str) {
        let (conn, done) = {
            let mut state = self.lock();
            (
                state.conns.remove(container_id),
                state.done.remove(container_id),
            )
        };
        if let Some(conn) = conn {
            conn.close();
        }
        if let Some(done) = done {
            done.cancel();
        }
    }

    /// Wait until the agent disconnects; returns at once if none is tracked
    pub async fn wait_for_disconnect(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let Some(done) = self.lock().done.get(container_id).cloned() else {
            return Ok(());
        };
        tokio::time::timeout(timeout, done.cancelled())
            .await
            .map_err(|_| {
                SockerlessError::Timeout(format!(
                    "timeout waiting for agent disconnect for container {}",
                    container_id
                ))
            })
    }

    /// Wait until an agent registers for the container
    pub async fn wait_for_agent(&self, container_id: &str, timeout: Duration) -> Result<()> {
        let ready = {
            let mut state = self.lock();
            if state.conns.contains_key(container_id) {
                return Ok(());
            }
            state
                .ready
                .entry(container_id.to_string())
                .or_default()
                .clone()
        };
        tokio::time::timeout(timeout, ready.cancelled())
            .await
            .map_err(|_| {
                SockerlessError::Timeout(format!(
                    "timeout waiting for agent callback for container {}",
                    container_id
                ))
            })
    }
}
