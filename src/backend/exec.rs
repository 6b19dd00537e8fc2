//! Exec instances

use super::{spawn_logged, Backend, EXEC_AUTO_STOP_DELAY};
use crate::api::types::{ExecCreateRequest, ExecInstance, ExecProcessConfig, ExecStartRequest, IdResponse};
use crate::driver::{BoxedConn, ExecRequest};
use crate::error::{Result, SockerlessError};
use crate::store::{generate_id, Store};
use std::sync::Arc;
use tracing::debug;

/// Override `base` entries by key; new keys keep their order at the end
pub fn merge_env(base: &[String], overrides: &[String]) -> Vec<String> {
    if overrides.is_empty() {
        return base.to_vec();
    }
    let key = |e: &str| e.split_once('=').map(|(k, _)| k.to_string());
    let mut merged: Vec<String> = base.iter().filter(|e| e.contains('=')).cloned().collect();
    for entry in overrides {
        let Some(k) = key(entry) else {
            continue;
        };
        match merged.iter_mut().find(|e| key(e).as_deref() == Some(k.as_str())) {
            Some(existing) => *existing = entry.clone(),
            None => merged.push(entry.clone()),
        }
    }
    merged
}

/// An exec marked running, waiting for its connection
pub struct ExecSession {
    pub request: ExecRequest,
    /// Whether the container is synthetic and agentless
    auto_stop: bool,
}

impl ExecSession {
    pub fn tty(&self) -> bool {
        self.request.tty
    }
}

impl Backend {
    pub fn create_exec(&self, reference: &str, req: ExecCreateRequest) -> Result<IdResponse> {
        let c = self.resolve_container(reference)?;
        if !c.state.running && (c.has_agent() || c.state.status.is_empty()) {
            return Err(SockerlessError::Conflict(format!(
                "Container {} is not running",
                reference
            )));
        }

        let id = generate_id();
        let (entrypoint, arguments) = match req.cmd.split_first() {
            Some((first, rest)) => (first.clone(), rest.to_vec()),
            None => (String::new(), Vec::new()),
        };
        let exec = ExecInstance {
            id: id.clone(),
            container_id: c.id.clone(),
            open_stdin: req.attach_stdin,
            open_stdout: req.attach_stdout,
            open_stderr: req.attach_stderr,
            process_config: ExecProcessConfig {
                tty: req.tty,
                entrypoint,
                arguments,
                privileged: req.privileged,
                user: req.user,
                env: req.env,
                working_dir: req.working_dir,
            },
            ..Default::default()
        };
        self.store.execs.put(id.clone(), exec);
        self.store
            .containers
            .update(&c.id, |c| c.exec_ids.push(id.clone()));
        Ok(IdResponse { id })
    }

    pub fn inspect_exec(&self, id: &str) -> Result<ExecInstance> {
        self.store
            .execs
            .get(id)
            .ok_or_else(|| SockerlessError::not_found("exec instance", id))
    }

    /// Mark an exec running and resolve what to run.
    ///
    /// Fails before the connection is upgraded, so a missing exec is a 404.
    pub fn begin_exec(&self, id: &str, req: &ExecStartRequest) -> Result<ExecSession> {
        let exec = self.inspect_exec(id)?;
        self.store.execs.update(id, |e| {
            e.running = true;
            e.pid = 43;
        });

        let container = self.store.containers.get(&exec.container_id).unwrap_or_default();
        let pc = &exec.process_config;
        let mut cmd = vec![pc.entrypoint.clone()];
        cmd.extend(pc.arguments.iter().cloned());
        let workdir = if pc.working_dir.is_empty() {
            container.config.working_dir.clone()
        } else {
            pc.working_dir.clone()
        };

        Ok(ExecSession {
            request: ExecRequest {
                container_id: exec.container_id.clone(),
                exec_id: id.to_string(),
                cmd,
                env: merge_env(&container.config.env, &pc.env),
                workdir,
                tty: pc.tty || req.tty,
            },
            auto_stop: !container.has_agent()
                && self.drivers.lifecycle.is_synthetic(&exec.container_id),
        })
    }

    /// Run a started exec over `conn`; returns the exit code
    pub async fn run_exec(&self, session: ExecSession, conn: BoxedConn) -> i64 {
        let req = &session.request;
        let exit_code = self.drivers.exec.exec(req, conn).await;
        self.store.execs.update(&req.exec_id, |e| {
            e.running = false;
            e.pid = 0;
            e.exit_code = exit_code;
        });
        debug!(
            "Exec {} in {} exited with {}",
            crate::api::short_id(&req.exec_id),
            crate::api::short_id(&req.container_id),
            exit_code
        );
        if session.auto_stop {
            schedule_exec_auto_stop(self.store.clone(), req.container_id.clone());
        }
        exit_code
    }
}

/// Stop a synthetic container once none of its execs is running
fn schedule_exec_auto_stop(store: Arc<Store>, container_id: String) {
    spawn_logged("exec auto-stop", async move {
        tokio::time::sleep(EXEC_AUTO_STOP_DELAY).await;
        let Some(c) = store.containers.get(&container_id) else {
            return;
        };
        if !c.state.running {
            return;
        }
        let busy = c
            .exec_ids
            .iter()
            .filter_map(|id| store.execs.get(id))
            .any(|e| e.running);
        if !busy {
            store.stop_container(&container_id, 0);
        }
    });
}
