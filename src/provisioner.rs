//! Starts, polls and tears down per-session sandboxes.

use crate::errors::{SandboxError, SandboxResult};
use crate::sandbox::{ContainerHandle, ContainerRuntime, RunningState, SandboxSpec};
use crate::shell::{Shell, TerminalSize};
use crate::state::{Session, SessionInfo, SessionRegistry, SessionState};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Container limits and readiness budget applied to every sandbox.
#[derive(Debug, Clone)]
pub struct SandboxPolicy {
    pub image: String,
    pub user: String,
    pub memory: String,
    pub pids_limit: u32,
    /// Delay before each readiness check.
    pub poll_interval: Duration,
    /// Readiness checks before giving up.
    pub max_attempts: u32,
}

impl Default for SandboxPolicy {
    fn default() -> Self {
        Self {
            image: "sandbox:latest".to_string(),
            user: "sandbox".to_string(),
            memory: "256m".to_string(),
            pids_limit: 64,
            poll_interval: Duration::from_millis(300),
            max_attempts: 11,
        }
    }
}

impl SandboxPolicy {
    pub fn spec(&self, name: &str, workspace: PathBuf) -> SandboxSpec {
        SandboxSpec {
            name: name.to_string(),
            workspace,
            image: self.image.clone(),
            user: self.user.clone(),
            memory: self.memory.clone(),
            pids_limit: self.pids_limit,
        }
    }
}

pub fn new_session_id() -> String {
    format!("sess-{}", Uuid::new_v4())
}

pub struct Provisioner {
    runtime: Arc<dyn ContainerRuntime>,
    registry: Arc<SessionRegistry>,
    policy: SandboxPolicy,
}

impl Provisioner {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        registry: Arc<SessionRegistry>,
        policy: SandboxPolicy,
    ) -> Self {
        Self {
            runtime,
            registry,
            policy,
        }
    }

    /// Start a sandbox over `workspace` and wait until it is running.
    ///
    /// The session is registered as `Provisioning` before the container is
    /// started and ends up `Ready` or `Failed`. The work runs on its own task,
    /// so a caller that goes away mid-poll still leaves the session settled
    /// and, on failure, the container removed.
    pub async fn provision(self: &Arc<Self>, workspace: PathBuf) -> SandboxResult<SessionInfo> {
        let id = new_session_id();
        self.registry
            .put(Session::new(id.clone(), workspace.clone()))
            .await?;

        let provisioner = Arc::clone(self);
        let task_id = id.clone();
        tokio::spawn(async move { provisioner.bring_up(task_id, workspace).await })
            .await
            .map_err(|e| SandboxError::ProvisionError(format!("provisioning task for {id} failed: {e}")))?
    }

    async fn bring_up(&self, id: String, workspace: PathBuf) -> SandboxResult<SessionInfo> {
        let spec = self.policy.spec(&id, workspace);
        info!(session_id = %id, workspace = %spec.workspace.display(), image = %spec.image, "provisioning sandbox");

        let handle = match self.runtime.start(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(session_id = %id, "container start failed: {e}");
                self.mark_failed(&id).await;
                return Err(SandboxError::ProvisionError(e.to_string()));
            }
        };

        match self.await_running(&handle).await {
            Ok(attempts) => debug!(session_id = %id, attempts, "container running"),
            Err(e) => {
                warn!(session_id = %id, "{e}");
                self.mark_failed(&id).await;
                self.teardown(&id).await;
                return Err(e);
            }
        }

        if self
            .registry
            .update_state(&id, SessionState::Ready)
            .await
            .is_err()
        {
            self.teardown(&id).await;
            return Err(SandboxError::ProvisionError(format!(
                "session {id} was terminated while provisioning"
            )));
        }

        info!(session_id = %id, "session ready");
        self.registry
            .get(&id)
            .await
            .ok_or(SandboxError::SessionNotFound(id))
    }

    /// Poll the runtime until the container reports running.
    ///
    /// Returns the number of checks it took. Inspection errors count as
    /// "not running yet".
    pub async fn await_running(&self, handle: &ContainerHandle) -> SandboxResult<u32> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 1..=attempts {
            sleep(self.policy.poll_interval).await;
            match self.runtime.inspect(handle).await {
                Ok(RunningState::Running) => return Ok(attempt),
                Ok(state) => debug!(container = %handle.name, attempt, ?state, "not running yet"),
                Err(e) => debug!(container = %handle.name, attempt, "inspect failed: {e}"),
            }
        }
        Err(SandboxError::ProvisionTimeout { attempts })
    }

    /// Stop and remove the session's container. Idempotent.
    pub async fn terminate(&self, session_id: &str) -> SandboxResult<()> {
        self.runtime.stop(&ContainerHandle::new(session_id)).await
    }

    /// Best-effort [`terminate`](Self::terminate); failures are only logged.
    pub async fn teardown(&self, session_id: &str) {
        match self.terminate(session_id).await {
            Ok(()) => debug!(session_id, "container removed"),
            Err(e) => warn!(session_id, "container teardown failed: {e}"),
        }
    }

    /// Remove the session from the registry and tear down its container.
    ///
    /// Only the caller that actually removed the entry performs teardown.
    pub async fn release(&self, session_id: &str) -> Option<Session> {
        let session = self.registry.detach_and_remove(session_id).await?;
        self.teardown(session_id).await;
        info!(session_id, "session released");
        Some(session)
    }

    pub async fn spawn_shell(&self, session_id: &str, size: TerminalSize) -> SandboxResult<Shell> {
        self.runtime
            .spawn_shell(&ContainerHandle::new(session_id), size)
            .await
    }

    /// Drop failed or stuck-provisioning sessions older than `ttl` and clean
    /// up after them.
    pub async fn reap_stale(&self, ttl: Duration) -> usize {
        let expired = self.registry.remove_stale(ttl).await;
        for session in &expired {
            info!(session_id = %session.id, "reaping stale session");
            self.teardown(&session.id).await;
        }
        expired.len()
    }

    /// Release every remaining session. Used on shutdown.
    pub async fn shutdown(&self) {
        for session in self.registry.drain().await {
            self.teardown(&session.id).await;
        }
    }

    async fn mark_failed(&self, session_id: &str) {
        if let Err(e) = self
            .registry
            .update_state(session_id, SessionState::Failed)
            .await
        {
            debug!(session_id, "could not mark session failed: {e}");
        }
    }
}
