//! Shared application state and the session registry.

use crate::config::Config;
use crate::errors::{SandboxError, SandboxResult};
use crate::provisioner::Provisioner;
use crate::sandbox::ContainerRuntime;
use crate::workspace::WorkspaceRoot;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, RwLock};
use uuid::Uuid;

/// How long a failed session stays visible, or a provisioning one may take,
/// before the reaper drops it.
pub const STALE_SESSION_TTL_SECS: u64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Provisioning,
    Ready,
    Failed,
    Terminated,
}

/// Registry-side record of an attached terminal.
///
/// Dropping it (by removing the session) wakes the bridge holding the
/// matching [`ShellTicket`].
#[derive(Debug)]
pub struct ShellHandle {
    pub attachment: Uuid,
    pub attached_at: Instant,
    _close: oneshot::Sender<()>,
}

/// Bridge-side half of an attachment.
#[derive(Debug)]
pub struct ShellTicket {
    pub attachment: Uuid,
    /// Resolves once the session has been removed from the registry.
    pub closed: oneshot::Receiver<()>,
}

/// One provisioned sandbox and its optional attached shell.
#[derive(Debug)]
pub struct Session {
    pub id: String,
    pub workspace: PathBuf,
    pub state: SessionState,
    pub created_at: Instant,
    pub shell: Option<ShellHandle>,
}

impl Session {
    pub fn new(id: String, workspace: PathBuf) -> Self {
        Self {
            id,
            workspace,
            state: SessionState::Provisioning,
            created_at: Instant::now(),
            shell: None,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            workspace: self.workspace.clone(),
            state: self.state,
            shell_attached: self.shell.is_some(),
            attached_at: self.shell.as_ref().map(|shell| shell.attached_at),
            created_at: self.created_at,
        }
    }
}

/// Point-in-time copy of a session, safe to hand out of the lock.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: String,
    pub workspace: PathBuf,
    pub state: SessionState,
    pub shell_attached: bool,
    pub attached_at: Option<Instant>,
    pub created_at: Instant,
}

/// Process-wide map from session id to session.
///
/// Every read-modify-write happens under one write guard, so an attach racing
/// a removal on the same id sees either the whole session or none of it.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn put(&self, session: Session) -> SandboxResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.id) {
            return Err(SandboxError::InvalidRequest(format!(
                "session id {} already issued",
                session.id
            )));
        }
        sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().await.get(id).map(Session::info)
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        self.sessions.read().await.values().map(Session::info).collect()
    }

    pub async fn update_state(&self, id: &str, state: SessionState) -> SandboxResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        session.state = state;
        Ok(())
    }

    /// Record a new terminal attachment. At most one per session.
    pub async fn attach_shell(&self, id: &str) -> SandboxResult<ShellTicket> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| SandboxError::SessionNotFound(id.to_string()))?;
        if session.state != SessionState::Ready {
            return Err(SandboxError::SessionNotReady(id.to_string()));
        }
        if session.shell.is_some() {
            return Err(SandboxError::AlreadyAttached(id.to_string()));
        }

        let attachment = Uuid::new_v4();
        let (close_tx, close_rx) = oneshot::channel();
        session.shell = Some(ShellHandle {
            attachment,
            attached_at: Instant::now(),
            _close: close_tx,
        });
        Ok(ShellTicket {
            attachment,
            closed: close_rx,
        })
    }

    /// Drop any attached shell and remove the session.
    ///
    /// Idempotent: only the first caller gets the session back, marked
    /// `Terminated`.
    pub async fn detach_and_remove(&self, id: &str) -> Option<Session> {
        let mut session = self.sessions.write().await.remove(id)?;
        session.shell = None;
        session.state = SessionState::Terminated;
        Some(session)
    }

    /// Remove `Failed` and still-`Provisioning` sessions older than `ttl`.
    pub async fn remove_stale(&self, ttl: Duration) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        let now = Instant::now();
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                matches!(s.state, SessionState::Failed | SessionState::Provisioning)
                    && now.duration_since(s.created_at) >= ttl
            })
            .map(|(id, _)| id.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id))
            .map(|mut s| {
                s.state = SessionState::Terminated;
                s
            })
            .collect()
    }

    pub async fn drain(&self) -> Vec<Session> {
        let mut sessions = self.sessions.write().await;
        sessions
            .drain()
            .map(|(_, mut s)| {
                s.shell = None;
                s.state = SessionState::Terminated;
                s
            })
            .collect()
    }
}

/// Shared application state handed to both listeners.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub provisioner: Arc<Provisioner>,
    pub workspace: Arc<WorkspaceRoot>,
    /// Port advertised in data-plane URLs.
    pub ws_port: u16,
    pub idle_timeout: Option<Duration>,
}

impl AppState {
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> SandboxResult<Self> {
        let workspace = Arc::new(WorkspaceRoot::open(&config.storage_root)?);
        let registry = Arc::new(SessionRegistry::new());
        let provisioner = Arc::new(Provisioner::new(
            runtime,
            registry.clone(),
            config.sandbox.clone(),
        ));
        Ok(Self {
            registry,
            provisioner,
            workspace,
            ws_port: config.ws_port,
            idle_timeout: config.idle_timeout,
        })
    }
}
