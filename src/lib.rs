//! Sandterm: container-backed terminal sandboxes.
//!
//! The control plane (HTTP, [`http_server`]) persists files into a workspace
//! root and provisions one container per session. The data plane
//! (WebSocket, [`terminal`]) attaches a single interactive shell to a ready
//! session and streams it until either side goes away.

pub mod config;
pub mod errors;
pub mod http_server;
pub mod protocol;
pub mod provisioner;
pub mod sandbox;
pub mod shell;
pub mod state;
pub mod terminal;
pub mod workspace;

pub use config::Config;
pub use errors::{SandboxError, SandboxResult};
pub use provisioner::{Provisioner, SandboxPolicy};
pub use sandbox::{ContainerHandle, ContainerRuntime, DockerRuntime, RunningState, SandboxSpec};
pub use shell::{Shell, ShellControl, TerminalSize};
pub use state::{AppState, SessionInfo, SessionRegistry, SessionState};
