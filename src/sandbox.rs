//! Container runtime capability and its Docker CLI implementation.

use crate::errors::{SandboxError, SandboxResult};
use crate::shell::{self, Shell, ShellCommand, TerminalSize};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Output;
use tokio::process::Command;
use tracing::{debug, info};

/// Command kept running in the sandbox so shells can attach later.
pub const IDLE_COMMAND: [&str; 3] = ["/bin/sh", "-c", "while true; do sleep 3600; done"];

/// Everything the runtime needs to start one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxSpec {
    /// Container name; the session id.
    pub name: String,
    /// Host directory bind-mounted read-write into the sandbox.
    pub workspace: PathBuf,
    pub image: String,
    pub user: String,
    pub memory: String,
    pub pids_limit: u32,
}

impl SandboxSpec {
    /// In-container directory the workspace is mounted at.
    pub fn project_dir(&self) -> String {
        format!("/home/{}/project", self.user)
    }
}

/// Reference to a started container.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerHandle {
    pub name: String,
}

impl ContainerHandle {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunningState {
    Running,
    Stopped,
    Missing,
}

/// The external process manager that actually isolates sandboxes.
#[async_trait]
pub trait ContainerRuntime: Send + Sync + 'static {
    async fn start(&self, spec: &SandboxSpec) -> SandboxResult<ContainerHandle>;
    async fn inspect(&self, handle: &ContainerHandle) -> SandboxResult<RunningState>;
    /// Stop and remove the container. Succeeds if it is already gone.
    async fn stop(&self, handle: &ContainerHandle) -> SandboxResult<()>;
    /// Start an interactive shell inside a running container.
    async fn spawn_shell(&self, handle: &ContainerHandle, size: TerminalSize)
        -> SandboxResult<Shell>;
}

/// Drives the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerRuntime {
    binary: String,
}

impl DockerRuntime {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn run_args(spec: &SandboxSpec) -> Vec<String> {
        let project_dir = spec.project_dir();
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            spec.name.clone(),
            "--network".into(),
            "none".into(),
            "--read-only".into(),
            "--memory".into(),
            spec.memory.clone(),
            "--pids-limit".into(),
            spec.pids_limit.to_string(),
            "--cap-drop".into(),
            "ALL".into(),
            "-v".into(),
            format!("{}:{}:rw", spec.workspace.display(), project_dir),
            "-w".into(),
            project_dir,
            "-d".into(),
            spec.image.clone(),
        ];
        args.extend(IDLE_COMMAND.iter().map(|s| s.to_string()));
        args
    }

    pub fn exec_command(&self, handle: &ContainerHandle) -> ShellCommand {
        ShellCommand {
            program: self.binary.clone(),
            args: vec![
                "exec".into(),
                "-it".into(),
                handle.name.clone(),
                "/bin/sh".into(),
            ],
            env: vec![("TERM".into(), "xterm-256color".into())],
        }
    }

    async fn docker(&self, args: &[String]) -> SandboxResult<Output> {
        debug!(binary = %self.binary, ?args, "invoking container runtime");
        Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SandboxError::Runtime {
                command: format!("{} {}", self.binary, args.first().map(String::as_str).unwrap_or("")),
                message: e.to_string(),
            })
    }

    fn failure(&self, verb: &str, output: &Output) -> SandboxError {
        SandboxError::Runtime {
            command: format!("{} {verb}", self.binary),
            message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new("docker")
    }
}

fn is_missing(stderr: &[u8]) -> bool {
    let stderr = String::from_utf8_lossy(stderr).to_lowercase();
    stderr.contains("no such container") || stderr.contains("no such object")
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &SandboxSpec) -> SandboxResult<ContainerHandle> {
        let output = self.docker(&Self::run_args(spec)).await?;
        if !output.status.success() {
            return Err(self.failure("run", &output));
        }
        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        info!(name = %spec.name, %container_id, "container started");
        Ok(ContainerHandle::new(spec.name.clone()))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> SandboxResult<RunningState> {
        let args = [
            "inspect".to_string(),
            "-f".to_string(),
            "{{.State.Running}}".to_string(),
            handle.name.clone(),
        ];
        let output = self.docker(&args).await?;
        if !output.status.success() {
            if is_missing(&output.stderr) {
                return Ok(RunningState::Missing);
            }
            return Err(self.failure("inspect", &output));
        }
        match String::from_utf8_lossy(&output.stdout).trim() {
            "true" => Ok(RunningState::Running),
            _ => Ok(RunningState::Stopped),
        }
    }

    async fn stop(&self, handle: &ContainerHandle) -> SandboxResult<()> {
        let args = ["rm".to_string(), "-f".to_string(), handle.name.clone()];
        let output = self.docker(&args).await?;
        if output.status.success() || is_missing(&output.stderr) {
            return Ok(());
        }
        Err(self.failure("rm", &output))
    }

    async fn spawn_shell(
        &self,
        handle: &ContainerHandle,
        size: TerminalSize,
    ) -> SandboxResult<Shell> {
        let command = self.exec_command(handle);
        tokio::task::spawn_blocking(move || shell::spawn_pty(&command, size))
            .await
            .map_err(|e| SandboxError::Runtime {
                command: "docker exec".into(),
                message: e.to_string(),
            })?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            name: "sess-1234".into(),
            workspace: PathBuf::from("/srv/workspaces/alice/app"),
            image: "sandbox:latest".into(),
            user: "sandbox".into(),
            memory: "256m".into(),
            pids_limit: 64,
        }
    }

    #[test]
    fn run_args_lock_down_the_container() {
        let args = DockerRuntime::run_args(&spec());
        let joined = args.join(" ");

        assert!(joined.starts_with("run --rm --name sess-1234"));
        assert!(joined.contains("--network none"));
        assert!(joined.contains("--read-only"));
        assert!(joined.contains("--memory 256m"));
        assert!(joined.contains("--pids-limit 64"));
        assert!(joined.contains("--cap-drop ALL"));
        assert!(joined.contains("-v /srv/workspaces/alice/app:/home/sandbox/project:rw"));
        assert!(joined.contains("-w /home/sandbox/project"));
        assert!(joined.contains("-d sandbox:latest /bin/sh -c"));
        assert_eq!(args.last().unwrap(), "while true; do sleep 3600; done");
    }

    #[test]
    fn exec_targets_the_session_container() {
        let runtime = DockerRuntime::new("/usr/bin/docker");
        let command = runtime.exec_command(&ContainerHandle::new("sess-1234"));
        assert_eq!(command.program, "/usr/bin/docker");
        assert_eq!(command.args, ["exec", "-it", "sess-1234", "/bin/sh"]);
        assert!(command
            .env
            .contains(&("TERM".to_string(), "xterm-256color".to_string())));
    }

    #[test]
    fn missing_container_messages_are_recognized() {
        assert!(is_missing(b"Error response from daemon: No such container: sess-1"));
        assert!(is_missing(b"Error: No such object: sess-1"));
        assert!(!is_missing(b"permission denied"));
    }

    #[tokio::test]
    async fn missing_binary_is_a_runtime_error() {
        let runtime = DockerRuntime::new("/nonexistent/docker-binary");
        let err = runtime.start(&spec()).await.unwrap_err();
        assert!(matches!(err, SandboxError::Runtime { .. }));
    }
}
