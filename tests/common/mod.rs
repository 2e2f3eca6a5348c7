//! In-memory container runtime and a two-listener test server.
#![allow(dead_code)]

use async_trait::async_trait;
use sandterm::shell::{Shell, ShellControl, TerminalSize};
use sandterm::{
    http_server, terminal, AppState, Config, ContainerHandle, ContainerRuntime, RunningState,
    SandboxError, SandboxPolicy, SandboxResult, SandboxSpec,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};

pub const PROMPT: &str = "sandbox$ ";
/// Input that makes a fake shell exit.
pub const EXIT: &str = "exit\r";

/// What one fake shell saw.
#[derive(Clone, Default)]
pub struct ShellProbe {
    pub inputs: Arc<Mutex<Vec<String>>>,
    pub resizes: Arc<Mutex<Vec<TerminalSize>>>,
    pub terminated: Arc<AtomicBool>,
}

impl ShellProbe {
    pub fn inputs(&self) -> Vec<String> {
        self.inputs.lock().unwrap().clone()
    }

    pub fn resizes(&self) -> Vec<TerminalSize> {
        self.resizes.lock().unwrap().clone()
    }

    pub fn terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

struct FakeControl {
    probe: ShellProbe,
}

impl ShellControl for FakeControl {
    fn resize(&mut self, size: TerminalSize) -> SandboxResult<()> {
        self.probe.resizes.lock().unwrap().push(size);
        Ok(())
    }

    fn terminate(&mut self) -> SandboxResult<()> {
        self.probe.terminated.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Runtime whose containers become running on the `running_on`-th
/// inspection (`0` never) and whose shells print a prompt then echo input.
#[derive(Default)]
pub struct FakeRuntime {
    pub running_on: u32,
    pub fail_start: bool,
    pub fail_shell: bool,
    pub inspections: Mutex<HashMap<String, u32>>,
    pub stopped: Mutex<Vec<String>>,
    pub shells: Mutex<HashMap<String, ShellProbe>>,
}

impl FakeRuntime {
    pub fn ready() -> Self {
        Self {
            running_on: 1,
            ..Default::default()
        }
    }

    pub fn never_ready() -> Self {
        Self::default()
    }

    pub fn inspections(&self, name: &str) -> u32 {
        self.inspections
            .lock()
            .unwrap()
            .get(name)
            .copied()
            .unwrap_or(0)
    }

    pub fn stopped(&self) -> Vec<String> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn shell(&self, name: &str) -> Option<ShellProbe> {
        self.shells.lock().unwrap().get(name).cloned()
    }

    pub fn shell_count(&self) -> usize {
        self.shells.lock().unwrap().len()
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn start(&self, spec: &SandboxSpec) -> SandboxResult<ContainerHandle> {
        if self.fail_start {
            return Err(SandboxError::Runtime {
                command: "fake run".into(),
                message: "no such image".into(),
            });
        }
        Ok(ContainerHandle::new(spec.name.clone()))
    }

    async fn inspect(&self, handle: &ContainerHandle) -> SandboxResult<RunningState> {
        let mut inspections = self.inspections.lock().unwrap();
        let n = inspections.entry(handle.name.clone()).or_insert(0);
        *n += 1;
        if self.running_on > 0 && *n >= self.running_on {
            Ok(RunningState::Running)
        } else {
            Ok(RunningState::Stopped)
        }
    }

    async fn stop(&self, handle: &ContainerHandle) -> SandboxResult<()> {
        self.stopped.lock().unwrap().push(handle.name.clone());
        Ok(())
    }

    async fn spawn_shell(
        &self,
        handle: &ContainerHandle,
        _size: TerminalSize,
    ) -> SandboxResult<Shell> {
        if self.fail_shell {
            return Err(SandboxError::Runtime {
                command: "fake exec".into(),
                message: "exec failed".into(),
            });
        }

        let probe = ShellProbe::default();
        self.shells
            .lock()
            .unwrap()
            .insert(handle.name.clone(), probe.clone());

        let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(16);
        let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(16);
        let inputs = probe.inputs.clone();
        tokio::spawn(async move {
            if output_tx.send(PROMPT.as_bytes().to_vec()).await.is_err() {
                return;
            }
            while let Some(bytes) = input_rx.recv().await {
                let text = String::from_utf8_lossy(&bytes).into_owned();
                inputs.lock().unwrap().push(text.clone());
                if text == EXIT {
                    return;
                }
                if output_tx.send(bytes).await.is_err() {
                    return;
                }
            }
        });

        Ok(Shell {
            output: output_rx,
            input: input_tx,
            control: Box::new(FakeControl { probe }),
        })
    }
}

pub struct TestServer {
    pub rest: SocketAddr,
    pub ws: SocketAddr,
    pub state: AppState,
    pub runtime: Arc<FakeRuntime>,
    pub root: TempDir,
    shutdown: Vec<oneshot::Sender<()>>,
}

impl TestServer {
    pub async fn start(runtime: FakeRuntime) -> Self {
        Self::start_with(runtime, None).await
    }

    pub async fn start_with(runtime: FakeRuntime, idle_timeout: Option<Duration>) -> Self {
        let root = TempDir::new().unwrap();
        let rest_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let ws_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let rest = rest_listener.local_addr().unwrap();
        let ws = ws_listener.local_addr().unwrap();

        let config = Config {
            storage_root: root.path().to_path_buf(),
            rest_port: rest.port(),
            ws_port: ws.port(),
            sandbox: SandboxPolicy {
                poll_interval: Duration::from_millis(1),
                max_attempts: 5,
                ..SandboxPolicy::default()
            },
            idle_timeout,
            ..Config::default()
        };
        let runtime = Arc::new(runtime);
        let state = AppState::new(&config, runtime.clone()).unwrap();

        let (rest_tx, rest_rx) = oneshot::channel::<()>();
        let (ws_tx, ws_rx) = oneshot::channel::<()>();
        let rest_app = http_server::router(state.clone());
        let ws_app = terminal::router(state.clone());
        tokio::spawn(async move {
            axum::serve(rest_listener, rest_app)
                .with_graceful_shutdown(async {
                    let _ = rest_rx.await;
                })
                .await
                .unwrap();
        });
        tokio::spawn(async move {
            axum::serve(ws_listener, ws_app)
                .with_graceful_shutdown(async {
                    let _ = ws_rx.await;
                })
                .await
                .unwrap();
        });

        Self {
            rest,
            ws,
            state,
            runtime,
            root,
            shutdown: vec![rest_tx, ws_tx],
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.rest, path)
    }

    pub fn term_url(&self, session_id: &str) -> String {
        format!("ws://{}/term/{}", self.ws, session_id)
    }

    /// Provision a session through the control plane and return its id.
    pub async fn create_session(&self, project_path: &str) -> String {
        let response = reqwest::Client::new()
            .post(self.url("/session"))
            .json(&serde_json::json!({ "projectPath": project_path }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        let body: serde_json::Value = response.json().await.unwrap();
        body["sessionId"].as_str().unwrap().to_string()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        for tx in self.shutdown.drain(..) {
            let _ = tx.send(());
        }
    }
}
