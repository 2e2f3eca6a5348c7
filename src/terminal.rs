//! Data plane: bridges a WebSocket on `/term/{session_id}` to a shell in the
//! session's sandbox.

use crate::errors::SandboxError;
use crate::protocol::{parse_client_frame, ClientFrame, ServerFrame, Utf8Decoder};
use crate::shell::{Shell, ShellControl, TerminalSize};
use crate::state::AppState;
use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, Instant};
use tracing::{debug, error, info, warn};

/// Input accepted from the client but not yet taken by the shell. Beyond
/// this, new input frames are dropped.
const MAX_PENDING_INPUT_BYTES: usize = 1024 * 1024;

/// Why a streaming terminal ended.
#[derive(Debug)]
enum CloseReason {
    ClientClosed,
    ShellExited,
    Terminated,
    IdleTimeout,
    Transport(String),
}

impl CloseReason {
    /// Close frame to send, if the client is still there to receive one.
    fn frame(&self) -> Option<(u16, &'static str)> {
        match self {
            CloseReason::ShellExited => Some((close_code::NORMAL, "shell exited")),
            CloseReason::Terminated => Some((close_code::NORMAL, "session terminated")),
            CloseReason::IdleTimeout => Some((close_code::NORMAL, "idle timeout")),
            CloseReason::ClientClosed | CloseReason::Transport(_) => None,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/term/:session_id", get(terminal_upgrade))
        .with_state(state)
}

/// Serve the data plane on `addr` until `shutdown` resolves.
pub async fn run_server(
    addr: SocketAddr,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(
        "terminal listening on ws://{}/term/{{session_id}}",
        listener.local_addr()?
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn terminal_upgrade(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| bridge(socket, state, session_id))
}

async fn close(socket: &mut WebSocket, code: u16, reason: impl Into<Cow<'static, str>>) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!("close frame not delivered: {e}");
    }
}

/// Connection lifecycle: attach, stream, then clean up.
async fn bridge(mut socket: WebSocket, state: AppState, session_id: String) {
    let ticket = match state.registry.attach_shell(&session_id).await {
        Ok(ticket) => ticket,
        Err(e) => {
            warn!(%session_id, "terminal attach rejected: {e}");
            close(&mut socket, close_code::POLICY, e.to_string()).await;
            return;
        }
    };

    let shell = match state
        .provisioner
        .spawn_shell(&session_id, TerminalSize::default())
        .await
    {
        Ok(shell) => shell,
        Err(e) => {
            error!(%session_id, "failed to start shell: {e}");
            close(&mut socket, close_code::ERROR, "failed to start shell").await;
            state.provisioner.release(&session_id).await;
            return;
        }
    };
    info!(%session_id, attachment = %ticket.attachment, "terminal attached");

    let Shell {
        output,
        input,
        mut control,
    } = shell;
    let reason = relay(
        &mut socket,
        output,
        input,
        control.as_mut(),
        ticket.closed,
        state.idle_timeout,
    )
    .await;
    info!(%session_id, ?reason, "terminal closed");

    if let Some((code, text)) = reason.frame() {
        close(&mut socket, code, text).await;
    }

    match tokio::task::spawn_blocking(move || control.terminate()).await {
        Ok(Ok(())) => debug!(%session_id, "shell terminated"),
        Ok(Err(e)) => warn!(%session_id, "failed to terminate shell: {e}"),
        Err(e) => warn!(%session_id, "shell termination task failed: {e}"),
    }

    state.provisioner.release(&session_id).await;
}

/// Pump frames until either side finishes.
///
/// Input is queued and handed to the shell as it makes room, so shell output
/// keeps draining while a large paste is still being written.
async fn relay(
    socket: &mut WebSocket,
    mut output: mpsc::Receiver<Vec<u8>>,
    input: mpsc::Sender<Vec<u8>>,
    control: &mut dyn ShellControl,
    mut closed: oneshot::Receiver<()>,
    idle_timeout: Option<Duration>,
) -> CloseReason {
    let mut decoder = Utf8Decoder::default();
    let mut pending: VecDeque<Vec<u8>> = VecDeque::new();
    let mut pending_bytes = 0usize;
    // Disabled below when there is no timeout; the duration is then irrelevant.
    let idle = sleep(idle_timeout.unwrap_or(Duration::from_secs(86_400)));
    tokio::pin!(idle);

    loop {
        tokio::select! {
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            warn!("dropping frame: {}", SandboxError::MalformedFrame("binary frame is not UTF-8".into()));
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return CloseReason::ClientClosed,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return CloseReason::Transport(e.to_string()),
                };
                if let Some(timeout) = idle_timeout {
                    idle.as_mut().reset(Instant::now() + timeout);
                }

                match parse_client_frame(&text) {
                    Ok(ClientFrame::Input { data }) => {
                        if pending_bytes + data.len() > MAX_PENDING_INPUT_BYTES {
                            warn!(pending_bytes, dropped = data.len(), "shell is not keeping up; dropping input");
                            continue;
                        }
                        pending_bytes += data.len();
                        pending.push_back(data.into_bytes());
                    }
                    Ok(frame @ ClientFrame::Resize { .. }) => {
                        if let Some(size) = frame.size() {
                            if let Err(e) = control.resize(size) {
                                warn!(?size, "resize failed: {e}");
                            }
                        }
                    }
                    Err(e) => warn!("dropping frame: {e}"),
                }
            }
            chunk = output.recv() => {
                let Some(bytes) = chunk else {
                    return CloseReason::ShellExited;
                };
                if let Some(timeout) = idle_timeout {
                    idle.as_mut().reset(Instant::now() + timeout);
                }
                let data = decoder.decode(&bytes);
                if data.is_empty() {
                    continue;
                }
                let frame = ServerFrame::Output { data }.to_json();
                if let Err(e) = socket.send(Message::Text(frame)).await {
                    return CloseReason::Transport(e.to_string());
                }
            }
            permit = input.reserve(), if !pending.is_empty() => {
                let Ok(permit) = permit else {
                    return CloseReason::ShellExited;
                };
                if let Some(data) = pending.pop_front() {
                    pending_bytes -= data.len();
                    permit.send(data);
                }
            }
            _ = &mut closed => return CloseReason::Terminated,
            _ = &mut idle, if idle_timeout.is_some() => return CloseReason::IdleTimeout,
        }
    }
}
