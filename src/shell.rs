//! Interactive shell processes attached to a running sandbox.

use crate::errors::{SandboxError, SandboxResult};
use portable_pty::{ChildKiller, CommandBuilder, MasterPty, NativePtySystem, PtySize, PtySystem};
use std::io::{Read, Write};
use tokio::sync::mpsc;
use tracing::debug;

const CHANNEL_CAPACITY: usize = 64;
const READ_BUFFER: usize = 4096;

/// Terminal geometry in character cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Out-of-band control over a live shell.
pub trait ShellControl: Send {
    fn resize(&mut self, size: TerminalSize) -> SandboxResult<()>;
    /// Stop the shell process. Called once when the terminal closes.
    fn terminate(&mut self) -> SandboxResult<()>;
}

/// A live shell: byte streams in both directions plus its control handle.
///
/// `output` yields `None` once the shell has exited and its output is drained.
pub struct Shell {
    pub output: mpsc::Receiver<Vec<u8>>,
    pub input: mpsc::Sender<Vec<u8>>,
    pub control: Box<dyn ShellControl>,
}

/// Command line for a PTY-backed shell.
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
}

struct PtyControl {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn portable_pty::Child + Send + Sync>,
}

impl ShellControl for PtyControl {
    fn resize(&mut self, size: TerminalSize) -> SandboxResult<()> {
        self.master
            .resize(pty_size(size))
            .map_err(|e| SandboxError::Runtime {
                command: "pty resize".into(),
                message: e.to_string(),
            })
    }

    fn terminate(&mut self) -> SandboxResult<()> {
        if let Ok(Some(status)) = self.child.try_wait() {
            debug!(?status, "shell already exited");
            return Ok(());
        }

        hangup(self.child.process_id());
        if let Err(e) = self.child.kill() {
            // The hangup may already have ended it.
            if matches!(self.child.try_wait(), Ok(Some(_))) {
                return Ok(());
            }
            return Err(e.into());
        }
        self.child.wait()?;
        Ok(())
    }
}

#[cfg(target_os = "linux")]
fn hangup(pid: Option<u32>) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
        if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGHUP) {
            debug!(pid, "SIGHUP failed: {e}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn hangup(_pid: Option<u32>) {}

fn pty_size(size: TerminalSize) -> PtySize {
    PtySize {
        rows: size.rows,
        cols: size.cols,
        pixel_width: 0,
        pixel_height: 0,
    }
}

fn pty_error(stage: &str, err: impl std::fmt::Display) -> SandboxError {
    SandboxError::Runtime {
        command: stage.to_string(),
        message: err.to_string(),
    }
}

/// Spawn `command` under a fresh PTY. Blocking; call from a blocking context.
///
/// PTY reads and writes run on dedicated threads and are bridged to the
/// returned channels.
pub fn spawn_pty(command: &ShellCommand, size: TerminalSize) -> SandboxResult<Shell> {
    let system = NativePtySystem::default();
    let pair = system
        .openpty(pty_size(size))
        .map_err(|e| pty_error("openpty", e))?;

    let mut builder = CommandBuilder::new(&command.program);
    builder.args(&command.args);
    for (key, value) in &command.env {
        builder.env(key, value);
    }

    let child = pair
        .slave
        .spawn_command(builder)
        .map_err(|e| pty_error(&command.program, e))?;
    // The slave end must close with the child so reads see EOF.
    drop(pair.slave);

    let mut reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| pty_error("pty reader", e))?;
    let mut writer = pair
        .master
        .take_writer()
        .map_err(|e| pty_error("pty writer", e))?;

    let (output_tx, output_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);
    let (input_tx, mut input_rx) = mpsc::channel::<Vec<u8>>(CHANNEL_CAPACITY);

    std::thread::spawn(move || {
        let mut buf = [0u8; READ_BUFFER];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if output_tx.blocking_send(buf[..n].to_vec()).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("pty read ended: {e}");
                    break;
                }
            }
        }
    });

    std::thread::spawn(move || {
        while let Some(data) = input_rx.blocking_recv() {
            if writer.write_all(&data).is_err() {
                break;
            }
            let _ = writer.flush();
        }
    });

    Ok(Shell {
        output: output_rx,
        input: input_tx,
        control: Box::new(PtyControl {
            master: pair.master,
            child,
        }),
    })
}
