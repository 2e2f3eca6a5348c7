//! Sandterm - terminal sandboxes with an HTTP control plane and a WebSocket
//! data plane.
//!
//! Usage:
//!   sandterm serve [--rest-port 4000] [--ws-port 4001] [--storage-root ./workspaces]

use clap::{Args as ClapArgs, Parser, Subcommand};
use sandterm::config::{DEFAULT_REST_PORT, DEFAULT_WS_PORT};
use sandterm::{http_server, terminal, AppState, Config, DockerRuntime, SandboxPolicy};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "sandterm")]
#[command(about = "Container-backed terminal sandboxes")]
struct Args {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the control plane and terminal listeners
    Serve(ServeArgs),
}

#[derive(ClapArgs, Debug)]
struct ServeArgs {
    /// Address both listeners bind to
    #[arg(long, env = "BIND", default_value = "0.0.0.0")]
    bind: IpAddr,

    /// Control plane (HTTP) port
    #[arg(long, env = "REST_PORT", default_value_t = DEFAULT_REST_PORT)]
    rest_port: u16,

    /// Data plane (WebSocket) port
    #[arg(long, env = "WS_PORT", default_value_t = DEFAULT_WS_PORT)]
    ws_port: u16,

    /// Directory holding every workspace
    #[arg(long, env = "STORAGE_ROOT", default_value = "./workspaces")]
    storage_root: PathBuf,

    /// Unprivileged user inside the sandbox image
    #[arg(long, env = "SANDBOX_USER", default_value = "sandbox")]
    sandbox_user: String,

    /// Image every sandbox is started from
    #[arg(long, env = "SANDBOX_IMAGE", default_value = "sandbox:latest")]
    sandbox_image: String,

    /// Memory limit passed to the container runtime
    #[arg(long, env = "SANDBOX_MEMORY", default_value = "256m")]
    sandbox_memory: String,

    /// Process limit inside the sandbox
    #[arg(long, env = "SANDBOX_PIDS_LIMIT", default_value = "64")]
    sandbox_pids_limit: u32,

    /// Delay before each readiness check, in milliseconds
    #[arg(long, env = "READY_POLL_MS", default_value = "300")]
    ready_poll_ms: u64,

    /// Readiness checks before provisioning fails
    #[arg(long, env = "READY_MAX_ATTEMPTS", default_value = "11")]
    ready_max_attempts: u32,

    /// Close terminals idle for this many seconds (0 disables)
    #[arg(long, env = "IDLE_TIMEOUT_SECS", default_value = "1800")]
    idle_timeout_secs: u64,

    /// Container runtime CLI
    #[arg(long, env = "DOCKER_BIN", default_value = "docker")]
    docker_bin: String,
}

impl From<ServeArgs> for Config {
    fn from(args: ServeArgs) -> Self {
        Config {
            bind: args.bind,
            rest_port: args.rest_port,
            ws_port: args.ws_port,
            storage_root: args.storage_root,
            docker_bin: args.docker_bin,
            sandbox: SandboxPolicy {
                image: args.sandbox_image,
                user: args.sandbox_user,
                memory: args.sandbox_memory,
                pids_limit: args.sandbox_pids_limit,
                poll_interval: Duration::from_millis(args.ready_poll_ms),
                max_attempts: args.ready_max_attempts,
            },
            idle_timeout: (args.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(args.idle_timeout_secs)),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();

    match args.command {
        Some(Commands::Serve(serve)) => serve_all(serve.into()).await,
        None => {
            eprintln!("Error: Use the 'serve' subcommand");
            exit(1);
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

async fn serve_all(config: Config) -> anyhow::Result<()> {
    let runtime = Arc::new(DockerRuntime::new(config.docker_bin.clone()));
    let state = AppState::new(&config, runtime)?;
    info!(
        storage_root = %state.workspace.path().display(),
        image = %config.sandbox.image,
        "starting sandterm"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let shutdown_tx = Arc::new(shutdown_tx);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = signal_tx.send(true);
    });

    let rest_addr = SocketAddr::new(config.bind, config.rest_port);
    let ws_addr = SocketAddr::new(config.bind, config.ws_port);
    // A listener that fails takes the other one down with it.
    let (rest, ws) = tokio::join!(
        async {
            let result =
                http_server::run_server(rest_addr, state.clone(), wait_for(shutdown_rx.clone()))
                    .await;
            let _ = shutdown_tx.send(true);
            result
        },
        async {
            let result =
                terminal::run_server(ws_addr, state.clone(), wait_for(shutdown_rx.clone())).await;
            let _ = shutdown_tx.send(true);
            result
        },
    );

    info!("tearing down remaining sessions");
    state.provisioner.shutdown().await;

    if let Err(e) = &rest {
        error!("control plane failed: {e}");
    }
    if let Err(e) = &ws {
        error!("terminal listener failed: {e}");
    }
    rest?;
    ws?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        error!("failed to listen for shutdown signal: {error}");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

async fn wait_for(mut shutdown: watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}
