//! Runtime configuration assembled by the binary from flags and environment.

use crate::provisioner::SandboxPolicy;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_REST_PORT: u16 = 4000;
pub const DEFAULT_WS_PORT: u16 = 4001;

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: IpAddr,
    pub rest_port: u16,
    pub ws_port: u16,
    pub storage_root: PathBuf,
    pub docker_bin: String,
    pub sandbox: SandboxPolicy,
    /// Close terminals with no traffic for this long. `None` disables.
    pub idle_timeout: Option<Duration>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            rest_port: DEFAULT_REST_PORT,
            ws_port: DEFAULT_WS_PORT,
            storage_root: PathBuf::from("workspaces"),
            docker_bin: "docker".to_string(),
            sandbox: SandboxPolicy::default(),
            idle_timeout: Some(Duration::from_secs(30 * 60)),
        }
    }
}
