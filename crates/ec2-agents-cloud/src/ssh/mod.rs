//! Agent launch over SSH
//!
//! The launch state machine talks to hosts only through [`AgentLauncher`]:
//! `probe` while an instance boots, `launch` once SSH answers. [`SshLauncher`]
//! is the `russh` implementation.
//!
//! - `host_key`: console host keys, the verification policy and pinned keys
//! - `session`: connection, authentication and remote commands
//! - `scp`: the `scp -t` sink protocol
//! - `windows`: administrator password retrieval

pub mod host_key;
mod launcher;
pub mod scp;
pub mod session;
pub mod windows;

pub use host_key::{HostKey, KnownHosts};
pub use launcher::SshLauncher;

use crate::config::HostKeyVerification;
use crate::error::ProvisionResult;
use crate::log_buffer::NodeLog;
use async_trait::async_trait;
use ec2_agents_common::PrivateKey;
use std::path::PathBuf;
use tokio::io::DuplexStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// How to authenticate as the admin user
#[derive(Clone)]
pub enum SshAuth {
    Key(PrivateKey),
    Password(String),
}

impl std::fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Key(key) => f.debug_tuple("Key").field(key).finish(),
            Self::Password(_) => f.write_str("Password(..)"),
        }
    }
}

/// Everything needed to reach and bootstrap one instance
#[derive(Debug, Clone)]
pub struct LaunchTarget {
    pub instance_id: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub auth: SshAuth,
    pub host_key_policy: HostKeyVerification,
    /// Host keys advertised in the console output
    pub console_host_keys: Vec<HostKey>,
    /// Remote directory receiving the payload
    pub remote_fs: String,
    /// Local agent payload, uploaded before the bootstrap command
    pub payload: Option<PathBuf>,
    pub bootstrap_command: String,
    pub windows: bool,
}

/// A started remote agent
#[derive(Debug)]
pub struct AgentSession {
    /// Controller end of the agent's stdio stream
    pub channel: DuplexStream,
    /// Exit status of the remote command, `-1` when none was reported
    pub exit: oneshot::Receiver<i32>,
}

#[async_trait]
pub trait AgentLauncher: Send + Sync + 'static {
    /// Whether SSH on the target answers and accepts our credentials.
    async fn probe(&self, target: &LaunchTarget) -> ProvisionResult<bool>;

    /// Upload the payload and start the bootstrap command. Remote output is
    /// copied to `log`; cancelling `stop` closes the session.
    async fn launch(
        &self,
        target: &LaunchTarget,
        log: NodeLog,
        stop: CancellationToken,
    ) -> ProvisionResult<AgentSession>;
}

/// The command that starts the agent: the init script, then the bootstrap
/// command or `java -jar <remote_fs>/agent.jar`.
pub fn bootstrap_command(
    remote_fs: &str,
    init_script: Option<&str>,
    command: Option<&str>,
) -> String {
    let remote_fs = remote_fs.trim_end_matches('/');
    let start = match command.map(str::trim).filter(|c| !c.is_empty()) {
        Some(command) => command.to_string(),
        None => format!(
            "java -jar {remote_fs}/{}",
            ec2_agents_common::defaults::AGENT_PAYLOAD_NAME
        ),
    };
    match init_script.map(str::trim).filter(|s| !s.is_empty()) {
        Some(init) => format!("cd {remote_fs} && {init} && {start}"),
        None => format!("cd {remote_fs} && {start}"),
    }
}
