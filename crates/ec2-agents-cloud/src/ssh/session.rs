//! SSH sessions on `russh`
//!
//! [`SshSession::connect`] performs the handshake under the template's
//! host key policy and authenticates as the admin user. Remote commands run
//! on exec channels; [`wait_completion`] turns a channel's event stream into
//! an exit status.

use super::host_key::{HostKey, HostKeyDecision, KnownHosts, verify};
use super::{LaunchTarget, SshAuth};
use crate::config::HostKeyVerification;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use russh::client::{self, Handle};
use russh::{Channel, ChannelMsg, Disconnect};
use russh_keys::PublicKeyBase64;
use russh_keys::key::PublicKey;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// One event on an exec channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    ExitStatus(u32),
    ExitSignal(String),
    Eof,
    Closed,
}

impl ChannelEvent {
    /// Events we act on; window adjustments and replies are dropped.
    pub fn from_msg(msg: ChannelMsg) -> Option<Self> {
        match msg {
            ChannelMsg::Data { data } => Some(Self::Stdout(data.to_vec())),
            ChannelMsg::ExtendedData { data, .. } => Some(Self::Stderr(data.to_vec())),
            ChannelMsg::ExitStatus { exit_status } => Some(Self::ExitStatus(exit_status)),
            ChannelMsg::ExitSignal { signal_name, .. } => {
                Some(Self::ExitSignal(format!("{signal_name:?}")))
            }
            ChannelMsg::Eof => Some(Self::Eof),
            ChannelMsg::Close => Some(Self::Closed),
            _ => None,
        }
    }
}

/// Tracks the exit status across channel events.
#[derive(Debug, Default)]
pub struct Completion {
    status: Option<u32>,
    signal: Option<String>,
}

impl Completion {
    /// Record `event`; returns true once the channel is closed.
    pub fn observe(&mut self, event: &ChannelEvent) -> bool {
        match event {
            ChannelEvent::ExitStatus(code) => self.status = Some(*code),
            ChannelEvent::ExitSignal(signal) => self.signal = Some(signal.clone()),
            ChannelEvent::Closed => return true,
            _ => {}
        }
        false
    }

    /// Remote exit status; `-1` when the command was killed by a signal or
    /// the channel closed without a status.
    pub fn exit_code(&self) -> i32 {
        match (self.status, &self.signal) {
            (Some(code), _) => i32::try_from(code).unwrap_or(-1),
            (None, Some(signal)) => {
                debug!(signal = %signal, "Remote command killed by signal");
                -1
            }
            (None, None) => -1,
        }
    }
}

/// Wait until the channel closes or `timeout` elapses.
///
/// Output events go to `on_output` (`true` for stderr). Returns the remote
/// exit status, or `-1` on timeout.
pub async fn wait_completion<S, F>(events: S, timeout: Duration, mut on_output: F) -> i32
where
    S: Stream<Item = ChannelEvent>,
    F: FnMut(bool, &[u8]),
{
    let mut completion = Completion::default();
    let drive = async {
        futures::pin_mut!(events);
        while let Some(event) = events.next().await {
            match &event {
                ChannelEvent::Stdout(data) => on_output(false, data),
                ChannelEvent::Stderr(data) => on_output(true, data),
                _ => {}
            }
            if completion.observe(&event) {
                break;
            }
        }
    };

    match tokio::time::timeout(timeout, drive).await {
        Ok(()) => completion.exit_code(),
        Err(_) => -1,
    }
}

/// Event stream of an exec channel
pub fn channel_events(channel: Channel<client::Msg>) -> impl Stream<Item = ChannelEvent> {
    futures::stream::unfold(channel, |mut channel| async move {
        loop {
            let msg = channel.wait().await?;
            if let Some(event) = ChannelEvent::from_msg(msg) {
                return Some((event, channel));
            }
        }
    })
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("{0}")]
    Unreachable(String),

    #[error("host key rejected: {0}")]
    HostKey(String),

    #[error("authentication as {0} rejected")]
    Auth(String),

    #[error("SSH handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("invalid private key: {0}")]
    Key(String),
}

/// `russh` handler applying the host key policy
pub struct HostKeyCheck {
    instance_id: String,
    policy: HostKeyVerification,
    console: Vec<HostKey>,
    known: KnownHosts,
    rejection: Arc<Mutex<Option<String>>>,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let presented = HostKey::new(
            server_public_key.name(),
            server_public_key.public_key_base64(),
        );
        let pinned = self.known.get(&self.instance_id);

        match verify(self.policy, &self.console, pinned.as_ref(), &presented) {
            HostKeyDecision::Accept { pin } => {
                if self.policy == HostKeyVerification::Off {
                    warn!(instance_id = %self.instance_id, "Host key verification is off");
                }
                if pin {
                    self.known.pin(&self.instance_id, presented);
                }
                Ok(true)
            }
            HostKeyDecision::Reject(reason) => {
                warn!(instance_id = %self.instance_id, reason = %reason, "Rejecting host key");
                *self
                    .rejection
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Some(reason);
                Ok(false)
            }
        }
    }
}

/// An authenticated SSH connection
pub struct SshSession {
    handle: Handle<HostKeyCheck>,
    instance_id: String,
}

impl SshSession {
    /// Connect and authenticate, bounded by `timeout`.
    pub async fn connect(
        target: &LaunchTarget,
        known: &KnownHosts,
        timeout: Duration,
    ) -> Result<Self, ConnectError> {
        match tokio::time::timeout(timeout, Self::connect_inner(target, known)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::Timeout(timeout)),
        }
    }

    async fn connect_inner(target: &LaunchTarget, known: &KnownHosts) -> Result<Self, ConnectError> {
        let rejection = Arc::new(Mutex::new(None));
        let handler = HostKeyCheck {
            instance_id: target.instance_id.clone(),
            policy: target.host_key_policy,
            console: target.console_host_keys.clone(),
            known: known.clone(),
            rejection: rejection.clone(),
        };
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(600)),
            ..Default::default()
        });

        let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| {
                match rejection.lock().unwrap_or_else(PoisonError::into_inner).take() {
                    Some(reason) => ConnectError::HostKey(reason),
                    None => ConnectError::Unreachable(e.to_string()),
                }
            })?;

        let authenticated = match &target.auth {
            SshAuth::Key(key) => {
                let pair = russh_keys::decode_secret_key(key.pem(), None)
                    .map_err(|e| ConnectError::Key(e.to_string()))?;
                handle
                    .authenticate_publickey(target.user.as_str(), Arc::new(pair))
                    .await
            }
            SshAuth::Password(password) => {
                handle
                    .authenticate_password(target.user.as_str(), password.as_str())
                    .await
            }
        }
        .map_err(|e| ConnectError::Unreachable(e.to_string()))?;

        if !authenticated {
            return Err(ConnectError::Auth(target.user.clone()));
        }
        debug!(instance_id = %target.instance_id, host = %target.host, "SSH session established");
        Ok(Self {
            handle,
            instance_id: target.instance_id.clone(),
        })
    }

    /// Open an exec channel running `command`.
    pub async fn open_exec(&self, command: &str) -> Result<Channel<client::Msg>, russh::Error> {
        let channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;
        Ok(channel)
    }

    /// Run `command` to completion; returns the exit status and the combined
    /// output.
    pub async fn exec(&self, command: &str, timeout: Duration) -> Result<(i32, String), russh::Error> {
        debug!(instance_id = %self.instance_id, command, "Running remote command");
        let channel = self.open_exec(command).await?;
        let mut output = Vec::new();
        let status = wait_completion(channel_events(channel), timeout, |_, data| {
            output.extend_from_slice(data)
        })
        .await;
        Ok((status, String::from_utf8_lossy(&output).into_owned()))
    }

    pub async fn close(&self) {
        if let Err(e) = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
        {
            debug!(instance_id = %self.instance_id, error = %e, "SSH disconnect failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[tokio::test]
    async fn returns_exit_status_after_close() {
        let events = stream::iter(vec![
            ChannelEvent::Stdout(b"hello\n".to_vec()),
            ChannelEvent::Stderr(b"warn\n".to_vec()),
            ChannelEvent::Eof,
            ChannelEvent::ExitStatus(3),
            ChannelEvent::Closed,
            ChannelEvent::Stdout(b"after close".to_vec()),
        ]);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = wait_completion(events, Duration::from_secs(5), |is_err, data| {
            if is_err {
                stderr.extend_from_slice(data)
            } else {
                stdout.extend_from_slice(data)
            }
        })
        .await;

        assert_eq!(status, 3);
        assert_eq!(stdout, b"hello\n");
        assert_eq!(stderr, b"warn\n");
    }

    #[tokio::test]
    async fn signal_without_status_is_minus_one() {
        let events = stream::iter(vec![
            ChannelEvent::ExitSignal("KILL".to_string()),
            ChannelEvent::Closed,
        ]);
        assert_eq!(wait_completion(events, Duration::from_secs(5), |_, _| {}).await, -1);

        let ended = stream::iter(vec![ChannelEvent::ExitStatus(0)]);
        assert_eq!(wait_completion(ended, Duration::from_secs(5), |_, _| {}).await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_minus_one() {
        let events = stream::iter(vec![ChannelEvent::Stdout(b"still running".to_vec())])
            .chain(stream::pending());
        let status = wait_completion(events, Duration::from_secs(3600), |_, _| {}).await;
        assert_eq!(status, -1);
    }
}
