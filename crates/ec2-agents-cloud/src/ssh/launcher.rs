//! [`AgentLauncher`] over SSH

use super::host_key::KnownHosts;
use super::scp::{self, shell_quote};
use super::session::{ChannelEvent, Completion, ConnectError, SshSession};
use super::{AgentLauncher, AgentSession, LaunchTarget};
use crate::config::Timings;
use crate::error::{ProvisionError, ProvisionResult};
use crate::log_buffer::NodeLog;
use async_trait::async_trait;
use ec2_agents_common::defaults::AGENT_PAYLOAD_NAME;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const CHANNEL_BUFFER_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct SshLauncher {
    known_hosts: KnownHosts,
    handshake_timeout: Duration,
    scp_timeout: Duration,
    command_timeout: Duration,
}

impl SshLauncher {
    pub fn new(known_hosts: KnownHosts, timings: &Timings) -> Self {
        Self {
            known_hosts,
            handshake_timeout: timings.ssh_handshake_timeout(),
            scp_timeout: timings.scp_timeout(),
            command_timeout: timings.remote_command_timeout(),
        }
    }

    pub fn known_hosts(&self) -> &KnownHosts {
        &self.known_hosts
    }

    fn connect_error(target: &LaunchTarget, err: ConnectError) -> ProvisionError {
        let instance_id = target.instance_id.clone();
        match err {
            ConnectError::Timeout(_) | ConnectError::Unreachable(_) => ProvisionError::SshTimeout {
                instance_id,
                reason: err.to_string(),
            },
            ConnectError::Auth(_) => ProvisionError::AuthFailed {
                instance_id,
                reason: err.to_string(),
            },
            ConnectError::HostKey(_) | ConnectError::Key(_) => ProvisionError::BootstrapFailed {
                instance_id,
                reason: err.to_string(),
            },
        }
    }

    fn bootstrap_failed(target: &LaunchTarget, reason: impl Into<String>) -> ProvisionError {
        ProvisionError::BootstrapFailed {
            instance_id: target.instance_id.clone(),
            reason: reason.into(),
        }
    }

    async fn run_checked(
        &self,
        session: &SshSession,
        target: &LaunchTarget,
        command: &str,
        log: &NodeLog,
    ) -> ProvisionResult<()> {
        let (status, output) = session
            .exec(command, self.scp_timeout)
            .await
            .map_err(|e| Self::bootstrap_failed(target, e.to_string()))?;
        log.output(&output);
        if status != 0 {
            return Err(Self::bootstrap_failed(
                target,
                format!("`{command}` exited with {status}"),
            ));
        }
        Ok(())
    }

    async fn upload_payload(
        &self,
        session: &SshSession,
        target: &LaunchTarget,
        log: &NodeLog,
    ) -> ProvisionResult<()> {
        let Some(payload) = &target.payload else {
            return Ok(());
        };
        let data = tokio::fs::read(payload).await.map_err(|e| {
            Self::bootstrap_failed(target, format!("cannot read {}: {e}", payload.display()))
        })?;

        let remote_fs = target.remote_fs.trim_end_matches('/');
        let final_path = format!("{remote_fs}/{AGENT_PAYLOAD_NAME}");
        let temp = scp::temp_path(&final_path, &uuid::Uuid::new_v4().simple().to_string());
        let temp_name = temp.rsplit('/').next().unwrap_or(temp.as_str()).to_string();

        let channel = session
            .open_exec(&scp::sink_command(&temp))
            .await
            .map_err(|e| Self::bootstrap_failed(target, e.to_string()))?;
        let (mut reader, mut writer) = tokio::io::split(channel.into_stream());
        tokio::time::timeout(
            self.scp_timeout,
            scp::send_file(&mut reader, &mut writer, &temp_name, 0o644, &data),
        )
        .await
        .map_err(|_| Self::bootstrap_failed(target, "agent upload timed out"))?
        .map_err(|e| Self::bootstrap_failed(target, e.to_string()))?;

        let rename = if target.windows {
            format!(
                "powershell -Command \"Move-Item -Force -Path {} -Destination {}\"",
                shell_quote(&temp),
                shell_quote(&final_path)
            )
        } else {
            scp::rename_command(&temp, &final_path)
        };
        self.run_checked(session, target, &rename, log).await?;
        log.event(format!("uploaded {} bytes to {final_path}", data.len()));
        Ok(())
    }
}

#[async_trait]
impl AgentLauncher for SshLauncher {
    async fn probe(&self, target: &LaunchTarget) -> ProvisionResult<bool> {
        match SshSession::connect(target, &self.known_hosts, self.handshake_timeout).await {
            Ok(session) => {
                session.close().await;
                Ok(true)
            }
            // Keys are installed by cloud-init late in boot
            Err(ConnectError::Timeout(_) | ConnectError::Unreachable(_) | ConnectError::Auth(_)) => {
                Ok(false)
            }
            Err(e) => Err(Self::connect_error(target, e)),
        }
    }

    #[instrument(skip_all, fields(instance_id = %target.instance_id, host = %target.host))]
    async fn launch(
        &self,
        target: &LaunchTarget,
        log: NodeLog,
        stop: CancellationToken,
    ) -> ProvisionResult<AgentSession> {
        let session = SshSession::connect(target, &self.known_hosts, self.handshake_timeout)
            .await
            .map_err(|e| Self::connect_error(target, e))?;
        log.event(format!("connected to {}:{} as {}", target.host, target.port, target.user));

        let mkdir = if target.windows {
            format!(
                "powershell -Command \"New-Item -ItemType Directory -Force -Path {}\"",
                shell_quote(&target.remote_fs)
            )
        } else {
            format!("mkdir -p {}", shell_quote(&target.remote_fs))
        };
        self.run_checked(&session, target, &mkdir, &log).await?;
        self.upload_payload(&session, target, &log).await?;

        let mut channel = session
            .open_exec(&target.bootstrap_command)
            .await
            .map_err(|e| Self::bootstrap_failed(target, e.to_string()))?;
        info!(command = %target.bootstrap_command, "Started remote agent");
        log.event(format!("started `{}`", target.bootstrap_command));

        let (controller_end, engine_end) = tokio::io::duplex(CHANNEL_BUFFER_BYTES);
        let (exit_tx, exit_rx) = oneshot::channel();
        let command_timeout = self.command_timeout;
        let instance_id = target.instance_id.clone();

        tokio::spawn(async move {
            let (mut from_controller, to_controller) = tokio::io::split(engine_end);
            let (stdout, _pump) = spawn_stdout_pump(to_controller, stop.clone(), instance_id.clone());
            let mut completion = Completion::default();
            let mut buf = vec![0u8; 8192];
            let mut stdin_open = true;
            let deadline = tokio::time::sleep(command_timeout);
            tokio::pin!(deadline);

            let status = loop {
                tokio::select! {
                    msg = channel.wait() => {
                        let Some(msg) = msg else {
                            break completion.exit_code();
                        };
                        let Some(event) = ChannelEvent::from_msg(msg) else {
                            continue;
                        };
                        match &event {
                            ChannelEvent::Stdout(data) => {
                                if stdout.send(data.clone()).is_err() {
                                    debug!(instance_id = %instance_id, "Controller channel closed");
                                }
                            }
                            ChannelEvent::Stderr(data) => log.output(&String::from_utf8_lossy(data)),
                            _ => {}
                        }
                        if completion.observe(&event) {
                            break completion.exit_code();
                        }
                    }
                    read = from_controller.read(&mut buf), if stdin_open => {
                        match read {
                            Ok(0) | Err(_) => {
                                stdin_open = false;
                                let _ = channel.eof().await;
                            }
                            Ok(n) => {
                                if let Err(e) = channel.data(&buf[..n]).await {
                                    warn!(instance_id = %instance_id, error = %e, "Failed to forward to agent");
                                }
                            }
                        }
                    }
                    _ = &mut deadline => {
                        warn!(instance_id = %instance_id, "Remote agent exceeded command timeout");
                        break -1;
                    }
                    _ = stop.cancelled() => {
                        debug!(instance_id = %instance_id, "Agent session stopped");
                        break completion.exit_code();
                    }
                }
            };

            drop(stdout);
            log.event(format!("agent exited with status {status}"));
            let _ = channel.close().await;
            session.close().await;
            let _ = exit_tx.send(status);
        });

        Ok(AgentSession {
            channel: controller_end,
            exit: exit_rx,
        })
    }
}

/// Forward agent stdout to the controller end on its own task. A controller
/// that stops reading stalls only this task; `stop` ends it even mid-write.
/// Queued output is flushed after the sender is dropped.
fn spawn_stdout_pump<W>(
    mut writer: W,
    stop: CancellationToken,
    instance_id: String,
) -> (mpsc::UnboundedSender<Vec<u8>>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let handle = tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                chunk = rx.recv() => chunk,
                _ = stop.cancelled() => break,
            };
            let Some(chunk) = chunk else {
                break;
            };
            tokio::select! {
                written = writer.write_all(&chunk) => {
                    if let Err(e) = written {
                        debug!(instance_id = %instance_id, error = %e, "Controller channel closed");
                        break;
                    }
                }
                _ = stop.cancelled() => break,
            }
        }
        let _ = writer.shutdown().await;
    });
    (tx, handle)
}
