//! Per-instance launch driver
//!
//! One task per instance record. Each turn of the loop runs the step for
//! the record's current state, turns its outcome into an [`Event`] and
//! applies it through the transition table. A step is raced against events
//! from the reconciler and the task's cancellation token; whichever comes
//! first is applied and the in-flight step is dropped.

use super::state::{self, Event, IdleAction, TransitionError};
use crate::aws::ec2::types::{InstanceDescription, InstanceQuery, SpotRequestFilter};
use crate::aws::{Ec2Api, describe_all_spot_requests};
use crate::config::{CloudConfig, HostKeyVerification, Timings, TemplateConfig};
use crate::error::{ProvisionError, ProvisionResult};
use crate::node::{Controller, Node};
use crate::planner::request;
use crate::registry::{InstanceRecord, InstanceRegistry};
use crate::ssh::host_key::parse_console_host_keys;
use crate::ssh::{self, AgentLauncher, AgentSession, HostKey, KnownHosts, LaunchTarget, SshAuth};
use crate::wait::{WaitConfig, WaitError, wait_for_resource};
use chrono::Utc;
use ec2_agents_common::tags::default_name;
use ec2_agents_common::{LifecycleState, PrivateKey, RemoteState};
use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// Everything a driver needs from its cloud
pub struct DriverContext<C, L> {
    pub api: Arc<C>,
    pub launcher: Arc<L>,
    pub controller: Arc<dyn Controller>,
    pub registry: InstanceRegistry,
    pub cloud: Arc<CloudConfig>,
    pub timings: Arc<Timings>,
    pub key: PrivateKey,
    pub known_hosts: KnownHosts,
    pub agent_payload: Option<PathBuf>,
}

impl<C, L> Clone for DriverContext<C, L> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
            launcher: self.launcher.clone(),
            controller: self.controller.clone(),
            registry: self.registry.clone(),
            cloud: self.cloud.clone(),
            timings: self.timings.clone(),
            key: self.key.clone(),
            known_hosts: self.known_hosts.clone(),
            agent_payload: self.agent_payload.clone(),
        }
    }
}

/// Handle to a running driver task
#[derive(Debug)]
pub struct DriverHandle {
    key: Arc<Mutex<String>>,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl DriverHandle {
    /// Current registry key of the driven record. A spot record is re-keyed
    /// by its instance id once the request is fulfilled.
    pub fn key(&self) -> String {
        self.key.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Queue an event; false when the driver has exited.
    pub fn send(&self, event: Event) -> bool {
        self.events.send(event).is_ok()
    }

    /// Request termination of the instance.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) {
        if let Err(e) = self.task.await {
            warn!(error = %e, "Driver task failed");
        }
    }
}

/// Start driving the record under `key`. Cancelling `parent` terminates it.
pub fn spawn<C, L>(ctx: DriverContext<C, L>, key: &str, parent: &CancellationToken) -> DriverHandle
where
    C: Ec2Api + 'static,
    L: AgentLauncher,
{
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let cancel = parent.child_token();
    let shared_key = Arc::new(Mutex::new(key.to_string()));
    let span = info_span!("driver", cloud = %ctx.cloud.name, key = %key);

    let driver = Driver {
        ctx,
        key: shared_key.clone(),
    };
    let inbox = Inbox {
        events: events_rx,
        cancel: cancel.clone(),
        cancel_seen: false,
    };
    let task = tokio::spawn(driver.run(inbox).instrument(span));

    DriverHandle {
        key: shared_key,
        events: events_tx,
        cancel,
        task,
    }
}

enum Step {
    Event(Event),
    Exit,
}

/// Outcome of a bounded wait inside a step
enum Waited {
    TimedOut,
    Failed(ProvisionError),
    /// The record was removed or re-keyed by someone else
    RecordGone,
}

impl From<WaitError<ProvisionError>> for Waited {
    fn from(err: WaitError<ProvisionError>) -> Self {
        match err {
            WaitError::Timeout { .. } => Self::TimedOut,
            WaitError::Cancelled(_) => Self::Failed(ProvisionError::Cancelled),
            WaitError::Check { source, .. } => Self::Failed(source),
        }
    }
}

struct Inbox {
    events: mpsc::UnboundedReceiver<Event>,
    cancel: CancellationToken,
    cancel_seen: bool,
}

impl Inbox {
    /// Run `step` unless an external event or cancellation arrives first.
    async fn race<F: Future<Output = Step>>(&mut self, step: F) -> Step {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled(), if !self.cancel_seen => {
                self.cancel_seen = true;
                Step::Event(Event::ExplicitTerminate)
            }
            Some(event) = self.events.recv() => Step::Event(event),
            step = step => step,
        }
    }
}

/// A started agent and the node handed to the controller
struct AgentRun {
    node: Arc<Node>,
    exit: Option<oneshot::Receiver<i32>>,
}

/// State carried between steps of one driver
#[derive(Default)]
struct Progress {
    target: Option<LaunchTarget>,
    agent: Option<AgentRun>,
}

struct Driver<C, L> {
    ctx: DriverContext<C, L>,
    key: Arc<Mutex<String>>,
}

impl<C: Ec2Api + 'static, L: AgentLauncher> Driver<C, L> {
    async fn run(self, mut inbox: Inbox) {
        let mut progress = Progress::default();
        loop {
            let Some(record) = self.record() else {
                debug!(key = %self.key(), "Record removed, driver exiting");
                self.release_agent(&mut progress, "record removed").await;
                break;
            };
            let idle = self.idle_action(&record);

            let step = match record.state {
                LifecycleState::Terminated => {
                    self.finish(&record, &mut progress).await;
                    break;
                }
                LifecycleState::Resumable => Step::Exit,
                LifecycleState::Failed => Step::Event(Event::ExplicitTerminate),
                _ => inbox.race(self.step(&record, &mut progress)).await,
            };
            let Step::Event(event) = step else {
                debug!(key = %self.key(), state = %record.state, "Driver exiting");
                break;
            };

            match state::apply(&self.ctx.registry, &self.key(), event, idle) {
                Ok(_) | Err(TransitionError::NotPermitted { .. }) => {}
                Err(TransitionError::Registry(e)) => {
                    debug!(key = %self.key(), error = %e, "Record changed concurrently");
                }
            }
        }
    }

    async fn step(&self, record: &InstanceRecord, progress: &mut Progress) -> Step {
        let event = match record.state {
            LifecycleState::Pending | LifecycleState::Booting | LifecycleState::Connecting => {
                let Some(template) = self.ctx.cloud.template(&record.template_id) else {
                    warn!(template = %record.template_id, "Template no longer configured");
                    record
                        .log
                        .event(format!("template {} no longer configured", record.template_id));
                    return Step::Event(Event::ExplicitTerminate);
                };
                match record.state {
                    LifecycleState::Pending => self.pending(template).await,
                    LifecycleState::Booting => self.booting(template, progress).await,
                    _ => self.connecting(template, progress).await,
                }
            }
            LifecycleState::Online => self.online(record, progress).await,
            LifecycleState::Stopping => self.stopping(record, progress).await,
            LifecycleState::Terminating => self.terminating(record, progress).await,
            LifecycleState::Resumable | LifecycleState::Failed | LifecycleState::Terminated => {
                return Step::Exit;
            }
        };
        Step::Event(event)
    }

    fn key(&self) -> String {
        self.key.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn record(&self) -> Option<InstanceRecord> {
        self.ctx.registry.get(&self.key())
    }

    fn max_attempts(&self) -> u32 {
        self.ctx.timings.max_attempts.max(1)
    }

    fn idle_action(&self, record: &InstanceRecord) -> IdleAction {
        let stop = self
            .ctx
            .cloud
            .template(&record.template_id)
            .is_some_and(|t| t.stop_on_terminate);
        IdleAction::from_stop_on_terminate(stop)
    }

    fn log_error(&self, record: &InstanceRecord, err: &ProvisionError) {
        warn!(key = %record.key(), kind = %err.kind(), error = %err.cause_chain(), "Launch step failed");
        record.log.event(format!("error: {}", err.cause_chain()));
    }

    /// Count an expired step budget against the record.
    fn bump_attempt(&self, what: &str, step_attempt: u32) {
        let max = self.max_attempts();
        match self.ctx.registry.update(&self.key(), |r| r.attempt += 1) {
            Ok(record) => {
                info!(
                    key = %record.key(),
                    attempt = record.attempt,
                    step_attempt,
                    max,
                    what,
                    "Step budget expired"
                );
                record
                    .log
                    .event(format!("{what} timed out (attempt {step_attempt}/{max})"));
            }
            Err(e) => debug!(error = %e, "Cannot count attempt"),
        }
    }

    fn ec2_poll(&self, timeout: Duration) -> WaitConfig {
        WaitConfig {
            timeout,
            ..WaitConfig::default()
        }
    }

    /// Poll DescribeInstances until `done` holds for the instance (`None`
    /// when EC2 no longer reports it).
    async fn await_instance<F>(
        &self,
        instance_id: &str,
        timeout: Duration,
        resource: &str,
        done: F,
    ) -> Result<Option<InstanceDescription>, Waited>
    where
        F: Fn(Option<&InstanceDescription>) -> bool + Send + Sync,
    {
        let api = self.ctx.api.as_ref();
        let query = InstanceQuery::Ids(vec![instance_id.to_string()]);
        let query = &query;
        let done = &done;

        let found = wait_for_resource(
            &self.ec2_poll(timeout),
            None,
            || async move {
                let found = match api.describe_instances(query).await {
                    Ok(found) => found.into_iter().find(|i| i.instance_id == instance_id),
                    Err(e) if e.is_not_found() => None,
                    Err(e) if e.is_retryable() => return Ok(None),
                    Err(e) => return Err(ProvisionError::from(e)),
                };
                Ok(done(found.as_ref()).then_some(found))
            },
            resource,
        )
        .await?;

        if let Some(instance) = &found {
            let key = self.key();
            if let Err(e) = self
                .ctx
                .registry
                .update(&key, |r| r.observe(instance, Utc::now()))
            {
                debug!(key, error = %e, "Record changed while waiting on EC2");
                return Err(Waited::RecordGone);
            }
        }
        Ok(found)
    }

    /// PENDING: wait for the spot request (if any) and for EC2 to report
    /// `running`, within `running_timeout` per attempt.
    async fn pending(&self, template: &TemplateConfig) -> Event {
        let max = self.max_attempts();
        for step_attempt in 1..=max {
            let Some(record) = self.record() else {
                return Event::Gone;
            };
            let result = match self.fulfilled_instance(&record, template).await {
                Ok(instance_id) => {
                    self.await_instance(
                        &instance_id,
                        self.ctx.timings.running_timeout(),
                        "instance running",
                        |i| {
                            i.is_some_and(|i| {
                                i.state == RemoteState::Running || i.state.is_gone()
                            })
                        },
                    )
                    .await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(Some(instance)) if instance.state == RemoteState::Running => {
                    record.log.event(format!(
                        "instance {} running in {}",
                        instance.instance_id,
                        instance.availability_zone.as_deref().unwrap_or("unknown zone")
                    ));
                    return Event::Running;
                }
                Ok(instance) => {
                    let reason = instance
                        .and_then(|i| i.state_reason)
                        .unwrap_or_else(|| "terminated before running".to_string());
                    warn!(key = %self.key(), reason = %reason, "Instance failed to boot");
                    record.log.event(format!("boot failed: {reason}"));
                    return Event::BootFail;
                }
                Err(Waited::TimedOut) => self.bump_attempt("waiting for running", step_attempt),
                Err(Waited::RecordGone) => return Event::Gone,
                Err(Waited::Failed(e)) => {
                    self.log_error(&record, &e);
                    return Event::Fail;
                }
            }
        }
        Event::NotRunningAfterLimit
    }

    /// The record's instance id, waiting for its spot request when needed.
    async fn fulfilled_instance(
        &self,
        record: &InstanceRecord,
        template: &TemplateConfig,
    ) -> Result<String, Waited> {
        if let Some(instance_id) = &record.instance_id {
            return Ok(instance_id.clone());
        }
        let Some(request_id) = record.spot_request_id.clone() else {
            return Err(Waited::Failed(ProvisionError::NotFound(format!(
                "instance of record {}",
                record.key()
            ))));
        };

        let api = self.ctx.api.as_ref();
        let filter = SpotRequestFilter::ids([request_id.clone()]);
        let filter = &filter;
        let wanted = request_id.as_str();
        let instance_id = wait_for_resource(
            &self.ec2_poll(self.ctx.timings.running_timeout()),
            None,
            || async move {
                let requests = match describe_all_spot_requests(api, filter).await {
                    Ok(requests) => requests,
                    Err(e) if e.is_retryable() || e.is_not_found() => return Ok(None),
                    Err(e) => return Err(ProvisionError::from(e)),
                };
                match requests.into_iter().find(|r| r.request_id == wanted) {
                    Some(request) if request.instance_id.is_some() => Ok(request.instance_id),
                    Some(request) if request.state.is_dead() => {
                        Err(ProvisionError::CapacityExhausted(format!(
                            "spot request {wanted} is {}: {}",
                            request.state,
                            request.status_code.unwrap_or_default()
                        )))
                    }
                    _ => Ok(None),
                }
            },
            "spot fulfilment",
        )
        .await?;

        let assigned = self
            .ctx
            .registry
            .assign_instance(&request_id, &instance_id)
            .map_err(|e| {
                debug!(spot_request_id = %request_id, error = %e, "Spot record changed concurrently");
                Waited::RecordGone
            })?;
        *self.key.lock().unwrap_or_else(PoisonError::into_inner) = instance_id.clone();
        info!(spot_request_id = %request_id, instance_id = %instance_id, "Spot request fulfilled");
        assigned
            .log
            .event(format!("spot request {request_id} fulfilled by {instance_id}"));

        // Spot instances do not inherit the request's tags
        if let Err(e) = api
            .create_tags(std::slice::from_ref(&instance_id), &assigned.tags)
            .await
        {
            warn!(instance_id = %instance_id, error = %e, "Failed to tag spot instance");
        }
        if let Some(name) = request::apply_default_name(api, template, &instance_id).await {
            if let Err(e) = self.ctx.registry.update(&instance_id, |r| {
                r.tags.insert(ec2_agents_common::tags::TAG_NAME.to_string(), name);
            }) {
                debug!(instance_id = %instance_id, error = %e, "Record changed while naming");
                return Err(Waited::RecordGone);
            }
        }
        Ok(instance_id)
    }

    /// BOOTING: resolve credentials and host keys, then probe SSH every
    /// `ssh_probe_interval` within `boot_timeout` per attempt.
    async fn booting(&self, template: &TemplateConfig, progress: &mut Progress) -> Event {
        let Some(record) = self.record() else {
            return Event::Gone;
        };
        let target = match self.prepare_target(&record, template).await {
            Ok(target) => target,
            Err(_) if self.record().is_none() => return Event::Gone,
            Err(e) => {
                self.log_error(&record, &e);
                return if e.is_permanent() {
                    Event::BootFail
                } else {
                    Event::SshTimeout
                };
            }
        };

        let config = WaitConfig::fixed(
            self.ctx.timings.ssh_probe_interval(),
            self.ctx.timings.boot_timeout(template),
        );
        let launcher = self.ctx.launcher.as_ref();
        let probe_target = &target;
        for step_attempt in 1..=self.max_attempts() {
            let result = wait_for_resource(
                &config,
                None,
                || async move { launcher.probe(probe_target).await.map(|ok| ok.then_some(())) },
                "ssh",
            )
            .await;

            match result {
                Ok(()) => {
                    record
                        .log
                        .event(format!("ssh answered on {}:{}", target.host, target.port));
                    progress.target = Some(target);
                    return Event::SshOk;
                }
                Err(WaitError::Timeout { .. }) => self.bump_attempt("ssh probe", step_attempt),
                Err(WaitError::Cancelled(_)) => return Event::ExplicitTerminate,
                Err(WaitError::Check { source, .. }) => {
                    self.log_error(&record, &source);
                    return Event::BootFail;
                }
            }
        }
        Event::SshTimeout
    }

    async fn prepare_target(
        &self,
        record: &InstanceRecord,
        template: &TemplateConfig,
    ) -> ProvisionResult<LaunchTarget> {
        let instance_id = record
            .instance_id
            .clone()
            .ok_or_else(|| ProvisionError::NotFound(format!("instance of record {}", record.key())))?;
        let host = template
            .connection_strategy
            .resolve(&record.network)
            .ok_or_else(|| ProvisionError::BootstrapFailed {
                instance_id: instance_id.clone(),
                reason: format!("instance has no {} address", template.connection_strategy),
            })?;
        self.ctx
            .registry
            .update(record.key(), |r| r.endpoint = Some(host.clone()))
            .map_err(|e| {
                debug!(key = %record.key(), error = %e, "Record changed while preparing");
                ProvisionError::NotFound(e.to_string())
            })?;

        let auth = match (&template.windows_password, template.windows) {
            (Some(password), true) => SshAuth::Password(password.clone()),
            (None, true) => {
                record.log.event("waiting for the Windows administrator password");
                let password = ssh::windows::fetch_password(
                    self.ctx.api.as_ref(),
                    &instance_id,
                    &self.ctx.key,
                    self.ctx.timings.ssh_probe_interval(),
                    self.ctx.timings.boot_timeout(template),
                    &CancellationToken::new(),
                )
                .await?;
                SshAuth::Password(password)
            }
            (_, false) => SshAuth::Key(self.ctx.key.clone()),
        };
        let console_host_keys = self
            .console_host_keys(&instance_id, template)
            .await?;

        Ok(LaunchTarget {
            host,
            port: template.ssh_port,
            user: template.admin_user().to_string(),
            auth,
            host_key_policy: template.host_key_verification,
            console_host_keys,
            remote_fs: template.remote_fs.clone(),
            payload: self.ctx.agent_payload.clone(),
            bootstrap_command: ssh::bootstrap_command(
                &template.remote_fs,
                template.init_script.as_deref(),
                template.bootstrap_command.as_deref(),
            ),
            windows: template.windows,
            instance_id,
        })
    }

    /// Host keys from the console output. The hard policy waits for them;
    /// the soft policy takes whatever is there now.
    async fn console_host_keys(
        &self,
        instance_id: &str,
        template: &TemplateConfig,
    ) -> ProvisionResult<Vec<HostKey>> {
        let api = self.ctx.api.as_ref();
        match template.host_key_verification {
            HostKeyVerification::Off | HostKeyVerification::AcceptNew => Ok(Vec::new()),
            HostKeyVerification::CheckNewSoft => match api.get_console_output(instance_id).await {
                Ok(output) => Ok(output.map(|o| parse_console_host_keys(&o)).unwrap_or_default()),
                Err(e) => {
                    debug!(instance_id, error = %e, "Console output unavailable");
                    Ok(Vec::new())
                }
            },
            HostKeyVerification::CheckNewHard => wait_for_resource(
                &WaitConfig::fixed(
                    self.ctx.timings.ssh_probe_interval(),
                    self.ctx.timings.boot_timeout(template),
                ),
                None,
                || async move {
                    match api.get_console_output(instance_id).await {
                        Ok(output) => Ok(output
                            .map(|o| parse_console_host_keys(&o))
                            .filter(|keys| !keys.is_empty())),
                        Err(e) if e.is_retryable() => Ok(None),
                        Err(e) => Err(ProvisionError::from(e)),
                    }
                },
                "console host keys",
            )
            .await
            .map_err(|e| match e {
                WaitError::Timeout { elapsed, .. } => ProvisionError::SshTimeout {
                    instance_id: instance_id.to_string(),
                    reason: format!("no host keys in console output after {elapsed:?}"),
                },
                WaitError::Cancelled(_) => ProvisionError::Cancelled,
                WaitError::Check { source, .. } => source,
            }),
        }
    }

    /// CONNECTING: start the agent within `launch_timeout` per attempt and
    /// hand the node to the controller.
    async fn connecting(&self, template: &TemplateConfig, progress: &mut Progress) -> Event {
        let Some(record) = self.record() else {
            return Event::Gone;
        };
        let target = match progress.target.clone() {
            Some(target) => target,
            None => match self.prepare_target(&record, template).await {
                Ok(target) => target,
                Err(_) if self.record().is_none() => return Event::Gone,
                Err(e) => {
                    self.log_error(&record, &e);
                    return Event::ConnectFail;
                }
            },
        };

        let timeout = self.ctx.timings.launch_timeout(template);
        for step_attempt in 1..=self.max_attempts() {
            let stop = CancellationToken::new();
            let launched = tokio::time::timeout(
                timeout,
                self.ctx
                    .launcher
                    .launch(&target, record.log.clone(), stop.clone()),
            )
            .await;

            match launched {
                Ok(Ok(session)) => {
                    return self
                        .attach(&record, template, &target, session, stop, progress)
                        .await;
                }
                Ok(Err(e)) if e.is_permanent() => {
                    self.log_error(&record, &e);
                    return Event::ConnectFail;
                }
                Ok(Err(e)) => {
                    self.log_error(&record, &e);
                    self.bump_attempt("agent launch", step_attempt);
                }
                Err(_) => {
                    stop.cancel();
                    self.bump_attempt("agent launch", step_attempt);
                }
            }
        }
        Event::ConnectFail
    }

    async fn attach(
        &self,
        record: &InstanceRecord,
        template: &TemplateConfig,
        target: &LaunchTarget,
        session: AgentSession,
        stop: CancellationToken,
        progress: &mut Progress,
    ) -> Event {
        let name = default_name(&template.id, &target.instance_id);
        let node = Arc::new(Node::new(
            name.clone(),
            record.labels.clone(),
            target.instance_id.clone(),
            record.cloud.clone(),
            record.template_id.clone(),
            session.channel,
            record.log.clone(),
            stop.clone(),
        ));

        match self.ctx.controller.attach(node.clone()).await {
            Ok(()) => {
                record.log.event(format!("node {name} attached"));
                progress.agent = Some(AgentRun {
                    node,
                    exit: Some(session.exit),
                });
                Event::Bootstrapped
            }
            Err(e) => {
                stop.cancel();
                warn!(node = %name, error = %e, "Controller rejected node");
                record.log.event(format!("controller rejected node: {e:#}"));
                Event::ConnectFail
            }
        }
    }

    /// ONLINE: idle and explicit termination arrive as events; an agent
    /// that exits on its own ends the instance.
    async fn online(&self, record: &InstanceRecord, progress: &mut Progress) -> Event {
        let Some(agent) = progress.agent.as_mut() else {
            warn!(key = %record.key(), "Online record without an agent session");
            record.log.event("agent session lost");
            return Event::ExplicitTerminate;
        };
        let status = match agent.exit.as_mut() {
            Some(exit) => exit.await.unwrap_or(-1),
            None => -1,
        };
        agent.exit = None;
        info!(node = %agent.node.name, status, "Agent exited");
        record.log.event(format!("agent exited with status {status}"));
        Event::ExplicitTerminate
    }

    async fn release_agent(&self, progress: &mut Progress, cause: &str) {
        progress.target = None;
        if let Some(agent) = progress.agent.take() {
            agent.node.disconnect(cause);
            self.ctx.controller.detach(&agent.node.name).await;
        }
    }

    /// STOPPING: stop the instance and wait for EC2 to report `stopped`.
    async fn stopping(&self, record: &InstanceRecord, progress: &mut Progress) -> Event {
        self.release_agent(progress, "idle, stopping instance").await;
        let Some(instance_id) = record.instance_id.clone() else {
            return Event::Fail;
        };
        if let Err(e) = self
            .ctx
            .api
            .stop_instances(std::slice::from_ref(&instance_id))
            .await
        {
            self.log_error(record, &e.into());
            return Event::Fail;
        }

        match self
            .await_instance(
                &instance_id,
                self.ctx.timings.running_timeout(),
                "instance stopped",
                |i| i.is_none_or(|i| i.state == RemoteState::Stopped || i.state.is_gone()),
            )
            .await
        {
            Ok(Some(instance)) if instance.state == RemoteState::Stopped => Event::Stopped,
            Ok(_) | Err(Waited::RecordGone) => Event::Gone,
            Err(Waited::TimedOut) => {
                record.log.event("instance did not stop in time");
                Event::Fail
            }
            Err(Waited::Failed(e)) => {
                self.log_error(record, &e);
                Event::Fail
            }
        }
    }

    /// TERMINATING: cancel the spot request, terminate the instance and wait
    /// until EC2 confirms. After `max_attempts` unconfirmed tries the record
    /// is released anyway; the reconciler reaps whatever is left.
    async fn terminating(&self, record: &InstanceRecord, progress: &mut Progress) -> Event {
        self.release_agent(progress, "instance terminating").await;
        let api = self.ctx.api.as_ref();

        if let Some(request_id) = &record.spot_request_id {
            if let Err(e) = api
                .cancel_spot_instance_requests(std::slice::from_ref(request_id))
                .await
            {
                if !e.is_not_found() {
                    warn!(spot_request_id = %request_id, error = %e, "Failed to cancel spot request");
                }
            }
        }
        let Some(instance_id) = record.instance_id.clone() else {
            return Event::Gone;
        };

        for step_attempt in 1..=self.max_attempts() {
            match api
                .terminate_instances(std::slice::from_ref(&instance_id))
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => return Event::Gone,
                Err(e) => {
                    self.log_error(record, &e.into());
                    self.bump_attempt("terminate", step_attempt);
                    continue;
                }
            }

            match self
                .await_instance(
                    &instance_id,
                    self.ctx.timings.running_timeout(),
                    "instance termination",
                    |i| i.is_none_or(|i| i.state.is_gone()),
                )
                .await
            {
                Ok(_) | Err(Waited::RecordGone) => return Event::Gone,
                Err(Waited::TimedOut) => self.bump_attempt("termination", step_attempt),
                Err(Waited::Failed(e)) => {
                    self.log_error(record, &e);
                    self.bump_attempt("termination", step_attempt);
                }
            }
        }

        warn!(instance_id = %instance_id, "Termination not confirmed, releasing record");
        record.log.event("termination not confirmed, releasing record");
        Event::Gone
    }

    /// TERMINATED: drop everything held for the instance.
    async fn finish(&self, record: &InstanceRecord, progress: &mut Progress) {
        self.release_agent(progress, "instance terminated").await;
        if let Some(instance_id) = &record.instance_id {
            self.ctx.known_hosts.forget(instance_id);
        }
        self.ctx.registry.remove(record.key());
        info!(key = %record.key(), template = %record.template_id, "Instance record released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::node::LoggingController;
    use crate::planner::{Planner, ProvisionOption};
    use crate::registry::Flavor;
    use crate::testing::{FAKE_AMI, FakeEc2, LaunchFailure, ScriptedLauncher};
    use ec2_agents_common::tags::{TAG_NAME, owner_tag_value};
    use ec2_agents_test_utils::keys::{TEST_FINGERPRINT, TEST_PRIVATE_KEY_PEM};

    struct Harness {
        fake: FakeEc2,
        launcher: ScriptedLauncher,
        controller: Arc<LoggingController>,
        ctx: DriverContext<FakeEc2, ScriptedLauncher>,
        planner: Planner<FakeEc2>,
    }

    fn harness(extra: &str) -> Harness {
        let text = format!(
            r#"
            controller_url = "https://ci.example.com"
            [[clouds]]
            name = "main"
            region = "us-east-1"
            [[clouds.templates]]
            id = "linux"
            ami = "{FAKE_AMI}"
            instance_type = "t3.large"
            labels = "linux"
            subnets = ["subnet-a"]
            host_key_verification = "accept-new"
            {extra}
            "#
        );
        let mut fleet = FleetConfig::from_toml_str(&text).unwrap();
        let cloud = Arc::new(fleet.clouds.remove(0));
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let launcher = ScriptedLauncher::new();
        let controller = Arc::new(LoggingController::new());
        let registry = InstanceRegistry::new();
        let key = PrivateKey::new(TEST_PRIVATE_KEY_PEM);
        let api = Arc::new(fake.clone());

        let ctx = DriverContext {
            api: api.clone(),
            launcher: Arc::new(launcher.clone()),
            controller: controller.clone(),
            registry: registry.clone(),
            cloud: cloud.clone(),
            timings: Arc::new(fleet.timings.clone()),
            key: key.clone(),
            known_hosts: KnownHosts::new(),
            agent_payload: None,
        };
        let planner = Planner::new(
            api,
            registry,
            cloud,
            owner_tag_value("https://ci.example.com"),
            key,
        );
        Harness {
            fake,
            launcher,
            controller,
            ctx,
            planner,
        }
    }

    impl Harness {
        async fn launch(&self) -> String {
            let template = self.ctx.cloud.templates[0].clone();
            let records = self
                .planner
                .provision(&template, 1, &[ProvisionOption::AllowCreate].into())
                .await
                .unwrap();
            records[0].key().to_string()
        }

        async fn wait_until<F>(&self, what: &str, mut done: F)
        where
            F: FnMut(&InstanceRegistry) -> bool,
        {
            for _ in 0..10_000 {
                if done(&self.ctx.registry) {
                    return;
                }
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            panic!("timed out waiting for {what}");
        }

        async fn wait_for_state(&self, key: &str, state: LifecycleState) {
            self.wait_until(&format!("{key} to reach {state}"), |r| {
                r.get(key).is_some_and(|rec| rec.state == state)
            })
            .await;
        }

        async fn wait_removed(&self, key: &str) {
            self.wait_until(&format!("{key} to be removed"), |r| !r.contains(key))
                .await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn drives_instance_online_and_terminates_on_idle() {
        let h = harness("");
        let key = h.launch().await;
        let handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());

        h.wait_for_state(&key, LifecycleState::Online).await;
        let nodes = h.controller.nodes();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].name, default_name("linux", &key));
        assert!(nodes[0].labels.contains("linux"));

        let target = &h.launcher.targets()[0];
        assert!(target.host.ends_with(".compute-1.amazonaws.com"));
        assert_eq!(target.user, "ec2-user");
        assert_eq!(
            target.bootstrap_command,
            "cd /tmp/ec2-agent && java -jar /tmp/ec2-agent/agent.jar"
        );

        assert!(handle.send(Event::Idle));
        h.wait_removed(&key).await;
        assert_eq!(h.fake.terminated(), [key.clone()]);
        assert!(h.controller.nodes().is_empty());
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn record_removed_while_pending_stops_the_driver() {
        let h = harness("");
        h.fake.set_hold_pending(true);
        let key = h.launch().await;
        let log = h.ctx.registry.get(&key).unwrap().log;
        let handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.ctx.registry.remove(&key).unwrap();
        h.fake.set_hold_pending(false);
        handle.join().await;

        let contents = log.contents();
        assert!(!contents.contains("running in"), "{contents}");
        assert!(!contents.contains("error:"), "{contents}");
        assert!(h.launcher.targets().is_empty());
        assert!(!h.ctx.registry.contains(&key));
    }

    #[tokio::test(start_paused = true)]
    async fn agent_exit_terminates_instance() {
        let h = harness("");
        let key = h.launch().await;
        let _handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());
        h.wait_for_state(&key, LifecycleState::Online).await;
        let log = h.ctx.registry.get(&key).unwrap().log;

        h.launcher.take_agent(&key).unwrap().exit(0);
        h.wait_removed(&key).await;
        assert_eq!(h.fake.terminated(), [key.clone()]);
        assert!(log.contents().contains("agent exited with status 0"));
        assert!(log.contents().contains("TERMINATING -> TERMINATED (gone)"));
    }

    #[tokio::test(start_paused = true)]
    async fn node_disconnect_terminates_instance() {
        let h = harness("");
        let key = h.launch().await;
        let _handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());
        h.wait_for_state(&key, LifecycleState::Online).await;

        h.controller.nodes()[0].disconnect("build finished");
        h.wait_removed(&key).await;
        assert_eq!(h.fake.terminated(), [key]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_with_stop_policy_becomes_resumable() {
        let h = harness("stop_on_terminate = true");
        let key = h.launch().await;
        let handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());
        h.wait_for_state(&key, LifecycleState::Online).await;

        handle.send(Event::Idle);
        h.wait_for_state(&key, LifecycleState::Resumable).await;
        assert_eq!(h.fake.calls("StopInstances"), 1);
        assert!(h.fake.terminated().is_empty());
        h.wait_until("driver exit", |_| handle.is_finished()).await;
    }

    #[tokio::test(start_paused = true)]
    async fn ssh_never_answering_fails_after_max_attempts() {
        let h = harness("");
        h.launcher.set_probe_failures(u32::MAX);
        let key = h.launch().await;
        let log = h.ctx.registry.get(&key).unwrap().log;
        let _handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());

        h.wait_removed(&key).await;
        assert_eq!(h.fake.terminated(), [key.clone()]);
        assert!(h.launcher.targets().is_empty());
        let contents = log.contents();
        assert!(contents.contains("ssh probe timed out (attempt 3/3)"));
        assert!(contents.contains("BOOTING -> FAILED (ssh_timeout)"));
        assert!(contents.contains("FAILED -> TERMINATING (explicit_terminate)"));
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_launch_error_fails_without_retry() {
        let h = harness("");
        h.launcher.fail_next_launch(LaunchFailure::Auth);
        let key = h.launch().await;
        let log = h.ctx.registry.get(&key).unwrap().log;
        let _handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());

        h.wait_removed(&key).await;
        assert_eq!(h.launcher.targets().len(), 1);
        let contents = log.contents();
        assert!(contents.contains("publickey rejected"));
        assert!(contents.contains("CONNECTING -> FAILED (connect_fail)"));
    }

    #[tokio::test(start_paused = true)]
    async fn transient_launch_error_is_retried() {
        let h = harness("");
        h.launcher.fail_next_launch(LaunchFailure::Timeout);
        let key = h.launch().await;
        let _handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());

        h.wait_for_state(&key, LifecycleState::Online).await;
        assert_eq!(h.launcher.targets().len(), 2);
        assert_eq!(h.ctx.registry.get(&key).unwrap().attempt, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_terminates_from_pending() {
        let h = harness("");
        h.fake.set_hold_pending(true);
        let key = h.launch().await;
        let parent = CancellationToken::new();
        let handle = spawn(h.ctx.clone(), &key, &parent);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.ctx.registry.get(&key).unwrap().state, LifecycleState::Pending);

        parent.cancel();
        h.wait_removed(&key).await;
        assert_eq!(h.fake.terminated(), [key]);
        handle.join().await;
    }

    #[tokio::test(start_paused = true)]
    async fn pending_past_limit_fails() {
        let h = harness("");
        h.fake.set_hold_pending(true);
        let key = h.launch().await;
        let log = h.ctx.registry.get(&key).unwrap().log;
        let _handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());

        h.wait_removed(&key).await;
        let contents = log.contents();
        assert!(contents.contains("waiting for running timed out (attempt 3/3)"));
        assert!(contents.contains("PENDING -> FAILED (not_running_after_limit)"));
    }

    #[tokio::test(start_paused = true)]
    async fn spot_record_is_rekeyed_and_tagged() {
        let h = harness(r#"spot = { max_price = "0.05" }"#);
        let request_key = h.launch().await;
        assert!(request_key.starts_with("sir-"));
        let handle = spawn(h.ctx.clone(), &request_key, &CancellationToken::new());

        h.wait_until("spot fulfilment", |r| {
            r.by_state(LifecycleState::Online)
                .iter()
                .any(|rec| rec.flavor == Flavor::Spot)
        })
        .await;
        let instance_id = handle.key();
        assert!(instance_id.starts_with("i-"));
        assert!(!h.ctx.registry.contains(&request_key));

        let instance = h.fake.instance(&instance_id).unwrap();
        assert_eq!(instance.tags[TAG_NAME], default_name("linux", &instance_id));
        assert_eq!(
            instance.tags[ec2_agents_common::tags::TAG_OWNER],
            "demand_https://ci.example.com"
        );

        handle.cancel();
        h.wait_removed(&instance_id).await;
        assert_eq!(
            h.fake.spot_requests()[0].state,
            crate::aws::ec2::types::SpotRequestState::Cancelled
        );
    }

    #[tokio::test(start_paused = true)]
    async fn windows_template_uses_decrypted_password() {
        let h = harness("windows = true");
        let key = h.launch().await;
        h.fake.set_password_data(
            &key,
            ec2_agents_test_utils::keys::TEST_PASSWORD_DATA,
            1,
        );
        let _handle = spawn(h.ctx.clone(), &key, &CancellationToken::new());

        h.wait_for_state(&key, LifecycleState::Online).await;
        let target = &h.launcher.targets()[0];
        assert_eq!(target.user, "Administrator");
        assert!(matches!(
            &target.auth,
            SshAuth::Password(p) if p == ec2_agents_test_utils::keys::TEST_PASSWORD
        ));
    }
}
