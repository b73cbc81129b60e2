//! In-memory test doubles
//!
//! [`FakeEc2`] implements [`Ec2Api`] over a small simulated region:
//! launched instances report `pending` on the first describe and `running`
//! afterwards, stopping and terminating instances settle the same way.
//! Errors can be queued per operation or pinned to a subnet.
//! [`ScriptedLauncher`] implements [`AgentLauncher`] without any network.

use crate::aws::ec2::types::{
    Filter, ImageDescription, InstanceDescription, InstanceQuery, KeyPairDescription, LaunchSpec,
    NetworkInfo, RegionDescription, SecurityGroupDescription, SpotRequestDescription,
    SpotRequestFilter, SpotRequestPage, SpotRequestState, SpotSpec, SubnetDescription, Tags,
};
use crate::aws::{Ec2Api, IaasError, IaasResult};
use crate::error::{ProvisionError, ProvisionResult};
use crate::log_buffer::NodeLog;
use crate::ssh::{AgentLauncher, AgentSession, LaunchTarget};
use async_trait::async_trait;
use chrono::Utc;
use ec2_agents_common::RemoteState;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::DuplexStream;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

/// Image id registered by [`FakeEc2::with_defaults`]
pub const FAKE_AMI: &str = "ami-0fake0000000000001";

#[derive(Default)]
struct State {
    regions: Vec<RegionDescription>,
    images: HashMap<String, ImageDescription>,
    subnets: Vec<SubnetDescription>,
    security_groups: Vec<SecurityGroupDescription>,
    key_pairs: Vec<KeyPairDescription>,
    instances: BTreeMap<String, InstanceDescription>,
    spot_requests: Vec<SpotRequestDescription>,
    /// Repeat the last request of each page at the start of the next
    spot_page_overlap: bool,
    /// Leave open spot requests unfulfilled
    hold_spot: bool,
    /// Keep launched instances pending
    hold_pending: bool,
    errors: HashMap<&'static str, VecDeque<IaasError>>,
    subnet_errors: HashMap<String, IaasError>,
    password_data: HashMap<String, (String, u32)>,
    console_output: HashMap<String, String>,
    calls: HashMap<&'static str, u32>,
    launches: Vec<LaunchSpec>,
    spot_specs: Vec<SpotSpec>,
    /// Launch spec behind each spot request
    spot_launches: HashMap<String, LaunchSpec>,
    terminated: Vec<String>,
    next_id: u64,
}

impl State {
    fn call(&mut self, op: &'static str) -> IaasResult<()> {
        *self.calls.entry(op).or_insert(0) += 1;
        match self.errors.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}-{:017x}", self.next_id)
    }

    fn new_instance(&mut self, spec: &LaunchSpec, spot_request_id: Option<String>) -> InstanceDescription {
        let instance_id = self.next_id("i");
        let subnet = spec
            .subnet_id
            .as_ref()
            .and_then(|id| self.subnets.iter().find(|s| &s.subnet_id == id));
        let octet = self.next_id % 250 + 2;
        InstanceDescription {
            instance_id: instance_id.clone(),
            state: RemoteState::Pending,
            instance_type: Some(spec.instance_type.clone()),
            image_id: Some(spec.image_id.clone()),
            subnet_id: spec.subnet_id.clone(),
            vpc_id: subnet.and_then(|s| s.vpc_id.clone()),
            availability_zone: subnet
                .and_then(|s| s.availability_zone.clone())
                .or_else(|| spec.availability_zone.clone()),
            network: NetworkInfo {
                public_dns: Some(format!("ec2-203-0-113-{octet}.compute-1.amazonaws.com")),
                private_dns: Some(format!("ip-10-0-0-{octet}.ec2.internal")),
                public_ip: Some(format!("203.0.113.{octet}")),
                private_ip: Some(format!("10.0.0.{octet}")),
            },
            launch_time: Some(Utc::now()),
            tags: if spot_request_id.is_some() {
                Tags::new()
            } else {
                spec.tags.clone()
            },
            spot_request_id,
            key_name: Some(spec.key_name.clone()),
            state_reason: None,
        }
    }

    /// Advance every transitional state by one step.
    fn settle(&mut self) {
        let hold_pending = self.hold_pending;
        for instance in self.instances.values_mut() {
            instance.state = match instance.state {
                RemoteState::Pending if !hold_pending => RemoteState::Running,
                RemoteState::Stopping => RemoteState::Stopped,
                RemoteState::ShuttingDown => RemoteState::Terminated,
                other => other,
            };
        }
    }

    fn fulfil_spot(&mut self) {
        if self.hold_spot {
            return;
        }
        let open: Vec<usize> = self
            .spot_requests
            .iter()
            .enumerate()
            .filter(|(_, r)| r.state == SpotRequestState::Open)
            .map(|(i, _)| i)
            .collect();
        for i in open {
            let request_id = self.spot_requests[i].request_id.clone();
            let Some(spec) = self.spot_launches.get(&request_id).cloned() else {
                continue;
            };
            let instance = self.new_instance(&spec, Some(request_id));
            self.spot_requests[i].state = SpotRequestState::Active;
            self.spot_requests[i].instance_id = Some(instance.instance_id.clone());
            self.spot_requests[i].status_code = Some("fulfilled".to_string());
            self.instances.insert(instance.instance_id.clone(), instance);
        }
    }
}

fn matches_filter(filter: &Filter, field: impl Fn(&str) -> Option<String>) -> bool {
    field(&filter.name).is_some_and(|value| filter.values.iter().any(|v| v == &value))
}

fn instance_field(instance: &InstanceDescription, name: &str) -> Option<String> {
    match name {
        "instance-id" => Some(instance.instance_id.clone()),
        "subnet-id" => instance.subnet_id.clone(),
        "instance-state-name" => Some(instance.state.to_string()),
        "availability-zone" => instance.availability_zone.clone(),
        tag => tag
            .strip_prefix("tag:")
            .and_then(|k| instance.tags.get(k).cloned()),
    }
}

/// Simulated EC2 region
#[derive(Clone, Default)]
pub struct FakeEc2 {
    state: Arc<Mutex<State>>,
}

impl std::fmt::Debug for FakeEc2 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeEc2").finish_non_exhaustive()
    }
}

impl FakeEc2 {
    pub fn new() -> Self {
        Self::default()
    }

    /// A region with one EBS-backed image, two subnets in different zones
    /// (`subnet-a` in us-east-1a, `subnet-b` in us-east-1b), a security
    /// group named `agents` and the key pair `ci-key` with `fingerprint`.
    pub fn with_defaults(fingerprint: &str) -> Self {
        let fake = Self::new();
        {
            let mut state = fake.lock();
            state.regions.push(RegionDescription {
                region_name: "us-east-1".to_string(),
                endpoint: Some("ec2.us-east-1.amazonaws.com".to_string()),
            });
            state.images.insert(
                FAKE_AMI.to_string(),
                ImageDescription {
                    image_id: FAKE_AMI.to_string(),
                    root_device_type: Some("ebs".to_string()),
                    root_device_name: Some("/dev/xvda".to_string()),
                    block_devices: vec![crate::aws::ec2::types::BlockDeviceSpec {
                        device_name: "/dev/xvda".to_string(),
                        snapshot_id: Some("snap-0fake".to_string()),
                        volume_size_gib: Some(8),
                        volume_type: Some("gp2".to_string()),
                        delete_on_termination: Some(true),
                        ..Default::default()
                    }],
                    windows: false,
                },
            );
            for (id, zone) in [("subnet-a", "us-east-1a"), ("subnet-b", "us-east-1b")] {
                state.subnets.push(SubnetDescription {
                    subnet_id: id.to_string(),
                    vpc_id: Some("vpc-1".to_string()),
                    availability_zone: Some(zone.to_string()),
                    available_ip_count: Some(250),
                });
            }
            state.security_groups.push(SecurityGroupDescription {
                group_id: "sg-0agents".to_string(),
                group_name: "agents".to_string(),
                vpc_id: Some("vpc-1".to_string()),
            });
            state.key_pairs.push(KeyPairDescription {
                key_name: "ci-key".to_string(),
                fingerprint: Some(fingerprint.to_string()),
            });
        }
        fake
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_image(&self, image: ImageDescription) {
        self.lock().images.insert(image.image_id.clone(), image);
    }

    pub fn add_subnet(&self, subnet: SubnetDescription) {
        self.lock().subnets.push(subnet);
    }

    /// Insert an instance as if launched by someone else
    pub fn add_instance(&self, instance: InstanceDescription) {
        self.lock()
            .instances
            .insert(instance.instance_id.clone(), instance);
    }

    pub fn add_spot_request(&self, request: SpotRequestDescription) {
        self.lock().spot_requests.push(request);
    }

    /// Fail the next call of `op` (e.g. `"RunInstances"`) with `err`
    pub fn fail_next(&self, op: &'static str, err: IaasError) {
        self.lock().errors.entry(op).or_default().push_back(err);
    }

    /// Fail every launch into `subnet_id` with `err`
    pub fn fail_subnet(&self, subnet_id: &str, err: IaasError) {
        self.lock().subnet_errors.insert(subnet_id.to_string(), err);
    }

    pub fn set_hold_pending(&self, hold: bool) {
        self.lock().hold_pending = hold;
    }

    pub fn set_hold_spot(&self, hold: bool) {
        self.lock().hold_spot = hold;
    }

    pub fn set_spot_page_overlap(&self, overlap: bool) {
        self.lock().spot_page_overlap = overlap;
    }

    /// Password data appears after `after_calls` empty responses
    pub fn set_password_data(&self, instance_id: &str, data: &str, after_calls: u32) {
        self.lock()
            .password_data
            .insert(instance_id.to_string(), (data.to_string(), after_calls));
    }

    pub fn set_console_output(&self, instance_id: &str, output: &str) {
        self.lock()
            .console_output
            .insert(instance_id.to_string(), output.to_string());
    }

    pub fn set_state(&self, instance_id: &str, state: RemoteState) {
        if let Some(instance) = self.lock().instances.get_mut(instance_id) {
            instance.state = state;
        }
    }

    /// Remove an instance entirely, as EC2 does some time after termination
    pub fn forget_instance(&self, instance_id: &str) {
        self.lock().instances.remove(instance_id);
    }

    pub fn calls(&self, op: &str) -> u32 {
        self.lock().calls.get(op).copied().unwrap_or(0)
    }

    pub fn launches(&self) -> Vec<LaunchSpec> {
        self.lock().launches.clone()
    }

    pub fn spot_specs(&self) -> Vec<SpotSpec> {
        self.lock().spot_specs.clone()
    }

    pub fn instance(&self, instance_id: &str) -> Option<InstanceDescription> {
        self.lock().instances.get(instance_id).cloned()
    }

    pub fn instances(&self) -> Vec<InstanceDescription> {
        self.lock().instances.values().cloned().collect()
    }

    /// Ids passed to TerminateInstances, in call order
    pub fn terminated(&self) -> Vec<String> {
        self.lock().terminated.clone()
    }

    pub fn spot_requests(&self) -> Vec<SpotRequestDescription> {
        self.lock().spot_requests.clone()
    }
}

impl Ec2Api for FakeEc2 {
    async fn describe_regions(&self) -> IaasResult<Vec<RegionDescription>> {
        let mut state = self.lock();
        state.call("DescribeRegions")?;
        Ok(state.regions.clone())
    }

    async fn describe_images(&self, image_ids: &[String]) -> IaasResult<Vec<ImageDescription>> {
        let mut state = self.lock();
        state.call("DescribeImages")?;
        let mut images = Vec::new();
        for id in image_ids {
            match state.images.get(id) {
                Some(image) => images.push(image.clone()),
                None => {
                    return Err(IaasError::NotFound {
                        code: "InvalidAMIID.NotFound".to_string(),
                        message: format!("The image id '[{id}]' does not exist"),
                    });
                }
            }
        }
        Ok(images)
    }

    async fn describe_instances(
        &self,
        query: &InstanceQuery,
    ) -> IaasResult<Vec<InstanceDescription>> {
        let mut state = self.lock();
        state.call("DescribeInstances")?;
        let result = state
            .instances
            .values()
            .filter(|instance| match query {
                InstanceQuery::Ids(ids) => ids.contains(&instance.instance_id),
                InstanceQuery::Filtered(filters) => filters
                    .iter()
                    .all(|f| matches_filter(f, |name| instance_field(instance, name))),
                InstanceQuery::All => true,
            })
            .cloned()
            .collect();
        state.settle();
        Ok(result)
    }

    async fn describe_key_pairs(&self) -> IaasResult<Vec<KeyPairDescription>> {
        let mut state = self.lock();
        state.call("DescribeKeyPairs")?;
        Ok(state.key_pairs.clone())
    }

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> IaasResult<Vec<SecurityGroupDescription>> {
        let mut state = self.lock();
        state.call("DescribeSecurityGroups")?;
        Ok(state
            .security_groups
            .iter()
            .filter(|g| {
                filters.iter().all(|f| {
                    matches_filter(f, |name| match name {
                        "group-name" => Some(g.group_name.clone()),
                        "group-id" => Some(g.group_id.clone()),
                        "vpc-id" => g.vpc_id.clone(),
                        _ => None,
                    })
                })
            })
            .cloned()
            .collect())
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> IaasResult<Vec<SubnetDescription>> {
        let mut state = self.lock();
        state.call("DescribeSubnets")?;
        Ok(state
            .subnets
            .iter()
            .filter(|s| {
                filters.iter().all(|f| {
                    matches_filter(f, |name| match name {
                        "subnet-id" => Some(s.subnet_id.clone()),
                        "vpc-id" => s.vpc_id.clone(),
                        "availability-zone" => s.availability_zone.clone(),
                        _ => None,
                    })
                })
            })
            .cloned()
            .collect())
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> IaasResult<Vec<InstanceDescription>> {
        let mut state = self.lock();
        state.call("RunInstances")?;
        state.launches.push(spec.clone());
        if let Some(err) = spec
            .subnet_id
            .as_ref()
            .and_then(|s| state.subnet_errors.get(s))
        {
            return Err(err.clone());
        }
        if !state.images.contains_key(&spec.image_id) {
            return Err(IaasError::NotFound {
                code: "InvalidAMIID.NotFound".to_string(),
                message: format!("The image id '[{}]' does not exist", spec.image_id),
            });
        }

        let mut launched = Vec::new();
        for _ in 0..spec.count.max(0) {
            let instance = state.new_instance(spec, None);
            state
                .instances
                .insert(instance.instance_id.clone(), instance.clone());
            launched.push(instance);
        }
        Ok(launched)
    }

    async fn terminate_instances(&self, ids: &[String]) -> IaasResult<()> {
        let mut state = self.lock();
        state.call("TerminateInstances")?;
        for id in ids {
            state.terminated.push(id.clone());
            if let Some(instance) = state.instances.get_mut(id) {
                if instance.state != RemoteState::Terminated {
                    instance.state = RemoteState::ShuttingDown;
                }
            }
        }
        Ok(())
    }

    async fn stop_instances(&self, ids: &[String]) -> IaasResult<()> {
        let mut state = self.lock();
        state.call("StopInstances")?;
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.state = RemoteState::Stopping;
            }
        }
        Ok(())
    }

    async fn start_instances(&self, ids: &[String]) -> IaasResult<()> {
        let mut state = self.lock();
        state.call("StartInstances")?;
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.state = RemoteState::Pending;
            }
        }
        Ok(())
    }

    async fn request_spot_instances(
        &self,
        spec: &SpotSpec,
    ) -> IaasResult<Vec<SpotRequestDescription>> {
        let mut state = self.lock();
        state.call("RequestSpotInstances")?;
        if let Some(err) = spec
            .launch
            .subnet_id
            .as_ref()
            .and_then(|s| state.subnet_errors.get(s))
        {
            return Err(err.clone());
        }
        state.spot_specs.push(spec.clone());

        let mut requests = Vec::new();
        for _ in 0..spec.launch.count.max(0) {
            let request = SpotRequestDescription {
                request_id: state.next_id("sir"),
                state: SpotRequestState::Open,
                instance_id: None,
                status_code: Some("pending-evaluation".to_string()),
                tags: spec.launch.tags.clone(),
            };
            state
                .spot_launches
                .insert(request.request_id.clone(), spec.launch.clone());
            state.spot_requests.push(request.clone());
            requests.push(request);
        }
        Ok(requests)
    }

    async fn describe_spot_instance_requests(
        &self,
        filter: &SpotRequestFilter,
        next_token: Option<String>,
        page_size: i32,
    ) -> IaasResult<SpotRequestPage> {
        let mut state = self.lock();
        state.call("DescribeSpotInstanceRequests")?;
        state.fulfil_spot();

        let matching: Vec<SpotRequestDescription> = state
            .spot_requests
            .iter()
            .filter(|r| filter.request_ids.is_empty() || filter.request_ids.contains(&r.request_id))
            .filter(|r| {
                filter.filters.iter().all(|f| {
                    matches_filter(f, |name| match name {
                        "state" => Some(r.state.to_string()),
                        tag => tag.strip_prefix("tag:").and_then(|k| r.tags.get(k).cloned()),
                    })
                })
            })
            .cloned()
            .collect();

        if !filter.request_ids.is_empty() {
            return Ok(SpotRequestPage {
                requests: matching,
                next_token: None,
            });
        }

        let size = usize::try_from(page_size.max(1)).unwrap_or(1);
        let start: usize = next_token.and_then(|t| t.parse().ok()).unwrap_or(0);
        let from = if state.spot_page_overlap && start > 0 {
            start - 1
        } else {
            start
        };
        let end = (start + size).min(matching.len());
        Ok(SpotRequestPage {
            requests: matching.get(from..end).unwrap_or_default().to_vec(),
            next_token: (end < matching.len()).then(|| end.to_string()),
        })
    }

    async fn cancel_spot_instance_requests(&self, ids: &[String]) -> IaasResult<()> {
        let mut state = self.lock();
        state.call("CancelSpotInstanceRequests")?;
        for request in state
            .spot_requests
            .iter_mut()
            .filter(|r| ids.contains(&r.request_id))
        {
            request.state = SpotRequestState::Cancelled;
        }
        Ok(())
    }

    async fn create_tags(&self, ids: &[String], tags: &Tags) -> IaasResult<()> {
        let mut state = self.lock();
        state.call("CreateTags")?;
        for id in ids {
            if let Some(instance) = state.instances.get_mut(id) {
                instance.tags.extend(tags.clone());
            }
        }
        Ok(())
    }

    async fn get_console_output(&self, instance_id: &str) -> IaasResult<Option<String>> {
        let mut state = self.lock();
        state.call("GetConsoleOutput")?;
        Ok(state.console_output.get(instance_id).cloned())
    }

    async fn get_password_data(&self, instance_id: &str) -> IaasResult<Option<String>> {
        let mut state = self.lock();
        state.call("GetPasswordData")?;
        match state.password_data.get_mut(instance_id) {
            Some((_, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Ok(None)
            }
            Some((data, _)) => Ok(Some(data.clone())),
            None => Ok(None),
        }
    }
}

/// How a scripted launch fails
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchFailure {
    Auth,
    Bootstrap,
    Timeout,
}

impl LaunchFailure {
    fn error(self, instance_id: &str) -> ProvisionError {
        let instance_id = instance_id.to_string();
        match self {
            Self::Auth => ProvisionError::AuthFailed {
                instance_id,
                reason: "publickey rejected".to_string(),
            },
            Self::Bootstrap => ProvisionError::BootstrapFailed {
                instance_id,
                reason: "`java -jar agent.jar` exited with 127".to_string(),
            },
            Self::Timeout => ProvisionError::SshTimeout {
                instance_id,
                reason: "handshake timed out".to_string(),
            },
        }
    }
}

/// Remote side of a scripted agent session
#[derive(Debug)]
pub struct ScriptedAgent {
    pub stdio: DuplexStream,
    exit: oneshot::Sender<i32>,
}

impl ScriptedAgent {
    /// End the remote agent with `status`
    pub fn exit(self, status: i32) {
        let _ = self.exit.send(status);
    }
}

#[derive(Default)]
struct LauncherState {
    /// Failed probes before SSH answers, per instance; `u32::MAX` never answers
    probe_failures: u32,
    probes: HashMap<String, u32>,
    launch_failures: VecDeque<LaunchFailure>,
    targets: Vec<LaunchTarget>,
    agents: HashMap<String, ScriptedAgent>,
}

/// [`AgentLauncher`] whose behaviour is set up by the test
#[derive(Clone, Default)]
pub struct ScriptedLauncher {
    state: Arc<Mutex<LauncherState>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, LauncherState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// SSH answers after `n` failed probes
    pub fn set_probe_failures(&self, n: u32) {
        self.lock().probe_failures = n;
    }

    pub fn fail_next_launch(&self, failure: LaunchFailure) {
        self.lock().launch_failures.push_back(failure);
    }

    pub fn targets(&self) -> Vec<LaunchTarget> {
        self.lock().targets.clone()
    }

    pub fn probes(&self, instance_id: &str) -> u32 {
        self.lock().probes.get(instance_id).copied().unwrap_or(0)
    }

    /// Take the remote end of a launched agent
    pub fn take_agent(&self, instance_id: &str) -> Option<ScriptedAgent> {
        self.lock().agents.remove(instance_id)
    }
}

#[async_trait]
impl AgentLauncher for ScriptedLauncher {
    async fn probe(&self, target: &LaunchTarget) -> ProvisionResult<bool> {
        let mut state = self.lock();
        let threshold = state.probe_failures;
        let probes = state.probes.entry(target.instance_id.clone()).or_insert(0);
        *probes += 1;
        Ok(*probes > threshold)
    }

    async fn launch(
        &self,
        target: &LaunchTarget,
        log: NodeLog,
        stop: CancellationToken,
    ) -> ProvisionResult<AgentSession> {
        let (exit_tx, exit_rx) = oneshot::channel();
        let (controller_end, agent_end) = tokio::io::duplex(1024);
        {
            let mut state = self.lock();
            state.targets.push(target.clone());
            if let Some(failure) = state.launch_failures.pop_front() {
                return Err(failure.error(&target.instance_id));
            }
            state.agents.insert(
                target.instance_id.clone(),
                ScriptedAgent {
                    stdio: agent_end,
                    exit: exit_tx,
                },
            );
        }
        log.event(format!("started `{}`", target.bootstrap_command));

        // A stopped session reports its exit like the SSH launcher does
        let launcher = self.clone();
        let instance_id = target.instance_id.clone();
        tokio::spawn(async move {
            stop.cancelled().await;
            if let Some(agent) = launcher.take_agent(&instance_id) {
                agent.exit(-1);
            }
        });

        Ok(AgentSession {
            channel: controller_end,
            exit: exit_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aws::describe_all_spot_requests;

    #[tokio::test]
    async fn instances_settle_on_describe() {
        let fake = FakeEc2::with_defaults("aa:bb");
        let spec = LaunchSpec {
            image_id: FAKE_AMI.to_string(),
            instance_type: "t3.micro".to_string(),
            count: 1,
            key_name: "ci-key".to_string(),
            subnet_id: Some("subnet-a".to_string()),
            availability_zone: None,
            security_group_ids: vec![],
            iam_instance_profile: None,
            user_data: None,
            block_devices: vec![],
            tags: Tags::new(),
            tenancy: Default::default(),
            ebs_optimized: false,
        };
        let launched = fake.run_instances(&spec).await.unwrap();
        let id = launched[0].instance_id.clone();
        assert_eq!(launched[0].availability_zone.as_deref(), Some("us-east-1a"));

        let query = InstanceQuery::Ids(vec![id.clone()]);
        assert_eq!(fake.describe_instances(&query).await.unwrap()[0].state, RemoteState::Pending);
        assert_eq!(fake.describe_instances(&query).await.unwrap()[0].state, RemoteState::Running);

        fake.terminate_instances(std::slice::from_ref(&id)).await.unwrap();
        assert_eq!(
            fake.describe_instances(&query).await.unwrap()[0].state,
            RemoteState::ShuttingDown
        );
        assert_eq!(
            fake.describe_instances(&query).await.unwrap()[0].state,
            RemoteState::Terminated
        );
    }

    #[tokio::test]
    async fn queued_errors_fire_once() {
        let fake = FakeEc2::new();
        fake.fail_next("DescribeKeyPairs", IaasError::transient("boom"));
        assert!(fake.describe_key_pairs().await.is_err());
        assert!(fake.describe_key_pairs().await.is_ok());
        assert_eq!(fake.calls("DescribeKeyPairs"), 2);
    }

    #[tokio::test]
    async fn spot_pages_overlap_but_aggregate_is_unique() {
        let fake = FakeEc2::new();
        fake.set_hold_spot(true);
        fake.set_spot_page_overlap(true);
        for i in 0..250 {
            fake.add_spot_request(SpotRequestDescription {
                request_id: format!("sir-{i:04}"),
                state: SpotRequestState::Open,
                instance_id: None,
                status_code: None,
                tags: Tags::new(),
            });
        }

        let all = describe_all_spot_requests(&fake, &SpotRequestFilter::default())
            .await
            .unwrap();
        assert_eq!(all.len(), 250);
        assert_eq!(all[0].request_id, "sir-0000");
        assert_eq!(all[249].request_id, "sir-0249");
        assert!(all.windows(2).all(|w| w[0].request_id < w[1].request_id));
        assert_eq!(fake.calls("DescribeSpotInstanceRequests"), 3);
    }
}
