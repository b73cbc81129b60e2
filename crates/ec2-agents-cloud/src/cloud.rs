//! Clouds and the cloud set
//!
//! A [`Cloud`] owns everything for one credentialed EC2 endpoint: its
//! client, registry, planner, reconciler and the driver tasks the reconciler
//! starts. Dropping out of service goes through [`Cloud::shutdown`], which
//! releases every instance the cloud owns.

use crate::aws::{AwsContext, Ec2Api, Ec2Client};
use crate::config::{CloudConfig, ConfigError, TemplateConfig, Timings};
use crate::error::{ProvisionError, ProvisionResult};
use crate::launch::driver::DriverContext;
use crate::node::{Controller, DemandLedger};
use crate::planner::{Planner, ProvisionOptions};
use crate::reconciler::{Reconciler, TickReport};
use crate::registry::{InstanceRecord, InstanceRegistry};
use crate::ssh::{AgentLauncher, KnownHosts, SshLauncher};
use chrono::Utc;
use ec2_agents_common::LifecycleState;
use ec2_agents_common::tags::owner_tag_value;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// What every cloud of a process shares
#[derive(Clone)]
pub struct CloudEnv {
    pub controller_url: String,
    pub timings: Arc<Timings>,
    pub controller: Arc<dyn Controller>,
    pub demand: DemandLedger,
    pub known_hosts: KnownHosts,
    pub agent_payload: Option<PathBuf>,
}

pub struct Cloud<C, L> {
    config: Arc<CloudConfig>,
    api: Arc<C>,
    registry: InstanceRegistry,
    timings: Arc<Timings>,
    planner: Arc<Planner<C>>,
    reconciler: Arc<Reconciler<C, L>>,
    demand: DemandLedger,
    shutdown: CancellationToken,
}

impl<C, L> std::fmt::Debug for Cloud<C, L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cloud")
            .field("name", &self.config.name)
            .field("region", &self.config.region)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Cloud<Ec2Client, SshLauncher> {
    /// Build a cloud talking to EC2 and launching agents over SSH.
    pub async fn connect(config: CloudConfig, env: CloudEnv) -> Result<Self, ConfigError> {
        let aws = AwsContext::for_cloud(&config).await;
        let api = Ec2Client::from_context(&aws).with_retry_policy(env.timings.retry_policy());
        let launcher = SshLauncher::new(env.known_hosts.clone(), &env.timings);
        Self::new(config, Arc::new(api), Arc::new(launcher), env)
    }
}

impl<C: Ec2Api + 'static, L: AgentLauncher> Cloud<C, L> {
    pub fn new(
        config: CloudConfig,
        api: Arc<C>,
        launcher: Arc<L>,
        env: CloudEnv,
    ) -> Result<Self, ConfigError> {
        let key = config.load_private_key()?;
        let config = Arc::new(config);
        let owner = owner_tag_value(&env.controller_url);
        let registry = InstanceRegistry::new();
        let shutdown = CancellationToken::new();

        let planner = Arc::new(Planner::new(
            api.clone(),
            registry.clone(),
            config.clone(),
            owner.clone(),
            key.clone(),
        ));
        let ctx = DriverContext {
            api: api.clone(),
            launcher,
            controller: env.controller,
            registry: registry.clone(),
            cloud: config.clone(),
            timings: env.timings.clone(),
            key,
            known_hosts: env.known_hosts,
            agent_payload: env.agent_payload,
        };
        let reconciler = Arc::new(Reconciler::new(
            ctx,
            planner.clone(),
            env.demand.clone(),
            owner,
            shutdown.child_token(),
        ));

        info!(
            cloud = %config.name,
            region = %config.region,
            templates = config.templates.len(),
            cap = config.instance_cap,
            "Cloud ready"
        );
        Ok(Self {
            config,
            api,
            registry,
            timings: env.timings,
            planner,
            reconciler,
            demand: env.demand,
            shutdown,
        })
    }

    /// Display name
    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CloudConfig {
        &self.config
    }

    pub fn registry(&self) -> &InstanceRegistry {
        &self.registry
    }

    pub fn timings(&self) -> &Timings {
        &self.timings
    }

    pub fn demand(&self) -> &DemandLedger {
        &self.demand
    }

    /// Template named by id, otherwise the most preferred template carrying
    /// `name` as a label.
    pub fn resolve_template(&self, name: &str) -> Option<&TemplateConfig> {
        self.config
            .template(name)
            .or_else(|| self.reconciler.candidates(Some(name)).into_iter().next())
    }

    /// Provision up to `n` instances of `template_id` now and start driving
    /// them.
    pub async fn provision(
        &self,
        template_id: &str,
        n: u32,
        options: &ProvisionOptions,
    ) -> ProvisionResult<Vec<InstanceRecord>> {
        let template = self.config.template(template_id).ok_or_else(|| {
            ProvisionError::InvalidArgument(format!(
                "cloud '{}' has no template '{template_id}'",
                self.config.name
            ))
        })?;
        let records = self.planner.provision(template, n, options).await?;
        self.reconciler.spawn_drivers();
        Ok(records)
    }

    /// Run one reconcile pass.
    pub async fn tick(&self) -> ProvisionResult<TickReport> {
        self.reconciler.tick().await
    }

    /// Start the periodic reconciler; it stops on [`Cloud::shutdown`].
    pub fn start(&self) -> JoinHandle<()> {
        let reconciler = self.reconciler.clone();
        let cancel = self.shutdown.clone();
        tokio::spawn(async move { reconciler.run(cancel).await })
    }

    /// Records with an attached agent
    pub fn list_online_nodes(&self) -> Vec<InstanceRecord> {
        self.registry.by_state(LifecycleState::Online)
    }

    /// Mark an online agent busy or idle. Idle time counts toward the
    /// template's idle termination.
    pub fn report_busy(&self, instance_id: &str, busy: bool) -> ProvisionResult<()> {
        self.registry
            .update(instance_id, |r| {
                r.idle_since = if busy { None } else { Some(Utc::now()) };
            })
            .map(|_| ())
            .map_err(|_| ProvisionError::NotFound(format!("instance {instance_id}")))
    }

    /// Stop the reconciler, terminate every instance through its driver and
    /// terminate whatever has no driver, stopped instances included.
    pub async fn shutdown(&self) {
        info!(cloud = %self.config.name, records = self.registry.len(), "Shutting down cloud");
        self.shutdown.cancel();
        self.reconciler.join_drivers().await;

        let leftover = self.registry.snapshot();
        let ids: Vec<String> = leftover
            .iter()
            .filter_map(|r| r.instance_id.clone())
            .collect();
        if !ids.is_empty() {
            if let Err(e) = self.api.terminate_instances(&ids).await {
                warn!(cloud = %self.config.name, instances = ?ids, error = %e, "Failed to terminate instances");
            }
        }
        let requests: Vec<String> = leftover
            .iter()
            .filter(|r| r.instance_id.is_none())
            .filter_map(|r| r.spot_request_id.clone())
            .collect();
        if !requests.is_empty() {
            if let Err(e) = self.api.cancel_spot_instance_requests(&requests).await {
                warn!(cloud = %self.config.name, requests = ?requests, error = %e, "Failed to cancel spot requests");
            }
        }
        for record in leftover {
            self.registry.remove(record.key());
        }
        info!(cloud = %self.config.name, "Cloud shut down");
    }
}

/// All configured clouds, addressed by display name
pub struct CloudSet<C, L> {
    clouds: Vec<Arc<Cloud<C, L>>>,
}

impl<C: Ec2Api + 'static, L: AgentLauncher> CloudSet<C, L> {
    pub fn new(clouds: Vec<Cloud<C, L>>) -> Result<Self, ConfigError> {
        let mut names = HashSet::new();
        for cloud in &clouds {
            if !names.insert(cloud.name().to_string()) {
                return Err(ConfigError::DuplicateCloud(cloud.name().to_string()));
            }
        }
        Ok(Self {
            clouds: clouds.into_iter().map(Arc::new).collect(),
        })
    }

    /// The cloud named `name`; `NotFound` when there is none, including
    /// when the set is empty.
    pub fn get_by_display_name(&self, name: &str) -> ProvisionResult<Arc<Cloud<C, L>>> {
        self.clouds
            .iter()
            .find(|c| c.name() == name)
            .cloned()
            .ok_or_else(|| ProvisionError::NotFound(format!("cloud '{name}'")))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Cloud<C, L>>> {
        self.clouds.iter()
    }

    pub fn len(&self) -> usize {
        self.clouds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clouds.is_empty()
    }

    /// Start every cloud's reconciler.
    pub fn start_all(&self) -> Vec<JoinHandle<()>> {
        self.clouds.iter().map(|c| c.start()).collect()
    }

    pub async fn shutdown_all(&self) {
        futures::future::join_all(self.clouds.iter().map(|c| c.shutdown())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::error::ErrorKind;
    use crate::node::LoggingController;
    use crate::planner::ProvisionOption;
    use crate::testing::{FAKE_AMI, FakeEc2, ScriptedLauncher};
    use ec2_agents_test_utils::keys::{TEST_FINGERPRINT, TEST_PRIVATE_KEY_PEM};

    fn env() -> CloudEnv {
        CloudEnv {
            controller_url: "https://ci.example.com".to_string(),
            timings: Arc::new(Timings::default()),
            controller: Arc::new(LoggingController::new()),
            demand: DemandLedger::new(),
            known_hosts: KnownHosts::new(),
            agent_payload: None,
        }
    }

    fn cloud(name: &str, fake: &FakeEc2) -> Cloud<FakeEc2, ScriptedLauncher> {
        let text = format!(
            r#"
            controller_url = "https://ci.example.com"
            [[clouds]]
            name = "{name}"
            region = "us-east-1"
            private_key = """{TEST_PRIVATE_KEY_PEM}"""
            [[clouds.templates]]
            id = "linux"
            ami = "{FAKE_AMI}"
            instance_type = "t3.large"
            labels = "linux"
            "#
        );
        let config = FleetConfig::from_toml_str(&text).unwrap().clouds.remove(0);
        Cloud::new(
            config,
            Arc::new(fake.clone()),
            Arc::new(ScriptedLauncher::new()),
            env(),
        )
        .unwrap()
    }

    #[test]
    fn lookup_by_display_name() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let set = CloudSet::new(vec![cloud("east", &fake), cloud("west", &fake)]).unwrap();
        assert_eq!(set.get_by_display_name("west").unwrap().name(), "west");
        assert_eq!(
            set.get_by_display_name("north").unwrap_err().kind(),
            ErrorKind::NotFound
        );

        let empty: CloudSet<FakeEc2, ScriptedLauncher> = CloudSet::new(vec![]).unwrap();
        assert_eq!(
            empty.get_by_display_name("east").unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let err = CloudSet::new(vec![cloud("east", &fake), cloud("east", &fake)]).unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateCloud(name) if name == "east"));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_terminates_everything() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let cloud = cloud("east", &fake);
        let records = cloud
            .provision("linux", 2, &[ProvisionOption::AllowCreate].into())
            .await
            .unwrap();
        assert_eq!(records.len(), 2);

        cloud.shutdown().await;
        assert!(cloud.registry().is_empty());
        let mut terminated = fake.terminated();
        terminated.sort();
        terminated.dedup();
        let mut launched: Vec<_> = records.iter().map(|r| r.key().to_string()).collect();
        launched.sort();
        assert_eq!(terminated, launched);
    }

    #[tokio::test]
    async fn unknown_template_is_invalid_argument() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let err = cloud("east", &fake)
            .provision("macos", 1, &[ProvisionOption::AllowCreate].into())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }
}
