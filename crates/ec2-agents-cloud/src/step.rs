//! Pipeline step: provision one instance and wait until it runs

use crate::aws::Ec2Api;
use crate::aws::ec2::types::Tags;
use crate::cloud::CloudSet;
use crate::error::{ProvisionError, ProvisionResult};
use crate::planner::ProvisionOption;
use crate::registry::InstanceRecord;
use crate::ssh::AgentLauncher;
use crate::wait::{WaitConfig, WaitError, wait_for_resource};
use ec2_agents_common::LifecycleState;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, instrument};

/// What the step hands back to the pipeline
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProvisionedInstance {
    pub id: String,
    pub public_dns: Option<String>,
    pub private_ip: Option<String>,
    pub tags: Tags,
}

impl From<&InstanceRecord> for ProvisionedInstance {
    fn from(record: &InstanceRecord) -> Self {
        Self {
            id: record.key().to_string(),
            public_dns: record.network.public_dns.clone(),
            private_ip: record.network.private_ip.clone(),
            tags: record.tags.clone(),
        }
    }
}

/// Provision one instance of `template` in `cloud` and block until EC2
/// reports it running. `template` is a template id or a label. The agent may still be connecting when this returns.
#[instrument(skip(clouds))]
pub async fn ec2_step<C, L>(
    clouds: &CloudSet<C, L>,
    cloud: &str,
    template: &str,
) -> ProvisionResult<ProvisionedInstance>
where
    C: Ec2Api + 'static,
    L: AgentLauncher,
{
    let cloud = clouds
        .get_by_display_name(cloud)
        .map_err(|_| ProvisionError::InvalidArgument(format!("unknown cloud '{cloud}'")))?;
    let Some(template_config) = cloud.resolve_template(template) else {
        return Err(ProvisionError::InvalidArgument(format!(
            "cloud '{}' has no template '{template}'",
            cloud.name()
        )));
    };
    let describe = format!(
        "AWS template '{}' ({} {})",
        template_config.id, template_config.ami, template_config.instance_type
    );

    let records = cloud
        .provision(&template_config.id, 1, &[ProvisionOption::AllowCreate].into())
        .await?;
    let Some(record) = records.into_iter().next() else {
        return Err(ProvisionError::CapacityExhausted(format!(
            "no instance could be provisioned from {describe}"
        )));
    };

    let key = record.key().to_string();
    let spot_request_id = record.spot_request_id.clone();
    let registry = cloud.registry();
    // The driver gives up on pending after max_attempts running timeouts
    let timings = cloud.timings();
    let bound = timings.running_timeout() * timings.max_attempts.max(1);

    let running = wait_for_resource(
        &WaitConfig::fixed(Duration::from_secs(1), bound),
        None,
        || {
            let current = registry.snapshot().into_iter().find(|r| {
                r.key() == key
                    || (spot_request_id.is_some() && r.spot_request_id == spot_request_id)
            });
            let describe = describe.as_str();
            let key = key.as_str();
            async move {
                match current {
                    Some(r) if r.state == LifecycleState::Pending => Ok(None),
                    Some(r)
                        if matches!(
                            r.state,
                            LifecycleState::Booting
                                | LifecycleState::Connecting
                                | LifecycleState::Online
                        ) =>
                    {
                        Ok(Some(r))
                    }
                    Some(r) => Err(ProvisionError::BootTimeout {
                        instance_id: r.key().to_string(),
                        reason: format!("{} while starting from {describe}", r.state),
                    }),
                    None => Err(ProvisionError::BootTimeout {
                        instance_id: key.to_string(),
                        reason: format!("instance from {describe} is gone"),
                    }),
                }
            }
        },
        "instance running",
    )
    .await
    .map_err(|e| match e {
        WaitError::Timeout { elapsed, .. } => ProvisionError::BootTimeout {
            instance_id: key.clone(),
            reason: format!("instance from {describe} not running after {elapsed:?}"),
        },
        WaitError::Cancelled(_) => ProvisionError::Cancelled,
        WaitError::Check { source, .. } => source,
    })?;

    let provisioned = ProvisionedInstance::from(&running);
    info!(
        instance_id = %provisioned.id,
        public_dns = ?provisioned.public_dns,
        private_ip = ?provisioned.private_ip,
        "Instance running"
    );
    Ok(provisioned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{Cloud, CloudEnv};
    use crate::config::{FleetConfig, Timings};
    use crate::error::ErrorKind;
    use crate::node::{DemandLedger, LoggingController};
    use crate::ssh::KnownHosts;
    use crate::testing::{FAKE_AMI, FakeEc2, ScriptedLauncher};
    use ec2_agents_common::tags::{TAG_NAME, TAG_OWNER};
    use ec2_agents_test_utils::keys::{TEST_FINGERPRINT, TEST_PRIVATE_KEY_PEM};
    use std::sync::Arc;

    fn clouds(fake: &FakeEc2) -> CloudSet<FakeEc2, ScriptedLauncher> {
        let text = format!(
            r#"
            controller_url = "https://ci.example.com"
            [[clouds]]
            name = "main"
            region = "us-east-1"
            private_key = """{TEST_PRIVATE_KEY_PEM}"""
            [[clouds.templates]]
            id = "linux"
            ami = "{FAKE_AMI}"
            instance_type = "t3.large"
            labels = "linux"
            [[clouds.templates]]
            id = "linux-large"
            ami = "{FAKE_AMI}"
            instance_type = "m5.4xlarge"
            labels = "linux large"
            "#
        );
        let config = FleetConfig::from_toml_str(&text).unwrap().clouds.remove(0);
        let env = CloudEnv {
            controller_url: "https://ci.example.com".to_string(),
            timings: Arc::new(Timings::default()),
            controller: Arc::new(LoggingController::new()),
            demand: DemandLedger::new(),
            known_hosts: KnownHosts::new(),
            agent_payload: None,
        };
        let cloud = Cloud::new(
            config,
            Arc::new(fake.clone()),
            Arc::new(ScriptedLauncher::new()),
            env,
        )
        .unwrap();
        CloudSet::new(vec![cloud]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn returns_running_instance() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let set = clouds(&fake);
        let instance = ec2_step(&set, "main", "linux").await.unwrap();

        assert!(instance.id.starts_with("i-"));
        assert!(instance.public_dns.is_some());
        assert!(instance.private_ip.as_deref().unwrap().starts_with("10.0.0."));
        assert_eq!(instance.tags[TAG_OWNER], "demand_https://ci.example.com");
        assert!(instance.tags.contains_key(TAG_NAME));
        set.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn label_selects_matching_template() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let set = clouds(&fake);
        let instance = ec2_step(&set, "main", "large").await.unwrap();

        let record = set
            .get_by_display_name("main")
            .unwrap()
            .registry()
            .get(&instance.id)
            .unwrap();
        assert_eq!(record.template_id, "linux-large");
        set.shutdown_all().await;
    }

    #[tokio::test]
    async fn unknown_names_are_invalid_arguments() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        let set = clouds(&fake);
        let err = ec2_step(&set, "nowhere", "linux").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = ec2_step(&set, "main", "macos").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(fake.calls("RunInstances"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn instance_that_never_runs_fails_with_template_in_message() {
        let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
        fake.set_hold_pending(true);
        let set = clouds(&fake);
        let err = ec2_step(&set, "main", "linux").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BootTimeout);
        assert!(err.to_string().contains("AWS template 'linux'"));
        set.shutdown_all().await;
    }
}
