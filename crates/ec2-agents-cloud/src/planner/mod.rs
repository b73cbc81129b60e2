//! Template planner
//!
//! Turns "n more agents of this template" into EC2 launches:
//!
//! 1. resume stopped instances of the template
//! 2. check the cloud and template caps
//! 3. resolve the AMI, block devices, key pair and tags
//! 4. try each permitted subnet in order, moving on when EC2 reports
//!    insufficient capacity
//!
//! Launched instances are recorded in the registry as `Pending`; the launch
//! state machine takes it from there.

pub mod ami;
pub mod capacity;
pub mod request;
pub mod subnet;

use crate::aws::Ec2Api;
use crate::aws::ec2::types::Tags;
use crate::config::{CloudConfig, TemplateConfig};
use crate::error::{ProvisionError, ProvisionResult};
use crate::launch::state::{self, Event, IdleAction};
use crate::registry::{Flavor, InstanceRecord, InstanceRegistry};
use capacity::Headroom;
use chrono::Utc;
use ec2_agents_common::tags::TAG_NAME;
use ec2_agents_common::{LifecycleState, PrivateKey};
use request::{LaunchPlan, Launched};
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, strum::Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisionOption {
    /// Launch new instances when no stopped ones can be resumed
    AllowCreate,
    /// Launch new instances without resuming, ignoring the template cap
    ForceCreate,
    /// Surface the first failure instead of failing over or returning empty
    FailFast,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisionOptions(BTreeSet<ProvisionOption>);

impl ProvisionOptions {
    pub fn contains(&self, option: ProvisionOption) -> bool {
        self.0.contains(&option)
    }

    fn may_create(&self) -> bool {
        self.contains(ProvisionOption::AllowCreate) || self.contains(ProvisionOption::ForceCreate)
    }
}

impl<const N: usize> From<[ProvisionOption; N]> for ProvisionOptions {
    fn from(options: [ProvisionOption; N]) -> Self {
        Self(options.into_iter().collect())
    }
}

/// Launches instances for the templates of one cloud
pub struct Planner<C> {
    api: Arc<C>,
    registry: InstanceRegistry,
    cloud: Arc<CloudConfig>,
    owner: String,
    key: PrivateKey,
    /// Serializes cap checks with the registry inserts that follow them
    admission: Mutex<()>,
}

impl<C: Ec2Api> Planner<C> {
    pub fn new(
        api: Arc<C>,
        registry: InstanceRegistry,
        cloud: Arc<CloudConfig>,
        owner: String,
        key: PrivateKey,
    ) -> Self {
        Self {
            api,
            registry,
            cloud,
            owner,
            key,
            admission: Mutex::new(()),
        }
    }

    /// Hold while checking caps and inserting records outside `provision`.
    pub async fn admission(&self) -> MutexGuard<'_, ()> {
        self.admission.lock().await
    }

    pub fn headroom(&self, template: &TemplateConfig) -> Headroom {
        Headroom::of(&self.registry, &self.cloud, template)
    }

    /// Provide up to `n` instances of `template`.
    ///
    /// Returns the resumed and launched records. An empty result means caps
    /// were reached or every subnet lacked capacity; the reason is logged.
    /// With [`ProvisionOption::FailFast`] both cases are errors instead.
    #[instrument(skip_all, fields(cloud = %self.cloud.name, template = %template.id, n = n))]
    pub async fn provision(
        &self,
        template: &TemplateConfig,
        n: u32,
        options: &ProvisionOptions,
    ) -> ProvisionResult<Vec<InstanceRecord>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let _admission = self.admission().await;
        let force = options.contains(ProvisionOption::ForceCreate);
        let fail_fast = options.contains(ProvisionOption::FailFast);

        let mut provided = if force {
            Vec::new()
        } else {
            self.resume(template, n).await?
        };
        let remaining = n.saturating_sub(u32::try_from(provided.len()).unwrap_or(n));
        if remaining == 0 || !options.may_create() {
            return Ok(provided);
        }

        let headroom = self.headroom(template);
        if !headroom.admits(remaining, force) {
            info!(
                requested = remaining,
                cloud_headroom = headroom.cloud,
                template_headroom = headroom.template,
                "Instance cap reached"
            );
            if fail_fast {
                return Err(ProvisionError::CapacityExhausted(format!(
                    "template '{}' of cloud '{}' is at its instance cap",
                    template.id, self.cloud.name
                )));
            }
            return Ok(provided);
        }

        provided.extend(self.launch(template, remaining, fail_fast).await?);
        Ok(provided)
    }

    /// Start stopped instances of the template, at most `n`.
    async fn resume(
        &self,
        template: &TemplateConfig,
        n: u32,
    ) -> ProvisionResult<Vec<InstanceRecord>> {
        let stopped: Vec<InstanceRecord> = self
            .registry
            .by_state(LifecycleState::Resumable)
            .into_iter()
            .filter(|r| r.template_id == template.id && r.instance_id.is_some())
            .take(usize::try_from(n).unwrap_or(usize::MAX))
            .collect();
        if stopped.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = stopped.iter().map(|r| r.key().to_string()).collect();
        self.api.start_instances(&ids).await?;
        info!(instances = ?ids, "Resumed stopped instances");

        let idle = IdleAction::from_stop_on_terminate(template.stop_on_terminate);
        let mut resumed = Vec::new();
        for id in &ids {
            match state::apply(&self.registry, id, Event::Demand, idle) {
                Ok(record) => resumed.push(record),
                Err(e) => warn!(instance_id = %id, error = %e, "Resumed instance changed state"),
            }
        }
        Ok(resumed)
    }

    async fn launch(
        &self,
        template: &TemplateConfig,
        n: u32,
        fail_fast: bool,
    ) -> ProvisionResult<Vec<InstanceRecord>> {
        let image = ami::resolve_image(self.api.as_ref(), template).await?;
        let plan = LaunchPlan {
            count: i32::try_from(n).unwrap_or(i32::MAX),
            key_name: subnet::key_pair_name(self.api.as_ref(), template, &self.key).await?,
            block_devices: ami::merge_block_devices(&image.block_devices, &template.block_devices),
            tags: request::launch_tags(template, &self.owner, &self.cloud.name),
        };
        let placements = subnet::placements(self.api.as_ref(), template).await?;

        let mut attempt = 0u32;
        let mut reasons = Vec::new();
        for placement in &placements {
            attempt += 1;
            let groups =
                subnet::security_group_ids(self.api.as_ref(), template, placement.vpc_id())
                    .await?;
            let spec = request::launch_spec(template, &plan, placement.subnet_id(), groups);

            match request::submit(self.api.as_ref(), template, spec).await {
                Ok(launched) if launched.is_empty() => {
                    reasons.push(format!(
                        "{}: EC2 launched nothing",
                        placement.subnet_id().unwrap_or("default VPC")
                    ));
                }
                Ok(launched) => {
                    return Ok(self
                        .record(template, launched, &plan.tags, placement.subnet_id(), attempt)
                        .await);
                }
                Err(e) if e.is_insufficient_capacity() && !fail_fast => {
                    warn!(
                        subnet = ?placement.subnet_id(),
                        attempt,
                        error = %e,
                        "Insufficient capacity, trying next subnet"
                    );
                    reasons.push(format!(
                        "{}: {e}",
                        placement.subnet_id().unwrap_or("default VPC")
                    ));
                }
                Err(e) => return Err(e.into()),
            }
        }

        warn!(
            attempts = attempt,
            reasons = %reasons.join("; "),
            "Every subnet exhausted, nothing launched"
        );
        Ok(Vec::new())
    }

    /// Register launched instances or spot requests as `Pending` records.
    async fn record(
        &self,
        template: &TemplateConfig,
        launched: Launched,
        tags: &Tags,
        subnet_id: Option<&str>,
        attempt: u32,
    ) -> Vec<InstanceRecord> {
        let labels: BTreeSet<String> = template.label_set().into_iter().map(str::to_string).collect();
        let now = Utc::now();
        let mut records = Vec::new();

        match launched {
            Launched::OnDemand(instances) => {
                for instance in instances {
                    let mut record = InstanceRecord::new(
                        &self.cloud.name,
                        &template.id,
                        labels.clone(),
                        Flavor::OnDemand,
                    );
                    record.instance_id = Some(instance.instance_id.clone());
                    record.tags = tags.clone();
                    record.observe(&instance, now);
                    if let Some(name) = request::apply_default_name(self.api.as_ref(), template, &instance.instance_id).await {
                        record.tags.insert(TAG_NAME.to_string(), name);
                    }
                    records.push(record);
                }
            }
            Launched::Spot(requests) => {
                for request in requests {
                    let mut record = InstanceRecord::new(
                        &self.cloud.name,
                        &template.id,
                        labels.clone(),
                        Flavor::Spot,
                    );
                    record.spot_request_id = Some(request.request_id);
                    record.subnet_id = subnet_id.map(str::to_string);
                    record.tags = tags.clone();
                    records.push(record);
                }
            }
        }

        let mut inserted = Vec::with_capacity(records.len());
        let mut seen = HashSet::new();
        for mut record in records {
            record.attempt = attempt;
            record.log.event(format!(
                "launched {} ({}) in {} on attempt {attempt}",
                record.key(),
                record.flavor,
                subnet_id.unwrap_or("the default VPC")
            ));
            if !seen.insert(record.key().to_string()) {
                continue;
            }
            match self.registry.insert(record.clone()) {
                Ok(()) => inserted.push(record),
                Err(e) => warn!(key = %record.key(), error = %e, "Launched instance already recorded"),
            }
        }
        debug!(records = inserted.len(), attempt, "Recorded launched instances");
        inserted
    }
}
