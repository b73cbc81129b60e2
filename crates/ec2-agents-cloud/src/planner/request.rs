//! Launch request shapes and submission

use crate::aws::ec2::types::{
    BlockDeviceSpec, InstanceDescription, LaunchSpec, SpotRequestDescription, SpotSpec, Tags,
};
use crate::aws::{Ec2Api, IaasError};
use crate::config::TemplateConfig;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ec2_agents_common::tags::{TAG_CLOUD, TAG_NAME, TAG_OWNER, TAG_TEMPLATE, default_name};
use tracing::{info, warn};

/// Template tags plus the reserved ownership tags.
///
/// The reserved tags always win over template tags of the same key.
pub fn launch_tags(template: &TemplateConfig, owner: &str, cloud: &str) -> Tags {
    let mut tags = template.tags.clone();
    tags.insert(TAG_OWNER.to_string(), owner.to_string());
    tags.insert(TAG_CLOUD.to_string(), cloud.to_string());
    tags.insert(TAG_TEMPLATE.to_string(), template.id.clone());
    tags
}

/// Everything resolved for one launch, independent of the subnet
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    pub count: i32,
    pub key_name: String,
    pub block_devices: Vec<BlockDeviceSpec>,
    pub tags: Tags,
}

pub fn launch_spec(
    template: &TemplateConfig,
    plan: &LaunchPlan,
    subnet_id: Option<&str>,
    security_group_ids: Vec<String>,
) -> LaunchSpec {
    LaunchSpec {
        image_id: template.ami.clone(),
        instance_type: template.instance_type.clone(),
        count: plan.count,
        key_name: plan.key_name.clone(),
        subnet_id: subnet_id.map(str::to_string),
        // With a subnet the zone is implied
        availability_zone: match subnet_id {
            Some(_) => None,
            None => template.zone().map(str::to_string),
        },
        security_group_ids,
        iam_instance_profile: template
            .iam_instance_profile
            .clone()
            .filter(|p| !p.is_empty()),
        user_data: template
            .user_data
            .as_deref()
            .filter(|u| !u.is_empty())
            .map(|u| STANDARD.encode(u)),
        block_devices: plan.block_devices.clone(),
        tags: plan.tags.clone(),
        tenancy: template.tenancy,
        ebs_optimized: template.ebs_optimized,
    }
}

/// What a submitted request produced
#[derive(Debug, Clone)]
pub enum Launched {
    OnDemand(Vec<InstanceDescription>),
    Spot(Vec<SpotRequestDescription>),
}

impl Launched {
    pub fn is_empty(&self) -> bool {
        match self {
            Self::OnDemand(instances) => instances.is_empty(),
            Self::Spot(requests) => requests.is_empty(),
        }
    }
}

/// Submit `spec` as a spot request or an on-demand launch per the template.
///
/// A spot template with `fallback_to_on_demand` retries on-demand when the
/// spot market cannot serve the request.
pub async fn submit<C: Ec2Api>(
    api: &C,
    template: &TemplateConfig,
    spec: LaunchSpec,
) -> Result<Launched, IaasError> {
    let Some(spot) = &template.spot else {
        return run_on_demand(api, template, &spec).await;
    };

    let spot_spec = SpotSpec {
        launch: spec,
        max_price: spot.max_price.clone(),
        persistence: spot.persistence,
    };
    match api.request_spot_instances(&spot_spec).await {
        Ok(requests) => {
            info!(
                template = %template.id,
                requests = ?requests.iter().map(|r| r.request_id.as_str()).collect::<Vec<_>>(),
                subnet = ?spot_spec.launch.subnet_id,
                "Requested spot instances"
            );
            Ok(Launched::Spot(requests))
        }
        Err(e) if spot.fallback_to_on_demand && e.is_spot_unavailable() => {
            warn!(
                template = %template.id,
                error = %e,
                "Spot unavailable, falling back to on-demand"
            );
            run_on_demand(api, template, &spot_spec.launch).await
        }
        Err(e) => Err(e),
    }
}

async fn run_on_demand<C: Ec2Api>(
    api: &C,
    template: &TemplateConfig,
    spec: &LaunchSpec,
) -> Result<Launched, IaasError> {
    let instances = api.run_instances(spec).await?;
    info!(
        template = %template.id,
        instances = ?instances.iter().map(|i| i.instance_id.as_str()).collect::<Vec<_>>(),
        subnet = ?spec.subnet_id,
        "Launched on-demand instances"
    );
    Ok(Launched::OnDemand(instances))
}

/// Tag `instance_id` with the default `Name` unless the template sets one.
/// Returns the applied name.
pub async fn apply_default_name<C: Ec2Api>(
    api: &C,
    template: &TemplateConfig,
    instance_id: &str,
) -> Option<String> {
    if template.tags.contains_key(TAG_NAME) {
        return None;
    }
    let name = default_name(&template.id, instance_id);
    let tags = Tags::from([(TAG_NAME.to_string(), name.clone())]);
    match api.create_tags(&[instance_id.to_string()], &tags).await {
        Ok(()) => Some(name),
        Err(e) => {
            warn!(instance_id, error = %e, "Failed to apply Name tag");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FleetConfig;
    use crate::testing::{FAKE_AMI, FakeEc2};

    fn template(extra: &str) -> TemplateConfig {
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
            zone = "us-east-1a"
            user_data = "echo hi"
            tags = {{ team = "infra", jenkins_slave_type = "spoofed" }}
            {extra}
            "#
        );
        FleetConfig::from_toml_str(&text).unwrap().clouds[0].templates[0].clone()
    }

    fn plan(template: &TemplateConfig) -> LaunchPlan {
        LaunchPlan {
            count: 1,
            key_name: "ci-key".to_string(),
            block_devices: vec![],
            tags: launch_tags(template, "demand_https://ci.example.com", "main"),
        }
    }

    #[test]
    fn reserved_tags_override_template_tags() {
        let t = template("");
        let tags = launch_tags(&t, "demand_https://ci.example.com", "main");
        assert_eq!(tags[TAG_OWNER], "demand_https://ci.example.com");
        assert_eq!(tags[TAG_CLOUD], "main");
        assert_eq!(tags[TAG_TEMPLATE], "linux");
        assert_eq!(tags["team"], "infra");
    }

    #[test]
    fn spec_encodes_user_data_and_zone() {
        let t = template("");
        let without_subnet = launch_spec(&t, &plan(&t), None, vec![]);
        assert_eq!(without_subnet.user_data.as_deref(), Some("ZWNobyBoaQ=="));
        assert_eq!(without_subnet.availability_zone.as_deref(), Some("us-east-1a"));

        let with_subnet = launch_spec(&t, &plan(&t), Some("subnet-a"), vec!["sg-1".to_string()]);
        assert_eq!(with_subnet.availability_zone, None);
        assert_eq!(with_subnet.subnet_id.as_deref(), Some("subnet-a"));
        assert_eq!(with_subnet.security_group_ids, ["sg-1"]);
    }

    #[tokio::test]
    async fn spot_falls_back_to_on_demand() {
        let fake = FakeEc2::with_defaults("aa");
        fake.fail_next(
            "RequestSpotInstances",
            IaasError::Permanent {
                code: Some("InsufficientInstanceCapacity".to_string()),
                message: "no spot capacity".to_string(),
            },
        );
        let t = template(r#"spot = { max_price = "0.05", fallback_to_on_demand = true }"#);
        let launched = submit(&fake, &t, launch_spec(&t, &plan(&t), None, vec![]))
            .await
            .unwrap();
        assert!(matches!(launched, Launched::OnDemand(ref i) if i.len() == 1));
        assert_eq!(fake.calls("RunInstances"), 1);
    }

    #[tokio::test]
    async fn spot_without_fallback_surfaces_error() {
        let fake = FakeEc2::with_defaults("aa");
        fake.fail_next(
            "RequestSpotInstances",
            IaasError::Permanent {
                code: Some("SpotMaxPriceTooLow".to_string()),
                message: "bid too low".to_string(),
            },
        );
        let t = template(r#"spot = { max_price = "0.001" }"#);
        let err = submit(&fake, &t, launch_spec(&t, &plan(&t), None, vec![]))
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("SpotMaxPriceTooLow"));
        assert_eq!(fake.calls("RunInstances"), 0);
    }
}
