//! Network placement: subnet rotation, security groups and key pair

use crate::aws::Ec2Api;
use crate::aws::ec2::types::{Filter, SubnetDescription};
use crate::config::TemplateConfig;
use crate::error::{ProvisionError, ProvisionResult};
use ec2_agents_common::PrivateKey;
use tracing::{debug, warn};

/// Where one launch attempt goes
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Placement {
    /// `None` lets EC2 pick a subnet of the default VPC
    pub subnet: Option<SubnetDescription>,
}

impl Placement {
    pub fn subnet_id(&self) -> Option<&str> {
        self.subnet.as_ref().map(|s| s.subnet_id.as_str())
    }

    pub fn vpc_id(&self) -> Option<&str> {
        self.subnet.as_ref().and_then(|s| s.vpc_id.as_deref())
    }
}

/// The template's subnets that lie in a permitted zone, in template order.
///
/// A template without subnets yields one placement in the default VPC.
/// Subnets EC2 does not know are skipped with a warning; when none remain
/// the template is invalid.
pub async fn placements<C: Ec2Api>(
    api: &C,
    template: &TemplateConfig,
) -> ProvisionResult<Vec<Placement>> {
    if template.subnets.is_empty() {
        return Ok(vec![Placement::default()]);
    }

    let described = api
        .describe_subnets(&[Filter::new("subnet-id", template.subnets.iter().cloned())])
        .await?;

    let mut candidates = Vec::new();
    for id in &template.subnets {
        let Some(subnet) = described.iter().find(|s| &s.subnet_id == id) else {
            warn!(template = %template.id, subnet = %id, "Subnet not found, skipping");
            continue;
        };
        let permitted = template
            .zone()
            .is_none_or(|zone| subnet.availability_zone.as_deref() == Some(zone));
        if !permitted {
            debug!(
                template = %template.id,
                subnet = %id,
                zone = ?subnet.availability_zone,
                "Subnet outside the template zone"
            );
            continue;
        }
        candidates.push(Placement {
            subnet: Some(subnet.clone()),
        });
    }

    if candidates.is_empty() {
        return Err(ProvisionError::invalid_template(
            &template.id,
            match template.zone() {
                Some(zone) => format!("no configured subnet is in zone {zone}"),
                None => "none of the configured subnets exist".to_string(),
            },
        ));
    }
    Ok(candidates)
}

/// Security group ids for a launch into `vpc_id`.
///
/// Entries starting with `sg-` are taken as ids; other entries are group
/// names resolved within the VPC (or the default VPC when `vpc_id` is `None`).
pub async fn security_group_ids<C: Ec2Api>(
    api: &C,
    template: &TemplateConfig,
    vpc_id: Option<&str>,
) -> ProvisionResult<Vec<String>> {
    let (ids, names): (Vec<&String>, Vec<&String>) = template
        .security_groups
        .iter()
        .partition(|g| g.starts_with("sg-"));
    let mut resolved: Vec<String> = ids.into_iter().cloned().collect();
    if names.is_empty() {
        return Ok(resolved);
    }

    let mut filters = vec![Filter::new("group-name", names.iter().map(|n| n.as_str()))];
    if let Some(vpc) = vpc_id {
        filters.push(Filter::new("vpc-id", [vpc]));
    }
    let groups = api.describe_security_groups(&filters).await?;

    for name in names {
        match groups.iter().find(|g| &g.group_name == name) {
            Some(group) => resolved.push(group.group_id.clone()),
            None => {
                return Err(ProvisionError::invalid_template(
                    &template.id,
                    format!(
                        "security group '{name}' not found in {}",
                        vpc_id.unwrap_or("the default VPC")
                    ),
                ));
            }
        }
    }
    Ok(resolved)
}

/// The template's key pair, or the EC2 key pair matching `key`.
pub async fn key_pair_name<C: Ec2Api>(
    api: &C,
    template: &TemplateConfig,
    key: &PrivateKey,
) -> ProvisionResult<String> {
    if let Some(name) = template.key_pair_name.as_deref().filter(|n| !n.is_empty()) {
        return Ok(name.to_string());
    }

    let pairs = api.describe_key_pairs().await?;
    pairs
        .into_iter()
        .find(|pair| {
            pair.fingerprint
                .as_deref()
                .is_some_and(|fp| key.matches_fingerprint(fp))
        })
        .map(|pair| pair.key_name)
        .ok_or_else(|| {
            ProvisionError::invalid_template(
                &template.id,
                "no EC2 key pair matches the cloud private key",
            )
        })
}
