//! EC2 instance lifecycle operations

use super::Ec2Client;
use super::convert;
use super::types::{InstanceDescription, LaunchSpec, Tags};
use crate::aws::error::{IaasError, IaasResult, from_sdk_error};
use aws_sdk_ec2::types::{IamInstanceProfileSpecification, InstanceType, Placement, Tenancy};
use tracing::info;

impl Ec2Client {
    /// Launch instances with RunInstances
    pub async fn run_instances(&self, spec: &LaunchSpec) -> IaasResult<Vec<InstanceDescription>> {
        info!(
            image_id = %spec.image_id,
            instance_type = %spec.instance_type,
            subnet_id = ?spec.subnet_id,
            count = spec.count,
            "Launching instances"
        );

        let placement = (spec.availability_zone.is_some()
            || spec.tenancy != super::types::Tenancy::Default)
            .then(|| {
                Placement::builder()
                    .set_availability_zone(spec.availability_zone.clone())
                    .tenancy(Tenancy::from(spec.tenancy.as_ref()))
                    .build()
            });
        let block_devices: Vec<_> = spec.block_devices.iter().map(convert::block_device_to).collect();

        let response = self
            .retry
            .retry("RunInstances", || async {
                self.client
                    .run_instances()
                    .image_id(&spec.image_id)
                    .instance_type(InstanceType::from(spec.instance_type.as_str()))
                    .min_count(spec.count)
                    .max_count(spec.count)
                    .key_name(&spec.key_name)
                    .set_subnet_id(spec.subnet_id.clone())
                    .set_security_group_ids(
                        (!spec.security_group_ids.is_empty()).then(|| spec.security_group_ids.clone()),
                    )
                    .set_iam_instance_profile(spec.iam_instance_profile.as_ref().map(|name| {
                        IamInstanceProfileSpecification::builder().name(name).build()
                    }))
                    .set_user_data(spec.user_data.clone())
                    .set_block_device_mappings(
                        (!block_devices.is_empty()).then(|| block_devices.clone()),
                    )
                    .set_tag_specifications(convert::instance_tag_specs(&spec.tags))
                    .set_placement(placement.clone())
                    .ebs_optimized(spec.ebs_optimized)
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        let launched: Vec<_> = response
            .instances()
            .iter()
            .filter_map(convert::instance_from)
            .collect();
        if launched.is_empty() {
            return Err(IaasError::permanent("RunInstances returned no instances"));
        }

        for instance in &launched {
            info!(instance_id = %instance.instance_id, "Instance launched");
        }
        Ok(launched)
    }

    /// Terminate instances in a single call
    pub async fn terminate_instances(&self, ids: &[String]) -> IaasResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(instance_ids = ?ids, "Terminating instances");

        self.retry
            .retry("TerminateInstances", || async {
                self.client
                    .terminate_instances()
                    .set_instance_ids(Some(ids.to_vec()))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;
        Ok(())
    }

    pub async fn stop_instances(&self, ids: &[String]) -> IaasResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(instance_ids = ?ids, "Stopping instances");

        self.retry
            .retry("StopInstances", || async {
                self.client
                    .stop_instances()
                    .set_instance_ids(Some(ids.to_vec()))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;
        Ok(())
    }

    pub async fn start_instances(&self, ids: &[String]) -> IaasResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(instance_ids = ?ids, "Starting instances");

        self.retry
            .retry("StartInstances", || async {
                self.client
                    .start_instances()
                    .set_instance_ids(Some(ids.to_vec()))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;
        Ok(())
    }

    pub async fn create_tags(&self, ids: &[String], tags: &Tags) -> IaasResult<()> {
        if ids.is_empty() || tags.is_empty() {
            return Ok(());
        }

        self.retry
            .retry("CreateTags", || async {
                self.client
                    .create_tags()
                    .set_resources(Some(ids.to_vec()))
                    .set_tags(Some(convert::tags_to(tags)))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;
        Ok(())
    }
}
