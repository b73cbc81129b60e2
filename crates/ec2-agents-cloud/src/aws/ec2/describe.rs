//! Read-only EC2 calls

use super::Ec2Client;
use super::convert;
use super::types::{
    Filter, ImageDescription, InstanceDescription, InstanceQuery, KeyPairDescription,
    RegionDescription, SecurityGroupDescription, SubnetDescription,
};
use crate::aws::error::{IaasResult, from_sdk_error};
use aws_sdk_ec2::types::PlatformValues;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tracing::debug;

impl Ec2Client {
    pub async fn describe_regions(&self) -> IaasResult<Vec<RegionDescription>> {
        let response = self
            .retry
            .retry("DescribeRegions", || async {
                self.client
                    .describe_regions()
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(response
            .regions()
            .iter()
            .filter_map(|r| {
                Some(RegionDescription {
                    region_name: r.region_name()?.to_string(),
                    endpoint: r.endpoint().map(str::to_string),
                })
            })
            .collect())
    }

    pub async fn describe_images(&self, image_ids: &[String]) -> IaasResult<Vec<ImageDescription>> {
        let response = self
            .retry
            .retry("DescribeImages", || async {
                self.client
                    .describe_images()
                    .set_image_ids(Some(image_ids.to_vec()))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(response
            .images()
            .iter()
            .filter_map(|image| {
                Some(ImageDescription {
                    image_id: image.image_id()?.to_string(),
                    root_device_type: image.root_device_type().map(|t| t.as_str().to_string()),
                    root_device_name: image.root_device_name().map(str::to_string),
                    block_devices: image
                        .block_device_mappings()
                        .iter()
                        .filter_map(convert::block_device_from)
                        .collect(),
                    windows: image.platform() == Some(&PlatformValues::Windows),
                })
            })
            .collect())
    }

    /// Describe instances, following `next_token` until exhausted.
    pub async fn describe_instances(
        &self,
        query: &InstanceQuery,
    ) -> IaasResult<Vec<InstanceDescription>> {
        let (ids, filters) = match query {
            InstanceQuery::Ids(ids) if ids.is_empty() => return Ok(Vec::new()),
            InstanceQuery::Ids(ids) => (Some(ids.clone()), None),
            InstanceQuery::Filtered(filters) => (None, convert::filters(filters)),
            InstanceQuery::All => (None, None),
        };

        let mut instances = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let token = next_token.take();
            let response = self
                .retry
                .retry("DescribeInstances", || async {
                    self.client
                        .describe_instances()
                        .set_instance_ids(ids.clone())
                        .set_filters(filters.clone())
                        .set_next_token(token.clone())
                        .send()
                        .await
                        .map_err(from_sdk_error)
                })
                .await?;

            instances.extend(
                response
                    .reservations()
                    .iter()
                    .flat_map(|r| r.instances())
                    .filter_map(convert::instance_from),
            );

            match response.next_token() {
                Some(token) if !token.is_empty() => next_token = Some(token.to_string()),
                _ => break,
            }
        }

        debug!(count = instances.len(), "Described instances");
        Ok(instances)
    }

    pub async fn describe_key_pairs(&self) -> IaasResult<Vec<KeyPairDescription>> {
        let response = self
            .retry
            .retry("DescribeKeyPairs", || async {
                self.client
                    .describe_key_pairs()
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(response
            .key_pairs()
            .iter()
            .filter_map(|k| {
                Some(KeyPairDescription {
                    key_name: k.key_name()?.to_string(),
                    fingerprint: k.key_fingerprint().map(str::to_string),
                })
            })
            .collect())
    }

    pub async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> IaasResult<Vec<SecurityGroupDescription>> {
        let response = self
            .retry
            .retry("DescribeSecurityGroups", || async {
                self.client
                    .describe_security_groups()
                    .set_filters(convert::filters(filters))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(response
            .security_groups()
            .iter()
            .filter_map(|g| {
                Some(SecurityGroupDescription {
                    group_id: g.group_id()?.to_string(),
                    group_name: g.group_name().unwrap_or_default().to_string(),
                    vpc_id: g.vpc_id().map(str::to_string),
                })
            })
            .collect())
    }

    pub async fn describe_subnets(&self, filters: &[Filter]) -> IaasResult<Vec<SubnetDescription>> {
        let response = self
            .retry
            .retry("DescribeSubnets", || async {
                self.client
                    .describe_subnets()
                    .set_filters(convert::filters(filters))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(response
            .subnets()
            .iter()
            .filter_map(|s| {
                Some(SubnetDescription {
                    subnet_id: s.subnet_id()?.to_string(),
                    vpc_id: s.vpc_id().map(str::to_string),
                    availability_zone: s.availability_zone().map(str::to_string),
                    available_ip_count: s.available_ip_address_count(),
                })
            })
            .collect())
    }

    /// Get console output from an instance
    pub async fn get_console_output(&self, instance_id: &str) -> IaasResult<Option<String>> {
        let response = self
            .retry
            .retry("GetConsoleOutput", || async {
                self.client
                    .get_console_output()
                    .instance_id(instance_id)
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(response
            .output()
            .and_then(|encoded| STANDARD.decode(encoded).ok())
            .and_then(|bytes| String::from_utf8(bytes).ok()))
    }

    /// Encrypted administrator password of a Windows instance
    pub async fn get_password_data(&self, instance_id: &str) -> IaasResult<Option<String>> {
        let response = self
            .retry
            .retry("GetPasswordData", || async {
                self.client
                    .get_password_data()
                    .instance_id(instance_id)
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(response
            .password_data()
            .map(str::trim)
            .filter(|data| !data.is_empty())
            .map(str::to_string))
    }
}
