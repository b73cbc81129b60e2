//! Spot instance requests

use super::Ec2Client;
use super::convert;
use super::types::{SpotPersistence, SpotRequestDescription, SpotRequestFilter, SpotRequestPage, SpotSpec};
use crate::aws::error::{IaasError, IaasResult, from_sdk_error};
use aws_sdk_ec2::types::{
    IamInstanceProfileSpecification, InstanceType, RequestSpotLaunchSpecification, ResourceType,
    SpotInstanceType, SpotPlacement, TagSpecification, Tenancy,
};
use tracing::info;

impl Ec2Client {
    pub async fn request_spot_instances(
        &self,
        spec: &SpotSpec,
    ) -> IaasResult<Vec<SpotRequestDescription>> {
        let launch = &spec.launch;
        info!(
            image_id = %launch.image_id,
            instance_type = %launch.instance_type,
            max_price = ?spec.max_price,
            persistence = %spec.persistence,
            "Requesting spot instances"
        );

        let launch_spec = RequestSpotLaunchSpecification::builder()
            .image_id(&launch.image_id)
            .instance_type(InstanceType::from(launch.instance_type.as_str()))
            .key_name(&launch.key_name)
            .set_subnet_id(launch.subnet_id.clone())
            .set_security_group_ids(
                (!launch.security_group_ids.is_empty()).then(|| launch.security_group_ids.clone()),
            )
            .set_iam_instance_profile(launch.iam_instance_profile.as_ref().map(|name| {
                IamInstanceProfileSpecification::builder().name(name).build()
            }))
            .set_user_data(launch.user_data.clone())
            .set_block_device_mappings(if launch.block_devices.is_empty() {
                None
            } else {
                Some(launch.block_devices.iter().map(convert::block_device_to).collect())
            })
            .placement(
                SpotPlacement::builder()
                    .set_availability_zone(launch.availability_zone.clone())
                    .tenancy(Tenancy::from(launch.tenancy.as_ref()))
                    .build(),
            )
            .ebs_optimized(launch.ebs_optimized)
            .build();

        // Instance tags are applied once the request is fulfilled
        let request_tags = (!launch.tags.is_empty()).then(|| {
            vec![
                TagSpecification::builder()
                    .resource_type(ResourceType::SpotInstancesRequest)
                    .set_tags(Some(convert::tags_to(&launch.tags)))
                    .build(),
            ]
        });

        let request_type = match spec.persistence {
            SpotPersistence::OneTime => SpotInstanceType::OneTime,
            SpotPersistence::Persistent => SpotInstanceType::Persistent,
        };

        let response = self
            .retry
            .retry("RequestSpotInstances", || async {
                self.client
                    .request_spot_instances()
                    .set_spot_price(spec.max_price.clone())
                    .instance_count(launch.count)
                    .r#type(request_type.clone())
                    .launch_specification(launch_spec.clone())
                    .set_tag_specifications(request_tags.clone())
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        let requests: Vec<_> = response
            .spot_instance_requests()
            .iter()
            .filter_map(convert::spot_request_from)
            .collect();
        if requests.is_empty() {
            return Err(IaasError::permanent("RequestSpotInstances returned no requests"));
        }
        Ok(requests)
    }

    pub async fn describe_spot_instance_requests(
        &self,
        filter: &SpotRequestFilter,
        next_token: Option<String>,
        page_size: i32,
    ) -> IaasResult<SpotRequestPage> {
        let ids = (!filter.request_ids.is_empty()).then(|| filter.request_ids.clone());
        let max_results = ids.is_none().then_some(page_size);

        let response = self
            .retry
            .retry("DescribeSpotInstanceRequests", || async {
                self.client
                    .describe_spot_instance_requests()
                    .set_spot_instance_request_ids(ids.clone())
                    .set_filters(convert::filters(&filter.filters))
                    .set_max_results(max_results)
                    .set_next_token(next_token.clone())
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;

        Ok(SpotRequestPage {
            requests: response
                .spot_instance_requests()
                .iter()
                .filter_map(convert::spot_request_from)
                .collect(),
            next_token: response.next_token().map(str::to_string),
        })
    }

    pub async fn cancel_spot_instance_requests(&self, ids: &[String]) -> IaasResult<()> {
        if ids.is_empty() {
            return Ok(());
        }
        info!(request_ids = ?ids, "Cancelling spot requests");

        self.retry
            .retry("CancelSpotInstanceRequests", || async {
                self.client
                    .cancel_spot_instance_requests()
                    .set_spot_instance_request_ids(Some(ids.to_vec()))
                    .send()
                    .await
                    .map_err(from_sdk_error)
            })
            .await?;
        Ok(())
    }
}
