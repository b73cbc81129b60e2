//! Conversions between SDK shapes and facade types

use super::types::{
    BlockDeviceSpec, Filter, InstanceDescription, NetworkInfo, SpotRequestDescription,
    SpotRequestState, Tags,
};
use aws_sdk_ec2::types as sdk;
use chrono::{DateTime, Utc};
use ec2_agents_common::RemoteState;

pub(super) fn filters(filters: &[Filter]) -> Option<Vec<sdk::Filter>> {
    if filters.is_empty() {
        return None;
    }
    Some(
        filters
            .iter()
            .map(|f| {
                sdk::Filter::builder()
                    .name(&f.name)
                    .set_values(Some(f.values.clone()))
                    .build()
            })
            .collect(),
    )
}

pub(super) fn tags_from(tags: &[sdk::Tag]) -> Tags {
    tags.iter()
        .filter_map(|t| Some((t.key()?.to_string(), t.value().unwrap_or_default().to_string())))
        .collect()
}

pub(super) fn tags_to(tags: &Tags) -> Vec<sdk::Tag> {
    tags.iter()
        .map(|(k, v)| sdk::Tag::builder().key(k).value(v).build())
        .collect()
}

/// Tag specifications for an instance and the volumes attached at launch
pub(super) fn instance_tag_specs(tags: &Tags) -> Option<Vec<sdk::TagSpecification>> {
    if tags.is_empty() {
        return None;
    }
    Some(
        [sdk::ResourceType::Instance, sdk::ResourceType::Volume]
            .into_iter()
            .map(|resource_type| {
                sdk::TagSpecification::builder()
                    .resource_type(resource_type)
                    .set_tags(Some(tags_to(tags)))
                    .build()
            })
            .collect(),
    )
}

pub(super) fn block_device_from(mapping: &sdk::BlockDeviceMapping) -> Option<BlockDeviceSpec> {
    let ebs = mapping.ebs();
    Some(BlockDeviceSpec {
        device_name: mapping.device_name()?.to_string(),
        virtual_name: mapping.virtual_name().map(str::to_string),
        snapshot_id: ebs.and_then(|e| e.snapshot_id()).map(str::to_string),
        volume_size_gib: ebs.and_then(|e| e.volume_size()),
        volume_type: ebs
            .and_then(|e| e.volume_type())
            .map(|v| v.as_str().to_string()),
        delete_on_termination: ebs.and_then(|e| e.delete_on_termination()),
        encrypted: ebs.and_then(|e| e.encrypted()),
        no_device: mapping.no_device().is_some(),
    })
}

pub(super) fn block_device_to(spec: &BlockDeviceSpec) -> sdk::BlockDeviceMapping {
    let builder = sdk::BlockDeviceMapping::builder()
        .device_name(&spec.device_name)
        .set_virtual_name(spec.virtual_name.clone());

    if spec.no_device {
        return builder.no_device("").build();
    }
    if spec.virtual_name.is_some() {
        return builder.build();
    }

    builder
        .ebs(
            sdk::EbsBlockDevice::builder()
                .set_snapshot_id(spec.snapshot_id.clone())
                .set_volume_size(spec.volume_size_gib)
                .set_volume_type(spec.volume_type.as_deref().map(sdk::VolumeType::from))
                .set_delete_on_termination(spec.delete_on_termination)
                .set_encrypted(spec.encrypted)
                .build(),
        )
        .build()
}

pub(super) fn remote_state(state: Option<&sdk::InstanceStateName>) -> RemoteState {
    state
        .and_then(|s| s.as_str().parse().ok())
        .unwrap_or(RemoteState::Pending)
}

pub(super) fn instance_from(instance: &sdk::Instance) -> Option<InstanceDescription> {
    Some(InstanceDescription {
        instance_id: instance.instance_id()?.to_string(),
        state: remote_state(instance.state().and_then(|s| s.name())),
        instance_type: instance.instance_type().map(|t| t.as_str().to_string()),
        image_id: instance.image_id().map(str::to_string),
        subnet_id: instance.subnet_id().map(str::to_string),
        vpc_id: instance.vpc_id().map(str::to_string),
        availability_zone: instance
            .placement()
            .and_then(|p| p.availability_zone())
            .map(str::to_string),
        network: NetworkInfo {
            public_dns: non_empty(instance.public_dns_name()),
            private_dns: non_empty(instance.private_dns_name()),
            public_ip: non_empty(instance.public_ip_address()),
            private_ip: non_empty(instance.private_ip_address()),
        },
        launch_time: instance
            .launch_time()
            .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
        tags: tags_from(instance.tags()),
        spot_request_id: instance.spot_instance_request_id().map(str::to_string),
        key_name: instance.key_name().map(str::to_string),
        state_reason: instance
            .state_reason()
            .and_then(|r| r.message())
            .map(str::to_string),
    })
}

pub(super) fn spot_request_from(
    request: &sdk::SpotInstanceRequest,
) -> Option<SpotRequestDescription> {
    Some(SpotRequestDescription {
        request_id: request.spot_instance_request_id()?.to_string(),
        state: request
            .state()
            .and_then(|s| s.as_str().parse().ok())
            .unwrap_or(SpotRequestState::Open),
        instance_id: request.instance_id().map(str::to_string),
        status_code: request
            .status()
            .and_then(|s| s.code())
            .map(str::to_string),
        tags: tags_from(request.tags()),
    })
}

/// EC2 reports absent DNS names as empty strings
fn non_empty(value: Option<&str>) -> Option<String> {
    value.filter(|v| !v.is_empty()).map(str::to_string)
}
