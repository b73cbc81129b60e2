//! AMI resolution and block device mappings

use crate::aws::Ec2Api;
use crate::aws::ec2::types::{BlockDeviceSpec, ImageDescription};
use crate::config::TemplateConfig;
use crate::error::{ProvisionError, ProvisionResult};
use tracing::debug;

/// Look up the template's AMI. It must exist and report its root device type.
pub async fn resolve_image<C: Ec2Api>(
    api: &C,
    template: &TemplateConfig,
) -> ProvisionResult<ImageDescription> {
    let images = match api.describe_images(std::slice::from_ref(&template.ami)).await {
        Ok(images) => images,
        Err(e) if e.is_not_found() => {
            return Err(ProvisionError::invalid_template(
                &template.id,
                format!("AMI {} does not exist", template.ami),
            ));
        }
        Err(e) => return Err(e.into()),
    };

    let image = images
        .into_iter()
        .find(|i| i.image_id == template.ami)
        .ok_or_else(|| {
            ProvisionError::invalid_template(
                &template.id,
                format!("AMI {} does not exist", template.ami),
            )
        })?;
    if image.root_device_type.is_none() {
        return Err(ProvisionError::invalid_template(
            &template.id,
            format!("AMI {} reports no root device type", template.ami),
        ));
    }
    debug!(
        ami = %image.image_id,
        root_device_type = ?image.root_device_type,
        devices = image.block_devices.len(),
        "Resolved AMI"
    );
    Ok(image)
}

/// AMI mappings with the template overrides applied per device name.
///
/// AMI devices keep their order; overridden fields replace the AMI's and
/// unset fields inherit them. Devices only the template names follow in
/// template order. A `no_device` override drops the AMI's snapshot.
pub fn merge_block_devices(
    image: &[BlockDeviceSpec],
    overrides: &[BlockDeviceSpec],
) -> Vec<BlockDeviceSpec> {
    let mut merged: Vec<BlockDeviceSpec> = image.to_vec();
    for over in overrides {
        match merged.iter_mut().find(|d| d.device_name == over.device_name) {
            Some(device) if over.no_device => {
                *device = BlockDeviceSpec {
                    device_name: over.device_name.clone(),
                    no_device: true,
                    ..Default::default()
                };
            }
            Some(device) => {
                device.virtual_name = over.virtual_name.clone().or(device.virtual_name.take());
                device.snapshot_id = over.snapshot_id.clone().or(device.snapshot_id.take());
                device.volume_size_gib = over.volume_size_gib.or(device.volume_size_gib);
                device.volume_type = over.volume_type.clone().or(device.volume_type.take());
                device.delete_on_termination =
                    over.delete_on_termination.or(device.delete_on_termination);
                device.encrypted = over.encrypted.or(device.encrypted);
                device.no_device = false;
            }
            None => merged.push(over.clone()),
        }
    }
    merged
}
