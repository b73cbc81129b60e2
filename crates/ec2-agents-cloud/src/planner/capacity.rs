//! Instance caps
//!
//! Live records (anything not `Terminated` or `Failed`, pending launches
//! included) count against both the cloud cap and the template cap.

use crate::config::{CloudConfig, TemplateConfig};
use crate::registry::InstanceRegistry;

/// Free slots under the cloud and template caps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Headroom {
    pub cloud: u32,
    pub template: u32,
}

impl Headroom {
    pub fn of(registry: &InstanceRegistry, cloud: &CloudConfig, template: &TemplateConfig) -> Self {
        let live_cloud = saturating_u32(registry.count_live());
        let live_template = saturating_u32(registry.count_live_template(&template.id));
        Self {
            cloud: cloud.instance_cap.saturating_sub(live_cloud),
            template: template
                .effective_cap(cloud.instance_cap)
                .saturating_sub(live_template),
        }
    }

    /// How many instances may be launched; `force` ignores the template cap.
    pub fn available(&self, force: bool) -> u32 {
        if force {
            self.cloud
        } else {
            self.cloud.min(self.template)
        }
    }

    /// Whether `n` more instances fit.
    pub fn admits(&self, n: u32, force: bool) -> bool {
        n <= self.available(force)
    }
}

fn saturating_u32(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}
