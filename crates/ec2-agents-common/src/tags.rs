//! EC2 tag constants for ec2-agents
//!
//! Every instance launched by a controller carries these tags so that a
//! later reconcile pass can tell its own instances apart from everybody
//! else's, and re-associate an orphan with the template that made it.
//!
//! ## Tag Schema
//!
//! | Tag Key | Description |
//! |---------|-------------|
//! | `jenkins_slave_type` | Owner tag, derived from the controller URL |
//! | `Name` | Defaults to `<template-label>-<short-instance-id>` |
//! | `ec2-agents:cloud` | Display name of the owning cloud |
//! | `ec2-agents:template` | Id of the originating template |

/// Reserved owner tag key (bit-exact, shared with existing deployments)
pub const TAG_OWNER: &str = "jenkins_slave_type";

/// Prefix of the owner tag value for demand-provisioned agents
pub const OWNER_VALUE_PREFIX: &str = "demand_";

/// Reserved name tag key
pub const TAG_NAME: &str = "Name";

/// Tag key for the owning cloud
pub const TAG_CLOUD: &str = "ec2-agents:cloud";

/// Tag key for the originating template
pub const TAG_TEMPLATE: &str = "ec2-agents:template";

/// Owner tag value for a controller.
///
/// Trailing slashes are dropped so `https://ci/` and `https://ci` own the
/// same instances.
pub fn owner_tag_value(controller_url: &str) -> String {
    format!(
        "{}{}",
        OWNER_VALUE_PREFIX,
        controller_url.trim().trim_end_matches('/')
    )
}

/// Short form of an instance id used in default names: the `i-` prefix is
/// dropped and at most 8 characters are kept.
pub fn short_instance_id(instance_id: &str) -> &str {
    let id = instance_id.strip_prefix("i-").unwrap_or(instance_id);
    match id.char_indices().nth(8) {
        Some((idx, _)) => &id[..idx],
        None => id,
    }
}

/// Default `Name` tag value: `<template-label>-<short-instance-id>`.
pub fn default_name(template_label: &str, instance_id: &str) -> String {
    format!("{}-{}", template_label, short_instance_id(instance_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn owner_value_ignores_trailing_slash() {
        assert_eq!(owner_tag_value("https://ci.example.com/"), "demand_https://ci.example.com");
        assert_eq!(
            owner_tag_value("https://ci.example.com"),
            owner_tag_value("https://ci.example.com///")
        );
    }

    #[test]
    fn short_id_strips_prefix_and_truncates() {
        assert_eq!(short_instance_id("i-0123456789abcdef0"), "01234567");
        assert_eq!(short_instance_id("i-abc"), "abc");
        assert_eq!(short_instance_id("sir-xyz"), "sir-xyz");
    }

    #[test]
    fn default_name_format() {
        assert_eq!(default_name("linux", "i-0123456789abcdef0"), "linux-01234567");
    }
}
