//! Request and response shapes of the EC2 facade
//!
//! These mirror the subset of the EC2 API the engine needs, in plain Rust
//! types so that the planner, reconciler and the in-memory fake never touch
//! SDK builders.

use chrono::{DateTime, Utc};
use ec2_agents_common::RemoteState;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Tag set, ordered by key
pub type Tags = BTreeMap<String, String>;

/// A describe filter (`Name` / `Values` pair)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filter {
    pub name: String,
    pub values: Vec<String>,
}

impl Filter {
    pub fn new<I, S>(name: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }

    /// `tag:<key>` filter
    pub fn tag(key: &str, value: impl Into<String>) -> Self {
        Self::new(format!("tag:{key}"), [value.into()])
    }
}

/// Which instances DescribeInstances should return
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceQuery {
    /// Instances by id
    Ids(Vec<String>),
    /// Instances matching every filter
    Filtered(Vec<Filter>),
    /// Every instance visible to the credentials
    All,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionDescription {
    pub region_name: String,
    pub endpoint: Option<String>,
}

/// One block device mapping entry, from an AMI or a template override
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BlockDeviceSpec {
    pub device_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_size_gib: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delete_on_termination: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted: Option<bool>,
    /// Suppress a device the AMI would otherwise attach
    #[serde(default)]
    pub no_device: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDescription {
    pub image_id: String,
    /// `ebs` or `instance-store`
    pub root_device_type: Option<String>,
    pub root_device_name: Option<String>,
    pub block_devices: Vec<BlockDeviceSpec>,
    pub windows: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubnetDescription {
    pub subnet_id: String,
    pub vpc_id: Option<String>,
    pub availability_zone: Option<String>,
    pub available_ip_count: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityGroupDescription {
    pub group_id: String,
    pub group_name: String,
    pub vpc_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPairDescription {
    pub key_name: String,
    pub fingerprint: Option<String>,
}

/// Addresses of an instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub public_dns: Option<String>,
    pub private_dns: Option<String>,
    pub public_ip: Option<String>,
    pub private_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceDescription {
    pub instance_id: String,
    pub state: RemoteState,
    pub instance_type: Option<String>,
    pub image_id: Option<String>,
    pub subnet_id: Option<String>,
    pub vpc_id: Option<String>,
    pub availability_zone: Option<String>,
    pub network: NetworkInfo,
    pub launch_time: Option<DateTime<Utc>>,
    pub tags: Tags,
    pub spot_request_id: Option<String>,
    pub key_name: Option<String>,
    pub state_reason: Option<String>,
}

impl InstanceDescription {
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

/// Instance placement tenancy ("host type" of spot requests)
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Tenancy {
    #[default]
    Default,
    Dedicated,
    Host,
}

/// Everything RunInstances needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub image_id: String,
    pub instance_type: String,
    pub count: i32,
    pub key_name: String,
    pub subnet_id: Option<String>,
    pub availability_zone: Option<String>,
    pub security_group_ids: Vec<String>,
    pub iam_instance_profile: Option<String>,
    /// Base64-encoded user data
    pub user_data: Option<String>,
    pub block_devices: Vec<BlockDeviceSpec>,
    /// Applied to the instance and its volumes at launch
    pub tags: Tags,
    pub tenancy: Tenancy,
    pub ebs_optimized: bool,
}

/// Spot request lifetime
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum SpotPersistence {
    #[default]
    OneTime,
    Persistent,
}

/// Everything RequestSpotInstances needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotSpec {
    pub launch: LaunchSpec,
    /// Maximum price; `None` bids the on-demand price
    pub max_price: Option<String>,
    pub persistence: SpotPersistence,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, strum::EnumString, strum::AsRefStr,
)]
#[strum(serialize_all = "kebab-case")]
pub enum SpotRequestState {
    Open,
    Active,
    Closed,
    Cancelled,
    Failed,
    Disabled,
}

impl SpotRequestState {
    /// The request will never produce an instance
    pub fn is_dead(self) -> bool {
        matches!(self, Self::Closed | Self::Cancelled | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotRequestDescription {
    pub request_id: String,
    pub state: SpotRequestState,
    pub instance_id: Option<String>,
    pub status_code: Option<String>,
    pub tags: Tags,
}

/// Which spot requests DescribeSpotInstanceRequests should return
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotRequestFilter {
    pub request_ids: Vec<String>,
    pub filters: Vec<Filter>,
}

impl SpotRequestFilter {
    pub fn ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            request_ids: ids.into_iter().map(Into::into).collect(),
            filters: Vec::new(),
        }
    }
}

/// One page of spot requests
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpotRequestPage {
    pub requests: Vec<SpotRequestDescription>,
    pub next_token: Option<String>,
}
