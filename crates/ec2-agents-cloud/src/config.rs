//! Fleet configuration
//!
//! A TOML document with the controller URL, optional timing overrides, and
//! one `[[clouds]]` table per credentialed EC2 endpoint, each holding its
//! `[[clouds.templates]]`. Field-level rules are checked with `garde`;
//! [`FleetConfig::validate_all`] adds the cross-field rules.

use crate::aws::ec2::types::{BlockDeviceSpec, NetworkInfo, SpotPersistence, Tags, Tenancy};
use crate::aws::retry::RetryPolicy;
use ec2_agents_common::defaults::{
    self, DEFAULT_BOOT_TIMEOUT_SECS, DEFAULT_IAAS_CALL_TIMEOUT_SECS, DEFAULT_LAUNCH_TIMEOUT_SECS,
    DEFAULT_MAX_ATTEMPTS, DEFAULT_ORPHAN_GRACE_SECS, DEFAULT_RECONCILE_INTERVAL_SECS,
    DEFAULT_REMOTE_COMMAND_TIMEOUT_SECS, DEFAULT_RETRY_BASE_MILLIS, DEFAULT_RETRY_CAP_SECS,
    DEFAULT_RETRY_JITTER, DEFAULT_RETRY_MAX_ATTEMPTS, DEFAULT_RUNNING_TIMEOUT_SECS,
    DEFAULT_SCP_TIMEOUT_SECS, DEFAULT_SSH_HANDSHAKE_TIMEOUT_SECS, DEFAULT_SSH_PROBE_INTERVAL_SECS,
};
use ec2_agents_common::{KeyError, PrivateKey};
use garde::Validate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid TOML")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("cloud name '{0}' is used more than once")]
    DuplicateCloud(String),

    #[error("template id '{template}' is used more than once in cloud '{cloud}'")]
    DuplicateTemplate { cloud: String, template: String },

    #[error("template '{template}': {reason}")]
    Unsupported { template: String, reason: String },

    #[error("private key of cloud '{cloud}' is unusable")]
    Key {
        cloud: String,
        #[source]
        source: KeyError,
    },
}

/// Top-level configuration document
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct FleetConfig {
    /// URL of the CI controller; the owner tag is derived from it
    #[garde(length(min = 1))]
    pub controller_url: String,

    /// Agent payload uploaded to every instance before bootstrap
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub agent_payload: Option<PathBuf>,

    #[serde(default)]
    #[garde(dive)]
    pub timings: Timings,

    #[serde(default)]
    #[garde(dive)]
    pub clouds: Vec<CloudConfig>,
}

impl FleetConfig {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Parse and validate a configuration document.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Field rules plus cross-field rules.
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.validate()
            .map_err(|report| ConfigError::Invalid(report.to_string()))?;

        let mut names = HashSet::new();
        for cloud in &self.clouds {
            if !names.insert(cloud.name.as_str()) {
                return Err(ConfigError::DuplicateCloud(cloud.name.clone()));
            }
            cloud.validate_templates()?;
        }
        Ok(())
    }

    pub fn cloud(&self, name: &str) -> Option<&CloudConfig> {
        self.clouds.iter().find(|c| c.name == name)
    }
}

/// How a cloud authenticates against EC2
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum CredentialSource {
    /// Access key and secret
    Static {
        access_key_id: String,
        secret_access_key: String,
    },
    /// Default provider chain: environment, instance role, SSO
    #[default]
    InstanceRole,
    /// Named profile from the shared AWS config files
    Profile { name: String },
}

impl CredentialSource {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Static { .. } => "static",
            Self::InstanceRole => "instance-role",
            Self::Profile { .. } => "profile",
        }
    }
}

impl std::fmt::Debug for CredentialSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Static { access_key_id, .. } => f
                .debug_struct("Static")
                .field("access_key_id", access_key_id)
                .finish_non_exhaustive(),
            Self::InstanceRole => f.write_str("InstanceRole"),
            Self::Profile { name } => f.debug_struct("Profile").field("name", name).finish(),
        }
    }
}

/// A credentialed endpoint into one EC2 region
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CloudConfig {
    /// Display name, unique among clouds
    #[garde(length(min = 1))]
    pub name: String,

    #[garde(length(min = 1))]
    pub region: String,

    /// Explicit EC2 endpoint (e.g. a local emulator)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub endpoint_url: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub credentials: CredentialSource,

    /// Cap on live instances across all templates
    #[serde(default = "defaults::default_instance_cap")]
    #[garde(range(min = 1))]
    pub instance_cap: u32,

    /// Private key PEM, inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub private_key: Option<String>,

    /// Private key PEM, from a file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub private_key_path: Option<PathBuf>,

    /// HTTP proxy for EC2 calls, `host:port`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub proxy: Option<String>,

    /// Provision as soon as demand appears instead of on the next reconcile pass
    #[serde(default)]
    #[garde(skip)]
    pub no_delay_provisioning: bool,

    #[serde(default)]
    #[garde(dive)]
    pub templates: Vec<TemplateConfig>,
}

impl CloudConfig {
    fn validate_templates(&self) -> Result<(), ConfigError> {
        let mut ids = HashSet::new();
        for template in &self.templates {
            if !ids.insert(template.id.as_str()) {
                return Err(ConfigError::DuplicateTemplate {
                    cloud: self.name.clone(),
                    template: template.id.clone(),
                });
            }
            template.validate_cross_fields()?;
        }
        Ok(())
    }

    pub fn template(&self, id: &str) -> Option<&TemplateConfig> {
        self.templates.iter().find(|t| t.id == id)
    }

    /// Load the cloud private key from the inline PEM or the key file.
    pub fn load_private_key(&self) -> Result<PrivateKey, ConfigError> {
        let pem = match (&self.private_key, &self.private_key_path) {
            (Some(pem), _) => pem.clone(),
            (None, Some(path)) => std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?,
            (None, None) => String::new(),
        };
        let key = PrivateKey::new(pem);
        key.fingerprint().map_err(|source| ConfigError::Key {
            cloud: self.name.clone(),
            source,
        })?;
        Ok(key)
    }
}

/// Which address the SSH launcher connects to
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ConnectionStrategy {
    #[default]
    PublicDns,
    PublicIp,
    PrivateDns,
    PrivateIp,
}

impl ConnectionStrategy {
    /// The address to connect to; DNS strategies fall back to the IP of the
    /// same visibility when the instance has no DNS name.
    pub fn resolve(self, network: &NetworkInfo) -> Option<String> {
        match self {
            Self::PublicDns => network.public_dns.clone().or_else(|| network.public_ip.clone()),
            Self::PublicIp => network.public_ip.clone(),
            Self::PrivateDns => network
                .private_dns
                .clone()
                .or_else(|| network.private_ip.clone()),
            Self::PrivateIp => network.private_ip.clone(),
        }
    }
}

/// SSH host key verification policy
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum HostKeyVerification {
    /// Require a host key advertised in the console output
    CheckNewHard,
    /// Use the console key when present, otherwise trust on first use
    #[default]
    CheckNewSoft,
    /// Trust on first use, pin thereafter
    AcceptNew,
    /// No verification
    Off,
}

/// Whether agents only take builds that name one of their labels
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum UsageMode {
    /// Also serve unlabeled demand
    #[default]
    Normal,
    /// Only serve demand for one of the template labels
    Exclusive,
}

/// Remote management protocol for Windows agents
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, strum::Display,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum WindowsConnection {
    #[default]
    Ssh,
    Winrm,
}

/// Spot market settings of a template
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct SpotConfig {
    /// Maximum hourly price in USD; unset bids the on-demand price
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub max_price: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub persistence: SpotPersistence,

    /// Launch on-demand when the spot request is refused
    #[serde(default)]
    #[garde(skip)]
    pub fallback_to_on_demand: bool,
}

/// Plan for a class of agent
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct TemplateConfig {
    /// Template id, unique within the cloud; also the `Name` tag prefix
    #[garde(length(min = 1))]
    pub id: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub description: Option<String>,

    #[garde(length(min = 1))]
    pub ami: String,

    #[garde(length(min = 1))]
    pub instance_type: String,

    /// Availability zone; unset or `any` lets EC2 choose
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub zone: Option<String>,

    /// Ordered subnet ids tried in turn on capacity errors; empty uses the default VPC
    #[serde(default)]
    #[garde(inner(length(min = 1)))]
    pub subnets: Vec<String>,

    /// Security group names (or `sg-` ids)
    #[serde(default)]
    #[garde(inner(length(min = 1)))]
    pub security_groups: Vec<String>,

    /// EC2 key pair; unset selects the pair matching the cloud private key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub key_pair_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub iam_instance_profile: Option<String>,

    #[serde(default)]
    #[garde(skip)]
    pub tags: Tags,

    /// Script passed as user data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub user_data: Option<String>,

    /// Cap on live instances of this template
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(range(min = 1))]
    pub instance_cap: Option<u32>,

    /// Whitespace-separated labels served by this template
    #[serde(default)]
    #[garde(skip)]
    pub labels: String,

    #[serde(default)]
    #[garde(skip)]
    pub usage_mode: UsageMode,

    /// Idle minutes before an online agent is stopped or terminated (0 = never)
    #[serde(default = "defaults::default_idle_termination_minutes")]
    #[garde(skip)]
    pub idle_termination_minutes: u64,

    /// Stop instead of terminate when idle
    #[serde(default)]
    #[garde(skip)]
    pub stop_on_terminate: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(dive)]
    pub spot: Option<SpotConfig>,

    #[serde(default)]
    #[garde(skip)]
    pub tenancy: Tenancy,

    #[serde(default)]
    #[garde(skip)]
    pub ebs_optimized: bool,

    /// Overrides merged over the AMI mappings, by device name
    #[serde(default)]
    #[garde(skip)]
    pub block_devices: Vec<BlockDeviceSpec>,

    #[serde(default)]
    #[garde(skip)]
    pub connection_strategy: ConnectionStrategy,

    #[serde(default = "defaults::default_admin_user")]
    #[garde(length(min = 1))]
    pub admin_user: String,

    #[serde(default = "defaults::default_ssh_port")]
    #[garde(range(min = 1))]
    pub ssh_port: u16,

    #[serde(default)]
    #[garde(skip)]
    pub host_key_verification: HostKeyVerification,

    #[serde(default)]
    #[garde(skip)]
    pub windows: bool,

    #[serde(default)]
    #[garde(skip)]
    pub windows_connection: WindowsConnection,

    /// Fixed administrator password; unset decrypts the EC2-generated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub windows_password: Option<String>,

    /// Remote directory receiving the agent payload
    #[serde(default = "defaults::default_remote_fs")]
    #[garde(length(min = 1))]
    pub remote_fs: String,

    /// Shell snippet run before the bootstrap command
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub init_script: Option<String>,

    /// Replaces `java -jar <remote_fs>/agent.jar`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(skip)]
    pub bootstrap_command: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(range(min = 1))]
    pub boot_timeout_secs: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[garde(range(min = 1))]
    pub launch_timeout_secs: Option<u64>,
}

impl TemplateConfig {
    fn validate_cross_fields(&self) -> Result<(), ConfigError> {
        let unsupported = |reason: &str| ConfigError::Unsupported {
            template: self.id.clone(),
            reason: reason.to_string(),
        };

        if self.windows && self.windows_connection == WindowsConnection::Winrm {
            return Err(unsupported("WinRM is not supported; use SSH for Windows agents"));
        }
        if let Some(price) = self.spot.as_ref().and_then(|s| s.max_price.as_deref()) {
            match price.trim().parse::<f64>() {
                Ok(p) if p > 0.0 => {}
                _ => return Err(unsupported("spot max_price must be a positive number")),
            }
        }
        if self.usage_mode == UsageMode::Exclusive && self.label_set().is_empty() {
            return Err(unsupported("exclusive templates need at least one label"));
        }
        Ok(())
    }

    pub fn label_set(&self) -> BTreeSet<&str> {
        self.labels.split_whitespace().collect()
    }

    /// Whether this template serves demand for `label` (`None` = unlabeled demand).
    pub fn matches_label(&self, label: Option<&str>) -> bool {
        match label.map(str::trim).filter(|l| !l.is_empty()) {
            None => self.usage_mode == UsageMode::Normal,
            Some(label) => self.label_set().contains(label),
        }
    }

    pub fn is_spot(&self) -> bool {
        self.spot.is_some()
    }

    /// Availability zone constraint, `None` for any zone
    pub fn zone(&self) -> Option<&str> {
        self.zone
            .as_deref()
            .map(str::trim)
            .filter(|z| !z.is_empty() && !z.eq_ignore_ascii_case("any"))
    }

    /// Template cap, bounded by the cloud cap
    pub fn effective_cap(&self, cloud_cap: u32) -> u32 {
        self.instance_cap.map_or(cloud_cap, |cap| cap.min(cloud_cap))
    }

    pub fn admin_user(&self) -> &str {
        if self.windows && self.admin_user == defaults::DEFAULT_ADMIN_USER {
            defaults::WINDOWS_ADMIN_USER
        } else {
            &self.admin_user
        }
    }
}

/// Engine timings, all overridable from `[timings]`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(default, deny_unknown_fields)]
pub struct Timings {
    #[garde(range(min = 1))]
    pub reconcile_interval_secs: u64,
    #[garde(range(min = 1))]
    pub running_timeout_secs: u64,
    #[garde(range(min = 1))]
    pub boot_timeout_secs: u64,
    #[garde(range(min = 1))]
    pub ssh_probe_interval_secs: u64,
    #[garde(range(min = 1))]
    pub launch_timeout_secs: u64,
    #[garde(range(min = 1))]
    pub max_attempts: u32,
    #[garde(skip)]
    pub orphan_grace_secs: u64,
    #[garde(range(min = 1))]
    pub iaas_call_timeout_secs: u64,
    #[garde(range(min = 1))]
    pub ssh_handshake_timeout_secs: u64,
    #[garde(range(min = 1))]
    pub scp_timeout_secs: u64,
    #[garde(range(min = 1))]
    pub remote_command_timeout_secs: u64,
    #[garde(range(min = 1))]
    pub retry_base_millis: u64,
    #[garde(range(min = 1))]
    pub retry_cap_secs: u64,
    #[garde(range(min = 1))]
    pub retry_max_attempts: u32,
    #[garde(range(min = 0.0, max = 1.0))]
    pub retry_jitter: f64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            running_timeout_secs: DEFAULT_RUNNING_TIMEOUT_SECS,
            boot_timeout_secs: DEFAULT_BOOT_TIMEOUT_SECS,
            ssh_probe_interval_secs: DEFAULT_SSH_PROBE_INTERVAL_SECS,
            launch_timeout_secs: DEFAULT_LAUNCH_TIMEOUT_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            orphan_grace_secs: DEFAULT_ORPHAN_GRACE_SECS,
            iaas_call_timeout_secs: DEFAULT_IAAS_CALL_TIMEOUT_SECS,
            ssh_handshake_timeout_secs: DEFAULT_SSH_HANDSHAKE_TIMEOUT_SECS,
            scp_timeout_secs: DEFAULT_SCP_TIMEOUT_SECS,
            remote_command_timeout_secs: DEFAULT_REMOTE_COMMAND_TIMEOUT_SECS,
            retry_base_millis: DEFAULT_RETRY_BASE_MILLIS,
            retry_cap_secs: DEFAULT_RETRY_CAP_SECS,
            retry_max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            retry_jitter: DEFAULT_RETRY_JITTER,
        }
    }
}

impl Timings {
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn running_timeout(&self) -> Duration {
        Duration::from_secs(self.running_timeout_secs)
    }

    /// Boot timeout, overridden per template
    pub fn boot_timeout(&self, template: &TemplateConfig) -> Duration {
        Duration::from_secs(template.boot_timeout_secs.unwrap_or(self.boot_timeout_secs))
    }

    pub fn ssh_probe_interval(&self) -> Duration {
        Duration::from_secs(self.ssh_probe_interval_secs)
    }

    /// Launch timeout, overridden per template
    pub fn launch_timeout(&self, template: &TemplateConfig) -> Duration {
        Duration::from_secs(template.launch_timeout_secs.unwrap_or(self.launch_timeout_secs))
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn ssh_handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_handshake_timeout_secs)
    }

    pub fn scp_timeout(&self) -> Duration {
        Duration::from_secs(self.scp_timeout_secs)
    }

    pub fn remote_command_timeout(&self) -> Duration {
        Duration::from_secs(self.remote_command_timeout_secs)
    }

    /// Records stuck in `Pending` longer than this are failed by the reconciler
    pub fn stuck_pending_after(&self) -> Duration {
        self.running_timeout() * self.max_attempts
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base: Duration::from_millis(self.retry_base_millis),
            factor: 2.0,
            cap: Duration::from_secs(self.retry_cap_secs),
            max_attempts: self.retry_max_attempts,
            jitter: self.retry_jitter,
            call_timeout: Duration::from_secs(self.iaas_call_timeout_secs),
        }
    }
}
