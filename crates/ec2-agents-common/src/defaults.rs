//! Default configuration values shared across ec2-agents components
//!
//! Every timing here can be overridden from the `[timings]` table of the
//! configuration file; templates override the per-template values.

/// Interval between reconciler passes (10 seconds)
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 10;

/// Bound on PENDING -> BOOTING, i.e. waiting for EC2 to report `running` (5 minutes)
pub const DEFAULT_RUNNING_TIMEOUT_SECS: u64 = 300;

/// Bound on SSH probing after entering BOOTING (3 minutes)
pub const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 180;

/// Interval between SSH reachability probes
pub const DEFAULT_SSH_PROBE_INTERVAL_SECS: u64 = 15;

/// Bound on agent upload plus bootstrap start (5 minutes)
pub const DEFAULT_LAUNCH_TIMEOUT_SECS: u64 = 300;

/// Attempts per timed step before a record is failed
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Grace period before a locally known but remotely absent instance is evicted (2 minutes)
pub const DEFAULT_ORPHAN_GRACE_SECS: u64 = 120;

/// Deadline for a single IaaS API call
pub const DEFAULT_IAAS_CALL_TIMEOUT_SECS: u64 = 30;

/// Deadline for the SSH handshake and authentication
pub const DEFAULT_SSH_HANDSHAKE_TIMEOUT_SECS: u64 = 30;

/// Deadline for an SCP transfer (5 minutes)
pub const DEFAULT_SCP_TIMEOUT_SECS: u64 = 300;

/// Deadline for a remote command (1 hour)
pub const DEFAULT_REMOTE_COMMAND_TIMEOUT_SECS: u64 = 3600;

/// IaaS retry policy: first back-off delay
pub const DEFAULT_RETRY_BASE_MILLIS: u64 = 1_000;

/// IaaS retry policy: back-off cap
pub const DEFAULT_RETRY_CAP_SECS: u64 = 30;

/// IaaS retry policy: total attempts including the first call
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 6;

/// IaaS retry policy: symmetric jitter fraction (plus or minus 20%)
pub const DEFAULT_RETRY_JITTER: f64 = 0.2;

/// Page size for DescribeSpotInstanceRequests (EC2 allows up to 1000)
pub const SPOT_REQUEST_PAGE_SIZE: i32 = 100;

/// Maximum page size accepted by EC2 describe calls
pub const EC2_MAX_PAGE_SIZE: i32 = 1000;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default administrator user for Linux AMIs
pub const DEFAULT_ADMIN_USER: &str = "ec2-user";

/// Administrator user for Windows AMIs
pub const WINDOWS_ADMIN_USER: &str = "Administrator";

/// Default remote working directory for the agent payload
pub const DEFAULT_REMOTE_FS: &str = "/tmp/ec2-agent";

/// File name of the agent payload on the remote host
pub const AGENT_PAYLOAD_NAME: &str = "agent.jar";

/// Default idle minutes before an online agent is stopped or terminated (0 = never)
pub const DEFAULT_IDLE_TERMINATION_MINUTES: u64 = 30;

/// Default cloud-wide instance cap
pub const DEFAULT_INSTANCE_CAP: u32 = 10;

/// Maximum lines kept in a node's log buffer
pub const DEFAULT_NODE_LOG_LINES: usize = 10_000;

// Serde default functions for struct field defaults

/// Returns the default SSH port
pub fn default_ssh_port() -> u16 {
    DEFAULT_SSH_PORT
}

/// Returns the default administrator user
pub fn default_admin_user() -> String {
    DEFAULT_ADMIN_USER.to_string()
}

/// Returns the default remote working directory
pub fn default_remote_fs() -> String {
    DEFAULT_REMOTE_FS.to_string()
}

/// Returns the default idle termination minutes
pub fn default_idle_termination_minutes() -> u64 {
    DEFAULT_IDLE_TERMINATION_MINUTES
}

/// Returns the default instance cap
pub fn default_instance_cap() -> u32 {
    DEFAULT_INSTANCE_CAP
}
