//! ec2-agents-cloud - EC2 build agent provisioning engine
//!
//! This crate turns pending CI demand into EC2 instances running build
//! agents, and takes them away again when they idle out or disappear.
//!
//! ## Layout
//!
//! - [`config`]: fleet, cloud and template configuration with validation
//! - [`aws`]: the [`aws::Ec2Api`] seam, its SDK client and error classification
//! - [`planner`]: capacity accounting, AMI and subnet selection, request building
//! - [`registry`]: the in-memory instance registry and remote reconciliation diff
//! - [`launch`]: the lifecycle transition table and per-instance drivers
//! - [`ssh`]: host key pinning, the SSH agent launcher and Windows passwords
//! - [`reconciler`]: the periodic loop that serves demand and reaps instances
//! - [`cloud`]: [`Cloud`] and [`CloudSet`], the surface the controller talks to
//! - [`step`]: the pipeline step that provisions one instance and waits for it

pub mod aws;
pub mod cloud;
pub mod config;
pub mod error;
pub mod launch;
pub mod log_buffer;
pub mod node;
pub mod planner;
pub mod reconciler;
pub mod registry;
pub mod ssh;
pub mod step;
pub mod wait;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cloud::{Cloud, CloudEnv, CloudSet};
pub use config::{CloudConfig, ConfigError, FleetConfig, TemplateConfig, Timings};
pub use error::{ErrorKind, ProvisionError, ProvisionResult};
pub use node::{Controller, DemandLedger, LoggingController, Node};
pub use planner::{ProvisionOption, ProvisionOptions};
pub use registry::{InstanceRecord, InstanceRegistry};
pub use step::{ProvisionedInstance, ec2_step};
