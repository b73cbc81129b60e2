//! AWS client modules
//!
//! - `context`: SDK configuration per cloud (region, credentials, endpoint)
//! - `ec2`: the [`Ec2Api`] facade and its SDK-backed implementation
//! - `error`: classification of SDK failures into [`IaasError`]
//! - `retry`: back-off policy for throttled and transient failures

pub mod context;
pub mod ec2;
pub mod error;
pub mod retry;

pub use context::AwsContext;
pub use ec2::{Ec2Api, Ec2Client, describe_all_spot_requests};
pub use error::{IaasError, IaasResult, classify_aws_error};
pub use retry::RetryPolicy;
