//! EC2 facade
//!
//! [`Ec2Client`] is the SDK-backed implementation of [`Ec2Api`]. Every call
//! goes through [`RetryPolicy::retry`], which bounds it by the call deadline
//! and retries throttled and transient failures.

mod convert;
mod describe;
mod instances;
mod operations;
mod spot;
pub mod types;

pub use operations::{Ec2Api, describe_all_spot_requests};
pub use types::*;

use crate::aws::context::AwsContext;
use crate::aws::retry::RetryPolicy;
use aws_sdk_ec2::Client;

/// EC2 client for one cloud
#[derive(Clone)]
pub struct Ec2Client {
    pub(crate) client: Client,
    pub(crate) retry: RetryPolicy,
}

impl Ec2Client {
    /// Create a new EC2 client (loads AWS config from environment)
    pub async fn new(region: &str) -> Self {
        let ctx = AwsContext::new(region).await;
        Self::from_context(&ctx)
    }

    /// Create an EC2 client from a pre-loaded AWS context
    pub fn from_context(ctx: &AwsContext) -> Self {
        Self {
            client: ctx.ec2_client(),
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl std::fmt::Debug for Ec2Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ec2Client")
            .field("retry", &self.retry)
            .finish_non_exhaustive()
    }
}
