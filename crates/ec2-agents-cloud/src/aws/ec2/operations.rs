//! EC2 operations trait
//!
//! The engine is generic over [`Ec2Api`] so that planning, reconciliation
//! and the launch state machine can run against the in-memory fake in tests.

use super::Ec2Client;
use super::types::{
    Filter, ImageDescription, InstanceDescription, InstanceQuery, KeyPairDescription, LaunchSpec,
    RegionDescription, SecurityGroupDescription, SpotRequestDescription, SpotRequestFilter,
    SpotRequestPage, SpotSpec, SubnetDescription, Tags,
};
use crate::aws::error::IaasResult;
use ec2_agents_common::defaults::{EC2_MAX_PAGE_SIZE, SPOT_REQUEST_PAGE_SIZE};
use std::collections::HashSet;
use std::future::Future;
use tracing::debug;

/// The EC2 calls the engine depends on.
///
/// Implementations must be safe for concurrent use; retries inside one call
/// must not block other calls.
pub trait Ec2Api: Send + Sync {
    fn describe_regions(&self) -> impl Future<Output = IaasResult<Vec<RegionDescription>>> + Send;

    fn describe_images(
        &self,
        image_ids: &[String],
    ) -> impl Future<Output = IaasResult<Vec<ImageDescription>>> + Send;

    fn describe_instances(
        &self,
        query: &InstanceQuery,
    ) -> impl Future<Output = IaasResult<Vec<InstanceDescription>>> + Send;

    fn describe_key_pairs(&self) -> impl Future<Output = IaasResult<Vec<KeyPairDescription>>> + Send;

    fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> impl Future<Output = IaasResult<Vec<SecurityGroupDescription>>> + Send;

    fn describe_subnets(
        &self,
        filters: &[Filter],
    ) -> impl Future<Output = IaasResult<Vec<SubnetDescription>>> + Send;

    fn run_instances(
        &self,
        spec: &LaunchSpec,
    ) -> impl Future<Output = IaasResult<Vec<InstanceDescription>>> + Send;

    fn terminate_instances(&self, ids: &[String]) -> impl Future<Output = IaasResult<()>> + Send;

    fn stop_instances(&self, ids: &[String]) -> impl Future<Output = IaasResult<()>> + Send;

    fn start_instances(&self, ids: &[String]) -> impl Future<Output = IaasResult<()>> + Send;

    fn request_spot_instances(
        &self,
        spec: &SpotSpec,
    ) -> impl Future<Output = IaasResult<Vec<SpotRequestDescription>>> + Send;

    /// One page of spot requests. `page_size` is ignored when the filter
    /// names request ids (EC2 rejects the combination).
    fn describe_spot_instance_requests(
        &self,
        filter: &SpotRequestFilter,
        next_token: Option<String>,
        page_size: i32,
    ) -> impl Future<Output = IaasResult<SpotRequestPage>> + Send;

    fn cancel_spot_instance_requests(
        &self,
        ids: &[String],
    ) -> impl Future<Output = IaasResult<()>> + Send;

    fn create_tags(&self, ids: &[String], tags: &Tags) -> impl Future<Output = IaasResult<()>> + Send;

    /// Decoded console output, `None` until the instance has written any
    fn get_console_output(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = IaasResult<Option<String>>> + Send;

    /// Encrypted Windows password blob, `None` until it is available
    fn get_password_data(
        &self,
        instance_id: &str,
    ) -> impl Future<Output = IaasResult<Option<String>>> + Send;
}

/// Every spot request matching `filter`, across all pages.
///
/// Pages are requested until EC2 stops returning a continuation token. The
/// result is the union of the pages in page order; a request reported on
/// more than one page is kept at its first position.
pub async fn describe_all_spot_requests<C: Ec2Api>(
    api: &C,
    filter: &SpotRequestFilter,
) -> IaasResult<Vec<SpotRequestDescription>> {
    let page_size = SPOT_REQUEST_PAGE_SIZE.min(EC2_MAX_PAGE_SIZE);
    let mut seen = HashSet::new();
    let mut all = Vec::new();
    let mut next_token = None;
    let mut pages = 0u32;

    loop {
        let page = api
            .describe_spot_instance_requests(filter, next_token.take(), page_size)
            .await?;
        pages += 1;

        for request in page.requests {
            if seen.insert(request.request_id.clone()) {
                all.push(request);
            }
        }

        match page.next_token {
            Some(token) if !token.is_empty() => next_token = Some(token),
            _ => break,
        }
    }

    debug!(pages, requests = all.len(), "Described spot instance requests");
    Ok(all)
}

impl Ec2Api for Ec2Client {
    async fn describe_regions(&self) -> IaasResult<Vec<RegionDescription>> {
        Ec2Client::describe_regions(self).await
    }

    async fn describe_images(&self, image_ids: &[String]) -> IaasResult<Vec<ImageDescription>> {
        Ec2Client::describe_images(self, image_ids).await
    }

    async fn describe_instances(
        &self,
        query: &InstanceQuery,
    ) -> IaasResult<Vec<InstanceDescription>> {
        Ec2Client::describe_instances(self, query).await
    }

    async fn describe_key_pairs(&self) -> IaasResult<Vec<KeyPairDescription>> {
        Ec2Client::describe_key_pairs(self).await
    }

    async fn describe_security_groups(
        &self,
        filters: &[Filter],
    ) -> IaasResult<Vec<SecurityGroupDescription>> {
        Ec2Client::describe_security_groups(self, filters).await
    }

    async fn describe_subnets(&self, filters: &[Filter]) -> IaasResult<Vec<SubnetDescription>> {
        Ec2Client::describe_subnets(self, filters).await
    }

    async fn run_instances(&self, spec: &LaunchSpec) -> IaasResult<Vec<InstanceDescription>> {
        Ec2Client::run_instances(self, spec).await
    }

    async fn terminate_instances(&self, ids: &[String]) -> IaasResult<()> {
        Ec2Client::terminate_instances(self, ids).await
    }

    async fn stop_instances(&self, ids: &[String]) -> IaasResult<()> {
        Ec2Client::stop_instances(self, ids).await
    }

    async fn start_instances(&self, ids: &[String]) -> IaasResult<()> {
        Ec2Client::start_instances(self, ids).await
    }

    async fn request_spot_instances(
        &self,
        spec: &SpotSpec,
    ) -> IaasResult<Vec<SpotRequestDescription>> {
        Ec2Client::request_spot_instances(self, spec).await
    }

    async fn describe_spot_instance_requests(
        &self,
        filter: &SpotRequestFilter,
        next_token: Option<String>,
        page_size: i32,
    ) -> IaasResult<SpotRequestPage> {
        Ec2Client::describe_spot_instance_requests(self, filter, next_token, page_size).await
    }

    async fn cancel_spot_instance_requests(&self, ids: &[String]) -> IaasResult<()> {
        Ec2Client::cancel_spot_instance_requests(self, ids).await
    }

    async fn create_tags(&self, ids: &[String], tags: &Tags) -> IaasResult<()> {
        Ec2Client::create_tags(self, ids, tags).await
    }

    async fn get_console_output(&self, instance_id: &str) -> IaasResult<Option<String>> {
        Ec2Client::get_console_output(self, instance_id).await
    }

    async fn get_password_data(&self, instance_id: &str) -> IaasResult<Option<String>> {
        Ec2Client::get_password_data(self, instance_id).await
    }
}
