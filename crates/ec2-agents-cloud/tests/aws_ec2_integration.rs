//! EC2 integration tests - actually call AWS APIs
//!
//! These tests are marked `#[ignore]` and only run with:
//! ```
//! AWS_PROFILE=your_profile cargo test --test aws_ec2_integration -- --ignored
//! ```
//!
//! They only read: nothing is launched.

use ec2_agents_cloud::aws::ec2::types::{Filter, InstanceQuery, SpotRequestFilter};
use ec2_agents_cloud::aws::{Ec2Api, Ec2Client, describe_all_spot_requests};
use ec2_agents_common::tags::{TAG_OWNER, owner_tag_value};
use ec2_agents_test_utils::aws::{get_test_region, test_controller_url};

#[tokio::test]
#[ignore]
async fn test_describe_regions_includes_test_region() {
    let region = get_test_region();
    let client = Ec2Client::new(&region).await;

    let regions = client
        .describe_regions()
        .await
        .expect("AWS credentials required - set AWS_PROFILE or AWS_ACCESS_KEY_ID");
    assert!(
        regions.iter().any(|r| r.region_name == region),
        "region {region} missing from {regions:?}"
    );
}

/// A fresh controller URL owns nothing, so the owner filter must match nothing
#[tokio::test]
#[ignore]
async fn test_owner_filter_matches_nothing_for_new_controller() {
    let client = Ec2Client::new(&get_test_region()).await;
    let owner = owner_tag_value(&test_controller_url());

    let instances = client
        .describe_instances(&InstanceQuery::Filtered(vec![Filter::tag(TAG_OWNER, owner.as_str())]))
        .await
        .expect("Should describe instances");
    assert!(instances.is_empty(), "unexpected instances: {instances:?}");

    let requests = describe_all_spot_requests(
        &client,
        &SpotRequestFilter {
            filters: vec![Filter::tag(TAG_OWNER, owner)],
            ..Default::default()
        },
    )
    .await
    .expect("Should describe spot requests");
    assert!(requests.is_empty(), "unexpected spot requests: {requests:?}");
}

#[tokio::test]
#[ignore]
async fn test_unknown_instance_is_not_found() {
    let client = Ec2Client::new(&get_test_region()).await;
    let err = client
        .describe_instances(&InstanceQuery::Ids(vec!["i-0000000000000dead".to_string()]))
        .await
        .expect_err("Instance should not exist");
    assert!(err.is_not_found(), "expected not found, got {err:?}");
}
