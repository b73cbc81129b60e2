//! End-to-end tests of a cloud against the in-memory EC2 fake
//!
//! Time is paused: driver waits and SSH probes complete instantly.

use chrono::Utc;
use ec2_agents_cloud::aws::ec2::types::{
    InstanceDescription, NetworkInfo, SpotRequestDescription, SpotRequestFilter,
    SpotRequestState, Tags,
};
use ec2_agents_cloud::aws::{IaasError, describe_all_spot_requests};
use ec2_agents_cloud::ssh::KnownHosts;
use ec2_agents_cloud::testing::{FAKE_AMI, FakeEc2, LaunchFailure, ScriptedLauncher};
use ec2_agents_cloud::{
    Cloud, CloudEnv, CloudSet, DemandLedger, ErrorKind, FleetConfig, LoggingController,
    ProvisionOption, ProvisionOptions, Timings, ec2_step,
};
use ec2_agents_common::tags::{TAG_CLOUD, TAG_OWNER, TAG_TEMPLATE, owner_tag_value};
use ec2_agents_common::{LifecycleState, RemoteState};
use ec2_agents_test_utils::keys::{TEST_FINGERPRINT, TEST_PRIVATE_KEY_PEM};
use std::sync::Arc;
use std::time::Duration;

const CONTROLLER_URL: &str = "https://ci.example.com";

struct Harness {
    fake: FakeEc2,
    launcher: ScriptedLauncher,
    controller: Arc<LoggingController>,
    cloud: Cloud<FakeEc2, ScriptedLauncher>,
}

fn harness(template_extra: &str) -> Harness {
    let text = format!(
        r#"
        controller_url = "{CONTROLLER_URL}"
        [[clouds]]
        name = "main"
        region = "us-east-1"
        instance_cap = 10
        private_key = """{TEST_PRIVATE_KEY_PEM}"""
        [[clouds.templates]]
        id = "linux"
        ami = "{FAKE_AMI}"
        instance_type = "t3.large"
        labels = "linux"
        subnets = ["subnet-a", "subnet-b"]
        host_key_verification = "accept-new"
        {template_extra}
        "#
    );
    let mut fleet = FleetConfig::from_toml_str(&text).unwrap();
    let fake = FakeEc2::with_defaults(TEST_FINGERPRINT);
    let launcher = ScriptedLauncher::new();
    let controller = Arc::new(LoggingController::new());
    let env = CloudEnv {
        controller_url: CONTROLLER_URL.to_string(),
        timings: Arc::new(Timings::default()),
        controller: controller.clone(),
        demand: DemandLedger::new(),
        known_hosts: KnownHosts::new(),
        agent_payload: None,
    };
    let cloud = Cloud::new(
        fleet.clouds.remove(0),
        Arc::new(fake.clone()),
        Arc::new(launcher.clone()),
        env,
    )
    .unwrap();
    Harness {
        fake,
        launcher,
        controller,
        cloud,
    }
}

fn allow() -> ProvisionOptions {
    [ProvisionOption::AllowCreate].into()
}

async fn wait_until<F: FnMut() -> bool>(what: &str, mut done: F) {
    for _ in 0..10_000 {
        if done() {
            return;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
    panic!("timed out waiting for {what}");
}

fn owned_instance(id: &str, template: Option<&str>) -> InstanceDescription {
    let mut tags = Tags::from([(TAG_OWNER.to_string(), owner_tag_value(CONTROLLER_URL))]);
    tags.insert(TAG_CLOUD.to_string(), "main".to_string());
    if let Some(t) = template {
        tags.insert(TAG_TEMPLATE.to_string(), t.to_string());
    }
    InstanceDescription {
        instance_id: id.to_string(),
        state: RemoteState::Running,
        instance_type: Some("t3.large".to_string()),
        image_id: Some(FAKE_AMI.to_string()),
        subnet_id: Some("subnet-a".to_string()),
        vpc_id: Some("vpc-1".to_string()),
        availability_zone: Some("us-east-1a".to_string()),
        network: NetworkInfo {
            public_dns: Some("ec2-203-0-113-10.compute-1.amazonaws.com".to_string()),
            private_dns: Some("ip-10-0-0-10.ec2.internal".to_string()),
            public_ip: Some("203.0.113.10".to_string()),
            private_ip: Some("10.0.0.10".to_string()),
        },
        launch_time: Some(Utc::now() - chrono::Duration::hours(1)),
        tags,
        spot_request_id: None,
        key_name: Some("ci-key".to_string()),
        state_reason: None,
    }
}

#[tokio::test(start_paused = true)]
async fn provision_at_template_cap_returns_empty() {
    let h = harness("instance_cap = 2");
    assert_eq!(h.cloud.provision("linux", 2, &allow()).await.unwrap().len(), 2);
    let launches = h.fake.calls("RunInstances");

    let more = h.cloud.provision("linux", 1, &allow()).await.unwrap();
    assert!(more.is_empty());
    assert_eq!(h.fake.calls("RunInstances"), launches);
    assert_eq!(h.cloud.registry().count_live_template("linux"), 2);
    h.cloud.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn capacity_error_fails_over_to_next_subnet() {
    let h = harness("");
    h.fake.fail_subnet(
        "subnet-a",
        IaasError::Permanent {
            code: Some("InsufficientInstanceCapacity".to_string()),
            message: "no t3.large capacity in us-east-1a".to_string(),
        },
    );

    let records = h.cloud.provision("linux", 1, &allow()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].subnet_id.as_deref(), Some("subnet-b"));
    assert_eq!(records[0].attempt, 2);
    assert_eq!(h.fake.instances().len(), 1);
    h.cloud.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn orphans_are_adopted_or_terminated_in_one_pass() {
    let h = harness("");
    h.fake.add_instance(owned_instance("i-0adopt0000000001", Some("linux")));
    h.fake.add_instance(owned_instance("i-0reap00000000001", Some("retired")));

    let report = h.cloud.tick().await.unwrap();
    assert_eq!(report.adopted, 1);
    assert_eq!(report.reaped, 1);
    assert!(h.cloud.registry().contains("i-0adopt0000000001"));
    assert!(!h.cloud.registry().contains("i-0reap00000000001"));
    assert_eq!(h.fake.terminated(), ["i-0reap00000000001"]);

    // The adopted instance is driven like one of ours
    wait_until("adopted agent online", || {
        h.cloud.list_online_nodes().len() == 1
    })
    .await;
    h.cloud.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn foreign_instances_are_left_alone() {
    let h = harness("");
    let mut foreign = owned_instance("i-0foreign00000001", Some("linux"));
    foreign.tags.insert(
        TAG_OWNER.to_string(),
        owner_tag_value("https://other.example.com"),
    );
    h.fake.add_instance(foreign);

    let report = h.cloud.tick().await.unwrap();
    assert_eq!(report.adopted + report.reaped, 0);
    assert!(h.fake.terminated().is_empty());
}

#[tokio::test(start_paused = true)]
async fn demand_drives_agent_online_and_idle_terminates_it() {
    let h = harness("idle_termination_minutes = 5");
    let receipt = h.cloud.demand().request_capacity(Some("linux"), 1);

    let report = h.cloud.tick().await.unwrap();
    assert_eq!(report.provisioned, 1);
    wait_until("agent online", || h.cloud.list_online_nodes().len() == 1).await;

    let record = h.cloud.list_online_nodes().remove(0);
    let id = record.key().to_string();
    assert_eq!(h.controller.nodes().len(), 1);
    assert_eq!(h.controller.nodes()[0].instance_id, id);
    assert_eq!(h.launcher.targets().len(), 1);

    h.cloud.report_busy(&id, true).unwrap();
    assert!(h.cloud.registry().get(&id).unwrap().idle_since.is_none());
    assert!(h.cloud.demand().release_capacity(receipt));

    // Idle for longer than the template allows
    h.cloud
        .registry()
        .update(&id, |r| {
            r.idle_since = Some(Utc::now() - chrono::Duration::minutes(10));
        })
        .unwrap();
    let report = h.cloud.tick().await.unwrap();
    assert_eq!(report.idled, 1);
    assert_eq!(report.provisioned, 0);

    wait_until("record released", || h.cloud.registry().is_empty()).await;
    assert_eq!(h.fake.terminated(), [id.clone()]);
    assert!(h.controller.nodes().is_empty());
    assert_eq!(
        h.cloud.report_busy(&id, false).unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

#[tokio::test(start_paused = true)]
async fn rejected_credentials_terminate_the_instance() {
    let h = harness("");
    h.launcher.fail_next_launch(LaunchFailure::Auth);
    let records = h.cloud.provision("linux", 1, &allow()).await.unwrap();
    let id = records[0].key().to_string();
    let log = records[0].log.clone();

    wait_until("record released", || h.cloud.registry().is_empty()).await;
    assert_eq!(h.fake.terminated(), [id]);
    assert!(h.controller.nodes().is_empty());
    let contents = log.contents();
    assert!(contents.contains("CONNECTING -> FAILED (connect_fail)"));
    assert!(contents.contains("TERMINATING -> TERMINATED (gone)"));
}

#[tokio::test(start_paused = true)]
async fn instance_vanishing_remotely_is_released() {
    let h = harness("");
    let records = h.cloud.provision("linux", 1, &allow()).await.unwrap();
    let id = records[0].key().to_string();
    wait_until("agent online", || {
        h.cloud
            .registry()
            .get(&id)
            .is_some_and(|r| r.state == LifecycleState::Online)
    })
    .await;

    h.fake.set_state(&id, RemoteState::Terminated);
    h.cloud.tick().await.unwrap();
    wait_until("record released", || !h.cloud.registry().contains(&id)).await;
    assert!(h.controller.nodes().is_empty());
}

#[tokio::test(start_paused = true)]
async fn spot_template_is_fulfilled_and_rekeyed() {
    let h = harness(r#"spot = { max_price = "0.05" }"#);
    let records = h.cloud.provision("linux", 1, &allow()).await.unwrap();
    let request_id = records[0].spot_request_id.clone().unwrap();
    assert!(records[0].instance_id.is_none());

    wait_until("spot agent online", || h.cloud.list_online_nodes().len() == 1).await;
    let record = h.cloud.list_online_nodes().remove(0);
    assert_eq!(record.spot_request_id.as_deref(), Some(request_id.as_str()));
    let id = record.instance_id.clone().unwrap();
    assert!(h.cloud.registry().contains(&id));
    assert!(!h.cloud.registry().contains(&request_id));
    h.cloud.shutdown().await;
    assert_eq!(h.fake.terminated(), [id]);
}

#[tokio::test]
async fn spot_request_pages_are_aggregated_without_loss() {
    let fake = FakeEc2::new();
    fake.set_hold_spot(true);
    fake.set_spot_page_overlap(true);
    // One past two full pages
    for i in 0..201 {
        fake.add_spot_request(SpotRequestDescription {
            request_id: format!("sir-{i:04}"),
            state: SpotRequestState::Open,
            instance_id: None,
            status_code: Some("pending-evaluation".to_string()),
            tags: Tags::new(),
        });
    }

    let all = describe_all_spot_requests(&fake, &SpotRequestFilter::default())
        .await
        .unwrap();
    assert_eq!(all.len(), 201);
    assert_eq!(all.first().unwrap().request_id, "sir-0000");
    assert_eq!(all.last().unwrap().request_id, "sir-0200");
    assert!(fake.calls("DescribeSpotInstanceRequests") >= 3);

    let some = describe_all_spot_requests(&fake, &SpotRequestFilter::ids(["sir-0007", "sir-0150"]))
        .await
        .unwrap();
    let ids: Vec<_> = some.iter().map(|r| r.request_id.as_str()).collect();
    assert_eq!(ids, ["sir-0007", "sir-0150"]);
}

#[tokio::test(start_paused = true)]
async fn pipeline_step_returns_the_running_instance() {
    let h = harness("");
    let set = CloudSet::new(vec![h.cloud]).unwrap();
    let instance = ec2_step(&set, "main", "linux").await.unwrap();
    assert!(h.fake.instance(&instance.id).is_some());
    assert_eq!(instance.tags[TAG_TEMPLATE], "linux");

    let err = ec2_step(&set, "main", "missing").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    set.shutdown_all().await;
    assert!(h.fake.terminated().contains(&instance.id));
}
