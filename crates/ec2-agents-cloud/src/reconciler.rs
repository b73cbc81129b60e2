//! Periodic reconciliation of one cloud
//!
//! Each pass describes the instances this controller owns, folds the result
//! into the registry, reaps orphans and zombies, fails stuck launches, idles
//! out unused agents and serves outstanding demand through the planner.
//! Describe calls complete before the registry is touched, so a pass works
//! on one consistent snapshot.

use crate::aws::Ec2Api;
use crate::aws::ec2::types::{Filter, InstanceDescription, InstanceQuery};
use crate::config::TemplateConfig;
use crate::error::ProvisionResult;
use crate::launch::driver::{self, DriverContext, DriverHandle};
use crate::launch::state::{self, Event, IdleAction};
use crate::node::{DemandKey, DemandLedger};
use crate::planner::{Planner, ProvisionOption};
use crate::registry::{self, Divergence, Flavor, InstanceRecord};
use crate::ssh::AgentLauncher;
use chrono::{DateTime, Utc};
use ec2_agents_common::LifecycleState;
use ec2_agents_common::tags::{TAG_OWNER, TAG_TEMPLATE};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// What one pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Records dropped because their instance is gone
    pub evicted: usize,
    /// Orphans taken under management
    pub adopted: usize,
    /// Orphans terminated
    pub reaped: usize,
    /// Launches failed for staying pending too long
    pub stuck: usize,
    /// Agents sent the idle event
    pub idled: usize,
    /// Records provisioned for demand
    pub provisioned: usize,
}

pub struct Reconciler<C, L> {
    ctx: DriverContext<C, L>,
    planner: Arc<Planner<C>>,
    demand: DemandLedger,
    owner: String,
    /// Parent of every driver's token
    drivers_cancel: CancellationToken,
    drivers: Mutex<Vec<DriverHandle>>,
}

impl<C: Ec2Api + 'static, L: AgentLauncher> Reconciler<C, L> {
    pub fn new(
        ctx: DriverContext<C, L>,
        planner: Arc<Planner<C>>,
        demand: DemandLedger,
        owner: String,
        drivers_cancel: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            planner,
            demand,
            owner,
            drivers_cancel,
            drivers: Mutex::new(Vec::new()),
        }
    }

    /// Reconcile every `reconcile_interval` until `cancel` fires. With
    /// `no_delay_provisioning` new demand triggers a pass immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.ctx.timings.reconcile_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let eager = self.ctx.cloud.no_delay_provisioning;

        info!(
            cloud = %self.ctx.cloud.name,
            interval = ?self.ctx.timings.reconcile_interval(),
            eager,
            "Reconciler started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
                _ = self.demand.changed(), if eager => {}
            }
            if let Err(e) = self.tick().await {
                warn!(cloud = %self.ctx.cloud.name, error = %e.cause_chain(), "Reconcile pass failed");
            }
        }
        info!(cloud = %self.ctx.cloud.name, "Reconciler stopped");
    }

    /// One reconcile pass.
    #[instrument(skip_all, fields(cloud = %self.ctx.cloud.name))]
    pub async fn tick(&self) -> ProvisionResult<TickReport> {
        let mut report = TickReport::default();
        self.prune_drivers();

        {
            let _admission = self.planner.admission().await;
            let remote = self.describe_owned().await?;
            let now = Utc::now();
            let local = self.ctx.registry.snapshot();
            let grace = chrono::Duration::from_std(self.ctx.timings.orphan_grace())
                .unwrap_or(chrono::Duration::zero());
            let diff = registry::reconcile(
                &local,
                &remote,
                &self.owner,
                &self.ctx.cloud.name,
                now,
                grace,
            );

            for key in &diff.missing {
                if let Err(e) = self.ctx.registry.update(key, |r| r.missing_since = Some(now)) {
                    debug!(key, error = %e, "Record removed during pass");
                }
            }
            for (key, description) in &diff.seen {
                if let Err(e) = self.ctx.registry.update(key, |r| r.observe(description, now)) {
                    debug!(key, error = %e, "Record removed during pass");
                }
            }
            for key in &diff.evict {
                self.evict(key);
                report.evicted += 1;
            }
            for divergence in &diff.diverged {
                self.converge(divergence);
            }
            for orphan in &diff.orphans {
                match self.orphan(orphan, now, grace).await {
                    Some(true) => report.adopted += 1,
                    Some(false) => report.reaped += 1,
                    None => {}
                }
            }
        }

        report.stuck = self.fail_stuck();
        report.idled = self.idle_out();
        report.provisioned = self.serve_demand().await;
        self.spawn_drivers();

        if report != TickReport::default() {
            info!(?report, "Reconcile pass");
        } else {
            debug!("Reconcile pass, nothing to do");
        }
        Ok(report)
    }

    /// Instances tagged with our owner tag, plus any recorded instance the
    /// tag query missed.
    async fn describe_owned(&self) -> ProvisionResult<Vec<InstanceDescription>> {
        let api = self.ctx.api.as_ref();
        let mut remote = api
            .describe_instances(&InstanceQuery::Filtered(vec![Filter::tag(
                TAG_OWNER,
                self.owner.as_str(),
            )]))
            .await?;

        let seen: HashSet<&str> = remote.iter().map(|r| r.instance_id.as_str()).collect();
        let unseen: Vec<String> = self
            .ctx
            .registry
            .snapshot()
            .into_iter()
            .filter_map(|r| r.instance_id)
            .filter(|id| !seen.contains(id.as_str()))
            .collect();
        if !unseen.is_empty() {
            match api.describe_instances(&InstanceQuery::Ids(unseen)).await {
                Ok(more) => remote.extend(more),
                Err(e) if e.is_not_found() => {
                    debug!(error = %e, "Some recorded instances no longer exist");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(remote)
    }

    fn idle_action(&self, record: &InstanceRecord) -> IdleAction {
        IdleAction::from_stop_on_terminate(
            self.ctx
                .cloud
                .template(&record.template_id)
                .is_some_and(|t| t.stop_on_terminate),
        )
    }

    /// Queue `event` on the record's driver, or apply it here when it has none.
    fn dispatch(&self, key: &str, event: Event) {
        {
            let drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(handle) = drivers.iter().find(|h| !h.is_finished() && h.key() == key) {
                if handle.send(event) {
                    return;
                }
            }
        }
        let Some(record) = self.ctx.registry.get(key) else {
            return;
        };
        if let Err(e) = state::apply(&self.ctx.registry, key, event, self.idle_action(&record)) {
            debug!(key, %event, error = %e, "Event not applied");
        }
    }

    /// Drop a record whose instance EC2 no longer reports.
    fn evict(&self, key: &str) {
        let driven = self
            .drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|h| !h.is_finished() && h.key() == key);
        if driven {
            self.dispatch(key, Event::Gone);
            return;
        }
        if let Some(record) = self.ctx.registry.remove(key) {
            if let Some(instance_id) = &record.instance_id {
                self.ctx.known_hosts.forget(instance_id);
            }
            record.log.event("instance no longer reported by EC2, record dropped");
            info!(key, template = %record.template_id, state = %record.state, "Evicted record");
        }
    }

    /// Bring a record in line with the state EC2 reports.
    fn converge(&self, divergence: &Divergence) {
        let event = match divergence.implied {
            LifecycleState::Terminated => Event::Gone,
            LifecycleState::Terminating => Event::ExplicitTerminate,
            LifecycleState::Resumable => Event::Stopped,
            LifecycleState::Pending => Event::Demand,
            other => {
                debug!(key = %divergence.key, implied = %other, "No event for divergence");
                return;
            }
        };
        info!(
            key = %divergence.key,
            local = %divergence.local,
            remote = %divergence.remote,
            %event,
            "Record diverged from EC2"
        );
        self.dispatch(&divergence.key, event);
    }

    /// Adopt an orphan whose template is known and fits the caps, otherwise
    /// terminate it. `None` while the orphan is inside the grace period or
    /// when the terminate call fails; the next pass retries it.
    async fn orphan(
        &self,
        orphan: &InstanceDescription,
        now: DateTime<Utc>,
        grace: chrono::Duration,
    ) -> Option<bool> {
        if orphan.launch_time.is_some_and(|t| now - t < grace) {
            debug!(instance_id = %orphan.instance_id, "Orphan within grace period");
            return None;
        }

        let template = orphan
            .tag(TAG_TEMPLATE)
            .and_then(|id| self.ctx.cloud.template(id));
        if let Some(template) = template {
            if self.planner.headroom(template).admits(1, false) {
                return Some(self.adopt(orphan, template));
            }
        }

        warn!(
            instance_id = %orphan.instance_id,
            template = ?orphan.tag(TAG_TEMPLATE),
            "Terminating orphan instance"
        );
        match self
            .ctx
            .api
            .terminate_instances(std::slice::from_ref(&orphan.instance_id))
            .await
        {
            Ok(()) => Some(false),
            Err(e) if e.is_not_found() => Some(false),
            Err(e) => {
                warn!(instance_id = %orphan.instance_id, error = %e, "Failed to terminate orphan");
                None
            }
        }
    }

    fn adopt(&self, orphan: &InstanceDescription, template: &TemplateConfig) -> bool {
        let flavor = if orphan.spot_request_id.is_some() {
            Flavor::Spot
        } else {
            Flavor::OnDemand
        };
        let labels = template.label_set().into_iter().map(str::to_string).collect();
        let mut record = InstanceRecord::new(&self.ctx.cloud.name, &template.id, labels, flavor);
        record.instance_id = Some(orphan.instance_id.clone());
        record.spot_request_id = orphan.spot_request_id.clone();
        record.launched_at = orphan.launch_time.unwrap_or(record.launched_at);
        record.observe(orphan, Utc::now());
        record
            .log
            .event(format!("adopted orphan instance {}", orphan.instance_id));

        match self.ctx.registry.insert(record) {
            Ok(()) => {
                info!(instance_id = %orphan.instance_id, template = %template.id, "Adopted orphan instance");
                true
            }
            Err(e) => {
                warn!(instance_id = %orphan.instance_id, error = %e, "Cannot adopt orphan");
                false
            }
        }
    }

    /// Fail launches pending longer than all their attempts allow.
    fn fail_stuck(&self) -> usize {
        let limit = self.ctx.timings.stuck_pending_after();
        let now = Utc::now();
        let mut failed = 0;
        for record in self.ctx.registry.by_state(LifecycleState::Pending) {
            let pending_for = (now - record.state_since).to_std().unwrap_or(Duration::ZERO);
            if pending_for < limit {
                continue;
            }
            warn!(key = %record.key(), ?pending_for, "Launch stuck in pending");
            record.log.event(format!("stuck pending for {pending_for:?}"));
            self.dispatch(record.key(), Event::Fail);
            failed += 1;
        }
        failed
    }

    /// Send the idle event to agents idle past their template's limit.
    fn idle_out(&self) -> usize {
        let now = Utc::now();
        let mut idled = 0;
        for record in self.ctx.registry.by_state(LifecycleState::Online) {
            let Some(template) = self.ctx.cloud.template(&record.template_id) else {
                continue;
            };
            if template.idle_termination_minutes == 0 {
                continue;
            }
            let Some(since) = record.idle_since else {
                continue;
            };
            let limit = chrono::Duration::minutes(
                i64::try_from(template.idle_termination_minutes).unwrap_or(i64::MAX),
            );
            if now - since < limit {
                continue;
            }
            info!(key = %record.key(), idle_since = %since, "Agent idle past its limit");
            self.dispatch(record.key(), Event::Idle);
            idled += 1;
        }
        idled
    }

    /// Requested capacity per label minus the records already serving it.
    pub fn shortfall(&self) -> Vec<(DemandKey, u32)> {
        let records = self.ctx.registry.snapshot();
        self.demand
            .outstanding()
            .into_iter()
            .filter_map(|(label, requested)| {
                let serving = records
                    .iter()
                    .filter(|r| r.serves_demand())
                    .filter(|r| {
                        self.ctx
                            .cloud
                            .template(&r.template_id)
                            .is_some_and(|t| t.matches_label(label.as_deref()))
                    })
                    .count();
                let short = requested.saturating_sub(u32::try_from(serving).unwrap_or(u32::MAX));
                (short > 0).then_some((label, short))
            })
            .collect()
    }

    /// Templates serving `label`, most preferred first: below half their
    /// cap, then on-demand before spot, then by id. A spot-only template
    /// (no on-demand fallback) ranks with the on-demand ones.
    pub fn candidates(&self, label: Option<&str>) -> Vec<&TemplateConfig> {
        let cloud = &self.ctx.cloud;
        let mut templates: Vec<&TemplateConfig> = cloud
            .templates
            .iter()
            .filter(|t| t.matches_label(label))
            .collect();
        templates.sort_by_cached_key(|t| {
            let cap = t.effective_cap(cloud.instance_cap);
            let live = u32::try_from(self.ctx.registry.count_live_template(&t.id))
                .unwrap_or(u32::MAX);
            let below_half = live.saturating_mul(2) < cap;
            let demoted = t.spot.as_ref().is_some_and(|s| s.fallback_to_on_demand);
            (!below_half, demoted, t.id.clone())
        });
        templates
    }

    async fn serve_demand(&self) -> usize {
        let mut provisioned = 0;
        for (label, mut short) in self.shortfall() {
            for template in self.candidates(label.as_deref()) {
                if short == 0 {
                    break;
                }
                match self
                    .planner
                    .provision(template, short, &[ProvisionOption::AllowCreate].into())
                    .await
                {
                    Ok(records) => {
                        let got = u32::try_from(records.len()).unwrap_or(short);
                        short = short.saturating_sub(got);
                        provisioned += records.len();
                    }
                    Err(e) => warn!(
                        label = ?label,
                        template = %template.id,
                        kind = %e.kind(),
                        error = %e.cause_chain(),
                        "Provisioning for demand failed"
                    ),
                }
            }
            if short > 0 {
                debug!(label = ?label, short, "Demand not fully served this pass");
            }
        }
        provisioned
    }

    fn prune_drivers(&self) {
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|h| !h.is_finished());
    }

    /// Start a driver for every record that needs one and has none.
    pub fn spawn_drivers(&self) {
        let mut drivers = self.drivers.lock().unwrap_or_else(PoisonError::into_inner);
        let driven: HashSet<String> = drivers
            .iter()
            .filter(|h| !h.is_finished())
            .map(DriverHandle::key)
            .collect();
        for record in self.ctx.registry.snapshot() {
            if record.state == LifecycleState::Resumable || driven.contains(record.key()) {
                continue;
            }
            debug!(key = %record.key(), state = %record.state, "Starting driver");
            drivers.push(driver::spawn(
                self.ctx.clone(),
                record.key(),
                &self.drivers_cancel,
            ));
        }
    }

    /// Running drivers
    pub fn driver_count(&self) -> usize {
        self.drivers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Wait for every driver to exit.
    pub async fn join_drivers(&self) {
        let drivers = std::mem::take(
            &mut *self.drivers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        futures::future::join_all(drivers.into_iter().map(DriverHandle::join)).await;
    }
}
