//! Instance registry
//!
//! In-memory map of the instance records a cloud owns, with secondary
//! indexes by template, lifecycle state and label. Records are keyed by
//! instance id, or by spot request id until the request is fulfilled.
//! All reads return cloned snapshots.

use crate::aws::ec2::types::{InstanceDescription, NetworkInfo, Tags};
use crate::log_buffer::NodeLog;
use chrono::{DateTime, Utc};
use ec2_agents_common::tags::{TAG_CLOUD, TAG_OWNER};
use ec2_agents_common::{LifecycleState, RemoteState};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

/// Purchase model of an instance
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, strum::Display, strum::AsRefStr,
)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum Flavor {
    #[default]
    OnDemand,
    Spot,
}

/// Local view of one launched instance
#[derive(Debug, Clone, Serialize)]
pub struct InstanceRecord {
    /// Instance id once known
    pub instance_id: Option<String>,
    pub spot_request_id: Option<String>,
    pub cloud: String,
    pub template_id: String,
    pub labels: BTreeSet<String>,
    pub flavor: Flavor,
    pub state: LifecycleState,
    pub state_since: DateTime<Utc>,
    pub launched_at: DateTime<Utc>,
    /// Last time a describe call reported the instance
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_state: Option<RemoteState>,
    pub subnet_id: Option<String>,
    pub network: NetworkInfo,
    /// Address the SSH launcher connected to
    pub endpoint: Option<String>,
    pub tags: Tags,
    /// Launch and step attempts so far; never decreases
    pub attempt: u32,
    /// First pass on which the instance was missing from describe results
    pub missing_since: Option<DateTime<Utc>>,
    /// Set while an online agent has no work
    pub idle_since: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub log: NodeLog,
}

impl InstanceRecord {
    pub fn new(cloud: &str, template_id: &str, labels: BTreeSet<String>, flavor: Flavor) -> Self {
        let now = Utc::now();
        Self {
            instance_id: None,
            spot_request_id: None,
            cloud: cloud.to_string(),
            template_id: template_id.to_string(),
            labels,
            flavor,
            state: LifecycleState::Pending,
            state_since: now,
            launched_at: now,
            last_seen: None,
            remote_state: None,
            subnet_id: None,
            network: NetworkInfo::default(),
            endpoint: None,
            tags: Tags::new(),
            attempt: 0,
            missing_since: None,
            idle_since: None,
            log: NodeLog::default(),
        }
    }

    /// Registry key: instance id, else spot request id
    pub fn key(&self) -> &str {
        self.instance_id
            .as_deref()
            .or(self.spot_request_id.as_deref())
            .unwrap_or_default()
    }

    /// Counts against instance caps
    pub fn is_live(&self) -> bool {
        !self.state.is_released()
    }

    /// Serves a label: running or on its way to running
    pub fn serves_demand(&self) -> bool {
        self.state.is_in_flight() || self.state == LifecycleState::Online
    }

    pub fn has_label(&self, label: Option<&str>) -> bool {
        label.is_none_or(|l| self.labels.contains(l))
    }

    /// Copy what a describe call reports onto the record.
    pub fn observe(&mut self, remote: &InstanceDescription, now: DateTime<Utc>) {
        self.remote_state = Some(remote.state);
        self.last_seen = Some(now);
        self.missing_since = None;
        if remote.subnet_id.is_some() {
            self.subnet_id = remote.subnet_id.clone();
        }
        if remote.network != NetworkInfo::default() {
            self.network = remote.network.clone();
        }
        for (k, v) in &remote.tags {
            self.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("no record for {0}")]
    NotFound(String),

    #[error("record {0} already exists")]
    Duplicate(String),

    #[error("record {key} is {actual}, expected {expected}")]
    StateMismatch {
        key: String,
        expected: LifecycleState,
        actual: LifecycleState,
    },
}

#[derive(Default)]
struct Inner {
    records: HashMap<String, InstanceRecord>,
    by_template: HashMap<String, BTreeSet<String>>,
    by_state: HashMap<LifecycleState, BTreeSet<String>>,
    by_label: HashMap<String, BTreeSet<String>>,
}

impl Inner {
    fn index(&mut self, key: &str, record: &InstanceRecord) {
        self.by_template
            .entry(record.template_id.clone())
            .or_default()
            .insert(key.to_string());
        self.by_state
            .entry(record.state)
            .or_default()
            .insert(key.to_string());
        for label in &record.labels {
            self.by_label
                .entry(label.clone())
                .or_default()
                .insert(key.to_string());
        }
    }

    fn unindex(&mut self, key: &str, record: &InstanceRecord) {
        fn drop_key<K: std::hash::Hash + Eq>(
            map: &mut HashMap<K, BTreeSet<String>>,
            index: &K,
            key: &str,
        ) {
            if let Some(keys) = map.get_mut(index) {
                keys.remove(key);
                if keys.is_empty() {
                    map.remove(index);
                }
            }
        }
        drop_key(&mut self.by_template, &record.template_id, key);
        drop_key(&mut self.by_state, &record.state, key);
        for label in &record.labels {
            drop_key(&mut self.by_label, label, key);
        }
    }

    fn collect(&self, keys: Option<&BTreeSet<String>>) -> Vec<InstanceRecord> {
        keys.into_iter()
            .flatten()
            .filter_map(|k| self.records.get(k).cloned())
            .collect()
    }
}

/// Shared, cloneable registry handle
#[derive(Clone, Default)]
pub struct InstanceRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry")
            .field("records", &self.len())
            .finish()
    }
}

impl InstanceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, record: InstanceRecord) -> Result<(), RegistryError> {
        let key = record.key().to_string();
        let mut inner = self.lock();
        if inner.records.contains_key(&key) {
            return Err(RegistryError::Duplicate(key));
        }
        inner.index(&key, &record);
        inner.records.insert(key, record);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<InstanceRecord> {
        self.lock().records.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.lock().records.contains_key(key)
    }

    pub fn remove(&self, key: &str) -> Option<InstanceRecord> {
        let mut inner = self.lock();
        let record = inner.records.remove(key)?;
        inner.unindex(key, &record);
        Some(record)
    }

    /// Move `key` from `expected` to `next`; fails without change when the
    /// record is in any other state.
    pub fn compare_and_set(
        &self,
        key: &str,
        expected: LifecycleState,
        next: LifecycleState,
    ) -> Result<InstanceRecord, RegistryError> {
        let mut inner = self.lock();
        let record = inner
            .records
            .get(key)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        if record.state != expected {
            return Err(RegistryError::StateMismatch {
                key: key.to_string(),
                expected,
                actual: record.state,
            });
        }

        inner.unindex(key, &record);
        let mut updated = record;
        updated.state = next;
        updated.state_since = Utc::now();
        updated.idle_since = (next == LifecycleState::Online).then_some(updated.state_since);
        inner.index(key, &updated);
        inner.records.insert(key.to_string(), updated.clone());
        Ok(updated)
    }

    /// Update fields other than the state, template and labels.
    pub fn update<F>(&self, key: &str, f: F) -> Result<InstanceRecord, RegistryError>
    where
        F: FnOnce(&mut InstanceRecord),
    {
        let mut inner = self.lock();
        let record = inner
            .records
            .get_mut(key)
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        let (state, template, labels) =
            (record.state, record.template_id.clone(), record.labels.clone());
        f(record);
        record.state = state;
        record.template_id = template;
        record.labels = labels;
        Ok(record.clone())
    }

    /// Re-key a spot record under the instance id that fulfilled it.
    pub fn assign_instance(
        &self,
        spot_request_id: &str,
        instance_id: &str,
    ) -> Result<InstanceRecord, RegistryError> {
        let mut inner = self.lock();
        if inner.records.contains_key(instance_id) {
            return Err(RegistryError::Duplicate(instance_id.to_string()));
        }
        let mut record = inner
            .records
            .remove(spot_request_id)
            .ok_or_else(|| RegistryError::NotFound(spot_request_id.to_string()))?;
        inner.unindex(spot_request_id, &record);
        record.instance_id = Some(instance_id.to_string());
        inner.index(instance_id, &record);
        inner.records.insert(instance_id.to_string(), record.clone());
        Ok(record)
    }

    pub fn snapshot(&self) -> Vec<InstanceRecord> {
        let mut records: Vec<_> = self.lock().records.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(b.key()));
        records
    }

    pub fn by_template(&self, template_id: &str) -> Vec<InstanceRecord> {
        let inner = self.lock();
        inner.collect(inner.by_template.get(template_id))
    }

    pub fn by_state(&self, state: LifecycleState) -> Vec<InstanceRecord> {
        let inner = self.lock();
        inner.collect(inner.by_state.get(&state))
    }

    pub fn by_label(&self, label: &str) -> Vec<InstanceRecord> {
        let inner = self.lock();
        inner.collect(inner.by_label.get(label))
    }

    /// Records counting against the cloud cap
    pub fn count_live(&self) -> usize {
        self.lock().records.values().filter(|r| r.is_live()).count()
    }

    /// Records of `template_id` counting against its cap
    pub fn count_live_template(&self, template_id: &str) -> usize {
        let inner = self.lock();
        inner
            .by_template
            .get(template_id)
            .into_iter()
            .flatten()
            .filter_map(|k| inner.records.get(k))
            .filter(|r| r.is_live())
            .count()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

/// A local state change forced by the remote state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Divergence {
    pub key: String,
    pub local: LifecycleState,
    pub remote: RemoteState,
    pub implied: LifecycleState,
}

/// Outcome of comparing the registry with one describe snapshot
#[derive(Debug, Clone, Default)]
pub struct ReconcileDiff {
    /// Records missing remotely past the grace period, or already terminated
    pub evict: Vec<String>,
    /// Records missing remotely for the first time
    pub missing: Vec<String>,
    /// Records present remotely, with the description to copy onto them
    pub seen: Vec<(String, InstanceDescription)>,
    /// Owned instances with no record
    pub orphans: Vec<InstanceDescription>,
    pub diverged: Vec<Divergence>,
}

/// Diff `local` against the `remote` describe result.
///
/// Remote instances count as ours when their owner tag equals `owner` and
/// their cloud tag, if any, names `cloud`. Records still waiting on a spot
/// request have no instance to compare and are skipped.
pub fn reconcile(
    local: &[InstanceRecord],
    remote: &[InstanceDescription],
    owner: &str,
    cloud: &str,
    now: DateTime<Utc>,
    grace: chrono::Duration,
) -> ReconcileDiff {
    let remote_by_id: HashMap<&str, &InstanceDescription> = remote
        .iter()
        .map(|r| (r.instance_id.as_str(), r))
        .collect();
    let mut diff = ReconcileDiff::default();
    let mut known = HashSet::new();

    for record in local {
        let Some(instance_id) = record.instance_id.as_deref() else {
            continue;
        };
        known.insert(instance_id);
        let key = record.key().to_string();

        match remote_by_id.get(instance_id) {
            None if record.state == LifecycleState::Terminated => diff.evict.push(key),
            None => match record.missing_since {
                Some(since) if now - since >= grace => diff.evict.push(key),
                Some(_) => {}
                None => diff.missing.push(key),
            },
            Some(description) => {
                if let Some(implied) = description.state.implied_local(record.state) {
                    diff.diverged.push(Divergence {
                        key: key.clone(),
                        local: record.state,
                        remote: description.state,
                        implied,
                    });
                }
                diff.seen.push((key, (*description).clone()));
            }
        }
    }

    diff.orphans = remote
        .iter()
        .filter(|r| !known.contains(r.instance_id.as_str()))
        .filter(|r| !r.state.is_gone())
        .filter(|r| r.tag(TAG_OWNER) == Some(owner))
        .filter(|r| r.tag(TAG_CLOUD).is_none_or(|c| c == cloud))
        .cloned()
        .collect();

    diff
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(id: &str, template: &str, labels: &[&str]) -> InstanceRecord {
        let mut r = InstanceRecord::new(
            "cloud",
            template,
            labels.iter().map(|l| l.to_string()).collect(),
            Flavor::OnDemand,
        );
        r.instance_id = Some(id.to_string());
        r
    }

    fn remote(id: &str, state: RemoteState, owner: Option<&str>) -> InstanceDescription {
        let mut tags = Tags::new();
        if let Some(owner) = owner {
            tags.insert(TAG_OWNER.to_string(), owner.to_string());
        }
        InstanceDescription {
            instance_id: id.to_string(),
            state,
            instance_type: None,
            image_id: None,
            subnet_id: None,
            vpc_id: None,
            availability_zone: None,
            network: NetworkInfo::default(),
            launch_time: None,
            tags,
            spot_request_id: None,
            key_name: None,
            state_reason: None,
        }
    }

    #[test]
    fn indexes_follow_state_changes() {
        let registry = InstanceRegistry::new();
        registry.insert(record("i-1", "linux", &["docker", "linux"])).unwrap();
        registry.insert(record("i-2", "linux", &["linux"])).unwrap();

        assert_eq!(registry.by_label("linux").len(), 2);
        assert_eq!(registry.by_label("docker").len(), 1);
        assert_eq!(registry.by_state(LifecycleState::Pending).len(), 2);

        registry
            .compare_and_set("i-1", LifecycleState::Pending, LifecycleState::Booting)
            .unwrap();
        assert_eq!(registry.by_state(LifecycleState::Pending).len(), 1);
        assert_eq!(registry.by_state(LifecycleState::Booting).len(), 1);

        registry.remove("i-1").unwrap();
        assert!(registry.by_label("docker").is_empty());
        assert_eq!(registry.by_template("linux").len(), 1);
    }

    #[test]
    fn compare_and_set_rejects_stale_expectation() {
        let registry = InstanceRegistry::new();
        registry.insert(record("i-1", "linux", &[])).unwrap();

        let err = registry
            .compare_and_set("i-1", LifecycleState::Booting, LifecycleState::Connecting)
            .unwrap_err();
        assert_eq!(
            err,
            RegistryError::StateMismatch {
                key: "i-1".to_string(),
                expected: LifecycleState::Booting,
                actual: LifecycleState::Pending,
            }
        );
        assert_eq!(registry.get("i-1").unwrap().state, LifecycleState::Pending);
        assert!(matches!(
            registry.compare_and_set("i-9", LifecycleState::Pending, LifecycleState::Booting),
            Err(RegistryError::NotFound(_))
        ));
    }

    #[test]
    fn online_sets_idle_since() {
        let registry = InstanceRegistry::new();
        let mut r = record("i-1", "linux", &[]);
        r.state = LifecycleState::Connecting;
        registry.insert(r).unwrap();

        let online = registry
            .compare_and_set("i-1", LifecycleState::Connecting, LifecycleState::Online)
            .unwrap();
        assert!(online.idle_since.is_some());
    }

    #[test]
    fn update_cannot_change_state() {
        let registry = InstanceRegistry::new();
        registry.insert(record("i-1", "linux", &[])).unwrap();
        let updated = registry
            .update("i-1", |r| {
                r.state = LifecycleState::Online;
                r.attempt += 1;
            })
            .unwrap();
        assert_eq!(updated.state, LifecycleState::Pending);
        assert_eq!(updated.attempt, 1);
        assert_eq!(registry.by_state(LifecycleState::Pending).len(), 1);
    }

    #[test]
    fn spot_records_are_rekeyed() {
        let registry = InstanceRegistry::new();
        let mut r = InstanceRecord::new("cloud", "spot", BTreeSet::new(), Flavor::Spot);
        r.spot_request_id = Some("sir-1".to_string());
        registry.insert(r).unwrap();
        assert!(registry.contains("sir-1"));

        let assigned = registry.assign_instance("sir-1", "i-7").unwrap();
        assert_eq!(assigned.key(), "i-7");
        assert!(!registry.contains("sir-1"));
        assert_eq!(registry.by_template("spot")[0].instance_id.as_deref(), Some("i-7"));
    }

    #[test]
    fn released_records_do_not_count() {
        let registry = InstanceRegistry::new();
        registry.insert(record("i-1", "linux", &[])).unwrap();
        let mut failed = record("i-2", "linux", &[]);
        failed.state = LifecycleState::Failed;
        registry.insert(failed).unwrap();

        assert_eq!(registry.count_live(), 1);
        assert_eq!(registry.count_live_template("linux"), 1);
        assert_eq!(registry.count_live_template("windows"), 0);
        assert!(matches!(
            registry.insert(record("i-1", "linux", &[])),
            Err(RegistryError::Duplicate(_))
        ));
    }

    #[test]
    fn reconcile_marks_then_evicts_missing() {
        let now = Utc::now();
        let grace = chrono::Duration::minutes(2);
        let fresh = record("i-1", "linux", &[]);
        let mut stale = record("i-2", "linux", &[]);
        stale.missing_since = Some(now - chrono::Duration::minutes(3));
        let mut recent = record("i-3", "linux", &[]);
        recent.missing_since = Some(now - chrono::Duration::seconds(30));

        let diff = reconcile(&[fresh, stale, recent], &[], "demand_ci", "cloud", now, grace);
        assert_eq!(diff.missing, vec!["i-1"]);
        assert_eq!(diff.evict, vec!["i-2"]);
    }

    #[test]
    fn reconcile_finds_orphans_and_divergence() {
        let now = Utc::now();
        let mut online = record("i-1", "linux", &[]);
        online.state = LifecycleState::Online;
        let mut spot_waiting = InstanceRecord::new("cloud", "spot", BTreeSet::new(), Flavor::Spot);
        spot_waiting.spot_request_id = Some("sir-1".to_string());

        let mut foreign_cloud = remote("i-4", RemoteState::Running, Some("demand_ci"));
        foreign_cloud
            .tags
            .insert(TAG_CLOUD.to_string(), "other".to_string());

        let described = vec![
            remote("i-1", RemoteState::Terminated, Some("demand_ci")),
            remote("i-2", RemoteState::Running, Some("demand_ci")),
            remote("i-3", RemoteState::Running, Some("demand_other")),
            foreign_cloud,
            remote("i-5", RemoteState::ShuttingDown, Some("demand_ci")),
            remote("i-6", RemoteState::Running, None),
        ];
        let diff = reconcile(
            &[online, spot_waiting],
            &described,
            "demand_ci",
            "cloud",
            now,
            chrono::Duration::minutes(2),
        );

        assert_eq!(diff.orphans.len(), 1);
        assert_eq!(diff.orphans[0].instance_id, "i-2");
        assert_eq!(
            diff.diverged,
            vec![Divergence {
                key: "i-1".to_string(),
                local: LifecycleState::Online,
                remote: RemoteState::Terminated,
                implied: LifecycleState::Terminated,
            }]
        );
        assert_eq!(diff.seen.len(), 1);
        assert!(diff.missing.is_empty());
    }

    proptest! {
        #[test]
        fn indexes_stay_consistent(ops in prop::collection::vec((0usize..6, 0usize..4), 1..40)) {
            let registry = InstanceRegistry::new();
            let states = [
                LifecycleState::Pending,
                LifecycleState::Booting,
                LifecycleState::Connecting,
                LifecycleState::Online,
            ];
            for (id, op) in ops {
                let key = format!("i-{id}");
                match op {
                    0 => { let _ = registry.insert(record(&key, if id % 2 == 0 { "a" } else { "b" }, &["x"])); }
                    1 => { registry.remove(&key); }
                    n => {
                        if let Some(r) = registry.get(&key) {
                            let _ = registry.compare_and_set(&key, r.state, states[n % states.len()]);
                        }
                    }
                }
            }

            let snapshot = registry.snapshot();
            let by_state: usize = states.iter().map(|s| registry.by_state(*s).len()).sum();
            prop_assert_eq!(by_state, snapshot.len());
            prop_assert_eq!(
                registry.by_template("a").len() + registry.by_template("b").len(),
                snapshot.len()
            );
            prop_assert_eq!(registry.by_label("x").len(), snapshot.len());
        }
    }
}
