//! Node and demand APIs
//!
//! A [`Node`] is an online agent handed to the CI controller through the
//! [`Controller`] trait. Demand flows the other way: the controller asks for
//! capacity per label on the [`DemandLedger`] and releases it with the
//! receipt it got back.

use crate::log_buffer::NodeLog;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::io::DuplexStream;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

/// An agent attached to the controller
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub labels: BTreeSet<String>,
    pub instance_id: String,
    pub cloud: String,
    pub template_id: String,
    channel: Mutex<Option<DuplexStream>>,
    log: NodeLog,
    stop: CancellationToken,
}

impl Node {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: String,
        labels: BTreeSet<String>,
        instance_id: String,
        cloud: String,
        template_id: String,
        channel: DuplexStream,
        log: NodeLog,
        stop: CancellationToken,
    ) -> Self {
        Self {
            name,
            labels,
            instance_id,
            cloud,
            template_id,
            channel: Mutex::new(Some(channel)),
            log,
            stop,
        }
    }

    /// The agent's stdio stream. It can be taken once.
    pub fn take_channel(&self) -> Option<DuplexStream> {
        self.channel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Close the agent session; the instance is then terminated.
    pub fn disconnect(&self, cause: &str) {
        info!(node = %self.name, cause, "Disconnecting node");
        self.log.event(format!("disconnect requested: {cause}"));
        self.stop.cancel();
    }

    pub fn is_disconnected(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn get_log(&self) -> String {
        self.log.contents()
    }
}

/// The CI controller side of the node API
#[async_trait]
pub trait Controller: Send + Sync + 'static {
    /// A node came online.
    async fn attach(&self, node: Arc<Node>) -> anyhow::Result<()>;

    /// A node is going away.
    async fn detach(&self, node_name: &str);
}

/// Controller that only keeps and logs nodes
#[derive(Debug, Default)]
pub struct LoggingController {
    nodes: Mutex<BTreeMap<String, Arc<Node>>>,
}

impl LoggingController {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Controller for LoggingController {
    async fn attach(&self, node: Arc<Node>) -> anyhow::Result<()> {
        info!(
            node = %node.name,
            instance_id = %node.instance_id,
            labels = ?node.labels,
            "Node online"
        );
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(node.name.clone(), node);
        Ok(())
    }

    async fn detach(&self, node_name: &str) {
        info!(node = %node_name, "Node offline");
        self.nodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(node_name);
    }
}

/// Handle returned by [`DemandLedger::request_capacity`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Receipt(Uuid);

impl std::fmt::Display for Receipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Requested capacity; `None` is unlabeled demand
pub type DemandKey = Option<String>;

/// Outstanding capacity requests
#[derive(Debug, Clone, Default)]
pub struct DemandLedger {
    requests: Arc<Mutex<HashMap<Receipt, (DemandKey, u32)>>>,
    changed: Arc<tokio::sync::Notify>,
}

impl DemandLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request_capacity(&self, label: Option<&str>, count: u32) -> Receipt {
        let receipt = Receipt(Uuid::new_v4());
        let key = label.map(str::trim).filter(|l| !l.is_empty()).map(str::to_string);
        info!(label = ?key, count, %receipt, "Capacity requested");
        self.lock().insert(receipt, (key, count));
        self.changed.notify_one();
        receipt
    }

    /// Withdraw a request; false when the receipt is unknown.
    pub fn release_capacity(&self, receipt: Receipt) -> bool {
        let released = self.lock().remove(&receipt).is_some();
        if !released {
            warn!(%receipt, "Unknown capacity receipt");
        }
        released
    }

    /// Total requested count per label
    pub fn outstanding(&self) -> BTreeMap<DemandKey, u32> {
        let mut totals = BTreeMap::new();
        for (label, count) in self.lock().values() {
            *totals.entry(label.clone()).or_insert(0) += count;
        }
        totals
    }

    /// Resolves after the next `request_capacity`.
    pub async fn changed(&self) {
        self.changed.notified().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Receipt, (DemandKey, u32)>> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
