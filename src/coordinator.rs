//! Node maintenance coordinator
//!
//! Drives the per-node maintenance workflow on top of the cluster-wide
//! [`Kmutex`]:
//!
//! - `synchronize` waits until this node holds the lock,
//! - `teardown` cordons the node and evicts its critical pods, waiting until
//!   they are gone,
//! - `release` frees the lock and uncordons the node,
//! - `release_delayed` defers the release to the next `start`, for callers
//!   about to reboot the node.
//!
//! No state is cached between calls: every operation re-reads the lease, the
//! node and its pods.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use crate::classifier::{pod_label, pod_ref, CriticalPodPolicy, PodClassifier};
use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::kmutex::{Kmutex, DEFAULT_RETRY_INTERVAL};
use crate::labels;
use crate::looper::poll_until;
use crate::node::{ClusterNode, NodeRegistry};

/// Name of the lease shared by all nodes
pub const DEFAULT_LEASE_NAME: &str = "sync";
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    /// Name of the node this instance runs on, also the lock identity
    pub node_name: String,
    pub lease_namespace: String,
    pub lease_name: String,
    pub policy: CriticalPodPolicy,
    /// Delay between lock acquisition attempts
    pub sync_interval: Duration,
    /// Delay between checks for evicted pods that are still running
    pub drain_poll_interval: Duration,
    /// Delay after a conflicting lease write
    pub lock_retry_interval: Duration,
}

impl CoordinatorConfig {
    pub fn new(node_name: impl Into<String>, lease_namespace: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            lease_namespace: lease_namespace.into(),
            lease_name: DEFAULT_LEASE_NAME.to_string(),
            policy: CriticalPodPolicy::default(),
            sync_interval: DEFAULT_SYNC_INTERVAL,
            drain_poll_interval: DEFAULT_DRAIN_POLL_INTERVAL,
            lock_retry_interval: DEFAULT_RETRY_INTERVAL,
        }
    }
}

/// Snapshot of the coordinator's view of its node
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node: String,
    pub lock_owner: String,
    pub lock_held: bool,
    pub cordoned: bool,
    pub delayed_release: bool,
    pub last_release: Option<String>,
}

pub struct MaintenanceCoordinator {
    config: CoordinatorConfig,
    cluster: Arc<dyn ClusterApi>,
    mutex: Kmutex,
    nodes: NodeRegistry,
    classifier: PodClassifier,
}

impl MaintenanceCoordinator {
    pub fn new(config: CoordinatorConfig, cluster: Arc<dyn ClusterApi>) -> Self {
        let mutex = Kmutex::new(
            cluster.clone(),
            config.lease_name.clone(),
            config.lease_namespace.clone(),
            config.node_name.clone(),
        )
        .with_retry_interval(config.lock_retry_interval);

        Self {
            nodes: NodeRegistry::new(cluster.clone()),
            classifier: PodClassifier::new(cluster.clone(), config.policy),
            mutex,
            cluster,
            config,
        }
    }

    fn identity(&self) -> &str {
        self.mutex.holder_identity()
    }

    async fn own_node(&self) -> Result<ClusterNode> {
        self.nodes.list().await?.node(&self.config.node_name)
    }

    /// Startup tasks: validate the node exists and replay a pending delayed
    /// release. Runs once before any other command is accepted.
    #[instrument(skip(self), fields(node = %self.config.node_name))]
    pub async fn start(&self) -> Result<()> {
        let mut own = self.own_node().await?;
        info!("Node {} found", own.name());

        if own.label(labels::DELAYED_RELEASE) == "true" {
            info!("Node marked for delayed release, releasing lock now");
            self.release().await?;
            own.set_label(labels::DELAYED_RELEASE, "").await?;
        }
        Ok(())
    }

    /// Block until this node holds the lock, or `cancel` fires
    #[instrument(skip(self, cancel), fields(node = %self.config.node_name))]
    pub async fn synchronize(&self, cancel: &CancellationToken) -> Result<()> {
        poll_until(cancel, self.config.sync_interval, move || {
            self.try_synchronize()
        })
        .await
    }

    /// One acquisition attempt, true once the lock is ours
    async fn try_synchronize(&self) -> Result<bool> {
        // informational only: a foreign owner is re-checked atomically by
        // try_acquire, but an owner equal to us is authoritative
        let owner = self.mutex.current_owner().await?;
        if owner == self.identity() {
            info!("Lock already owned by us ({})", owner);
            return Ok(true);
        }

        if self.mutex.try_acquire().await? {
            info!("Lock successfully acquired by {}", self.identity());
            Ok(true)
        } else {
            let owner = self.mutex.current_owner().await?;
            info!("Could not acquire lock, currently owned by {}", owner);
            Ok(false)
        }
    }

    /// Cordon the node, evict its critical pods and wait until they are gone
    #[instrument(skip(self, cancel), fields(node = %self.config.node_name))]
    pub async fn teardown(&self, cancel: &CancellationToken) -> Result<()> {
        let mut own = self.own_node().await?;
        own.set_cordoned(true).await?;

        let node_name = own.name();
        let critical = self.classifier.critical_pods(&node_name).await?;
        for pod in &critical {
            self.evict(pod).await?;
        }

        let node_name = node_name.as_str();
        poll_until(cancel, self.config.drain_poll_interval, move || {
            self.drain_converged(node_name)
        })
        .await?;

        info!("Teardown of node {} complete", node_name);
        Ok(())
    }

    async fn label_pod(&self, namespace: &str, name: &str, key: &str, value: &str) -> Result<()> {
        self.cluster
            .patch_pod(namespace, name, &labels::patch(key, value))
            .await?;
        Ok(())
    }

    /// Mark the pod as evicted, then request its eviction.
    ///
    /// A pod marked by an earlier teardown keeps its marker and is evicted
    /// again, since that run may have stopped before its eviction request.
    async fn evict(&self, pod: &Pod) -> Result<()> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();

        if pod_label(pod, labels::POD_EVICTED).is_some() {
            info!("Pod {} already marked for eviction", pod_ref(pod));
        } else {
            match self
                .label_pod(&namespace, &name, labels::POD_EVICTED, "true")
                .await
            {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    info!("Pod {} already gone", pod_ref(pod));
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        info!("Evict Pod {}", pod_ref(pod));
        match self.cluster.evict_pod(&namespace, &name).await {
            Ok(()) => {
                info!("Pod {} evicted", pod_ref(pod));
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                info!("Evict failed with NotFound, Pod already gone {}", pod_ref(pod));
                Ok(())
            }
            Err(e) => {
                // unmark so a later teardown targets the pod again
                if let Err(unmark) = self
                    .label_pod(&namespace, &name, labels::POD_EVICTED, "")
                    .await
                {
                    warn!(
                        "Failed to remove eviction marker from Pod {}: {}",
                        pod_ref(pod),
                        unmark
                    );
                }
                Err(e)
            }
        }
    }

    async fn drain_converged(&self, node_name: &str) -> Result<bool> {
        let remaining = self.classifier.evicted_critical_pods(node_name).await?;
        if remaining.is_empty() {
            return Ok(true);
        }

        let names: Vec<String> = remaining.iter().map(pod_ref).collect();
        info!(
            "Waiting for {} critical pod(s) to terminate: {}",
            names.len(),
            names.join(", ")
        );
        Ok(false)
    }

    /// Release the lock and uncordon the node.
    ///
    /// Fails with [`Error::LockNotHeld`] when another node holds the lock,
    /// without touching anything. When nobody holds it the node is still
    /// uncordoned, so it never stays stuck unschedulable.
    #[instrument(skip(self), fields(node = %self.config.node_name))]
    pub async fn release(&self) -> Result<()> {
        let owner = self.mutex.current_owner().await?;
        if owner.is_empty() {
            warn!("Lock is not held by anyone, uncordoning node anyway");
        } else if owner != self.identity() {
            return Err(Error::LockNotHeld { owner });
        } else {
            self.mutex.release().await?;
            info!("Lock released");
        }

        let mut own = self.own_node().await?;
        own.set_label(labels::LAST_RELEASE, &Utc::now().timestamp().to_string())
            .await?;
        own.set_cordoned(false).await?;
        Ok(())
    }

    /// Flag the node so the lock is released on the next `start`
    #[instrument(skip(self), fields(node = %self.config.node_name))]
    pub async fn release_delayed(&self) -> Result<()> {
        let mut own = self.own_node().await?;
        own.set_label(labels::DELAYED_RELEASE, "true").await?;
        info!("Node {} marked for delayed release", own.name());
        Ok(())
    }

    /// Critical pods currently running on this node
    #[instrument(skip(self), fields(node = %self.config.node_name))]
    pub async fn critical_pods(&self) -> Result<Vec<Pod>> {
        let own = self.own_node().await?;
        let pods = self.classifier.critical_pods(&own.name()).await?;
        info!("{} critical pod(s) on node {}", pods.len(), own.name());
        Ok(pods)
    }

    pub async fn status(&self) -> Result<NodeStatus> {
        let own = self.own_node().await?;
        let lock_owner = self.mutex.current_owner().await?;
        let last_release = own.label(labels::LAST_RELEASE);

        Ok(NodeStatus {
            node: own.name(),
            lock_held: lock_owner == self.identity(),
            lock_owner,
            cordoned: own.is_cordoned(),
            delayed_release: own.label(labels::DELAYED_RELEASE) == "true",
            last_release: (!last_release.is_empty()).then(|| last_release.to_string()),
        })
    }
}
