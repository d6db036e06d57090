//! Cluster API surface used by the coordinator
//!
//! Everything the lock, the node registry and the pod classifier need from
//! the backing store goes through [`ClusterApi`]. Implementations must report
//! missing objects as [`Error::NotFound`](crate::Error::NotFound) and failed
//! resourceVersion preconditions as [`Error::Conflict`](crate::Error::Conflict)
//! so callers can tell them apart from other failures.

mod kube_client;
pub mod memory;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use serde_json::Value;

use crate::error::Result;

pub use kube_client::KubeCluster;
pub use memory::MemoryCluster;

#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease>;

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease>;

    /// Replace the lease, conditional on `lease.metadata.resource_version`
    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease>;

    async fn list_nodes(&self) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Apply a JSON merge patch to a node and return the patched object
    async fn patch_node(&self, name: &str, patch: &Value) -> Result<Node>;

    /// List pods in phase `Running` scheduled on `node_name`, across all
    /// namespaces, optionally narrowed by a label selector
    async fn list_running_pods(
        &self,
        node_name: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>>;

    /// Apply a JSON merge patch to a pod and return the patched object
    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<Pod>;

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet>;

    /// Request eviction of a pod through the eviction subresource
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()>;
}
