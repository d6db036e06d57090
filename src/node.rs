//! Node lookup and field-scoped node mutations

use std::sync::Arc;

use k8s_openapi::api::core::v1::Node;
use kube::ResourceExt;
use serde_json::{json, Value};
use tracing::info;

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};
use crate::labels;

#[derive(Clone)]
pub struct NodeRegistry {
    cluster: Arc<dyn ClusterApi>,
}

impl NodeRegistry {
    pub fn new(cluster: Arc<dyn ClusterApi>) -> Self {
        Self { cluster }
    }

    /// Snapshot of all nodes in the cluster
    pub async fn list(&self) -> Result<NodeSet> {
        let nodes = self
            .cluster
            .list_nodes()
            .await?
            .into_iter()
            .map(|node| ClusterNode {
                node,
                cluster: self.cluster.clone(),
            })
            .collect();
        Ok(NodeSet { nodes })
    }

    /// Fetch a single node; a missing node is reported as unavailable
    pub async fn get(&self, name: &str) -> Result<ClusterNode> {
        match self.cluster.get_node(name).await {
            Ok(node) => Ok(ClusterNode {
                node,
                cluster: self.cluster.clone(),
            }),
            Err(e) if e.is_not_found() => Err(Error::NodeUnavailable(name.to_string())),
            Err(e) => Err(e),
        }
    }
}

pub struct NodeSet {
    nodes: Vec<ClusterNode>,
}

impl NodeSet {
    pub fn node(&self, name: &str) -> Result<ClusterNode> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .cloned()
            .ok_or_else(|| Error::NodeUnavailable(name.to_string()))
    }
}

/// A node snapshot plus the handle needed to patch it
#[derive(Clone)]
pub struct ClusterNode {
    node: Node,
    cluster: Arc<dyn ClusterApi>,
}

impl ClusterNode {
    pub fn name(&self) -> String {
        self.node.name_any()
    }

    /// Label value, empty when the label is not set
    pub fn label(&self, key: &str) -> &str {
        self.node
            .metadata
            .labels
            .as_ref()
            .and_then(|l| l.get(key))
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn is_cordoned(&self) -> bool {
        self.node
            .spec
            .as_ref()
            .and_then(|s| s.unschedulable)
            .unwrap_or(false)
    }

    async fn patch(&mut self, patch: Value) -> Result<()> {
        let name = self.name();
        self.node = match self.cluster.patch_node(&name, &patch).await {
            Ok(node) => node,
            Err(e) if e.is_not_found() => return Err(Error::NodeUnavailable(name)),
            Err(e) => return Err(e),
        };
        Ok(())
    }

    /// Set a label; an empty value removes it. Only the one key is patched,
    /// so concurrent changes to other labels survive.
    pub async fn set_label(&mut self, key: &str, value: &str) -> Result<()> {
        self.patch(labels::patch(key, value)).await
    }

    /// Toggle `spec.unschedulable`
    pub async fn set_cordoned(&mut self, cordoned: bool) -> Result<()> {
        self.patch(json!({ "spec": { "unschedulable": cordoned } }))
            .await?;
        info!(
            "Node {} {}",
            self.name(),
            if cordoned { "cordoned" } else { "uncordoned" }
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn registry(cluster: &Arc<MemoryCluster>) -> NodeRegistry {
        NodeRegistry::new(cluster.clone())
    }

    #[tokio::test]
    async fn test_list_and_lookup() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("n1");
        cluster.add_node("n2");

        let nodes = registry(&cluster).list().await.unwrap();
        assert_eq!(nodes.node("n1").unwrap().name(), "n1");
        assert_eq!(nodes.node("n2").unwrap().name(), "n2");
        assert!(matches!(
            nodes.node("n3"),
            Err(Error::NodeUnavailable(ref name)) if name == "n3"
        ));
    }

    #[tokio::test]
    async fn test_get_vanished_node_is_unavailable() {
        let cluster = Arc::new(MemoryCluster::new());
        let err = registry(&cluster).get("gone").await.err().unwrap();
        assert!(matches!(err, Error::NodeUnavailable(_)));
    }

    #[tokio::test]
    async fn test_set_label_only_touches_one_key() {
        let cluster = Arc::new(MemoryCluster::new());
        let mut labels = BTreeMap::new();
        labels.insert("kubernetes.io/hostname".to_string(), "n1".to_string());
        cluster.insert_node(Node {
            metadata: ObjectMeta {
                name: Some("n1".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        });

        let mut node = registry(&cluster).get("n1").await.unwrap();
        node.set_label("example.com/flag", "true").await.unwrap();

        // the snapshot is refreshed from the patch result
        assert_eq!(node.label("example.com/flag"), "true");
        let stored = cluster.node("n1").unwrap();
        let stored_labels = stored.metadata.labels.unwrap();
        assert_eq!(stored_labels.get("kubernetes.io/hostname").unwrap(), "n1");
        assert_eq!(stored_labels.get("example.com/flag").unwrap(), "true");
    }

    #[tokio::test]
    async fn test_empty_label_value_deletes() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("n1");

        let mut node = registry(&cluster).get("n1").await.unwrap();
        node.set_label("example.com/flag", "true").await.unwrap();
        node.set_label("example.com/flag", "").await.unwrap();

        assert_eq!(node.label("example.com/flag"), "");
        let stored = cluster.node("n1").unwrap();
        assert!(!stored
            .metadata
            .labels
            .unwrap_or_default()
            .contains_key("example.com/flag"));
    }

    #[tokio::test]
    async fn test_cordon_toggle() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("n1");

        let mut node = registry(&cluster).get("n1").await.unwrap();
        assert!(!node.is_cordoned());

        node.set_cordoned(true).await.unwrap();
        assert!(node.is_cordoned());
        assert!(registry(&cluster).get("n1").await.unwrap().is_cordoned());

        node.set_cordoned(false).await.unwrap();
        assert!(!registry(&cluster).get("n1").await.unwrap().is_cordoned());
    }

    #[tokio::test]
    async fn test_patch_vanished_node_is_unavailable() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.add_node("n1");

        let mut node = registry(&cluster).get("n1").await.unwrap();
        cluster.remove_node("n1");

        let err = node.set_cordoned(true).await.unwrap_err();
        assert!(matches!(err, Error::NodeUnavailable(_)));
    }
}
