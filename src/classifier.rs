//! Critical pod classification
//!
//! A pod is critical when its presence has to be resolved (by eviction)
//! before the node may go down for maintenance. The decision is taken from:
//!
//! 1. the explicit `suss.world-direct.at/critical` label, if present with
//!    either `"true"` or `"false"`;
//! 2. ownership by a StatefulSet, if enabled;
//! 3. ownership by a ReplicaSet that wants exactly one replica, if enabled.

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::ResourceExt;
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::error::Result;
use crate::labels;

/// Which ownership shapes count as critical
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CriticalPodPolicy {
    pub consider_statefulset_critical: bool,
    pub consider_sole_replicas_critical: bool,
}

/// Why a pod was classified as critical
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CriticalReason {
    /// Labelled `critical=true`
    ExplicitLabel,
    /// Labelled `critical=false`. Still treated as blocking: any explicit
    /// operator decision makes the pod take part in teardown.
    ExplicitOptOut,
    /// Owned by the named StatefulSet
    StatefulSet(String),
    /// Owned by the named ReplicaSet, which wants a single replica
    SoleReplica(String),
}

impl fmt::Display for CriticalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CriticalReason::ExplicitLabel => write!(f, "label {}=true", labels::CRITICAL_POD),
            CriticalReason::ExplicitOptOut => {
                write!(f, "label {}=false", labels::CRITICAL_POD)
            }
            CriticalReason::StatefulSet(name) => write!(f, "StatefulSet {}", name),
            CriticalReason::SoleReplica(name) => write!(f, "only one replica in ReplicaSet {}", name),
        }
    }
}

fn is_apps_group(owner: &OwnerReference) -> bool {
    owner
        .api_version
        .split_once('/')
        .map(|(group, _)| group == "apps")
        .unwrap_or(false)
}

pub fn pod_label<'a>(pod: &'a Pod, key: &str) -> Option<&'a str> {
    pod.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
}

pub fn pod_ref(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

#[derive(Clone)]
pub struct PodClassifier {
    cluster: Arc<dyn ClusterApi>,
    policy: CriticalPodPolicy,
}

impl PodClassifier {
    pub fn new(cluster: Arc<dyn ClusterApi>, policy: CriticalPodPolicy) -> Self {
        Self { cluster, policy }
    }

    /// Classify a pod, returning the first reason it is critical
    pub async fn classify(&self, pod: &Pod) -> Result<Option<CriticalReason>> {
        let reason = match pod_label(pod, labels::CRITICAL_POD) {
            Some("true") => Some(CriticalReason::ExplicitLabel),
            Some("false") => Some(CriticalReason::ExplicitOptOut),
            _ => self.critical_owner(pod).await?,
        };

        match &reason {
            Some(reason) => info!("Pod {} is critical ({})", pod_ref(pod), reason),
            None => debug!("Pod {} is not critical", pod_ref(pod)),
        }
        Ok(reason)
    }

    pub async fn is_critical(&self, pod: &Pod) -> Result<bool> {
        Ok(self.classify(pod).await?.is_some())
    }

    async fn critical_owner(&self, pod: &Pod) -> Result<Option<CriticalReason>> {
        for owner in pod.owner_references() {
            if !is_apps_group(owner) {
                continue;
            }

            match owner.kind.as_str() {
                "StatefulSet" if self.policy.consider_statefulset_critical => {
                    return Ok(Some(CriticalReason::StatefulSet(owner.name.clone())));
                }
                "ReplicaSet" if self.policy.consider_sole_replicas_critical => {
                    let namespace = pod.namespace().unwrap_or_default();
                    let replica_set = self
                        .cluster
                        .get_replica_set(&namespace, &owner.name)
                        .await?;
                    // replicas defaults to 1 when unset
                    let desired = replica_set
                        .spec
                        .as_ref()
                        .and_then(|s| s.replicas)
                        .unwrap_or(1);
                    if desired == 1 {
                        return Ok(Some(CriticalReason::SoleReplica(owner.name.clone())));
                    }
                }
                _ => {}
            }
        }
        Ok(None)
    }

    async fn filter_critical(&self, pods: Vec<Pod>) -> Result<Vec<Pod>> {
        let mut critical = Vec::new();
        for pod in pods {
            if self.is_critical(&pod).await? {
                critical.push(pod);
            }
        }
        Ok(critical)
    }

    /// Running pods on `node_name` that are critical
    pub async fn critical_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods = self.cluster.list_running_pods(node_name, None).await?;
        self.filter_critical(pods).await
    }

    /// Running pods on `node_name` that were marked for eviction and are
    /// still critical, i.e. evictions that have not converged yet
    pub async fn evicted_critical_pods(&self, node_name: &str) -> Result<Vec<Pod>> {
        let pods = self
            .cluster
            .list_running_pods(node_name, Some(labels::POD_EVICTED))
            .await?;
        self.filter_critical(pods).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::MemoryCluster;
    use k8s_openapi::api::apps::v1::{ReplicaSet, ReplicaSetSpec};
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn owner(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{}-uid", name),
            ..Default::default()
        }
    }

    fn pod(name: &str, labels: &[(&str, &str)], owners: Vec<OwnerReference>) -> Pod {
        let labels: BTreeMap<String, String> = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(labels),
                owner_references: Some(owners),
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some("n1".to_string()),
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some("Running".to_string()),
                ..Default::default()
            }),
        }
    }

    fn replica_set(name: &str, replicas: Option<i32>) -> ReplicaSet {
        ReplicaSet {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            spec: Some(ReplicaSetSpec {
                replicas,
                ..Default::default()
            }),
            status: None,
        }
    }

    fn classifier(cluster: &Arc<MemoryCluster>, statefulset: bool, sole: bool) -> PodClassifier {
        PodClassifier::new(
            cluster.clone(),
            CriticalPodPolicy {
                consider_statefulset_critical: statefulset,
                consider_sole_replicas_critical: sole,
            },
        )
    }

    #[tokio::test]
    async fn test_explicit_true_label_is_critical() {
        let cluster = Arc::new(MemoryCluster::new());
        let pod = pod("web", &[(labels::CRITICAL_POD, "true")], vec![]);

        let reason = classifier(&cluster, false, false).classify(&pod).await.unwrap();
        assert_eq!(reason, Some(CriticalReason::ExplicitLabel));
    }

    #[tokio::test]
    async fn test_explicit_false_label_is_still_critical() {
        let cluster = Arc::new(MemoryCluster::new());
        let pod = pod("web", &[(labels::CRITICAL_POD, "false")], vec![]);

        let reason = classifier(&cluster, false, false).classify(&pod).await.unwrap();
        assert_eq!(reason, Some(CriticalReason::ExplicitOptOut));
    }

    #[tokio::test]
    async fn test_explicit_label_outranks_ownership() {
        let cluster = Arc::new(MemoryCluster::new());
        let pod = pod(
            "db-0",
            &[(labels::CRITICAL_POD, "false")],
            vec![owner("StatefulSet", "db")],
        );

        let reason = classifier(&cluster, true, true).classify(&pod).await.unwrap();
        assert_eq!(reason, Some(CriticalReason::ExplicitOptOut));
    }

    #[tokio::test]
    async fn test_other_label_values_fall_through() {
        let cluster = Arc::new(MemoryCluster::new());
        let pod = pod("web", &[(labels::CRITICAL_POD, "maybe")], vec![]);

        assert!(!classifier(&cluster, true, true).is_critical(&pod).await.unwrap());
    }

    #[tokio::test]
    async fn test_statefulset_owner_follows_switch() {
        let cluster = Arc::new(MemoryCluster::new());
        let pod = pod("db-0", &[], vec![owner("StatefulSet", "db")]);

        assert_eq!(
            classifier(&cluster, true, false).classify(&pod).await.unwrap(),
            Some(CriticalReason::StatefulSet("db".to_string()))
        );
        assert!(!classifier(&cluster, false, false).is_critical(&pod).await.unwrap());
    }

    #[tokio::test]
    async fn test_statefulset_in_other_group_is_ignored() {
        let cluster = Arc::new(MemoryCluster::new());
        let mut foreign = owner("StatefulSet", "db");
        foreign.api_version = "example.com/v1".to_string();
        let pod = pod("db-0", &[], vec![foreign]);

        assert!(!classifier(&cluster, true, true).is_critical(&pod).await.unwrap());
    }

    #[tokio::test]
    async fn test_sole_replica_requires_switch_and_single_replica() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert_replica_set(replica_set("single", Some(1)));
        cluster.insert_replica_set(replica_set("triple", Some(3)));
        cluster.insert_replica_set(replica_set("defaulted", None));

        let single = pod("single-abc", &[], vec![owner("ReplicaSet", "single")]);
        let triple = pod("triple-abc", &[], vec![owner("ReplicaSet", "triple")]);
        let defaulted = pod("defaulted-abc", &[], vec![owner("ReplicaSet", "defaulted")]);

        let enabled = classifier(&cluster, false, true);
        assert_eq!(
            enabled.classify(&single).await.unwrap(),
            Some(CriticalReason::SoleReplica("single".to_string()))
        );
        assert!(!enabled.is_critical(&triple).await.unwrap());
        assert!(enabled.is_critical(&defaulted).await.unwrap());

        let disabled = classifier(&cluster, false, false);
        assert!(!disabled.is_critical(&single).await.unwrap());
    }

    #[tokio::test]
    async fn test_missing_replica_set_is_an_error() {
        let cluster = Arc::new(MemoryCluster::new());
        let pod = pod("orphan-abc", &[], vec![owner("ReplicaSet", "orphan")]);

        let err = classifier(&cluster, false, true)
            .is_critical(&pod)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_any_critical_owner_wins() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert_replica_set(replica_set("wide", Some(4)));
        let pod = pod(
            "mixed",
            &[],
            vec![owner("ReplicaSet", "wide"), owner("StatefulSet", "db")],
        );

        assert_eq!(
            classifier(&cluster, true, true).classify(&pod).await.unwrap(),
            Some(CriticalReason::StatefulSet("db".to_string()))
        );
    }

    #[tokio::test]
    async fn test_critical_pods_only_lists_running_pods_on_node() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert_pod(pod("a", &[(labels::CRITICAL_POD, "true")], vec![]));
        cluster.insert_pod(pod("b", &[], vec![]));

        let mut elsewhere = pod("c", &[(labels::CRITICAL_POD, "true")], vec![]);
        elsewhere.spec.as_mut().unwrap().node_name = Some("n2".to_string());
        cluster.insert_pod(elsewhere);

        let mut pending = pod("d", &[(labels::CRITICAL_POD, "true")], vec![]);
        pending.status.as_mut().unwrap().phase = Some("Pending".to_string());
        cluster.insert_pod(pending);

        let critical = classifier(&cluster, false, false)
            .critical_pods("n1")
            .await
            .unwrap();
        let names: Vec<String> = critical.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_evicted_critical_pods_requires_marker() {
        let cluster = Arc::new(MemoryCluster::new());
        cluster.insert_pod(pod("a", &[(labels::CRITICAL_POD, "true")], vec![]));
        cluster.insert_pod(pod(
            "b",
            &[(labels::CRITICAL_POD, "true"), (labels::POD_EVICTED, "true")],
            vec![],
        ));
        cluster.insert_pod(pod("c", &[(labels::POD_EVICTED, "true")], vec![]));

        let pending = classifier(&cluster, false, false)
            .evicted_critical_pods("n1")
            .await
            .unwrap();
        let names: Vec<String> = pending.iter().map(|p| p.name_any()).collect();
        assert_eq!(names, vec!["b".to_string()]);
    }
}
