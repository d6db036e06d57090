//! In-process [`ClusterApi`] implementation
//!
//! Objects are kept as typed k8s-openapi values. Every write bumps a global
//! revision that is stamped into `metadata.resourceVersion`, lease replaces
//! are checked against it, and patches follow JSON merge patch semantics
//! (RFC 7386). Used by the test suites and for exercising the workflow
//! without a cluster.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec, PodStatus};
use kube::api::ObjectMeta;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

use super::ClusterApi;
use crate::error::{Error, Result};

type Key = (String, String);

/// Failure returned by an upcoming eviction request
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvictionFault {
    /// The pod terminates on its own just before the request: it is removed
    /// and the eviction answers 404
    Gone,
    /// The eviction is refused with 429, as when a PodDisruptionBudget
    /// does not allow it
    Rejected,
}

#[derive(Default)]
pub struct MemoryCluster {
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    revision: u64,
    leases: BTreeMap<Key, Lease>,
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    replica_sets: BTreeMap<Key, ReplicaSet>,
    /// Number of upcoming lease replaces to reject as if another writer won
    injected_conflicts: usize,
    /// Keep evicted pods around, as a pod with a long grace period would
    retain_evicted: bool,
    evictions: Vec<Key>,
    eviction_faults: VecDeque<EvictionFault>,
}

impl State {
    fn next_version(&mut self) -> String {
        self.revision += 1;
        self.revision.to_string()
    }
}

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a schedulable node without labels
    pub fn add_node(&self, name: &str) {
        self.insert_node(Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        });
    }

    pub fn insert_node(&self, mut node: Node) {
        let mut state = self.state();
        node.metadata.resource_version = Some(state.next_version());
        let name = node.metadata.name.clone().unwrap_or_default();
        state.nodes.insert(name, node);
    }

    pub fn remove_node(&self, name: &str) {
        self.state().nodes.remove(name);
    }

    pub fn insert_pod(&self, mut pod: Pod) {
        let mut state = self.state();
        pod.metadata.resource_version = Some(state.next_version());
        let namespace = pod.metadata.namespace.clone().unwrap_or_default();
        let name = pod.metadata.name.clone().unwrap_or_default();
        state.pods.insert((namespace, name), pod);
    }

    pub fn remove_pod(&self, namespace: &str, name: &str) {
        self.state().pods.remove(&key(namespace, name));
    }

    pub fn insert_replica_set(&self, mut replica_set: ReplicaSet) {
        let mut state = self.state();
        replica_set.metadata.resource_version = Some(state.next_version());
        let namespace = replica_set.metadata.namespace.clone().unwrap_or_default();
        let name = replica_set.metadata.name.clone().unwrap_or_default();
        state.replica_sets.insert((namespace, name), replica_set);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state().nodes.get(name).cloned()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state().pods.get(&key(namespace, name)).cloned()
    }

    pub fn lease(&self, namespace: &str, name: &str) -> Option<Lease> {
        self.state().leases.get(&key(namespace, name)).cloned()
    }

    /// Reject the next `count` lease replaces with a conflict. Each rejection
    /// also bumps the stored resourceVersion, like a concurrent writer would.
    pub fn inject_conflicts(&self, count: usize) {
        self.state().injected_conflicts = count;
    }

    pub fn pending_conflicts(&self) -> usize {
        self.state().injected_conflicts
    }

    pub fn retain_evicted_pods(&self, retain: bool) {
        self.state().retain_evicted = retain;
    }

    /// Make the next eviction requests fail, one fault per request
    pub fn inject_eviction_faults(&self, faults: impl IntoIterator<Item = EvictionFault>) {
        self.state().eviction_faults.extend(faults);
    }

    /// `(namespace, name)` of every accepted eviction, in order
    pub fn evictions(&self) -> Vec<(String, String)> {
        self.state().evictions.clone()
    }
}

/// A pod in phase `Running`, scheduled on `node_name`
pub fn running_pod(namespace: &str, name: &str, node_name: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        status: Some(PodStatus {
            phase: Some("Running".to_string()),
            ..Default::default()
        }),
    }
}

/// JSON merge patch (RFC 7386): `null` removes a key, objects merge
/// recursively, anything else replaces
fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch_map) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }

    if let Value::Object(target_map) = target {
        for (field, value) in patch_map {
            if value.is_null() {
                target_map.remove(field);
            } else {
                merge_patch(
                    target_map.entry(field.clone()).or_insert(Value::Null),
                    value,
                );
            }
        }
    }
}

fn apply_patch<K: Serialize + DeserializeOwned>(object: &K, patch: &Value) -> Result<K> {
    let mut value = serde_json::to_value(object)?;
    merge_patch(&mut value, patch);
    Ok(serde_json::from_value(value)?)
}

/// Equality-based selectors only: `key`, `key=value`, `key==value`
fn selector_matches(selector: &str, labels: Option<&BTreeMap<String, String>>) -> bool {
    selector
        .split(',')
        .map(str::trim)
        .filter(|term| !term.is_empty())
        .all(|term| match term.split_once('=') {
            Some((label, value)) => {
                let value = value.trim_start_matches('=');
                labels.and_then(|l| l.get(label.trim())).map(String::as_str) == Some(value)
            }
            None => labels.map(|l| l.contains_key(term)).unwrap_or(false),
        })
}

fn is_running_on(pod: &Pod, node_name: &str) -> bool {
    let on_node = pod
        .spec
        .as_ref()
        .and_then(|s| s.node_name.as_deref())
        .map(|n| n == node_name)
        .unwrap_or(false);
    let running = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .map(|p| p == "Running")
        .unwrap_or(false);
    on_node && running
}

#[async_trait]
impl ClusterApi for MemoryCluster {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease> {
        self.state()
            .leases
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Lease",
                name: name.to_string(),
            })
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let mut state = self.state();
        if state.leases.contains_key(&key(namespace, &name)) {
            return Err(Error::Conflict {
                kind: "Lease",
                name,
            });
        }

        let mut created = lease.clone();
        created.metadata.namespace = Some(namespace.to_string());
        created.metadata.resource_version = Some(state.next_version());
        state
            .leases
            .insert(key(namespace, &name), created.clone());
        debug!("Created lease {}/{}", namespace, name);
        Ok(created)
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let name = lease.metadata.name.clone().unwrap_or_default();
        let mut state = self.state();
        let current_version = match state.leases.get(&key(namespace, &name)) {
            Some(current) => current.metadata.resource_version.clone(),
            None => {
                return Err(Error::NotFound {
                    kind: "Lease",
                    name,
                })
            }
        };

        if state.injected_conflicts > 0 {
            state.injected_conflicts -= 1;
            let version = state.next_version();
            if let Some(current) = state.leases.get_mut(&key(namespace, &name)) {
                current.metadata.resource_version = Some(version);
            }
            return Err(Error::Conflict {
                kind: "Lease",
                name,
            });
        }

        if lease.metadata.resource_version != current_version {
            return Err(Error::Conflict {
                kind: "Lease",
                name,
            });
        }

        let mut replaced = lease.clone();
        replaced.metadata.namespace = Some(namespace.to_string());
        replaced.metadata.resource_version = Some(state.next_version());
        state
            .leases
            .insert(key(namespace, &name), replaced.clone());
        Ok(replaced)
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        Ok(self.state().nodes.values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.state()
            .nodes
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "Node",
                name: name.to_string(),
            })
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<Node> {
        let mut state = self.state();
        let current = state.nodes.get(name).ok_or_else(|| Error::NotFound {
            kind: "Node",
            name: name.to_string(),
        })?;

        let mut patched = apply_patch(current, patch)?;
        patched.metadata.resource_version = Some(state.next_version());
        state.nodes.insert(name.to_string(), patched.clone());
        Ok(patched)
    }

    async fn list_running_pods(
        &self,
        node_name: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .values()
            .filter(|pod| is_running_on(pod, node_name))
            .filter(|pod| {
                label_selector
                    .map(|selector| selector_matches(selector, pod.metadata.labels.as_ref()))
                    .unwrap_or(true)
            })
            .cloned()
            .collect())
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<Pod> {
        let mut state = self.state();
        let current = state
            .pods
            .get(&key(namespace, name))
            .ok_or_else(|| Error::NotFound {
                kind: "Pod",
                name: name.to_string(),
            })?;

        let mut patched = apply_patch(current, patch)?;
        patched.metadata.resource_version = Some(state.next_version());
        state.pods.insert(key(namespace, name), patched.clone());
        Ok(patched)
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        self.state()
            .replica_sets
            .get(&key(namespace, name))
            .cloned()
            .ok_or_else(|| Error::NotFound {
                kind: "ReplicaSet",
                name: name.to_string(),
            })
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        if !state.pods.contains_key(&key(namespace, name)) {
            return Err(Error::NotFound {
                kind: "Pod",
                name: name.to_string(),
            });
        }

        match state.eviction_faults.pop_front() {
            Some(EvictionFault::Gone) => {
                state.pods.remove(&key(namespace, name));
                return Err(Error::NotFound {
                    kind: "Pod",
                    name: name.to_string(),
                });
            }
            Some(EvictionFault::Rejected) => {
                return Err(Error::KubeError(kube::Error::Api(
                    kube::error::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "Cannot evict pod as it would violate the pod's disruption budget."
                            .to_string(),
                        reason: "TooManyRequests".to_string(),
                        code: 429,
                    },
                )));
            }
            None => {}
        }

        state.evictions.push(key(namespace, name));
        if !state.retain_evicted {
            state.pods.remove(&key(namespace, name));
        }
        Ok(())
    }
}
