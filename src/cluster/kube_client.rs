//! [`ClusterApi`] backed by a kube-rs client

use std::path::Path;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::ReplicaSet;
use k8s_openapi::api::coordination::v1::Lease;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tracing::{debug, info};

use super::ClusterApi;
use crate::error::{Error, Result};

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Build a client from an explicit kubeconfig file, or from the
    /// in-cluster service account when no path is given
    pub async fn connect(kubeconfig: Option<&Path>) -> Result<Self> {
        let config = match kubeconfig {
            Some(path) => {
                info!("Using kubeconfig {}", path.display());
                let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                    Error::ConfigError(format!(
                        "Failed to read kubeconfig {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| Error::ConfigError(format!("Invalid kubeconfig: {}", e)))?
            }
            None => {
                info!("Using in-cluster config");
                Config::incluster().map_err(|e| {
                    Error::ConfigError(format!("Failed to load in-cluster config: {}", e))
                })?
            }
        };

        let client = Client::try_from(config).map_err(Error::KubeError)?;
        Ok(Self::new(client))
    }
}

/// Split out 404 and 409 responses so callers can match on them
fn classify(err: kube::Error, kind: &'static str, name: &str) -> Error {
    match err {
        kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound {
            kind,
            name: name.to_string(),
        },
        kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict {
            kind,
            name: name.to_string(),
        },
        other => Error::KubeError(other),
    }
}

fn lease_name(lease: &Lease) -> &str {
    lease.metadata.name.as_deref().unwrap_or_default()
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get_lease(&self, namespace: &str, name: &str) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| classify(e, "Lease", name))
    }

    async fn create_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), lease)
            .await
            .map_err(|e| classify(e, "Lease", lease_name(lease)))
    }

    async fn replace_lease(&self, namespace: &str, lease: &Lease) -> Result<Lease> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), namespace);
        let name = lease_name(lease);
        api.replace(name, &PostParams::default(), lease)
            .await
            .map_err(|e| classify(e, "Lease", name))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let nodes = api.list(&ListParams::default()).await?;
        Ok(nodes.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        api.get(name).await.map_err(|e| classify(e, "Node", name))
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        debug!("Patching node {}: {}", name, patch);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, "Node", name))
    }

    async fn list_running_pods(
        &self,
        node_name: &str,
        label_selector: Option<&str>,
    ) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let mut params = ListParams::default().fields(&format!(
            "spec.nodeName={},status.phase=Running",
            node_name
        ));
        if let Some(selector) = label_selector {
            params = params.labels(selector);
        }
        let pods = api.list(&params).await?;
        Ok(pods.items)
    }

    async fn patch_pod(&self, namespace: &str, name: &str, patch: &Value) -> Result<Pod> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await
            .map_err(|e| classify(e, "Pod", name))
    }

    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| classify(e, "ReplicaSet", name))
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        api.evict(name, &EvictParams::default())
            .await
            .map_err(|e| classify(e, "Pod", name))?;
        Ok(())
    }
}
