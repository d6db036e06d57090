//! Cluster-wide mutex backed by a `coordination.k8s.io/v1` Lease
//!
//! The lease's `holderIdentity` names the current owner; an absent (or
//! empty) holder means the mutex is free. Every operation is a
//! read-modify-write cycle guarded by the lease's resourceVersion, so two
//! instances can never both observe themselves as the holder: the second
//! writer gets a conflict, re-reads the lease and sees the first owner.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::cluster::ClusterApi;
use crate::error::{Error, Result};

pub const DEFAULT_RETRY_INTERVAL: Duration = Duration::from_secs(1);

pub struct Kmutex {
    lease_name: String,
    lease_namespace: String,
    holder_identity: String,
    retry_interval: Duration,
    create_if_missing: bool,
    cluster: Arc<dyn ClusterApi>,
}

fn holder(lease: &Lease) -> Option<&str> {
    lease
        .spec
        .as_ref()
        .and_then(|s| s.holder_identity.as_deref())
        .filter(|h| !h.is_empty())
}

fn set_holder(lease: &mut Lease, identity: Option<String>) {
    lease
        .spec
        .get_or_insert_with(LeaseSpec::default)
        .holder_identity = identity;
}

impl Kmutex {
    pub fn new(
        cluster: Arc<dyn ClusterApi>,
        lease_name: impl Into<String>,
        lease_namespace: impl Into<String>,
        holder_identity: impl Into<String>,
    ) -> Self {
        Self {
            lease_name: lease_name.into(),
            lease_namespace: lease_namespace.into(),
            holder_identity: holder_identity.into(),
            retry_interval: DEFAULT_RETRY_INTERVAL,
            create_if_missing: true,
            cluster,
        }
    }

    /// Delay between attempts after a conflicting write
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    /// When false, a missing lease fails with `NotFound` instead of being created
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn holder_identity(&self) -> &str {
        &self.holder_identity
    }

    fn empty_lease(&self) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.lease_namespace.clone()),
                ..Default::default()
            },
            spec: None,
        }
    }

    /// Fetch the lease, creating it when missing and allowed to
    ///
    /// Returns `None` when another instance created it concurrently; the
    /// caller should back off and read again.
    async fn load_lease(&self) -> Result<Option<Lease>> {
        match self
            .cluster
            .get_lease(&self.lease_namespace, &self.lease_name)
            .await
        {
            Ok(lease) => Ok(Some(lease)),
            Err(e) if e.is_not_found() && self.create_if_missing => {
                info!(
                    "Lease {}/{} not found, creating",
                    self.lease_namespace, self.lease_name
                );
                match self
                    .cluster
                    .create_lease(&self.lease_namespace, &self.empty_lease())
                    .await
                {
                    Ok(created) => Ok(Some(created)),
                    Err(e) if e.is_conflict() => Ok(None),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Run `transition` against the current lease and persist the result.
    ///
    /// The write only happens when the transition changed the holder. A
    /// conflicting write re-reads the lease and runs the transition again
    /// after `retry_interval`; any other error, including one returned by
    /// the transition, is returned as is.
    async fn with_lease<T, F>(&self, mut transition: F) -> Result<T>
    where
        F: FnMut(&mut Lease) -> Result<T>,
    {
        loop {
            if let Some(mut lease) = self.load_lease().await? {
                let before = holder(&lease).map(str::to_owned);
                let outcome = transition(&mut lease)?;

                if holder(&lease) == before.as_deref() {
                    return Ok(outcome);
                }

                match self
                    .cluster
                    .replace_lease(&self.lease_namespace, &lease)
                    .await
                {
                    Ok(_) => return Ok(outcome),
                    Err(e) if e.is_conflict() => {}
                    Err(e) => return Err(e),
                }
            }

            debug!(
                "Conflict on lease {}/{}, retrying in {:?}",
                self.lease_namespace, self.lease_name, self.retry_interval
            );
            tokio::time::sleep(self.retry_interval).await;
        }
    }

    /// Take the mutex if it is free.
    ///
    /// Returns true when the mutex is now held by us, including when we
    /// already held it, and false when another identity holds it.
    pub async fn try_acquire(&self) -> Result<bool> {
        let identity = self.holder_identity.as_str();
        let acquired = self
            .with_lease(|lease| {
                let current = holder(lease).map(str::to_owned);
                match current {
                    None => {
                        set_holder(lease, Some(identity.to_string()));
                        Ok(true)
                    }
                    Some(owner) => Ok(owner == identity),
                }
            })
            .await?;

        if acquired {
            debug!("Lease {} held by {}", self.lease_name, identity);
        }
        Ok(acquired)
    }

    /// Identity currently holding the mutex, empty if free
    pub async fn current_owner(&self) -> Result<String> {
        self.with_lease(|lease| Ok(holder(lease).unwrap_or_default().to_string()))
            .await
    }

    /// Free the mutex.
    ///
    /// Releasing a free mutex is a no-op. Releasing a mutex held by another
    /// identity fails with [`Error::LockNotHeld`] and leaves it untouched.
    pub async fn release(&self) -> Result<()> {
        let identity = self.holder_identity.as_str();
        self.with_lease(|lease| {
            if let Some(owner) = holder(lease) {
                if owner != identity {
                    return Err(Error::LockNotHeld {
                        owner: owner.to_string(),
                    });
                }
            }
            set_holder(lease, None);
            Ok(())
        })
        .await?;

        info!("Lease {} released by {}", self.lease_name, identity);
        Ok(())
    }
}
