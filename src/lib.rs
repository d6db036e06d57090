//! suss: synchronizes disruptive node maintenance across a Kubernetes cluster
//!
//! One instance runs on every node. Before a node goes down (reboot, kernel
//! update) the local tooling asks its instance to take a cluster-wide lock
//! stored in a `Lease`, cordon the node and evict the pods that must not be
//! interrupted uncoordinated. After maintenance the lock is released and
//! the node uncordoned, letting the next node proceed.

pub mod classifier;
pub mod cluster;
pub mod coordinator;
pub mod error;
pub mod kmutex;
pub mod labels;
pub mod looper;
pub mod node;
pub mod telemetry;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
